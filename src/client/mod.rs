//! Client role: one supervised link to the server

mod efficiency;
mod supervisor;

pub use efficiency::{monitor, process_cpu_time, EfficiencyMonitor, EfficiencyReport};
pub use supervisor::{
    Backoff, Connector, HostEvent, NetConnector, Supervisor, SupervisorSettings, SupervisorState,
};
