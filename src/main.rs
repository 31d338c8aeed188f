//! Warpdrive - Point-to-Point Virtual Private Network
//!
//! Runs either the server hub or a client, plus a few credential tools.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warpdrive::client::{HostEvent, NetConnector, Supervisor, SupervisorSettings};
use warpdrive::config::WarpdriveConfig;
use warpdrive::identity;
use warpdrive::link::{
    generate_key, load_private_key, public_key_base64, save_private_key, save_public_key, save_signature,
    sign_public_key,
};
use warpdrive::routes::RoutePlan;
use warpdrive::server::Server;
use warpdrive::tun::{TunInterface, TunParams};

/// Default config file, used when present
const DEFAULT_CONFIG: &str = "warpdrive.toml";

/// Grace period between closing the link and exiting on `kill`
const KILL_GRACE: Duration = Duration::from_millis(250);

/// Warpdrive - Point-to-Point Virtual Private Network
#[derive(Parser)]
#[command(name = "warpdrive")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run as a server
    #[arg(long)]
    server: bool,

    /// Listen endpoint (server), e.g. ws://0.0.0.0:5000 or udp://0.0.0.0:5001
    #[arg(short, long)]
    listen: Vec<String>,

    /// Server endpoint to connect to (client)
    #[arg(short, long)]
    connect: Option<String>,

    /// Virtual interface name
    #[arg(short, long)]
    dev: Option<String>,

    /// Virtual interface address, e.g. 10.0.0.2/24
    #[arg(long)]
    ip: Option<String>,

    /// Private key path
    #[arg(short = 'p', long)]
    key_path: Option<PathBuf>,

    /// Signature file path
    #[arg(short = 's', long)]
    signature_path: Option<PathBuf>,

    /// Certificate authority public key path
    #[arg(long = "ca", visible_alias = "certificate-authority-path")]
    ca_path: Option<PathBuf>,

    /// Send link payloads unencrypted
    #[arg(long)]
    no_encryption: bool,

    /// Log authentication errors instead of rejecting the peer
    #[arg(long)]
    ignore_auth: bool,

    /// Turn off authentication altogether
    #[arg(long)]
    disable_auth: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    verbosity: Option<String>,

    /// Route all traffic through the tunnel (client)
    #[arg(long)]
    autoconf: bool,

    /// Print this host's attestation token and exit
    #[arg(long)]
    attest: bool,

    /// Answer pings on the virtual interface locally
    #[arg(long)]
    spoof_pings: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file with default values
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        output: PathBuf,

        /// Configure as a server
        #[arg(long)]
        server: bool,
    },

    /// Generate a certificate authority key pair
    Genca {
        /// CA private key output
        #[arg(long, default_value = "./ca.sk")]
        private: PathBuf,

        /// CA public key output
        #[arg(long, default_value = "./ca")]
        public: PathBuf,
    },

    /// Generate a node private key
    Genkey {
        /// Private key output
        #[arg(default_value = "./client.sk")]
        output: PathBuf,
    },

    /// Sign a node's public key with the CA private key
    Sign {
        /// Node private key to certify
        key: PathBuf,

        /// Signature output
        #[arg(default_value = "./client.sign")]
        output: PathBuf,

        /// CA private key
        #[arg(long, default_value = "./ca.sk")]
        ca_key: PathBuf,
    },
}

impl Cli {
    /// Command-line flags win over the config file
    fn apply(&self, config: &mut WarpdriveConfig) {
        if self.server {
            config.network.server = true;
        }
        if !self.listen.is_empty() {
            config.network.listen = self.listen.clone();
        }
        if let Some(connect) = &self.connect {
            config.network.connect = Some(connect.clone());
        }
        if self.autoconf {
            config.network.autoconf = true;
        }
        if let Some(dev) = &self.dev {
            config.tun.name = Some(dev.clone());
        }
        if let Some(ip) = &self.ip {
            config.tun.address = ip.clone();
        }
        if self.spoof_pings {
            config.tun.spoof_pings = true;
        }
        if let Some(path) = &self.key_path {
            config.security.key_path = Some(path.clone());
        }
        if let Some(path) = &self.signature_path {
            config.security.signature_path = Some(path.clone());
        }
        if let Some(path) = &self.ca_path {
            config.security.ca_path = path.clone();
        }
        if self.no_encryption {
            config.security.encrypt = false;
        }
        if self.ignore_auth {
            config.security.ignore_auth = true;
        }
        if self.disable_auth {
            config.security.auth = false;
        }
        if let Some(level) = &self.verbosity {
            config.log.verbosity = level.clone();
        }
    }
}

/// What `kill` and shutdown act on
enum Role {
    Server(Arc<Server>),
    Client(Arc<Supervisor>),
}

impl Role {
    async fn close_links(&self) {
        match self {
            Role::Server(server) => server.table().close_all().await,
            Role::Client(supervisor) => supervisor.close_link().await,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(command) = &cli.command {
        init_logging(cli.verbosity.as_deref().unwrap_or("info"));
        return run_command(command);
    }

    if cli.attest {
        println!("{}", hex::encode(identity::local_attestation()));
        return Ok(());
    }

    let (mut config, load_error) = load_config(cli.config.as_deref());
    cli.apply(&mut config);
    init_logging(&config.log.verbosity);

    if let Some(e) = load_error {
        tracing::warn!(
            "No config file loaded ({}). If you are configuring Warpdrive from the command line, this is fine.",
            e
        );
    }

    config.validate().context("invalid configuration")?;
    let config = Arc::new(config);

    if !nix::unistd::Uid::effective().is_root() {
        tracing::warn!("Not running as root; creating the virtual interface may fail");
    }

    // Record the server's current route before the tunnel takes over
    let route_plan = if !config.network.server && config.network.autoconf {
        match RoutePlan::prepare(&config.connect_endpoint()?).await {
            Ok(plan) => Some(plan),
            Err(e) => {
                tracing::error!("Route autoconfiguration disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    let tun = match open_tun(&config) {
        Ok(tun) => Arc::new(tun),
        Err(e) => {
            tracing::error!("Failed to open virtual interface: {:#}", e);
            std::process::exit(1);
        }
    };
    tun.set_spoofed_pings(config.tun.spoof_pings);

    if let Some(plan) = route_plan {
        if let Some(name) = tun.name().await {
            if let Err(e) = plan.apply(&name) {
                tracing::error!("Failed to configure routes: {}", e);
            }
        }
        // Closing the device drops its routes; put them back on the new one
        tun.on_reopen(Arc::new(move |name: &str| {
            if let Err(e) = plan.apply(name) {
                tracing::error!("Failed to restore routes via {}: {}", name, e);
            }
        }));
    }

    let shutdown = CancellationToken::new();
    let role = if config.network.server {
        Role::Server(Arc::new(Server::new(config.clone(), tun.clone(), shutdown.clone())?))
    } else {
        let attestation = identity::local_attestation();
        tracing::info!("Attestation token: {}", hex::encode(&attestation));
        let settings = SupervisorSettings::from_config(&config, Some(attestation))?;
        let connector = Arc::new(NetConnector {
            timeout: config.handshake_timeout(),
        });
        Role::Client(Arc::new(Supervisor::new(settings, tun.clone(), connector, shutdown.clone())))
    };
    let role = Arc::new(role);

    let main_task = match role.as_ref() {
        Role::Server(server) => {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        }
        Role::Client(supervisor) => {
            #[cfg(unix)]
            spawn_power_events(supervisor.clone())?;
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.run().await })
        }
    };

    tokio::spawn(console(role.clone()));

    let shutdown_on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            shutdown_on_signal.cancel();
        }
    });

    match main_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!("Warpdrive stopped with an error: {}", e);
            role.close_links().await;
            tun.close().await;
            return Err(e.into());
        }
        Err(e) => anyhow::bail!("main task panicked: {}", e),
    }

    role.close_links().await;
    tun.close().await;
    tracing::info!(
        "Warpdrive stopped ({} bytes read from and {} bytes written to the virtual interface)",
        tun.bytes_received(),
        tun.bytes_sent()
    );
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the config file, falling back to defaults
fn load_config(path: Option<&Path>) -> (WarpdriveConfig, Option<String>) {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG));
    match WarpdriveConfig::from_file(path) {
        Ok(config) => (config, None),
        Err(e) => (WarpdriveConfig::default(), Some(format!("{}: {}", path.display(), e))),
    }
}

#[cfg(target_os = "linux")]
fn open_tun(config: &WarpdriveConfig) -> anyhow::Result<TunInterface> {
    let params = TunParams::from_config(config)?;
    let tun = TunInterface::open(Arc::new(warpdrive::tun::LinuxOpener), params)?;
    Ok(tun)
}

#[cfg(not(target_os = "linux"))]
fn open_tun(config: &WarpdriveConfig) -> anyhow::Result<TunInterface> {
    let _ = TunParams::from_config(config)?;
    anyhow::bail!("no virtual interface support on this platform")
}

/// Map SIGUSR1/SIGUSR2 to host suspend/resume
#[cfg(unix)]
fn spawn_power_events(supervisor: Arc<Supervisor>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut suspend = signal(SignalKind::user_defined1()).context("cannot watch SIGUSR1")?;
    let mut resume = signal(SignalKind::user_defined2()).context("cannot watch SIGUSR2")?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(_) = suspend.recv() => supervisor.host_event(HostEvent::Suspend).await,
                Some(_) = resume.recv() => supervisor.host_event(HostEvent::Resume).await,
                else => break,
            }
        }
    });
    Ok(())
}

/// Read console commands from stdin
async fn console(role: Arc<Role>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "" => {}
            "kill" => {
                tracing::info!("Closing link and exiting");
                role.close_links().await;
                tokio::time::sleep(KILL_GRACE).await;
                std::process::exit(0);
            }
            other => tracing::warn!("Unknown command: {}", other),
        }
    }
}

fn run_command(command: &Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init { output, server } => {
            let mut config = WarpdriveConfig::default();
            if *server {
                config.network.server = true;
                config.network.listen = vec!["ws://0.0.0.0:5000".into(), "udp://0.0.0.0:5001".into()];
                config.tun.address = "10.0.0.1/24".into();
            } else {
                config.network.connect = Some("ws://127.0.0.1:5000".into());
            }
            config.save(output).context("cannot write configuration")?;
            println!("Configuration written to {}", output.display());
        }
        Commands::Genca { private, public } => {
            let ca = generate_key();
            save_private_key(&ca, private).context("cannot write CA private key")?;
            save_public_key(&ca.verifying_key(), public).context("cannot write CA public key")?;
            println!("CA public key: {}", public_key_base64(&ca.verifying_key()));
            println!("Private key written to {}, public key to {}", private.display(), public.display());
        }
        Commands::Genkey { output } => {
            let key = generate_key();
            save_private_key(&key, output).context("cannot write private key")?;
            println!("Public key: {}", public_key_base64(&key.verifying_key()));
        }
        Commands::Sign { key, output, ca_key } => {
            let ca = load_private_key(ca_key).with_context(|| format!("cannot load CA key {}", ca_key.display()))?;
            let node = load_private_key(key).with_context(|| format!("cannot load key {}", key.display()))?;
            let signature = sign_public_key(&ca, &node.verifying_key());
            save_signature(&signature, output).context("cannot write signature")?;
            println!(
                "Signed {} for public key {}",
                output.display(),
                public_key_base64(&node.verifying_key())
            );
        }
    }
    Ok(())
}
