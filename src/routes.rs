//! Client route autoconfiguration
//!
//! Sends all IPv4 traffic through the virtual interface while keeping the
//! server itself reachable through the original gateway. The default route
//! is left alone; two /1 routes take precedence over it.

use std::net::{IpAddr, Ipv4Addr};
use std::process::Command;

use crate::error::{Error, Result};
use crate::transport::Endpoint;

/// The two halves of the IPv4 space routed through the tunnel
pub const SPLIT_DEFAULT: [&str; 2] = ["0.0.0.0/1", "128.0.0.0/1"];

/// How the kernel currently reaches a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub gateway: Option<Ipv4Addr>,
    pub device: Option<String>,
}

/// Parse the first line of `ip route get <addr>`
///
/// e.g. `203.0.113.7 via 192.168.1.1 dev eth0 src 192.168.1.20 uid 0`
pub fn parse_route_get(output: &str) -> Option<RouteInfo> {
    let line = output.lines().next()?;
    let words: Vec<&str> = line.split_whitespace().collect();

    let mut gateway = None;
    let mut device = None;
    for pair in words.windows(2) {
        match pair[0] {
            "via" => gateway = pair[1].parse().ok(),
            "dev" => device = Some(pair[1].to_string()),
            _ => {}
        }
    }

    if gateway.is_none() && device.is_none() {
        return None;
    }
    Some(RouteInfo { gateway, device })
}

/// Ask the kernel how `addr` is routed
pub fn route_to(addr: Ipv4Addr) -> Result<RouteInfo> {
    let output = Command::new("ip")
        .args(["route", "get", &addr.to_string()])
        .output()
        .map_err(|e| Error::Route(format!("cannot run ip: {}", e)))?;
    if !output.status.success() {
        return Err(Error::Route(format!(
            "ip route get {} failed: {}",
            addr,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    parse_route_get(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| Error::Route(format!("no route to {}", addr)))
}

/// Routes to install once the device is up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    pub server: Ipv4Addr,
    /// How the server was reached before the tunnel existed
    pub exception: RouteInfo,
}

impl RoutePlan {
    /// Resolve the server and record its current route
    pub async fn prepare(endpoint: &Endpoint) -> Result<Self> {
        let server = match endpoint.host.parse::<Ipv4Addr>() {
            Ok(addr) => addr,
            Err(_) => {
                tracing::info!("Resolving {}...", endpoint.host);
                let addr = match endpoint.resolve().await?.ip() {
                    IpAddr::V4(v4) => v4,
                    IpAddr::V6(v6) => {
                        return Err(Error::Route(format!("{} resolved to IPv6 address {}", endpoint.host, v6)))
                    }
                };
                tracing::info!("{} is {}", endpoint.host, addr);
                addr
            }
        };

        let exception = route_to(server)?;
        Ok(Self { server, exception })
    }

    /// `ip route add` argument lists, exception route first
    pub fn commands(&self, tun_device: &str) -> Vec<Vec<String>> {
        let mut commands = Vec::with_capacity(3);

        let mut exception = vec!["route".to_string(), "add".to_string(), format!("{}/32", self.server)];
        if let Some(gateway) = self.exception.gateway {
            exception.extend(["via".to_string(), gateway.to_string()]);
        }
        if let Some(device) = &self.exception.device {
            exception.extend(["dev".to_string(), device.clone()]);
        }
        commands.push(exception);

        for net in SPLIT_DEFAULT {
            commands.push(vec![
                "route".to_string(),
                "add".to_string(),
                net.to_string(),
                "dev".to_string(),
                tun_device.to_string(),
            ]);
        }
        commands
    }

    /// Install the routes; individual failures are logged
    pub fn apply(&self, tun_device: &str) -> Result<()> {
        tracing::info!("Adding exception route for the server ({})", self.server);
        for args in self.commands(tun_device) {
            let status = Command::new("ip")
                .args(&args)
                .status()
                .map_err(|e| Error::Route(format!("cannot run ip: {}", e)))?;
            if !status.success() {
                tracing::warn!("ip {} failed", args.join(" "));
            }
        }
        tracing::info!("Finished configuring routes via {}", tun_device);
        Ok(())
    }
}
