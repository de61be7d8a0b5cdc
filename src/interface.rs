//! Network interface lookup used to pin listeners and egress sockets to a NIC.
//!
//! The platform implementation is chosen once through [`system_resolver`];
//! everything else talks to the [`InterfaceResolver`] trait.

use std::net::Ipv4Addr;
use std::process::Command;
use tracing::debug;

/// Name accepted as an alias for the unspecified address
pub const ALL_INTERFACES: &str = "all";

/// Interface is a named IPv4 address on the local host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub ip: Ipv4Addr,
}

/// InterfaceResolver maps interface names to addresses and back
pub trait InterfaceResolver: Send + Sync {
    /// list returns every IPv4 interface known to the host
    fn list(&self) -> Vec<Interface>;

    /// resolve_ip returns the first IPv4 address bound to the named interface
    fn resolve_ip(&self, name: &str) -> Option<Ipv4Addr> {
        if let Some(ip) = self.list().into_iter().find(|i| i.name == name).map(|i| i.ip) {
            return Some(ip);
        }

        match name {
            "lo" | "loopback" => Some(Ipv4Addr::LOCALHOST),
            ALL_INTERFACES => Some(Ipv4Addr::UNSPECIFIED),
            _ => None,
        }
    }

    /// resolve_name returns the interface owning the given address
    fn resolve_name(&self, ip: Ipv4Addr) -> Option<String> {
        if let Some(iface) = self.list().into_iter().find(|i| i.ip == ip) {
            return Some(iface.name);
        }

        if ip.is_loopback() {
            Some("lo".to_string())
        } else if ip.is_unspecified() {
            Some(ALL_INTERFACES.to_string())
        } else {
            None
        }
    }
}

/// LinuxInterfaces shells out to `ip -4 addr show`
#[derive(Debug, Default)]
pub struct LinuxInterfaces;

impl InterfaceResolver for LinuxInterfaces {
    fn list(&self) -> Vec<Interface> {
        match Command::new("ip").args(["-4", "addr", "show"]).output() {
            Ok(out) if out.status.success() => {
                parse_ip_addr_output(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(out) => {
                debug!(status = %out.status, "ip addr exited unsuccessfully");
                Vec::new()
            }
            Err(e) => {
                debug!("failed to run ip addr: {e}");
                Vec::new()
            }
        }
    }
}

/// StaticInterfaces serves a fixed interface table
#[derive(Debug, Default, Clone)]
pub struct StaticInterfaces {
    interfaces: Vec<Interface>,
}

impl StaticInterfaces {
    /// new is a constructor for the StaticInterfaces type
    pub fn new(interfaces: Vec<Interface>) -> Self {
        Self { interfaces }
    }
}

impl InterfaceResolver for StaticInterfaces {
    fn list(&self) -> Vec<Interface> {
        self.interfaces.clone()
    }
}

/// system_resolver picks the interface resolver for the running platform
pub fn system_resolver() -> Box<dyn InterfaceResolver> {
    if cfg!(target_os = "linux") {
        Box::new(LinuxInterfaces)
    } else {
        Box::new(StaticInterfaces::default())
    }
}

/// parse_ip_addr_output extracts (name, ip) pairs from `ip -4 addr show` output
///
/// ```text
/// 2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 ...
///     inet 10.0.0.5/24 brd 10.0.0.255 scope global eth0
/// ```
pub fn parse_ip_addr_output(output: &str) -> Vec<Interface> {
    let mut interfaces = Vec::new();
    let mut current: Option<String> = None;

    for line in output.lines() {
        // Interface header lines start with the link index
        if line.starts_with(|c: char| c.is_ascii_digit()) {
            current = line
                .split(':')
                .nth(1)
                .map(|name| name.trim())
                .map(|name| name.split('@').next().unwrap_or(name).to_string());
            continue;
        }

        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix("inet ") else {
            continue;
        };
        let Some(name) = current.as_ref() else {
            continue;
        };

        let addr = rest.split_whitespace().next().unwrap_or_default();
        let addr = addr.split('/').next().unwrap_or_default();
        if let Ok(ip) = addr.parse::<Ipv4Addr>() {
            interfaces.push(Interface {
                name: name.clone(),
                ip,
            });
        }
    }

    interfaces
}
