//! Port manager (C6): persisted port selection and best-effort NAT
//! traversal. Never fails fatally — a closed NAT just means the swarm
//! engine operates outbound-only.

use std::io::Write;
use std::net::{TcpListener, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{info, warn};

use crate::error::DccError;

const CANDIDATE_PORTS: &[u16] = &[6881, 6882, 6883, 6889, 51413];
const RANDOM_PORT_RANGE: std::ops::RangeInclusive<u16> = 49152..=65535;
const RANDOM_PORT_ATTEMPTS: usize = 32;

/// `(successful, port, last_check)` per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatStatus {
    pub successful: bool,
    pub port: u16,
    pub last_check_unix: u64,
}

pub fn default_port_file_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("kotor-dcc")
        .join("port")
}

pub struct PortManager {
    port_file: PathBuf,
    port: u16,
    nat_status: NatStatus,
}

impl PortManager {
    /// Read the persisted port, or probe candidates/random high ports and
    /// persist whichever binds first.
    pub fn ensure_initialized(port_file: PathBuf) -> Result<Self, DccError> {
        let port = match read_persisted_port(&port_file) {
            Some(p) if port_is_bindable(p) => p,
            _ => {
                let chosen = choose_port()?;
                persist_port(&port_file, chosen)?;
                chosen
            }
        };
        info!(port, "port manager initialized");
        Ok(PortManager {
            port_file,
            port,
            nat_status: NatStatus {
                successful: false,
                port,
                last_check_unix: now_unix(),
            },
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn nat_status(&self) -> NatStatus {
        self.nat_status
    }

    pub fn port_file_path(&self) -> &Path {
        &self.port_file
    }

    /// Best-effort UPnP then NAT-PMP traversal. Never returns an error:
    /// a failed attempt just leaves `nat_status().successful == false`.
    pub fn attempt_nat_traversal(&mut self) {
        if try_upnp(self.port) {
            self.nat_status = NatStatus {
                successful: true,
                port: self.port,
                last_check_unix: now_unix(),
            };
            info!(port = self.port, method = "upnp", "nat traversal succeeded");
            return;
        }
        if try_natpmp(self.port) {
            self.nat_status = NatStatus {
                successful: true,
                port: self.port,
                last_check_unix: now_unix(),
            };
            info!(port = self.port, method = "nat-pmp", "nat traversal succeeded");
            return;
        }
        self.nat_status = NatStatus {
            successful: false,
            port: self.port,
            last_check_unix: now_unix(),
        };
        warn!(port = self.port, "nat traversal failed, continuing outbound-only");
    }

    /// Test-only seam: force a NAT status without touching the network,
    /// used by the diagnostics harness (C10).
    pub fn set_nat_status_for_testing(&mut self, status: NatStatus) {
        self.nat_status = status;
    }
}

fn read_persisted_port(path: &Path) -> Option<u16> {
    let text = std::fs::read_to_string(path).ok()?;
    text.trim().parse().ok()
}

fn persist_port(path: &Path, port: u16) -> Result<(), DccError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        write!(f, "{port}")?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn choose_port() -> Result<u16, DccError> {
    for &candidate in CANDIDATE_PORTS {
        if port_is_bindable(candidate) {
            return Ok(candidate);
        }
    }
    let mut rng = rand::thread_rng();
    for _ in 0..RANDOM_PORT_ATTEMPTS {
        let candidate = rng.gen_range(RANDOM_PORT_RANGE);
        if port_is_bindable(candidate) {
            return Ok(candidate);
        }
    }
    Err(DccError::IoError {
        source: std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "exhausted candidate and random ports without finding a bindable one",
        ),
    })
}

fn port_is_bindable(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok() && UdpSocket::bind(("0.0.0.0", port)).is_ok()
}

fn try_upnp(port: u16) -> bool {
    match igd_next::search_gateway(igd_next::SearchOptions::default()) {
        Ok(gateway) => {
            let local_addr = match local_ipv4() {
                Some(addr) => std::net::SocketAddrV4::new(addr, port),
                None => return false,
            };
            gateway
                .add_port(
                    igd_next::PortMappingProtocol::TCP,
                    port,
                    local_addr,
                    0,
                    "kotor-dcc",
                )
                .is_ok()
        }
        Err(_) => false,
    }
}

fn try_natpmp(port: u16) -> bool {
    let mut client = match natpmp::Natpmp::new() {
        Ok(c) => c,
        Err(_) => return false,
    };
    if client
        .send_port_mapping_request(natpmp::Protocol::TCP, port, port, 3600)
        .is_err()
    {
        return false;
    }
    client.read_response_or_retry().is_ok()
}

fn local_ipv4() -> Option<std::net::Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(v4) => Some(v4),
        std::net::IpAddr::V6(_) => None,
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_and_reloads_port() {
        let dir = tempfile::tempdir().unwrap();
        let port_file = dir.path().join("port");
        std::fs::write(&port_file, "35555").unwrap();

        let manager = PortManager::ensure_initialized(port_file).unwrap();
        assert_eq!(manager.nat_status().port, 35555);
    }

    #[test]
    fn synthetic_nat_status_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let port_file = dir.path().join("port");
        let mut manager = PortManager::ensure_initialized(port_file).unwrap();
        manager.set_nat_status_for_testing(NatStatus {
            successful: true,
            port: manager.port(),
            last_check_unix: 42,
        });
        assert!(manager.nat_status().successful);
    }
}
