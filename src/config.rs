use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CohortError, Result};
use crate::scheduler::{HostKey, HostMap, HostSpec};

/// Port a remote beacon is assumed to listen on when the hosts file omits it.
pub const DEFAULT_BEACON_PORT: u16 = 2222;

/// Bounds on every wait a beacon or submitter performs.
#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Liveness probe (PROBE/ALIVE).
    pub probe: Duration,
    /// Each key exchange and AUTH round trip.
    pub handshake: Duration,
    /// JOB until JOB-ACK. Covers unpacking and spawning on the remote side.
    pub dispatch: Duration,
    /// DONE until DONE-ACK.
    pub done: Duration,
    /// Time workers get to exit after their control channel closes.
    pub kill_grace: Duration,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(2),
            handshake: Duration::from_secs(5),
            dispatch: Duration::from_secs(10),
            done: Duration::from_secs(2),
            kill_grace: Duration::from_millis(500),
            connect_attempts: 3,
            connect_retry_delay: Duration::from_millis(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BeaconConfig {
    /// Unix socket the local submitter connects to.
    pub control_socket: PathBuf,
    /// TCP address remote beacons dispatch to.
    pub listen_addr: SocketAddr,
    /// Password remote parents must present.
    pub password: String,
    /// Unpacked bundles and worker control sockets live here.
    pub runtime_dir: PathBuf,
    pub timeouts: Timeouts,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            control_socket: PathBuf::from("/tmp/cohort-beacon.sock"),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_BEACON_PORT)),
            password: String::new(),
            runtime_dir: std::env::temp_dir().join("cohort"),
            timeouts: Timeouts::default(),
        }
    }
}

impl BeaconConfig {
    pub fn new(control_socket: impl Into<PathBuf>, listen_addr: SocketAddr) -> Self {
        Self {
            control_socket: control_socket.into(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn with_runtime_dir(mut self, runtime_dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = runtime_dir.into();
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

#[derive(Deserialize)]
struct HostsFileEntry {
    max_procs: Option<i64>,
    #[serde(default)]
    password: String,
}

/// Read a hosts file, keeping the order hosts appear in.
pub fn load_hosts(path: &Path) -> Result<HostMap> {
    let text = std::fs::read_to_string(path)?;
    parse_hosts(&text)
}

/// Parse the JSON object form of a hosts file.
pub fn parse_hosts(text: &str) -> Result<HostMap> {
    let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)?;
    let mut hosts = HostMap::new();
    for (name, value) in raw {
        let entry: HostsFileEntry = serde_json::from_value(value)?;
        let max_processes = match entry.max_procs {
            None => None,
            Some(n) if n < 1 => {
                return Err(CohortError::InvalidJob(format!(
                    "host {} has a process count less than one",
                    name
                )))
            }
            Some(n) => Some(n as usize),
        };
        hosts.insert(host_key(&name), HostSpec::new(max_processes, entry.password));
    }
    if hosts.is_empty() {
        return Err(CohortError::InvalidJob("hosts map is empty".to_string()));
    }
    Ok(hosts)
}

fn host_key(name: &str) -> HostKey {
    if name == "local" || name.contains(':') {
        HostKey::from(name)
    } else {
        HostKey::Remote(format!("{}:{}", name, DEFAULT_BEACON_PORT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_default() {
        let t = Timeouts::default();
        assert_eq!(t.probe, Duration::from_secs(2));
        assert_eq!(t.kill_grace, Duration::from_millis(500));
        assert_eq!(t.connect_attempts, 3);
    }

    #[test]
    fn beacon_config_default() {
        let cfg = BeaconConfig::default();
        assert_eq!(cfg.control_socket, PathBuf::from("/tmp/cohort-beacon.sock"));
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:2222");
        assert!(cfg.password.is_empty());
        assert!(cfg.runtime_dir.ends_with("cohort"));
    }

    #[test]
    fn beacon_config_builders() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let cfg = BeaconConfig::new("/tmp/x.sock", addr)
            .with_password("pw")
            .with_runtime_dir("/tmp/rt");
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.password, "pw");
        assert_eq!(cfg.runtime_dir, PathBuf::from("/tmp/rt"));
    }

    #[test]
    fn hosts_file_keeps_order_and_fills_defaults() {
        let hosts = parse_hosts(
            r#"{
                "10.0.0.9": {"max_procs": 4, "password": "s3cret"},
                "local": {"max_procs": 2},
                "10.0.0.5:7000": {}
            }"#,
        )
        .unwrap();

        let keys: Vec<String> = hosts.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["10.0.0.9:2222", "local", "10.0.0.5:7000"]);

        let first = hosts.get(&HostKey::from("10.0.0.9:2222")).unwrap();
        assert_eq!(first.max_processes, Some(4));
        assert_eq!(first.password, "s3cret");

        let last = hosts.get(&HostKey::from("10.0.0.5:7000")).unwrap();
        assert_eq!(last.max_processes, None);
        assert_eq!(last.password, "");
    }

    #[test]
    fn hosts_file_rejects_non_positive_counts() {
        assert!(parse_hosts(r#"{"local": {"max_procs": 0}}"#).is_err());
        assert!(parse_hosts(r#"{"local": {"max_procs": -2}}"#).is_err());
    }

    #[test]
    fn hosts_file_rejects_empty_object() {
        assert!(parse_hosts("{}").is_err());
    }
}
