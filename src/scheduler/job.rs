use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CohortError, Result};

/// Zero-based identity of a worker within a job.
pub type Rank = usize;

/// Identifier of a machine taking part in a job: this machine, or a remote
/// beacon addressed as `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum HostKey {
    Local,
    Remote(String),
}

impl HostKey {
    pub fn is_local(&self) -> bool {
        matches!(self, HostKey::Local)
    }
}

impl From<String> for HostKey {
    fn from(value: String) -> Self {
        if value == "local" {
            HostKey::Local
        } else {
            HostKey::Remote(value)
        }
    }
}

impl From<&str> for HostKey {
    fn from(value: &str) -> Self {
        HostKey::from(value.to_string())
    }
}

impl From<HostKey> for String {
    fn from(value: HostKey) -> Self {
        value.to_string()
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKey::Local => write!(f, "local"),
            HostKey::Remote(addr) => write!(f, "{}", addr),
        }
    }
}

/// Capacity and credentials of one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    /// `None` means unbounded.
    pub max_processes: Option<usize>,
    #[serde(default)]
    pub password: String,
}

impl HostSpec {
    pub fn new(max_processes: Option<usize>, password: impl Into<String>) -> Self {
        Self {
            max_processes,
            password: password.into(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None, "")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct HostEntry {
    host: HostKey,
    #[serde(flatten)]
    spec: HostSpec,
}

/// Hosts of a job in registration order.
///
/// Order is significant: the planner visits hosts round-robin in this order
/// and hands out start ranks in it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostMap {
    entries: Vec<HostEntry>,
}

impl HostMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host, replacing the spec of an already registered one in place.
    pub fn insert(&mut self, host: HostKey, spec: HostSpec) {
        match self.entries.iter_mut().find(|e| e.host == host) {
            Some(entry) => entry.spec = spec,
            None => self.entries.push(HostEntry { host, spec }),
        }
    }

    pub fn with(mut self, host: impl Into<HostKey>, spec: HostSpec) -> Self {
        self.insert(host.into(), spec);
        self
    }

    pub fn get(&self, host: &HostKey) -> Option<&HostSpec> {
        self.entries.iter().find(|e| &e.host == host).map(|e| &e.spec)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HostKey, &HostSpec)> {
        self.entries.iter().map(|e| (&e.host, &e.spec))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(CohortError::InvalidJob("hosts map is empty".to_string()));
        }
        for entry in &self.entries {
            if entry.spec.max_processes == Some(0) {
                return Err(CohortError::InvalidJob(format!(
                    "host {} has a process count less than one",
                    entry.host
                )));
            }
        }
        Ok(())
    }
}

/// A job as submitted: how many ranks, which program, and optionally where.
///
/// Validated on construction and on deserialization; immutable once admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawJobDescriptor")]
pub struct JobDescriptor {
    size: usize,
    app: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    hosts: Option<HostMap>,
}

#[derive(Deserialize)]
struct RawJobDescriptor {
    size: usize,
    app: PathBuf,
    #[serde(default)]
    hosts: Option<HostMap>,
}

impl TryFrom<RawJobDescriptor> for JobDescriptor {
    type Error = CohortError;

    fn try_from(raw: RawJobDescriptor) -> Result<Self> {
        let job = JobDescriptor::new(raw.size, raw.app)?;
        match raw.hosts {
            Some(hosts) => job.with_hosts(hosts),
            None => Ok(job),
        }
    }
}

impl JobDescriptor {
    pub fn new(size: usize, app: impl Into<PathBuf>) -> Result<Self> {
        if size == 0 {
            return Err(CohortError::InvalidJob(
                "job size must be at least one".to_string(),
            ));
        }
        Ok(Self {
            size,
            app: app.into(),
            hosts: None,
        })
    }

    pub fn with_hosts(mut self, hosts: HostMap) -> Result<Self> {
        hosts.validate()?;
        self.hosts = Some(hosts);
        Ok(self)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn app(&self) -> &PathBuf {
        &self.app
    }

    pub fn hosts(&self) -> Option<&HostMap> {
        self.hosts.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn host_keys_parse_local_sentinel() {
        assert_eq!(HostKey::from("local"), HostKey::Local);
        assert_eq!(
            HostKey::from("10.0.0.2:2222"),
            HostKey::Remote("10.0.0.2:2222".to_string())
        );
        assert_eq!(HostKey::Local.to_string(), "local");
    }

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(
            JobDescriptor::new(0, "/bin/true"),
            Err(CohortError::InvalidJob(_))
        ));
    }

    #[test]
    fn zero_capacity_host_is_rejected() {
        let hosts = HostMap::new().with("local", HostSpec::new(Some(0), ""));
        let job = JobDescriptor::new(2, "/bin/true").unwrap();
        assert!(job.with_hosts(hosts).is_err());
    }

    #[test]
    fn insert_keeps_registration_order() {
        let hosts = HostMap::new()
            .with("b:1", HostSpec::unbounded())
            .with("local", HostSpec::unbounded())
            .with("b:1", HostSpec::new(Some(3), "pw"));
        let keys: Vec<String> = hosts.iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["b:1", "local"]);
        assert_eq!(
            hosts.get(&HostKey::from("b:1")).unwrap().max_processes,
            Some(3)
        );
    }

    #[test]
    fn deserialization_validates() {
        let bad = json!({"size": 0, "app": "/bin/true"});
        assert!(serde_json::from_value::<JobDescriptor>(bad).is_err());

        let good = json!({
            "size": 3,
            "app": "/bin/true",
            "hosts": [
                {"host": "local", "max_processes": 2, "password": ""},
                {"host": "127.0.0.1:9000", "max_processes": null, "password": "pw"}
            ]
        });
        let job: JobDescriptor = serde_json::from_value(good).unwrap();
        assert_eq!(job.size(), 3);
        assert_eq!(job.hosts().unwrap().len(), 2);
    }
}
