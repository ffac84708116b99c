use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scheduler::Rank;

/// Addressing information of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub from: Rank,
    pub to: Rank,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// The uniform record moved between ranks, over local sockets and remote links alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub data: Value,
}

impl Envelope {
    pub fn new(from: Rank, to: Rank, subject: Option<String>, data: Value) -> Self {
        Self {
            header: Header { from, to, subject },
            data,
        }
    }

    pub fn to(&self) -> Rank {
        self.header.to
    }
}

/// Events pushed toward the job submitter for the lifetime of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    Stdout { rank: Rank, line: String },
    Stderr { rank: Rank, line: String },
    Exit { rank: Rank, code: Option<i32> },
    /// `signaled` is true when the reporting node aborted because a peer told
    /// it to, so the receiver must not start another cascade.
    Aborted { reason: String, signaled: bool },
}

impl MonitorEvent {
    pub fn aborted(reason: impl Into<String>, signaled: bool) -> Self {
        MonitorEvent::Aborted {
            reason: reason.into(),
            signaled,
        }
    }
}
