use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::Sealed;
use crate::protocol::{Envelope, MonitorEvent};
use crate::runner::packaging::AppBundle;
use crate::scheduler::planner::DistributionPlan;
use crate::scheduler::{JobDescriptor, Rank};

/// Frames exchanged between two beacons over TCP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum PeerFrame {
    Probe,
    Alive,
    KeyExchangeParams {
        prime: String,
        public_key: String,
    },
    KeyExchangePublic {
        public_key: String,
        greeting: Sealed,
    },
    Auth {
        password: Sealed,
    },
    AuthStatus {
        status: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Job {
        job: Sealed,
    },
    JobAck {
        status: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Done,
    DoneAck,
    Abort {
        reason: String,
    },
    Msg {
        envelope: Sealed,
    },
    Monitor {
        event: Sealed,
    },
}

impl PeerFrame {
    /// Replies are matched to the oldest outstanding request on a link;
    /// everything else is delivered as an inbound event.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            PeerFrame::Alive
                | PeerFrame::KeyExchangePublic { .. }
                | PeerFrame::AuthStatus { .. }
                | PeerFrame::JobAck { .. }
                | PeerFrame::DoneAck
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerFrame::Probe => "PROBE",
            PeerFrame::Alive => "ALIVE",
            PeerFrame::KeyExchangeParams { .. } => "KEY-EXCHANGE-PARAMS",
            PeerFrame::KeyExchangePublic { .. } => "KEY-EXCHANGE-PUBLIC",
            PeerFrame::Auth { .. } => "AUTH",
            PeerFrame::AuthStatus { .. } => "AUTH-STATUS",
            PeerFrame::Job { .. } => "JOB",
            PeerFrame::JobAck { .. } => "JOB-ACK",
            PeerFrame::Done => "DONE",
            PeerFrame::DoneAck => "DONE-ACK",
            PeerFrame::Abort { .. } => "ABORT",
            PeerFrame::Msg { .. } => "MSG",
            PeerFrame::Monitor { .. } => "MONITOR",
        }
    }
}

/// Plaintext of a sealed JOB frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFrame {
    pub job_id: Uuid,
    pub size: usize,
    pub bundle: AppBundle,
    pub plan: DistributionPlan,
}

/// Answer to a RUN request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Admission {
    Available,
    Busy,
}

/// Frames exchanged between a submitter and its local beacon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum ControlFrame {
    Probe,
    Alive,
    Run { job: JobDescriptor },
    Confirm { status: Admission },
    Done,
    Abort { reason: String },
    Stop,
    Monitor { event: MonitorEvent },
}

/// Frames exchanged between a beacon and one of its local workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum WorkerFrame {
    Hello { rank: Rank },
    Msg(Envelope),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn peer_frames_use_wire_names() {
        let encoded = serde_json::to_value(PeerFrame::KeyExchangeParams {
            prime: "p".into(),
            public_key: "k".into(),
        })
        .unwrap();
        assert_eq!(
            encoded,
            json!({"kind": "KEY-EXCHANGE-PARAMS", "prime": "p", "public_key": "k"})
        );
        assert_eq!(
            serde_json::to_value(PeerFrame::DoneAck).unwrap(),
            json!({"kind": "DONE-ACK"})
        );
    }

    #[test]
    fn only_answers_are_replies() {
        assert!(PeerFrame::Alive.is_reply());
        assert!(PeerFrame::DoneAck.is_reply());
        assert!(!PeerFrame::Probe.is_reply());
        assert!(!PeerFrame::Done.is_reply());
        assert!(!PeerFrame::Abort {
            reason: "x".into()
        }
        .is_reply());
    }

    #[test]
    fn admission_is_lowercase() {
        let frame = ControlFrame::Confirm {
            status: Admission::Busy,
        };
        assert_eq!(
            serde_json::to_value(frame).unwrap(),
            json!({"kind": "CONFIRM", "status": "busy"})
        );
    }
}
