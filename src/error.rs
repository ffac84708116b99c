use thiserror::Error;

#[derive(Error, Debug)]
pub enum CohortError {
    #[error("Beacon is busy with another job")]
    AdmissionRejected,

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("{host} {reason}")]
    AuthenticationFailed { host: String, reason: String },

    #[error("{host} {reason}")]
    DispatchRejected { host: String, reason: String },

    #[error("{0}")]
    LostConnection(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Unknown rank: {0}")]
    UnknownRank(usize),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("'{0}' field is missing from the message")]
    MissingField(&'static str),

    #[error("A receive request is already outstanding")]
    RecvPending,

    #[error("corrupted data")]
    CorruptedData,

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Packaging error: {0}")]
    Packaging(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CohortError {
    /// The reason string carried by an `aborted` monitor event.
    pub fn abort_reason(&self) -> String {
        match self {
            CohortError::Io(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CohortError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_reason_names_host() {
        let err = CohortError::AuthenticationFailed {
            host: "127.0.0.1:8000".to_string(),
            reason: "incorrect password".to_string(),
        };
        assert_eq!(err.abort_reason(), "127.0.0.1:8000 incorrect password");
    }

    #[test]
    fn io_reason_is_bare_message() {
        let err = CohortError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert_eq!(err.abort_reason(), "connection refused");
    }
}
