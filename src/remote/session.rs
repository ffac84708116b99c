//! Initiating side of the beacon-to-beacon protocol.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::config::Timeouts;
use crate::crypto::{KeyPair, GREETING};
use crate::error::{CohortError, Result};
use crate::protocol::{JobFrame, PeerFrame};
use crate::remote::{connect_with_retry, LinkEvent, LinkState, PeerLink};

/// A link to one remote beacon, walked through PROBE, key exchange, AUTH and
/// JOB in that order. Any failed step closes the link.
pub struct PeerSession {
    host: String,
    link: PeerLink,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    timeouts: Timeouts,
}

impl PeerSession {
    /// Connect to `host` and check it answers a probe.
    pub async fn connect(host: &str, timeouts: &Timeouts) -> Result<Self> {
        let stream = connect_with_retry(
            host,
            timeouts.connect_attempts,
            timeouts.connect_retry_delay,
        )
        .await?;
        Self::over(stream, host, timeouts).await
    }

    /// Same as [`PeerSession::connect`] over an already open stream.
    pub async fn over<S>(stream: S, host: &str, timeouts: &Timeouts) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (link, events) = PeerLink::spawn(stream, host);
        let mut session = PeerSession {
            host: host.to_string(),
            link,
            events,
            timeouts: timeouts.clone(),
        };
        let reply = session
            .step(PeerFrame::Probe, session.timeouts.probe, "ALIVE")
            .await?;
        match reply {
            PeerFrame::Alive => {
                session.link.set_state(LinkState::Probed);
                Ok(session)
            }
            other => Err(session.violation("ALIVE", &other)),
        }
    }

    /// Connect, exchange keys and authenticate in one go.
    pub async fn establish(host: &str, password: &str, timeouts: &Timeouts) -> Result<Self> {
        let mut session = Self::connect(host, timeouts).await?;
        session.exchange_keys().await?;
        session.authenticate(password).await?;
        Ok(session)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    /// Agree on session keys and check the responder derived the same ones.
    pub async fn exchange_keys(&mut self) -> Result<()> {
        let pair = KeyPair::generate();
        let request = PeerFrame::KeyExchangeParams {
            prime: pair.encoded_prime(),
            public_key: pair.encoded_public(),
        };
        let reply = self
            .step(request, self.timeouts.handshake, "KEY-EXCHANGE-PUBLIC")
            .await?;
        let PeerFrame::KeyExchangePublic {
            public_key,
            greeting,
        } = reply
        else {
            return Err(self.violation("KEY-EXCHANGE-PUBLIC", &reply));
        };

        let agreed = pair.agree(&public_key).and_then(|cipher| {
            match cipher.open(&greeting) {
                Ok(text) if text == GREETING => Ok(cipher),
                _ => Err(CohortError::HandshakeFailed(format!(
                    "{} derived different session keys",
                    self.host
                ))),
            }
        });
        let cipher = match agreed {
            Ok(cipher) => cipher,
            Err(e) => {
                self.link.close();
                return Err(e);
            }
        };
        self.link.set_cipher(cipher)?;
        tracing::debug!(peer = %self.host, "Session keys agreed");
        Ok(())
    }

    /// Present `password`, sealed with the session keys.
    pub async fn authenticate(&mut self, password: &str) -> Result<()> {
        let sealed = self.link.cipher()?.seal(password.as_bytes())?;
        let reply = self
            .step(
                PeerFrame::Auth { password: sealed },
                self.timeouts.handshake,
                "AUTH-STATUS",
            )
            .await?;
        match reply {
            PeerFrame::AuthStatus { status: true, .. } => {
                self.link.set_state(LinkState::Authorized);
                Ok(())
            }
            PeerFrame::AuthStatus { error, .. } => {
                self.link.close();
                Err(CohortError::AuthenticationFailed {
                    host: self.host.clone(),
                    reason: error.unwrap_or_else(|| "unauthorized".to_string()),
                })
            }
            other => Err(self.violation("AUTH-STATUS", &other)),
        }
    }

    /// Hand the remote beacon its share of a job.
    pub async fn dispatch(&mut self, job: &JobFrame) -> Result<()> {
        if self.link.state() != LinkState::Authorized {
            return Err(CohortError::ProtocolViolation(format!(
                "JOB sent to {} before authorization",
                self.host
            )));
        }
        let sealed = self.link.cipher()?.seal_json(job)?;
        let reply = self
            .step(
                PeerFrame::Job { job: sealed },
                self.timeouts.dispatch,
                "JOB-ACK",
            )
            .await?;
        match reply {
            PeerFrame::JobAck { status: true, .. } => {
                self.link.bind_job(job.job_id);
                tracing::info!(peer = %self.host, job_id = %job.job_id, "Job share accepted");
                Ok(())
            }
            PeerFrame::JobAck { error, .. } => {
                self.link.close();
                Err(CohortError::DispatchRejected {
                    host: self.host.clone(),
                    reason: error.unwrap_or_else(|| "job rejected".to_string()),
                })
            }
            other => Err(self.violation("JOB-ACK", &other)),
        }
    }

    /// Give up the session, keeping the link and its event stream.
    pub fn into_parts(self) -> (PeerLink, mpsc::UnboundedReceiver<LinkEvent>) {
        (self.link, self.events)
    }

    async fn step(
        &self,
        frame: PeerFrame,
        timeout: std::time::Duration,
        waiting_for: &'static str,
    ) -> Result<PeerFrame> {
        match self.link.call(frame, timeout, waiting_for).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.link.close();
                Err(match e {
                    CohortError::Timeout(_) | CohortError::ChannelClosed(_) => {
                        CohortError::LostConnection(format!(
                            "{} did not answer with {}",
                            self.host, waiting_for
                        ))
                    }
                    other => other,
                })
            }
        }
    }

    fn violation(&self, expected: &str, got: &PeerFrame) -> CohortError {
        self.link.close();
        CohortError::ProtocolViolation(format!(
            "expected {} from {}, got {}",
            expected,
            self.host,
            got.name()
        ))
    }
}

/// Tell a remote beacon its share is finished and wait for the acknowledgement.
pub async fn signal_done(link: &PeerLink, timeouts: &Timeouts) -> Result<()> {
    link.set_state(LinkState::Draining);
    let result = link.call(PeerFrame::Done, timeouts.done, "DONE-ACK").await;
    link.close();
    match result? {
        PeerFrame::DoneAck => Ok(()),
        other => Err(CohortError::ProtocolViolation(format!(
            "expected DONE-ACK from {}, got {}",
            link.id(),
            other.name()
        ))),
    }
}

/// Ask a remote beacon to abort. Nothing is awaited.
pub fn signal_abort(link: &PeerLink, reason: &str) {
    if let Err(e) = link.send(PeerFrame::Abort {
        reason: reason.to_string(),
    }) {
        tracing::debug!(peer = %link.id(), error = %e, "ABORT not sent");
    }
    link.close();
}
