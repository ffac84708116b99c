//! Receiving side of the beacon-to-beacon protocol.
//!
//! [`Responder`] holds the per-connection handshake state and turns each
//! request frame into its reply. It does no I/O so the connection task that
//! owns it stays a plain frame pump.

use crate::crypto::{secrets_match, KeyPair, Sealed, SessionCipher, GREETING};
use crate::error::{CohortError, Result};
use crate::protocol::{JobFrame, PeerFrame};
use crate::remote::LinkState;

pub struct Responder {
    peer: String,
    password: String,
    cipher: Option<SessionCipher>,
    state: LinkState,
}

impl Responder {
    pub fn new(peer: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            password: password.into(),
            cipher: None,
            state: LinkState::Connecting,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_authorized(&self) -> bool {
        matches!(self.state, LinkState::Authorized | LinkState::JobAssigned)
    }

    pub fn on_probe(&mut self) -> PeerFrame {
        if self.state == LinkState::Connecting {
            self.state = LinkState::Probed;
        }
        PeerFrame::Alive
    }

    /// Answer KEY-EXCHANGE-PARAMS with our public value and a greeting sealed
    /// under the new keys. The cipher is returned for the link to use.
    pub fn on_key_exchange(
        &mut self,
        prime: &str,
        public_key: &str,
    ) -> Result<(PeerFrame, SessionCipher)> {
        if self.cipher.is_some() {
            return Err(CohortError::ProtocolViolation(format!(
                "{} repeated the key exchange",
                self.peer
            )));
        }
        let pair = KeyPair::for_encoded_prime(prime)?;
        let cipher = pair.agree(public_key)?;
        let greeting = cipher.seal(GREETING)?;
        self.cipher = Some(cipher.clone());
        self.state = LinkState::KeyExchanged;
        Ok((
            PeerFrame::KeyExchangePublic {
                public_key: pair.encoded_public(),
                greeting,
            },
            cipher,
        ))
    }

    /// Check a sealed password. Integrity is verified before the password is
    /// looked at.
    pub fn on_auth(&mut self, password: &Sealed) -> PeerFrame {
        let Some(cipher) = &self.cipher else {
            return auth_failure("unsecure channel");
        };
        let presented = match cipher.open(password) {
            Ok(presented) => presented,
            Err(_) => {
                tracing::warn!(peer = %self.peer, "AUTH frame failed integrity check");
                return auth_failure("corrupted data");
            }
        };
        if !secrets_match(&presented, self.password.as_bytes()) {
            tracing::warn!(peer = %self.peer, "AUTH with incorrect password");
            return auth_failure("incorrect password");
        }
        self.state = LinkState::Authorized;
        PeerFrame::AuthStatus {
            status: true,
            error: None,
        }
    }

    /// Unseal and check a JOB frame. Only valid once authorized.
    pub fn open_job(&self, sealed: &Sealed) -> Result<JobFrame> {
        let cipher = match (&self.cipher, self.state) {
            (Some(cipher), LinkState::Authorized) => cipher,
            _ => {
                return Err(CohortError::AuthenticationFailed {
                    host: self.peer.clone(),
                    reason: "unauthorized".to_string(),
                })
            }
        };
        let job: JobFrame = cipher.open_json(sealed)?;
        job.plan.validate()?;
        if job.plan.size() != job.size {
            return Err(CohortError::InvalidJob(format!(
                "plan covers {} ranks, job has {}",
                job.plan.size(),
                job.size
            )));
        }
        if job.plan.local().is_none() {
            return Err(CohortError::InvalidJob(
                "plan has no share for this host".to_string(),
            ));
        }
        Ok(job)
    }

    pub fn job_accepted(&mut self) {
        self.state = LinkState::JobAssigned;
    }
}

fn auth_failure(reason: &str) -> PeerFrame {
    PeerFrame::AuthStatus {
        status: false,
        error: Some(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use crate::remote::{LinkEvent, PeerLink, PeerSession};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn tamper(sealed: &Sealed) -> Sealed {
        let mut mac = STANDARD.decode(&sealed.mac).unwrap();
        mac[0] ^= 0x01;
        Sealed {
            mac: STANDARD.encode(mac),
            ..sealed.clone()
        }
    }

    fn exchanged(password: &str) -> (Responder, SessionCipher) {
        let mut responder = Responder::new("10.0.0.1:5000", password);
        let initiator = KeyPair::generate();
        let (reply, _) = responder
            .on_key_exchange(&initiator.encoded_prime(), &initiator.encoded_public())
            .unwrap();
        let PeerFrame::KeyExchangePublic { public_key, greeting } = reply else {
            panic!("unexpected reply");
        };
        let cipher = initiator.agree(&public_key).unwrap();
        assert_eq!(cipher.open(&greeting).unwrap(), GREETING);
        (responder, cipher)
    }

    #[test]
    fn auth_before_key_exchange_is_refused() {
        let mut responder = Responder::new("peer", "pw");
        let (_, cipher) = exchanged("pw");
        let reply = responder.on_auth(&cipher.seal(b"pw").unwrap());
        assert_eq!(reply, auth_failure("unsecure channel"));
        assert!(!responder.is_authorized());
    }

    #[test]
    fn correct_password_authorizes() {
        let (mut responder, cipher) = exchanged("s3cret");
        let reply = responder.on_auth(&cipher.seal(b"s3cret").unwrap());
        assert_eq!(
            reply,
            PeerFrame::AuthStatus {
                status: true,
                error: None
            }
        );
        assert!(responder.is_authorized());
    }

    #[test]
    fn wrong_password_is_reported() {
        let (mut responder, cipher) = exchanged("s3cret");
        let reply = responder.on_auth(&cipher.seal(b"guess").unwrap());
        assert_eq!(reply, auth_failure("incorrect password"));
        assert!(!responder.is_authorized());
    }

    #[test]
    fn tampered_password_is_corrupted_even_when_correct() {
        let (mut responder, cipher) = exchanged("s3cret");
        let sealed = tamper(&cipher.seal(b"s3cret").unwrap());
        assert_eq!(responder.on_auth(&sealed), auth_failure("corrupted data"));
        assert!(!responder.is_authorized());
    }

    #[test]
    fn job_requires_authorization() {
        let (responder, cipher) = exchanged("pw");
        let sealed = cipher.seal(b"{}").unwrap();
        assert!(matches!(
            responder.open_job(&sealed),
            Err(CohortError::AuthenticationFailed { .. })
        ));
    }

    #[test]
    fn foreign_prime_is_rejected() {
        let mut responder = Responder::new("peer", "pw");
        let result = responder.on_key_exchange("ff", "02");
        assert!(result.is_err());
        assert_eq!(responder.state(), LinkState::Connecting);
    }

    /// Answer handshake frames the way a beacon's peer listener does.
    fn serve(password: &'static str) -> tokio::io::DuplexStream {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (link, mut events) = PeerLink::spawn(theirs, "initiator");
            let mut responder = Responder::new("initiator", password);
            while let Some(LinkEvent::Frame(frame)) = events.recv().await {
                let reply = match frame {
                    PeerFrame::Probe => responder.on_probe(),
                    PeerFrame::KeyExchangeParams { prime, public_key } => {
                        let (reply, cipher) =
                            responder.on_key_exchange(&prime, &public_key).unwrap();
                        link.set_cipher(cipher).unwrap();
                        reply
                    }
                    PeerFrame::Auth { password } => responder.on_auth(&password),
                    _ => break,
                };
                link.send(reply).unwrap();
            }
        });
        ours
    }

    #[tokio::test]
    async fn session_authenticates_against_responder() {
        let stream = serve("pw");
        let mut session = PeerSession::over(stream, "127.0.0.1:8000", &Timeouts::default())
            .await
            .unwrap();
        session.exchange_keys().await.unwrap();
        session.authenticate("pw").await.unwrap();
        assert_eq!(session.state(), LinkState::Authorized);
    }

    #[tokio::test]
    async fn session_reports_incorrect_password_with_host() {
        let stream = serve("pw");
        let mut session = PeerSession::over(stream, "127.0.0.1:8000", &Timeouts::default())
            .await
            .unwrap();
        session.exchange_keys().await.unwrap();
        let err = session.authenticate("nope").await.unwrap_err();
        assert_eq!(err.abort_reason(), "127.0.0.1:8000 incorrect password");
        assert_eq!(session.state(), LinkState::Closed);
    }
}
