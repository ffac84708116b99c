//! Beacon-to-beacon plumbing outside the control loop: accepting links from
//! parents, pumping link events into the loop and dispatching job shares to
//! remote hosts.

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::beacon::{BeaconEvent, BeaconHandle};
use crate::config::Timeouts;
use crate::crypto::Sealed;
use crate::error::{CohortError, Result};
use crate::protocol::{JobFrame, PeerFrame};
use crate::remote::session::signal_abort;
use crate::remote::{LinkEvent, PeerLink, PeerSession, Responder};

/// Accept connections from parent beacons until shutdown.
pub async fn serve(
    listener: TcpListener,
    password: String,
    handle: BeaconHandle,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(peer = %addr, "Peer connected");
                    tokio::spawn(serve_peer(
                        stream,
                        addr.to_string(),
                        password.clone(),
                        handle.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => tracing::warn!(error = %e, "Failed to accept peer"),
            }
        }
    }
}

/// Answer one parent: handshake, JOB, then forward its frames to the loop.
async fn serve_peer(
    stream: tokio::net::TcpStream,
    peer: String,
    password: String,
    handle: BeaconHandle,
    shutdown: CancellationToken,
) {
    let (link, mut events) = PeerLink::spawn(stream, peer.clone());
    let mut responder = Responder::new(peer.clone(), password);

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => {
                link.close();
                break;
            }
            event = events.recv() => event,
        };
        let Some(event) = event else { break };

        let frame = match event {
            LinkEvent::Frame(frame) => frame,
            LinkEvent::Closed { reason } => {
                tracing::debug!(peer = %peer, reason = %reason, "Parent link closed");
                if link.job().is_some() {
                    let _ = handle.send(BeaconEvent::PeerClosed {
                        job_id: link.job(),
                        host: peer.clone(),
                        reason,
                    });
                }
                break;
            }
        };

        let reply = match frame {
            PeerFrame::Probe => responder.on_probe(),
            PeerFrame::KeyExchangeParams { prime, public_key } => {
                match responder.on_key_exchange(&prime, &public_key) {
                    Ok((reply, cipher)) => match link.set_cipher(cipher) {
                        Ok(()) => reply,
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "Key exchange failed");
                            link.close();
                            break;
                        }
                    },
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "Key exchange failed");
                        link.close();
                        break;
                    }
                }
            }
            PeerFrame::Auth { password } => {
                let reply = responder.on_auth(&password);
                if responder.is_authorized() {
                    link.set_state(responder.state());
                }
                reply
            }
            PeerFrame::Job { job } => {
                let result = accept_job(&handle, &link, &responder, &job).await;
                if let Err(e) = &result {
                    tracing::warn!(peer = %peer, error = %e, "Rejected job share");
                } else {
                    responder.job_accepted();
                }
                PeerFrame::JobAck {
                    status: result.is_ok(),
                    error: result.err().map(|e| e.abort_reason()),
                }
            }
            frame if link.job().is_some() => {
                let event = BeaconEvent::Peer {
                    job_id: link.job(),
                    host: peer.clone(),
                    frame,
                };
                if handle.send(event).is_err() {
                    break;
                }
                continue;
            }
            frame => {
                tracing::warn!(peer = %peer, frame = frame.name(), "Frame before job assignment");
                continue;
            }
        };

        if let Err(e) = link.send(reply) {
            tracing::debug!(peer = %peer, error = %e, "Reply not sent");
            break;
        }
    }
}

async fn accept_job(
    handle: &BeaconHandle,
    link: &PeerLink,
    responder: &Responder,
    sealed: &Sealed,
) -> Result<()> {
    let job = responder.open_job(sealed)?;
    let (ack, acked) = oneshot::channel();
    handle.send(BeaconEvent::RemoteJob {
        link: link.clone(),
        job,
        ack,
    })?;
    acked
        .await
        .map_err(|_| CohortError::ChannelClosed("beacon"))?
}

/// Forward a link's events to the control loop, tagged with its job.
pub async fn pump(
    host: String,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    job_id: Option<Uuid>,
    handle: BeaconHandle,
) {
    while let Some(event) = events.recv().await {
        let event = match event {
            LinkEvent::Frame(frame) => BeaconEvent::Peer {
                job_id,
                host: host.clone(),
                frame,
            },
            LinkEvent::Closed { reason } => {
                let _ = handle.send(BeaconEvent::PeerClosed {
                    job_id,
                    host,
                    reason,
                });
                return;
            }
        };
        if handle.send(event).is_err() {
            return;
        }
    }
}

/// One remote host's share of a job.
#[derive(Debug)]
pub struct Dispatch {
    pub host: String,
    pub password: String,
    pub frame: JobFrame,
}

/// Connect, authenticate and hand out every share concurrently.
///
/// Either every host accepts, or the first failure to arrive is reported at
/// once: attempts still in flight are dropped, which closes their
/// connections, and the hosts that already accepted are told to abort.
/// Cancelling does the same without reporting anything.
pub async fn dispatch_all(
    job_id: Uuid,
    dispatches: Vec<Dispatch>,
    timeouts: Timeouts,
    handle: BeaconHandle,
    cancel: CancellationToken,
) {
    let mut attempts: FuturesUnordered<_> = dispatches
        .iter()
        .map(|d| dispatch_one(d, &timeouts))
        .collect();
    let mut accepted = Vec::with_capacity(dispatches.len());

    let failure = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(job_id = %job_id, "Dispatch cancelled");
                for (link, _) in &accepted {
                    signal_abort(link, "job no longer active");
                }
                return;
            }
            next = attempts.next() => next,
        };
        match next {
            Some(Ok(session)) => {
                tracing::debug!(job_id = %job_id, peer = %session.host(), "Share accepted");
                accepted.push(session.into_parts());
            }
            Some(Err(e)) => break Some(e),
            None => break None,
        }
    };
    let abandoned = attempts.len();
    drop(attempts);

    let result = match failure {
        None => Ok(accepted),
        Some(e) => {
            tracing::warn!(job_id = %job_id, error = %e, abandoned, "Dispatch failed");
            let reason = e.abort_reason();
            for (link, _) in &accepted {
                signal_abort(link, &reason);
            }
            Err(e)
        }
    };
    let _ = handle.send(BeaconEvent::Dispatched { job_id, result });
}

async fn dispatch_one(dispatch: &Dispatch, timeouts: &Timeouts) -> Result<PeerSession> {
    tracing::debug!(peer = %dispatch.host, "Dispatching share");
    let mut session = PeerSession::establish(&dispatch.host, &dispatch.password, timeouts).await?;
    session.dispatch(&dispatch.frame).await?;
    Ok(session)
}
