//! The local control socket submitters connect to.

use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::beacon::{BeaconEvent, BeaconHandle, ConnId};
use crate::error::{CohortError, Result};
use crate::protocol::{ControlFrame, JsonCodec};

/// Bind the control socket, replacing a stale one left by a dead beacon.
pub async fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(CohortError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("a beacon is already running on {}", path.display()),
            )));
        }
        tracing::debug!(path = %path.display(), "Removing stale control socket");
        std::fs::remove_file(path)?;
    }
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(UnixListener::bind(path)?)
}

pub async fn serve(listener: UnixListener, handle: BeaconHandle, shutdown: CancellationToken) {
    let mut next_conn: ConnId = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    next_conn += 1;
                    tokio::spawn(serve_submitter(stream, next_conn, handle.clone(), shutdown.clone()));
                }
                Err(e) => tracing::warn!(error = %e, "Failed to accept submitter"),
            }
        }
    }
}

async fn serve_submitter(
    stream: UnixStream,
    conn: ConnId,
    handle: BeaconHandle,
    shutdown: CancellationToken,
) {
    let (mut sink, mut frames) = Framed::new(stream, JsonCodec::<ControlFrame>::new()).split();
    let (reply, mut outbound) = mpsc::unbounded_channel::<ControlFrame>();
    tracing::debug!(conn, "Submitter connected");

    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    tracing::debug!(conn, error = %e, "Write to submitter failed");
                    break;
                }
            }
            _ = shutdown.cancelled() => {
                // Let the final events of an aborted job go out.
                while let Ok(frame) = outbound.try_recv() {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
            incoming = frames.next() => match incoming {
                Some(Ok(frame)) => {
                    let event = BeaconEvent::Control { conn, frame, reply: reply.clone() };
                    if handle.send(event).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(conn, error = %e, "Bad frame from submitter");
                    break;
                }
                None => break,
            }
        }
    }

    tracing::debug!(conn, "Submitter disconnected");
    let _ = handle.send(BeaconEvent::SubmitterClosed { conn });
}
