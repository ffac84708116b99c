//! A framed connection to another beacon.
//!
//! Each link runs a reader task and a writer task. Reply frames (ALIVE,
//! KEY-EXCHANGE-PUBLIC, AUTH-STATUS, JOB-ACK, DONE-ACK) complete the oldest
//! outstanding [`PeerLink::call`]; every other frame is handed to whoever owns
//! the link's event receiver. Frames are written in the order they are queued,
//! which keeps messages between two ranks in send order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::crypto::{Sealed, SessionCipher};
use crate::error::{CohortError, Result};
use crate::protocol::{Envelope, JsonCodec, MonitorEvent, PeerFrame};
use crate::remote::LinkState;

/// What the reader task reports to the owner of a link.
#[derive(Debug)]
pub enum LinkEvent {
    Frame(PeerFrame),
    Closed { reason: String },
}

struct Shared {
    id: String,
    waiters: Mutex<VecDeque<oneshot::Sender<PeerFrame>>>,
    cipher: OnceLock<SessionCipher>,
    job: Mutex<Option<Uuid>>,
    state: Mutex<LinkState>,
}

/// Cancels the link tasks once the last handle is gone.
struct CloseOnDrop(CancellationToken);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Cheaply clonable handle to one beacon-to-beacon connection.
#[derive(Clone)]
pub struct PeerLink {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<PeerFrame>,
    closed: CancellationToken,
    _guard: Arc<CloseOnDrop>,
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl PeerLink {
    /// Start the reader and writer tasks over `stream`.
    pub fn spawn<S>(stream: S, id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<LinkEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = Arc::new(Shared {
            id: id.into(),
            waiters: Mutex::new(VecDeque::new()),
            cipher: OnceLock::new(),
            job: Mutex::new(None),
            state: Mutex::new(LinkState::Connecting),
        });
        let closed = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let (sink, stream) = Framed::new(stream, JsonCodec::<PeerFrame>::new()).split();
        tokio::spawn(write_loop(sink, outbound_rx, closed.clone(), shared.id.clone()));
        tokio::spawn(read_loop(stream, events_tx, closed.clone(), shared.clone()));

        let link = PeerLink {
            shared,
            outbound,
            closed: closed.clone(),
            _guard: Arc::new(CloseOnDrop(closed)),
        };
        (link, events_rx)
    }

    /// The host identifier this link was opened for (`ip:port`).
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> LinkState {
        self.shared
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(LinkState::Closed)
    }

    pub fn set_state(&self, state: LinkState) {
        if let Ok(mut current) = self.shared.state.lock() {
            tracing::trace!(peer = %self.shared.id, from = ?*current, to = ?state, "Link state");
            *current = state;
        }
    }

    /// The job this link carries, once dispatch succeeded.
    pub fn job(&self) -> Option<Uuid> {
        self.shared.job.lock().ok().and_then(|j| *j)
    }

    pub fn bind_job(&self, job_id: Uuid) {
        if let Ok(mut job) = self.shared.job.lock() {
            *job = Some(job_id);
        }
        self.set_state(LinkState::JobAssigned);
    }

    /// Install the session keys negotiated during key exchange.
    pub fn set_cipher(&self, cipher: SessionCipher) -> Result<()> {
        self.shared
            .cipher
            .set(cipher)
            .map_err(|_| CohortError::HandshakeFailed("keys already exchanged".to_string()))?;
        self.set_state(LinkState::KeyExchanged);
        Ok(())
    }

    pub fn cipher(&self) -> Result<&SessionCipher> {
        self.shared
            .cipher
            .get()
            .ok_or_else(|| CohortError::HandshakeFailed("unsecure channel".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Queue a frame for writing.
    pub fn send(&self, frame: PeerFrame) -> Result<()> {
        if self.is_closed() {
            return Err(CohortError::ChannelClosed("peer link"));
        }
        self.outbound
            .send(frame)
            .map_err(|_| CohortError::ChannelClosed("peer link"))
    }

    /// Send `frame` and wait for the matching reply.
    pub async fn call(
        &self,
        frame: PeerFrame,
        timeout: Duration,
        waiting_for: &'static str,
    ) -> Result<PeerFrame> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .waiters
            .lock()
            .map_err(|_| CohortError::ChannelClosed("peer link"))?
            .push_back(tx);
        self.send(frame)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CohortError::LostConnection(format!(
                "lost connection to {}",
                self.shared.id
            ))),
            Err(_) => Err(CohortError::Timeout(waiting_for)),
        }
    }

    /// Seal an envelope with the session keys and forward it as MSG.
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let sealed = self.cipher()?.seal_json(envelope)?;
        self.send(PeerFrame::Msg { envelope: sealed })
    }

    /// Seal a monitor event and forward it as MONITOR.
    pub fn send_monitor(&self, event: &MonitorEvent) -> Result<()> {
        let sealed = self.cipher()?.seal_json(event)?;
        self.send(PeerFrame::Monitor { event: sealed })
    }

    pub fn open<T: DeserializeOwned>(&self, sealed: &Sealed) -> Result<T> {
        self.cipher()?.open_json(sealed)
    }

    /// Stop both tasks. Frames already queued are still written.
    pub fn close(&self) {
        self.set_state(LinkState::Closed);
        self.closed.cancel();
    }
}

async fn write_loop<W>(
    mut sink: W,
    mut outbound: mpsc::UnboundedReceiver<PeerFrame>,
    closed: CancellationToken,
    peer: String,
) where
    W: futures::Sink<PeerFrame, Error = CohortError> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let name = frame.name();
                if let Err(e) = sink.send(frame).await {
                    tracing::debug!(peer = %peer, frame = name, error = %e, "Failed to write frame");
                    closed.cancel();
                    return;
                }
            }
            _ = closed.cancelled() => {
                // Flush whatever was queued before the close, e.g. a final ABORT.
                while let Ok(frame) = outbound.try_recv() {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<R>(
    mut stream: R,
    events: mpsc::UnboundedSender<LinkEvent>,
    closed: CancellationToken,
    shared: Arc<Shared>,
) where
    R: futures::Stream<Item = Result<PeerFrame>> + Unpin,
{
    let reason = loop {
        tokio::select! {
            _ = closed.cancelled() => break "link closed".to_string(),
            next = stream.next() => match next {
                Some(Ok(frame)) => {
                    tracing::trace!(peer = %shared.id, frame = frame.name(), "Frame received");
                    let frame = if frame.is_reply() {
                        match shared.waiters.lock().ok().and_then(|mut w| w.pop_front()) {
                            Some(waiter) => {
                                let _ = waiter.send(frame);
                                continue;
                            }
                            None => frame,
                        }
                    } else {
                        frame
                    };
                    if events.send(LinkEvent::Frame(frame)).is_err() {
                        break "link owner gone".to_string();
                    }
                }
                Some(Err(e)) => break format!("lost connection to {}: {}", shared.id, e),
                None => break format!("lost connection to {}", shared.id),
            }
        }
    };

    closed.cancel();
    if let Ok(mut waiters) = shared.waiters.lock() {
        waiters.clear();
    }
    if let Ok(mut state) = shared.state.lock() {
        *state = LinkState::Closed;
    }
    let _ = events.send(LinkEvent::Closed { reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use serde_json::json;

    fn pair() -> (
        (PeerLink, mpsc::UnboundedReceiver<LinkEvent>),
        (PeerLink, mpsc::UnboundedReceiver<LinkEvent>),
    ) {
        let (a, b) = tokio::io::duplex(4096);
        (PeerLink::spawn(a, "a:1"), PeerLink::spawn(b, "b:1"))
    }

    fn share_keys(a: &PeerLink, b: &PeerLink) {
        let x = KeyPair::generate();
        let y = KeyPair::for_encoded_prime(&x.encoded_prime()).unwrap();
        a.set_cipher(x.agree(&y.encoded_public()).unwrap()).unwrap();
        b.set_cipher(y.agree(&x.encoded_public()).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn call_is_answered_by_reply_frame() {
        let ((a, _a_events), (b, mut b_events)) = pair();
        tokio::spawn(async move {
            while let Some(LinkEvent::Frame(PeerFrame::Probe)) = b_events.recv().await {
                b.send(PeerFrame::Alive).unwrap();
            }
        });

        let reply = a
            .call(PeerFrame::Probe, Duration::from_secs(1), "ALIVE")
            .await
            .unwrap();
        assert_eq!(reply, PeerFrame::Alive);
    }

    #[tokio::test]
    async fn unanswered_call_times_out() {
        let ((a, _a_events), (_b, _b_events)) = pair();
        let result = a
            .call(PeerFrame::Probe, Duration::from_millis(50), "ALIVE")
            .await;
        assert!(matches!(result, Err(CohortError::Timeout("ALIVE"))));
    }

    #[tokio::test]
    async fn sealed_messages_arrive_in_order() {
        let ((a, _a_events), (b, mut b_events)) = pair();
        share_keys(&a, &b);

        for i in 0..20 {
            a.send_envelope(&Envelope::new(0, 1, None, json!(i))).unwrap();
        }
        for i in 0..20 {
            match b_events.recv().await.unwrap() {
                LinkEvent::Frame(PeerFrame::Msg { envelope }) => {
                    let env: Envelope = b.open(&envelope).unwrap();
                    assert_eq!(env.data, json!(i));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn sealing_requires_key_exchange() {
        let ((a, _a_events), (_b, _b_events)) = pair();
        let result = a.send_monitor(&MonitorEvent::aborted("x", false));
        assert!(matches!(result, Err(CohortError::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn dropping_the_peer_reports_closed() {
        let ((a, mut a_events), (b, b_events)) = pair();
        drop(b);
        drop(b_events);
        match a_events.recv().await.unwrap() {
            LinkEvent::Closed { reason } => assert!(reason.contains("b:1") || reason.contains("a:1")),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(a.is_closed());
        assert!(a.send(PeerFrame::Probe).is_err());
    }

    #[tokio::test]
    async fn frames_queued_before_close_are_flushed() {
        let ((a, _a_events), (_b, mut b_events)) = pair();
        a.send(PeerFrame::Abort {
            reason: "bye".to_string(),
        })
        .unwrap();
        a.close();
        match b_events.recv().await.unwrap() {
            LinkEvent::Frame(PeerFrame::Abort { reason }) => assert_eq!(reason, "bye"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
