//! Runtime linked into worker programs.
//!
//! A worker is started by a beacon with `size` and `rank` as its first two
//! arguments and the path of its control socket in [`CONTROL_SOCKET_ENV`].
//! [`init`] connects to that socket and runs the worker's entry function;
//! [`Process`] is the handle the entry function uses to talk to other ranks.

use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::error::{CohortError, Result};
use crate::protocol::{Envelope, Header, JsonCodec, WorkerFrame};
use crate::scheduler::Rank;

/// Environment variable carrying the worker's control socket path.
pub const CONTROL_SOCKET_ENV: &str = "COHORT_CONTROL_SOCKET";

/// Which messages a [`Process::recv`] accepts. `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Criteria {
    pub from: Option<Rank>,
    pub subject: Option<String>,
}

impl Criteria {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn from_rank(rank: Rank) -> Self {
        Self {
            from: Some(rank),
            subject: None,
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn matches(&self, header: &Header) -> bool {
        self.from.map_or(true, |from| from == header.from)
            && self
                .subject
                .as_ref()
                .map_or(true, |s| header.subject.as_ref() == Some(s))
    }
}

/// A message about to be sent. `to` and `data` are required.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub to: Option<Rank>,
    pub data: Option<Value>,
    pub subject: Option<String>,
}

impl OutgoingMessage {
    pub fn new(to: Rank, data: Value) -> Self {
        Self {
            to: Some(to),
            data: Some(data),
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// Inbound messages not yet received, plus at most one waiting receive.
#[derive(Debug, Default)]
struct Mailbox {
    queue: VecDeque<Envelope>,
    waiting: Option<(Criteria, oneshot::Sender<Value>)>,
    closed: bool,
}

impl Mailbox {
    fn deliver(&mut self, envelope: Envelope) {
        if let Some((criteria, waiter)) = self.waiting.take() {
            if criteria.matches(&envelope.header) {
                match waiter.send(envelope.data) {
                    Ok(()) => return,
                    Err(data) => {
                        // Receiver went away; keep the message.
                        self.queue.push_back(Envelope {
                            header: envelope.header,
                            data,
                        });
                        return;
                    }
                }
            }
            self.waiting = Some((criteria, waiter));
        }
        self.queue.push_back(envelope);
    }

    fn take(&mut self, criteria: &Criteria) -> Option<Value> {
        let index = self.queue.iter().position(|e| criteria.matches(&e.header))?;
        self.queue.remove(index).map(|e| e.data)
    }

    fn close(&mut self) {
        self.closed = true;
        self.waiting = None;
    }
}

enum Outbound {
    Frame(WorkerFrame),
    Flush(oneshot::Sender<()>),
}

struct Inner {
    rank: Rank,
    size: usize,
    outbound: mpsc::UnboundedSender<Outbound>,
    mailbox: Mutex<Mailbox>,
}

/// Handle of one worker process.
#[derive(Clone)]
pub struct Process {
    inner: Arc<Inner>,
}

impl Process {
    /// Connect to the beacon's control socket and introduce ourselves.
    ///
    /// The returned task finishes when the control channel closes.
    pub async fn connect(socket: &Path, rank: Rank, size: usize) -> Result<(Self, JoinHandle<()>)> {
        let stream = UnixStream::connect(socket).await?;
        Ok(Self::attach(stream, rank, size))
    }

    fn attach(stream: UnixStream, rank: Rank, size: usize) -> (Self, JoinHandle<()>) {
        let (mut sink, mut frames) = Framed::new(stream, JsonCodec::<WorkerFrame>::new()).split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            rank,
            size,
            outbound,
            mailbox: Mutex::new(Mailbox::default()),
        });

        tokio::spawn(async move {
            if sink.send(WorkerFrame::Hello { rank }).await.is_err() {
                return;
            }
            while let Some(item) = outbound_rx.recv().await {
                match item {
                    Outbound::Frame(frame) => {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Flush(done) => {
                        let _ = sink.flush().await;
                        let _ = done.send(());
                    }
                }
            }
        });

        let reader_inner = inner.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(frame)) = frames.next().await {
                match frame {
                    WorkerFrame::Msg(envelope) => {
                        if let Ok(mut mailbox) = reader_inner.mailbox.lock() {
                            mailbox.deliver(envelope);
                        }
                    }
                    WorkerFrame::Hello { .. } => {}
                }
            }
            if let Ok(mut mailbox) = reader_inner.mailbox.lock() {
                mailbox.close();
            }
        });

        (Process { inner }, reader)
    }

    pub fn rank(&self) -> Rank {
        self.inner.rank
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Queue a message for another rank. Fails at once when `to` or `data`
    /// is missing; `0`, `false` and `null` are all valid data.
    pub fn send(&self, message: OutgoingMessage) -> Result<()> {
        let to = message.to.ok_or(CohortError::MissingField("to"))?;
        let data = message.data.ok_or(CohortError::MissingField("data"))?;
        let envelope = Envelope::new(self.inner.rank, to, message.subject, data);
        self.inner
            .outbound
            .send(Outbound::Frame(WorkerFrame::Msg(envelope)))
            .map_err(|_| CohortError::ChannelClosed("control channel"))
    }

    /// Shorthand for sending any serializable value without a subject.
    pub fn send_to<T: Serialize>(&self, to: Rank, data: T) -> Result<()> {
        self.send(OutgoingMessage::new(to, serde_json::to_value(data)?))
    }

    /// Receive the earliest message matching `criteria`, waiting for one if
    /// none has arrived yet. Only one receive may wait at a time.
    pub async fn recv(&self, criteria: Criteria) -> Result<Value> {
        let waiting = {
            let mut mailbox = self
                .inner
                .mailbox
                .lock()
                .map_err(|_| CohortError::ChannelClosed("mailbox"))?;
            if let Some(data) = mailbox.take(&criteria) {
                return Ok(data);
            }
            if mailbox.closed {
                return Err(CohortError::ChannelClosed("control channel"));
            }
            if let Some((_, waiter)) = &mailbox.waiting {
                if !waiter.is_closed() {
                    return Err(CohortError::RecvPending);
                }
            }
            let (tx, rx) = oneshot::channel();
            mailbox.waiting = Some((criteria, tx));
            rx
        };
        waiting
            .await
            .map_err(|_| CohortError::ChannelClosed("control channel"))
    }

    /// Wait until every message sent so far has been written to the socket.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .outbound
            .send(Outbound::Flush(tx))
            .map_err(|_| CohortError::ChannelClosed("control channel"))?;
        rx.await
            .map_err(|_| CohortError::ChannelClosed("control channel"))
    }

    /// Flush and terminate the worker successfully.
    pub async fn end(&self) -> ! {
        let _ = self.flush().await;
        std::process::exit(0)
    }
}

/// Parse `size` and `rank` from the launch arguments.
pub fn launch_args<I: IntoIterator<Item = String>>(args: I) -> Result<(usize, Rank)> {
    let mut args = args.into_iter().skip(1);
    let size = args
        .next()
        .and_then(|a| a.parse::<usize>().ok())
        .ok_or(CohortError::MissingField("size"))?;
    let rank = args
        .next()
        .and_then(|a| a.parse::<Rank>().ok())
        .ok_or(CohortError::MissingField("rank"))?;
    if rank >= size {
        return Err(CohortError::UnknownRank(rank));
    }
    Ok((size, rank))
}

/// Run `entry` as this worker's program and exit.
///
/// Exits with 1 when the worker was not started by a beacon, when `entry`
/// fails, or when the beacon closes the control channel first.
pub fn init<F, Fut>(entry: F) -> !
where
    F: FnOnce(Process) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let Ok(socket) = std::env::var(CONTROL_SOCKET_ENV) else {
        eprintln!("cohort workers must be launched by a beacon");
        std::process::exit(1);
    };
    let (size, rank) = match launch_args(std::env::args()) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("invalid launch arguments: {}", e);
            std::process::exit(1);
        }
    };
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async move {
        let (process, reader) = match Process::connect(Path::new(&socket), rank, size).await {
            Ok(connected) => connected,
            Err(e) => {
                eprintln!("cannot reach beacon: {}", e);
                return 1;
            }
        };
        let handle = process.clone();
        tokio::select! {
            result = entry(process) => match result {
                Ok(()) => {
                    let _ = handle.flush().await;
                    0
                }
                Err(e) => {
                    eprintln!("{}", e);
                    let _ = handle.flush().await;
                    1
                }
            },
            _ = reader => 1,
        }
    });
    std::process::exit(code)
}
