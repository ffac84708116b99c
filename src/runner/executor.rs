use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CohortError, Result};
use crate::process::CONTROL_SOCKET_ENV;
use crate::protocol::{Envelope, JsonCodec, MonitorEvent, WorkerFrame};
use crate::router::{Router, WorkerChannel};
use crate::scheduler::Rank;

/// The ranks of a job this node runs itself.
#[derive(Debug, Clone)]
pub struct LocalSubjob {
    pub job_id: Uuid,
    pub entry: PathBuf,
    pub size: usize,
    pub start: Rank,
    pub count: usize,
}

impl LocalSubjob {
    pub fn ranks(&self) -> std::ops::Range<Rank> {
        self.start..self.start + self.count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// What the runner's observers report back to the beacon.
#[derive(Debug)]
pub enum RunnerEvent {
    Output {
        job_id: Uuid,
        rank: Rank,
        stream: OutputStream,
        line: String,
    },
    Exited {
        job_id: Uuid,
        rank: Rank,
        code: Option<i32>,
    },
    /// A worker connected to its control socket.
    Attached {
        job_id: Uuid,
        rank: Rank,
        channel: WorkerChannel,
    },
    /// A worker sent an envelope.
    Message {
        job_id: Uuid,
        rank: Rank,
        envelope: Envelope,
    },
}

impl RunnerEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            RunnerEvent::Output { job_id, .. }
            | RunnerEvent::Exited { job_id, .. }
            | RunnerEvent::Attached { job_id, .. }
            | RunnerEvent::Message { job_id, .. } => *job_id,
        }
    }
}

struct RunningJob {
    job_id: Uuid,
    socket: PathBuf,
    stop: CancellationToken,
}

/// Spawns and supervises the worker processes of the current job.
pub struct JobRunner {
    runtime_dir: PathBuf,
    kill_grace: Duration,
    events: mpsc::UnboundedSender<RunnerEvent>,
    current: Option<RunningJob>,
}

impl JobRunner {
    pub fn new(
        runtime_dir: impl Into<PathBuf>,
        kill_grace: Duration,
        events: mpsc::UnboundedSender<RunnerEvent>,
    ) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            kill_grace,
            events,
            current: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    /// Start one worker per rank of `subjob`.
    ///
    /// Workers get `size` and `rank` as arguments and the path of the job's
    /// control socket in the environment. If a spawn fails the workers
    /// already started stay up; the caller aborts the job.
    pub async fn run_locally(&mut self, subjob: &LocalSubjob) -> Result<()> {
        if let Some(job) = &self.current {
            if job.job_id != subjob.job_id {
                return Err(CohortError::ProtocolViolation(format!(
                    "runner is busy with job {}",
                    job.job_id
                )));
            }
        }
        if self.current.is_none() {
            let job = self.listen(subjob.job_id).await?;
            self.current = Some(job);
        }
        let Some(job) = &self.current else {
            return Err(CohortError::ChannelClosed("runner"));
        };

        tracing::info!(
            job_id = %subjob.job_id,
            entry = %subjob.entry.display(),
            start = subjob.start,
            count = subjob.count,
            "Starting workers"
        );
        for rank in subjob.ranks() {
            let child = spawn_worker(&subjob.entry, subjob.size, rank, &job.socket)?;
            tokio::spawn(supervise(
                child,
                subjob.job_id,
                rank,
                self.events.clone(),
                job.stop.clone(),
                self.kill_grace,
            ));
        }
        Ok(())
    }

    /// Terminate every worker of the current job and tell the monitor why.
    ///
    /// Workers lose their control socket first and are killed if they are
    /// still around after the grace period. Router state is left to the caller.
    pub fn abort(&mut self, reason: &str, signaled: bool, router: &Router) {
        if let Some(job) = self.current.take() {
            tracing::warn!(job_id = %job.job_id, reason, "Aborting local workers");
            job.stop.cancel();
            remove_socket(&job.socket);
        }
        if let Err(e) = router.route_to_parent(MonitorEvent::aborted(reason, signaled)) {
            tracing::debug!(error = %e, "Aborted event not delivered");
        }
    }

    /// Release the control socket after a completed job.
    pub fn finish(&mut self) {
        if let Some(job) = self.current.take() {
            tracing::info!(job_id = %job.job_id, "Job finished");
            job.stop.cancel();
            remove_socket(&job.socket);
        }
    }

    async fn listen(&self, job_id: Uuid) -> Result<RunningJob> {
        tokio::fs::create_dir_all(&self.runtime_dir).await?;
        let socket = self.runtime_dir.join(format!("{}.sock", job_id.simple()));
        remove_socket(&socket);
        let listener = UnixListener::bind(&socket)?;
        let stop = CancellationToken::new();
        tokio::spawn(accept_workers(
            listener,
            job_id,
            self.events.clone(),
            stop.clone(),
        ));
        Ok(RunningJob {
            job_id,
            socket,
            stop,
        })
    }
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %e, "Could not remove control socket");
        }
    }
}

fn spawn_worker(entry: &Path, size: usize, rank: Rank, socket: &Path) -> Result<Child> {
    Command::new(entry)
        .arg(size.to_string())
        .arg(rank.to_string())
        .env(CONTROL_SOCKET_ENV, socket)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            CohortError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to start {}: {}", entry.display(), e),
            ))
        })
}

/// Forward output lines, wait for exit and report it. On stop the worker
/// gets `grace` to exit on its own before it is killed.
async fn supervise(
    mut child: Child,
    job_id: Uuid,
    rank: Rank,
    events: mpsc::UnboundedSender<RunnerEvent>,
    stop: CancellationToken,
    grace: Duration,
) {
    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        let events = events.clone();
        readers.push(tokio::spawn(forward_lines(out, job_id, rank, OutputStream::Stdout, events)));
    }
    if let Some(err) = child.stderr.take() {
        let events = events.clone();
        readers.push(tokio::spawn(forward_lines(err, job_id, rank, OutputStream::Stderr, events)));
    }

    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop.cancelled() => match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(job_id = %job_id, rank, "Worker still running after grace period, killing");
                let _ = child.start_kill();
                child.wait().await
            }
        },
    };

    // Output lines go out before the exit notice.
    for reader in readers {
        let _ = tokio::time::timeout(Duration::from_secs(1), reader).await;
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(job_id = %job_id, rank, error = %e, "Failed to wait for worker");
            None
        }
    };
    tracing::info!(job_id = %job_id, rank, code = ?code, "Worker exited");
    let _ = events.send(RunnerEvent::Exited { job_id, rank, code });
}

async fn forward_lines<R>(
    reader: R,
    job_id: Uuid,
    rank: Rank,
    stream: OutputStream,
    events: mpsc::UnboundedSender<RunnerEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let event = RunnerEvent::Output {
                    job_id,
                    rank,
                    stream,
                    line,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(job_id = %job_id, rank, error = %e, "Output stream failed");
                break;
            }
        }
    }
}

async fn accept_workers(
    listener: UnixListener,
    job_id: Uuid,
    events: mpsc::UnboundedSender<RunnerEvent>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_worker(stream, job_id, events.clone(), stop.clone()));
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Worker control socket failed");
                    break;
                }
            }
        }
    }
}

/// Pump envelopes between one worker and the beacon until either side goes
/// away or the job stops.
async fn serve_worker(
    stream: UnixStream,
    job_id: Uuid,
    events: mpsc::UnboundedSender<RunnerEvent>,
    stop: CancellationToken,
) {
    let (mut sink, mut frames) = Framed::new(stream, JsonCodec::<WorkerFrame>::new()).split();

    let first = tokio::select! {
        _ = stop.cancelled() => return,
        frame = frames.next() => frame,
    };
    let rank = match first {
        Some(Ok(WorkerFrame::Hello { rank })) => rank,
        other => {
            tracing::warn!(job_id = %job_id, frame = ?other, "Worker did not introduce itself");
            return;
        }
    };

    let (tx, mut downlink) = mpsc::unbounded_channel();
    let attached = RunnerEvent::Attached {
        job_id,
        rank,
        channel: WorkerChannel::new(tx),
    };
    if events.send(attached).is_err() {
        return;
    }
    tracing::debug!(job_id = %job_id, rank, "Worker attached");

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            outgoing = downlink.recv() => {
                let Some(envelope) = outgoing else { break };
                if let Err(e) = sink.send(WorkerFrame::Msg(envelope)).await {
                    tracing::debug!(job_id = %job_id, rank, error = %e, "Worker write failed");
                    break;
                }
            }
            incoming = frames.next() => match incoming {
                Some(Ok(WorkerFrame::Msg(envelope))) => {
                    if envelope.header.from != rank {
                        tracing::warn!(
                            job_id = %job_id,
                            rank,
                            claimed = envelope.header.from,
                            "Dropping message with forged sender"
                        );
                        continue;
                    }
                    if events.send(RunnerEvent::Message { job_id, rank, envelope }).is_err() {
                        break;
                    }
                }
                Some(Ok(WorkerFrame::Hello { .. })) => {
                    tracing::warn!(job_id = %job_id, rank, "Duplicate HELLO from worker");
                }
                Some(Err(e)) => {
                    tracing::warn!(job_id = %job_id, rank, error = %e, "Bad frame from worker");
                    break;
                }
                None => break,
            }
        }
    }
}
