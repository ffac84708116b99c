//! Submitter side of the local control socket.

use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::error::{CohortError, Result};
use crate::protocol::{Admission, ControlFrame, JsonCodec, MonitorEvent};
use crate::scheduler::{JobDescriptor, Rank};

/// Reason sent when the submitter is interrupted from the keyboard.
pub const KEYBOARD_INTERRUPT: &str = "Keyboard Interrupt";

/// How a watched job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every rank exited. Ranks with a non-zero or missing exit code are listed.
    Completed { failed: Vec<(Rank, Option<i32>)> },
    Aborted { reason: String },
}

pub struct Submitter {
    framed: Framed<UnixStream, JsonCodec<ControlFrame>>,
}

impl Submitter {
    pub async fn connect(socket: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket).await.map_err(|e| {
            CohortError::LostConnection(format!(
                "no beacon listening on {}: {}",
                socket.display(),
                e
            ))
        })?;
        Ok(Self {
            framed: Framed::new(stream, JsonCodec::new()),
        })
    }

    async fn send(&mut self, frame: ControlFrame) -> Result<()> {
        self.framed.send(frame).await
    }

    async fn next_frame(&mut self) -> Result<Option<ControlFrame>> {
        self.framed.next().await.transpose()
    }

    /// Check that the beacon answers.
    pub async fn probe(&mut self, timeout: Duration) -> Result<()> {
        self.send(ControlFrame::Probe).await?;
        match tokio::time::timeout(timeout, self.next_frame()).await {
            Ok(Ok(Some(ControlFrame::Alive))) => Ok(()),
            Ok(Ok(Some(other))) => Err(CohortError::ProtocolViolation(format!(
                "expected ALIVE, got {:?}",
                other
            ))),
            Ok(Ok(None)) => Err(CohortError::LostConnection(
                "lost connection to local beacon".to_string(),
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CohortError::Timeout("ALIVE")),
        }
    }

    /// Submit a job and return the beacon's admission decision.
    pub async fn run(&mut self, job: JobDescriptor) -> Result<Admission> {
        self.send(ControlFrame::Run { job }).await?;
        match self.next_frame().await? {
            Some(ControlFrame::Confirm { status }) => Ok(status),
            Some(other) => Err(CohortError::ProtocolViolation(format!(
                "expected CONFIRM, got {:?}",
                other
            ))),
            None => Err(CohortError::LostConnection(
                "lost connection to local beacon".to_string(),
            )),
        }
    }

    /// The next monitor event, or `None` once the beacon hangs up.
    pub async fn next_event(&mut self) -> Result<Option<MonitorEvent>> {
        loop {
            match self.next_frame().await? {
                Some(ControlFrame::Monitor { event }) => return Ok(Some(event)),
                Some(other) => {
                    tracing::debug!(frame = ?other, "Ignoring non-monitor frame");
                }
                None => return Ok(None),
            }
        }
    }

    pub async fn done(&mut self) -> Result<()> {
        self.send(ControlFrame::Done).await
    }

    pub async fn abort(&mut self, reason: &str) -> Result<()> {
        self.send(ControlFrame::Abort {
            reason: reason.to_string(),
        })
        .await
    }

    /// Ask the beacon to shut down and wait for it to hang up.
    pub async fn stop(&mut self, timeout: Duration) -> Result<()> {
        self.send(ControlFrame::Stop).await?;
        let drained = tokio::time::timeout(timeout, async {
            while let Ok(Some(_)) = self.next_frame().await {}
        })
        .await;
        drained.map_err(|_| CohortError::Timeout("beacon to stop"))
    }

    /// Follow a running job until every one of `size` ranks exited or the job
    /// is aborted. Sends DONE on completion. Cancelling `interrupt` asks the
    /// beacon to abort with [`KEYBOARD_INTERRUPT`].
    pub async fn watch<F>(
        &mut self,
        size: usize,
        interrupt: CancellationToken,
        mut on_event: F,
    ) -> Result<JobOutcome>
    where
        F: FnMut(&MonitorEvent),
    {
        let mut exited = 0;
        let mut failed = Vec::new();
        let mut interrupted = false;

        while exited < size {
            let event = tokio::select! {
                _ = interrupt.cancelled(), if !interrupted => {
                    interrupted = true;
                    self.abort(KEYBOARD_INTERRUPT).await?;
                    continue;
                }
                event = self.next_event() => event?,
            };
            let Some(event) = event else {
                return Err(CohortError::LostConnection(
                    "lost connection to local beacon".to_string(),
                ));
            };
            on_event(&event);
            match event {
                MonitorEvent::Exit { rank, code } => {
                    exited += 1;
                    if code != Some(0) {
                        failed.push((rank, code));
                    }
                }
                MonitorEvent::Aborted { reason, .. } => return Ok(JobOutcome::Aborted { reason }),
                MonitorEvent::Stdout { .. } | MonitorEvent::Stderr { .. } => {}
            }
        }

        self.done().await?;
        Ok(JobOutcome::Completed { failed })
    }
}
