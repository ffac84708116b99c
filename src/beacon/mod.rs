//! The beacon daemon.
//!
//! One control loop owns all job state (router, runner, admission). The
//! submitter socket, the peer listener, every peer link and the runner's
//! observers run as separate tasks and talk to the loop through
//! [`BeaconEvent`]s. Events that belong to a job carry its id, so late
//! events from an aborted or finished job are dropped.

pub mod control;
pub mod peers;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::BeaconConfig;
use crate::error::{CohortError, Result};
use crate::protocol::{
    Admission, ControlFrame, Envelope, JobFrame, MonitorEvent, PeerFrame,
};
use crate::remote::session::signal_done;
use crate::remote::{LinkEvent, PeerLink};
use crate::router::{Location, MetaTable, MonitorChannel, Router};
use crate::runner::{FilePackager, JobRunner, LocalSubjob, OutputStream, Packager, RunnerEvent};
use crate::scheduler::{divide, HostKey, JobDescriptor};

/// Identifies one submitter connection on the control socket.
pub type ConnId = u64;

#[derive(Debug)]
pub enum BeaconEvent {
    /// A frame from a local submitter.
    Control {
        conn: ConnId,
        frame: ControlFrame,
        reply: mpsc::UnboundedSender<ControlFrame>,
    },
    SubmitterClosed {
        conn: ConnId,
    },
    /// A parent beacon hands us a share of its job.
    RemoteJob {
        link: PeerLink,
        job: JobFrame,
        ack: oneshot::Sender<Result<()>>,
    },
    /// A frame from a peer link tied to `job_id`.
    Peer {
        job_id: Option<Uuid>,
        host: String,
        frame: PeerFrame,
    },
    PeerClosed {
        job_id: Option<Uuid>,
        host: String,
        reason: String,
    },
    /// Outcome of dispatching a job's shares to the remote hosts.
    Dispatched {
        job_id: Uuid,
        result: Result<Vec<(PeerLink, mpsc::UnboundedReceiver<LinkEvent>)>>,
    },
    /// Abort whatever is running and shut down.
    Interrupt {
        reason: String,
    },
}

/// Sender side of the control loop's event queue.
#[derive(Debug, Clone)]
pub struct BeaconHandle {
    events: mpsc::UnboundedSender<BeaconEvent>,
}

impl BeaconHandle {
    pub fn send(&self, event: BeaconEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| CohortError::ChannelClosed("beacon"))
    }
}

#[derive(Debug)]
enum Role {
    /// We admitted the job from a local submitter.
    Root { submitter: ConnId },
    /// A parent beacon dispatched a share to us.
    Child,
}

#[derive(Debug)]
struct ActiveJob {
    id: Uuid,
    role: Role,
    /// Cancels an in-flight dispatch to remote hosts.
    dispatch: Option<CancellationToken>,
    /// Our own share, started once every remote accepted theirs.
    pending_local: Option<LocalSubjob>,
    /// Entry point unpacked for a share a parent sent us.
    bundle: Option<PathBuf>,
}

struct Beacon {
    config: BeaconConfig,
    listen_port: u16,
    router: Router,
    runner: JobRunner,
    packager: Arc<dyn Packager>,
    active: Option<ActiveJob>,
    handle: BeaconHandle,
    shutdown: CancellationToken,
}

/// A running beacon: its listeners and control loop.
pub struct BeaconServer {
    listen_addr: SocketAddr,
    control_socket: PathBuf,
    handle: BeaconHandle,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl BeaconServer {
    /// Bind both sockets and start the control loop.
    pub async fn start(config: BeaconConfig) -> Result<Self> {
        let packager = Arc::new(FilePackager::new(config.runtime_dir.join("bundles")));
        Self::start_with(config, packager).await
    }

    pub async fn start_with(config: BeaconConfig, packager: Arc<dyn Packager>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.runtime_dir).await?;
        let peer_listener = TcpListener::bind(config.listen_addr).await?;
        let listen_addr = peer_listener.local_addr()?;
        let control_listener = control::bind(&config.control_socket).await?;

        let shutdown = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (runner_tx, runner_rx) = mpsc::unbounded_channel();
        let handle = BeaconHandle { events: events_tx };

        tokio::spawn(control::serve(
            control_listener,
            handle.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(peers::serve(
            peer_listener,
            config.password.clone(),
            handle.clone(),
            shutdown.clone(),
        ));

        tracing::info!(
            listen_addr = %listen_addr,
            control_socket = %config.control_socket.display(),
            runtime_dir = %config.runtime_dir.display(),
            "Starting beacon"
        );

        let beacon = Beacon {
            listen_port: listen_addr.port(),
            router: Router::new(),
            runner: JobRunner::new(
                config.runtime_dir.clone(),
                config.timeouts.kill_grace,
                runner_tx,
            ),
            packager,
            active: None,
            handle: handle.clone(),
            shutdown: shutdown.clone(),
            config: config.clone(),
        };
        let task = tokio::spawn(beacon.run(events_rx, runner_rx));

        Ok(Self {
            listen_addr,
            control_socket: config.control_socket,
            handle,
            shutdown,
            task,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn control_socket(&self) -> &Path {
        &self.control_socket
    }

    pub fn handle(&self) -> BeaconHandle {
        self.handle.clone()
    }

    /// Abort the running job, if any, and shut down.
    pub fn interrupt(&self, reason: impl Into<String>) {
        let event = BeaconEvent::Interrupt {
            reason: reason.into(),
        };
        if self.handle.send(event).is_err() {
            self.shutdown.cancel();
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once the beacon started shutting down, e.g. after STOP.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    /// Wait for the control loop to exit and remove the control socket.
    pub async fn wait(self) -> Result<()> {
        let result = self.task.await;
        if let Err(e) = std::fs::remove_file(&self.control_socket) {
            tracing::debug!(error = %e, "Control socket already gone");
        }
        result.map_err(|e| CohortError::Io(std::io::Error::other(e.to_string())))
    }
}

impl Beacon {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<BeaconEvent>,
        mut runner_events: mpsc::UnboundedReceiver<RunnerEvent>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.abort("beacon stopped", false, None);
                    break;
                }
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(event) = runner_events.recv() => self.handle_runner_event(event),
            }
        }
        self.router.clear();
        tracing::info!("Beacon stopped");
    }

    async fn handle_event(&mut self, event: BeaconEvent) {
        match event {
            BeaconEvent::Control { conn, frame, reply } => self.on_control(conn, frame, reply).await,
            BeaconEvent::SubmitterClosed { conn } => {
                if self.is_submitter(conn) {
                    self.abort("lost connection to runner", false, None);
                }
            }
            BeaconEvent::RemoteJob { link, job, ack } => {
                let result = self.accept_remote_job(link, job).await;
                let _ = ack.send(result);
            }
            BeaconEvent::Peer {
                job_id,
                host,
                frame,
            } => {
                if self.is_current(job_id) {
                    self.on_peer_frame(&host, frame).await;
                } else {
                    tracing::trace!(peer = %host, frame = frame.name(), "Ignoring frame for stale job");
                }
            }
            BeaconEvent::PeerClosed {
                job_id,
                host,
                reason,
            } => {
                if self.is_current(job_id) {
                    self.on_peer_closed(&host, &reason);
                }
            }
            BeaconEvent::Dispatched { job_id, result } => self.on_dispatched(job_id, result).await,
            BeaconEvent::Interrupt { reason } => {
                self.abort(&reason, false, None);
                self.shutdown.cancel();
            }
        }
    }

    async fn on_control(
        &mut self,
        conn: ConnId,
        frame: ControlFrame,
        reply: mpsc::UnboundedSender<ControlFrame>,
    ) {
        match frame {
            ControlFrame::Probe => {
                let _ = reply.send(ControlFrame::Alive);
            }
            ControlFrame::Run { job } => self.admit(conn, job, reply).await,
            ControlFrame::Done if self.is_submitter(conn) => self.finish().await,
            ControlFrame::Abort { reason } if self.is_submitter(conn) => {
                self.abort(&reason, false, None)
            }
            ControlFrame::Stop => {
                tracing::info!(conn, "Stop requested");
                self.abort("beacon stopped", false, None);
                self.shutdown.cancel();
            }
            other => {
                tracing::warn!(conn, frame = ?other, "Unexpected frame on control socket");
            }
        }
    }

    /// RUN: admit the job if idle, then start it.
    async fn admit(
        &mut self,
        conn: ConnId,
        job: JobDescriptor,
        reply: mpsc::UnboundedSender<ControlFrame>,
    ) {
        if let Some(active) = &self.active {
            tracing::info!(conn, active = %active.id, "Rejecting job, beacon is busy");
            let _ = reply.send(ControlFrame::Confirm {
                status: Admission::Busy,
            });
            return;
        }
        let _ = reply.send(ControlFrame::Confirm {
            status: Admission::Available,
        });

        let job_id = Uuid::new_v4();
        tracing::info!(
            job_id = %job_id,
            size = job.size(),
            app = %job.app().display(),
            distributed = job.hosts().is_some(),
            "Job admitted"
        );
        self.router
            .set_monitor_channel(MonitorChannel::Submitter(reply));
        self.active = Some(ActiveJob {
            id: job_id,
            role: Role::Root { submitter: conn },
            dispatch: None,
            pending_local: None,
            bundle: None,
        });

        if let Err(e) = self.launch(job_id, &job).await {
            tracing::error!(job_id = %job_id, error = %e, "Job failed to start");
            self.abort(&e.abort_reason(), false, None);
        }
    }

    async fn launch(&mut self, job_id: Uuid, job: &JobDescriptor) -> Result<()> {
        let size = job.size();
        let share = |start, count| LocalSubjob {
            job_id,
            entry: job.app().clone(),
            size,
            start,
            count,
        };

        let Some(hosts) = job.hosts() else {
            self.router.set_meta_table(MetaTable::pure_local(size));
            return self.runner.run_locally(&share(0, size)).await;
        };

        let plan = divide(size, hosts)?;
        tracing::debug!(job_id = %job_id, plan = ?plan.entries(), "Job divided");
        self.router
            .set_meta_table(MetaTable::from_plan(&plan, Location::Local));
        let local = plan.local().map(|entry| share(entry.start, entry.count));

        if plan.remotes().next().is_none() {
            if let Some(local) = local {
                self.runner.run_locally(&local).await?;
            }
            return Ok(());
        }

        let bundle = {
            let packager = self.packager.clone();
            let app = job.app().clone();
            tokio::task::spawn_blocking(move || packager.pack(&app))
                .await
                .map_err(|e| CohortError::Packaging(e.to_string()))??
        };

        let mut dispatches = Vec::new();
        for host in plan.remotes() {
            let password = hosts
                .get(&HostKey::Remote(host.to_string()))
                .map(|spec| spec.password.clone())
                .unwrap_or_default();
            let frame = JobFrame {
                job_id,
                size,
                bundle: bundle.clone(),
                plan: plan.relabel_for(host, self.listen_port)?,
            };
            dispatches.push(peers::Dispatch {
                host: host.to_string(),
                password,
                frame,
            });
        }

        let cancel = CancellationToken::new();
        if let Some(active) = self.active.as_mut() {
            active.dispatch = Some(cancel.clone());
            active.pending_local = local;
        }
        tokio::spawn(peers::dispatch_all(
            job_id,
            dispatches,
            self.config.timeouts.clone(),
            self.handle.clone(),
            cancel,
        ));
        Ok(())
    }

    async fn on_dispatched(
        &mut self,
        job_id: Uuid,
        result: Result<Vec<(PeerLink, mpsc::UnboundedReceiver<LinkEvent>)>>,
    ) {
        let current = self.is_current(Some(job_id));
        match result {
            Ok(links) if current => {
                for (link, events) in links {
                    let host = link.id().to_string();
                    tokio::spawn(peers::pump(
                        host.clone(),
                        events,
                        Some(job_id),
                        self.handle.clone(),
                    ));
                    self.router.set_remote_channel(host, link);
                }
                let local = self.active.as_mut().and_then(|active| {
                    active.dispatch = None;
                    active.pending_local.take()
                });
                tracing::info!(job_id = %job_id, "All remote shares accepted");
                if let Some(local) = local {
                    if let Err(e) = self.runner.run_locally(&local).await {
                        self.abort(&e.abort_reason(), false, None);
                    }
                }
            }
            Ok(links) => {
                for (link, _) in links {
                    let _ = link.send(PeerFrame::Abort {
                        reason: "job no longer active".to_string(),
                    });
                    link.close();
                }
            }
            Err(e) if current => {
                tracing::error!(job_id = %job_id, error = %e, "Dispatch failed");
                self.abort(&e.abort_reason(), false, None);
            }
            Err(_) => {}
        }
    }

    /// JOB from a parent: unpack, register the parent and start our share.
    async fn accept_remote_job(&mut self, link: PeerLink, job: JobFrame) -> Result<()> {
        if self.active.is_some() {
            return Err(CohortError::AdmissionRejected);
        }
        let share = job
            .plan
            .local()
            .cloned()
            .ok_or_else(|| CohortError::InvalidJob("plan has no local share".to_string()))?;
        let entry = {
            let packager = self.packager.clone();
            let bundle = job.bundle.clone();
            tokio::task::spawn_blocking(move || packager.unpack(&bundle))
                .await
                .map_err(|e| CohortError::Packaging(e.to_string()))??
        };
        let subjob = LocalSubjob {
            job_id: job.job_id,
            entry: entry.clone(),
            size: job.size,
            start: share.start,
            count: share.count,
        };

        let parent = link.id().to_string();
        tracing::info!(
            job_id = %job.job_id,
            parent = %parent,
            start = share.start,
            count = share.count,
            "Accepted share of remote job"
        );
        self.router.set_meta_table(MetaTable::from_plan(
            &job.plan,
            Location::Remote(parent.clone()),
        ));
        self.router.set_remote_channel(parent.clone(), link.clone());
        self.router
            .set_monitor_channel(MonitorChannel::Parent(link.clone()));
        link.bind_job(job.job_id);
        self.active = Some(ActiveJob {
            id: job.job_id,
            role: Role::Child,
            dispatch: None,
            pending_local: None,
            bundle: Some(entry),
        });

        if let Err(e) = self.runner.run_locally(&subjob).await {
            tracing::error!(job_id = %job.job_id, error = %e, "Could not start share");
            self.runner.finish();
            self.router.clear();
            if let Some(active) = self.active.take() {
                self.discard_bundle(&active);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn on_peer_frame(&mut self, host: &str, frame: PeerFrame) {
        let Some(link) = self.router.remote_channel(host).cloned() else {
            tracing::debug!(peer = %host, frame = frame.name(), "Frame from unregistered link");
            return;
        };
        match frame {
            PeerFrame::Msg { envelope } => match link.open::<Envelope>(&envelope) {
                Ok(envelope) => self.deliver(envelope),
                Err(e) => tracing::warn!(peer = %host, error = %e, "Dropping unreadable MSG"),
            },
            PeerFrame::Monitor { event } => match link.open::<MonitorEvent>(&event) {
                Ok(MonitorEvent::Aborted {
                    reason,
                    signaled: false,
                }) => self.abort(&reason, false, Some(host)),
                Ok(MonitorEvent::Aborted { .. }) => {
                    tracing::debug!(peer = %host, "Peer confirmed abort");
                }
                Ok(event) => self.report(event),
                Err(e) => tracing::warn!(peer = %host, error = %e, "Dropping unreadable MONITOR"),
            },
            PeerFrame::Abort { reason } => self.abort(&reason, true, Some(host)),
            PeerFrame::Done if self.is_parent(host) => {
                if let Err(e) = link.send(PeerFrame::DoneAck) {
                    tracing::warn!(peer = %host, error = %e, "DONE-ACK not sent");
                }
                link.close();
                self.runner.finish();
                self.router.clear();
                if let Some(active) = self.active.take() {
                    tracing::info!(job_id = %active.id, "Share completed");
                    self.discard_bundle(&active);
                }
            }
            other => {
                tracing::warn!(peer = %host, frame = other.name(), "Unexpected frame from peer");
            }
        }
    }

    fn on_peer_closed(&mut self, host: &str, reason: &str) {
        if self.router.remote_channel(host).is_none() {
            return;
        }
        tracing::warn!(peer = %host, reason, "Peer link lost");
        let reason = if self.is_parent(host) {
            format!("lost connection to parent beacon {}", host)
        } else {
            format!("lost connection to remote beacon {}", host)
        };
        self.abort(&reason, false, Some(host));
    }

    fn handle_runner_event(&mut self, event: RunnerEvent) {
        if !self.is_current(Some(event.job_id())) {
            tracing::trace!(event = ?event, "Ignoring runner event for stale job");
            return;
        }
        match event {
            RunnerEvent::Output {
                rank, stream, line, ..
            } => self.report(match stream {
                OutputStream::Stdout => MonitorEvent::Stdout { rank, line },
                OutputStream::Stderr => MonitorEvent::Stderr { rank, line },
            }),
            RunnerEvent::Exited { rank, code, .. } => self.report(MonitorEvent::Exit { rank, code }),
            RunnerEvent::Attached { rank, channel, .. } => {
                let local = self
                    .router
                    .meta_table()
                    .and_then(|t| t.location(rank))
                    .map_or(false, |l| *l == Location::Local);
                if local {
                    self.router.set_local_channel(rank, channel);
                } else {
                    tracing::warn!(rank, "Worker attached for a rank that is not ours");
                }
            }
            RunnerEvent::Message { envelope, .. } => self.deliver(envelope),
        }
    }

    fn deliver(&mut self, envelope: Envelope) {
        let rank = envelope.to();
        if let Err(e) = self.router.route_to(rank, envelope) {
            tracing::error!(rank, error = %e, "Dropping undeliverable message");
        }
    }

    fn report(&self, event: MonitorEvent) {
        if let Err(e) = self.router.route_to_parent(event) {
            tracing::debug!(error = %e, "Monitor event not delivered");
        }
    }

    /// DONE from the submitter: release every remote, then go idle.
    async fn finish(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        if let Some(dispatch) = active.dispatch.take() {
            dispatch.cancel();
        }
        if self.router.has_remotes() {
            let links: Vec<PeerLink> = self
                .router
                .remote_channels()
                .map(|(_, link)| link.clone())
                .collect();
            let timeouts = &self.config.timeouts;
            let results = join_all(links.iter().map(|link| signal_done(link, timeouts))).await;
            for (link, result) in links.iter().zip(results) {
                if let Err(e) = result {
                    tracing::warn!(peer = %link.id(), error = %e, "Remote did not acknowledge DONE");
                }
            }
        }
        self.runner.finish();
        self.router.clear();
        self.discard_bundle(&active);
        tracing::info!(job_id = %active.id, "Job completed");
    }

    /// Unwind the active job everywhere. Does nothing when idle.
    ///
    /// `origin` is the peer that told us to abort; it is not told again.
    fn abort(&mut self, reason: &str, signaled: bool, origin: Option<&str>) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        tracing::warn!(job_id = %active.id, reason, signaled, "Aborting job");
        if let Some(dispatch) = active.dispatch.take() {
            dispatch.cancel();
        }
        for (host, link) in self.router.remote_channels() {
            if Some(host.as_str()) == origin {
                continue;
            }
            let abort = PeerFrame::Abort {
                reason: reason.to_string(),
            };
            if let Err(e) = link.send(abort) {
                tracing::debug!(peer = %host, error = %e, "ABORT not sent");
            }
        }
        self.runner.abort(reason, signaled, &self.router);
        for (_, link) in self.router.remote_channels() {
            link.close();
        }
        self.router.clear();
        self.discard_bundle(&active);
    }

    fn discard_bundle(&self, active: &ActiveJob) {
        if let Some(entry) = &active.bundle {
            if let Err(e) = self.packager.discard(entry) {
                tracing::warn!(job_id = %active.id, error = %e, "Could not remove unpacked bundle");
            }
        }
    }

    fn is_current(&self, job_id: Option<Uuid>) -> bool {
        matches!((job_id, &self.active), (Some(id), Some(active)) if active.id == id)
    }

    fn is_submitter(&self, conn: ConnId) -> bool {
        matches!(
            &self.active,
            Some(ActiveJob { role: Role::Root { submitter }, .. }) if *submitter == conn
        )
    }

    fn is_parent(&self, host: &str) -> bool {
        let child = matches!(&self.active, Some(ActiveJob { role: Role::Child, .. }));
        child
            && matches!(
                self.router.meta_table().map(|t| t.parent()),
                Some(Location::Remote(parent)) if parent == host
            )
    }
}
