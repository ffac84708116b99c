//! Per-job routing state of a beacon.
//!
//! The meta table says where every rank lives; the registries hold the
//! channels to reach it. Messages for a local rank whose worker has not
//! attached yet wait in a pending queue and are flushed in arrival order
//! when it does.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::error::{CohortError, Result};
use crate::protocol::{ControlFrame, Envelope, MonitorEvent};
use crate::remote::PeerLink;
use crate::scheduler::{DistributionPlan, PlanHost, Rank};

/// Where a rank can be reached from this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local,
    /// Over the link registered under this host id.
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaTable {
    ranks: Vec<Location>,
    parent: Location,
}

impl MetaTable {
    /// Every rank local, monitor local.
    pub fn pure_local(size: usize) -> Self {
        Self {
            ranks: vec![Location::Local; size],
            parent: Location::Local,
        }
    }

    /// Build the table for a plan as seen by this node.
    ///
    /// On the root `parent` is `Local` and every remote host is reached
    /// directly. Elsewhere the only link is to the parent, so ranks of
    /// third-party hosts are located at the parent, which relays them.
    pub fn from_plan(plan: &DistributionPlan, parent: Location) -> Self {
        let mut ranks = vec![parent.clone(); plan.size()];
        for entry in plan.entries() {
            let location = match (&entry.host, &parent) {
                (PlanHost::Local, _) => Location::Local,
                (PlanHost::Parent { .. }, _) => parent.clone(),
                (PlanHost::Remote { id }, Location::Local) => Location::Remote(id.clone()),
                (PlanHost::Remote { .. }, Location::Remote(_)) => parent.clone(),
            };
            for rank in entry.ranks() {
                if let Some(slot) = ranks.get_mut(rank) {
                    *slot = location.clone();
                }
            }
        }
        Self { ranks, parent }
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn location(&self, rank: Rank) -> Option<&Location> {
        self.ranks.get(rank)
    }

    pub fn parent(&self) -> &Location {
        &self.parent
    }

}

/// Downlink to one local worker.
#[derive(Debug, Clone)]
pub struct WorkerChannel(mpsc::UnboundedSender<Envelope>);

impl WorkerChannel {
    pub fn new(sender: mpsc::UnboundedSender<Envelope>) -> Self {
        Self(sender)
    }

    pub fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.0
            .send(envelope)
            .map_err(|_| CohortError::ChannelClosed("worker control channel"))
    }
}

/// Where monitor events of this node go.
#[derive(Debug, Clone)]
pub enum MonitorChannel {
    /// The local submitter that ran the job.
    Submitter(mpsc::UnboundedSender<ControlFrame>),
    /// The beacon that dispatched our share.
    Parent(PeerLink),
}

#[derive(Debug, Default)]
pub struct Router {
    table: Option<MetaTable>,
    monitor: Option<MonitorChannel>,
    locals: HashMap<Rank, WorkerChannel>,
    remotes: HashMap<String, PeerLink>,
    pending: HashMap<Rank, Vec<Envelope>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no job state is held at all.
    pub fn is_clean(&self) -> bool {
        self.table.is_none()
            && self.monitor.is_none()
            && self.locals.is_empty()
            && self.remotes.is_empty()
            && self.pending.is_empty()
    }

    pub fn set_meta_table(&mut self, table: MetaTable) {
        self.table = Some(table);
    }

    pub fn meta_table(&self) -> Option<&MetaTable> {
        self.table.as_ref()
    }

    pub fn set_monitor_channel(&mut self, channel: MonitorChannel) {
        self.monitor = Some(channel);
    }

    /// Register a worker's downlink and flush what was queued for it.
    pub fn set_local_channel(&mut self, rank: Rank, channel: WorkerChannel) {
        if let Some(queued) = self.pending.remove(&rank) {
            tracing::debug!(rank, count = queued.len(), "Flushing pending messages");
            for envelope in queued {
                if let Err(e) = channel.deliver(envelope) {
                    tracing::warn!(rank, error = %e, "Dropped pending message");
                }
            }
        }
        self.locals.insert(rank, channel);
    }

    pub fn set_remote_channel(&mut self, host: impl Into<String>, link: PeerLink) {
        self.remotes.insert(host.into(), link);
    }

    pub fn remote_channel(&self, host: &str) -> Option<&PeerLink> {
        self.remotes.get(host)
    }

    pub fn remote_channels(&self) -> impl Iterator<Item = (&String, &PeerLink)> {
        self.remotes.iter()
    }

    pub fn has_remotes(&self) -> bool {
        !self.remotes.is_empty()
    }

    /// Drop every registry. Safe to call repeatedly.
    pub fn clear(&mut self) {
        self.table = None;
        self.monitor = None;
        self.locals.clear();
        self.remotes.clear();
        self.pending.clear();
    }

    /// Send a monitor event toward whoever started this node's share.
    pub fn route_to_parent(&self, event: MonitorEvent) -> Result<()> {
        match &self.monitor {
            Some(MonitorChannel::Submitter(submitter)) => submitter
                .send(ControlFrame::Monitor { event })
                .map_err(|_| CohortError::ChannelClosed("submitter")),
            Some(MonitorChannel::Parent(link)) => link.send_monitor(&event),
            None => Err(CohortError::ChannelClosed("monitor")),
        }
    }

    /// Deliver an envelope to `rank`, wherever it lives.
    pub fn route_to(&mut self, rank: Rank, envelope: Envelope) -> Result<()> {
        let location = self
            .table
            .as_ref()
            .and_then(|t| t.location(rank))
            .ok_or(CohortError::UnknownRank(rank))?;

        match location {
            Location::Local => match self.locals.get(&rank) {
                Some(channel) => channel.deliver(envelope),
                None => {
                    self.pending.entry(rank).or_default().push(envelope);
                    Ok(())
                }
            },
            Location::Remote(host) => match self.remotes.get(host) {
                Some(link) => link.send_envelope(&envelope),
                None => Err(CohortError::LostConnection(format!(
                    "no link to {} for rank {}",
                    host, rank
                ))),
            },
        }
    }
}
