use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CohortError, Result};
use crate::scheduler::job::{HostKey, HostMap, Rank};

/// Whose share a plan entry describes, from the point of view of the node
/// holding the plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum PlanHost {
    Local,
    /// The node that dispatched this plan, reachable on `port` at the address
    /// the plan arrived from.
    Parent { port: u16 },
    Remote { id: String },
}

impl fmt::Display for PlanHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanHost::Local => write!(f, "local"),
            PlanHost::Parent { port } => write!(f, "parent(:{})", port),
            PlanHost::Remote { id } => write!(f, "{}", id),
        }
    }
}

impl From<&HostKey> for PlanHost {
    fn from(key: &HostKey) -> Self {
        match key {
            HostKey::Local => PlanHost::Local,
            HostKey::Remote(id) => PlanHost::Remote { id: id.clone() },
        }
    }
}

/// A contiguous range of ranks owned by one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub host: PlanHost,
    pub start: Rank,
    pub count: usize,
}

impl PlanEntry {
    pub fn ranks(&self) -> std::ops::Range<Rank> {
        self.start..self.start + self.count
    }
}

/// Per-host contiguous rank ranges covering exactly `[0, size)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionPlan {
    size: usize,
    entries: Vec<PlanEntry>,
}

impl DistributionPlan {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn get(&self, host: &PlanHost) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| &e.host == host)
    }

    pub fn local(&self) -> Option<&PlanEntry> {
        self.get(&PlanHost::Local)
    }

    /// Remote hosts in registration order.
    pub fn remotes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| match &e.host {
            PlanHost::Remote { id } => Some(id.as_str()),
            _ => None,
        })
    }

    /// Rewrite the plan as seen by `receiver`: our own share becomes the
    /// parent's (reachable on `parent_port`), the receiver's share becomes
    /// local, every other entry is left untouched.
    pub fn relabel_for(&self, receiver: &str, parent_port: u16) -> Result<DistributionPlan> {
        if !self.remotes().any(|id| id == receiver) {
            return Err(CohortError::InvalidJob(format!(
                "host {} is not part of the plan",
                receiver
            )));
        }

        let entries = self
            .entries
            .iter()
            .map(|entry| {
                let host = match &entry.host {
                    PlanHost::Local => PlanHost::Parent { port: parent_port },
                    PlanHost::Remote { id } if id == receiver => PlanHost::Local,
                    other => other.clone(),
                };
                PlanEntry {
                    host,
                    start: entry.start,
                    count: entry.count,
                }
            })
            .collect();

        Ok(DistributionPlan {
            size: self.size,
            entries,
        })
    }

    /// Check the tiling invariant of a plan received from elsewhere.
    pub fn validate(&self) -> Result<()> {
        let mut ranges: Vec<_> = self.entries.iter().map(PlanEntry::ranks).collect();
        ranges.sort_by_key(|r| r.start);
        let mut next = 0;
        for range in ranges {
            if range.start != next {
                return Err(CohortError::InvalidJob(format!(
                    "plan ranges do not tile [0, {})",
                    self.size
                )));
            }
            next = range.end;
        }
        if next != self.size {
            return Err(CohortError::InvalidJob(format!(
                "plan covers {} of {} ranks",
                next, self.size
            )));
        }
        Ok(())
    }
}

/// Divide `size` ranks over `hosts` round-robin.
///
/// A host takes one more rank per visit while below its cap. When a whole
/// cycle passes without any assignment every cap is exhausted, and the
/// remaining ranks are handed out round-robin ignoring caps. Starts are then
/// assigned contiguously, local host first, the rest in registration order.
/// Hosts that end up with no ranks are left out of the plan.
pub fn divide(size: usize, hosts: &HostMap) -> Result<DistributionPlan> {
    if size == 0 {
        return Err(CohortError::InvalidJob(
            "job size must be at least one".to_string(),
        ));
    }
    if hosts.is_empty() {
        return Err(CohortError::InvalidJob("hosts map is empty".to_string()));
    }

    let caps: Vec<(&HostKey, Option<usize>)> =
        hosts.iter().map(|(k, s)| (k, s.max_processes)).collect();
    let mut counts = vec![0usize; caps.len()];

    let mut allocated = 0;
    let mut next = 0;
    let mut misses = 0;
    let mut overallocate = false;
    while allocated < size {
        let index = next % caps.len();
        next += 1;
        let below_cap = caps[index].1.map_or(true, |max| counts[index] < max);
        if below_cap || overallocate {
            counts[index] += 1;
            allocated += 1;
            if !overallocate {
                misses = 0;
            }
        } else {
            misses += 1;
            overallocate = misses == caps.len();
        }
    }

    let mut starts = vec![0usize; caps.len()];
    let mut start = 0;
    if let Some(local) = caps.iter().position(|(k, _)| k.is_local()) {
        starts[local] = 0;
        start += counts[local];
    }
    for (index, (key, _)) in caps.iter().enumerate() {
        if !key.is_local() {
            starts[index] = start;
            start += counts[index];
        }
    }

    let entries = caps
        .iter()
        .enumerate()
        .filter(|(index, _)| counts[*index] > 0)
        .map(|(index, (key, _))| PlanEntry {
            host: PlanHost::from(*key),
            start: starts[index],
            count: counts[index],
        })
        .collect();

    Ok(DistributionPlan { size, entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::HostSpec;

    fn capped(n: usize) -> HostSpec {
        HostSpec::new(Some(n), "")
    }

    fn plan_of(entries: Vec<(PlanHost, Rank, usize)>, size: usize) -> DistributionPlan {
        DistributionPlan {
            size,
            entries: entries
                .into_iter()
                .map(|(host, start, count)| PlanEntry { host, start, count })
                .collect(),
        }
    }

    fn remote(id: &str) -> PlanHost {
        PlanHost::Remote { id: id.to_string() }
    }

    #[test]
    fn local_host_gets_rank_zero_even_when_registered_last() {
        let hosts = HostMap::new()
            .with("a:1", capped(2))
            .with("local", capped(2));
        let plan = divide(4, &hosts).unwrap();
        assert_eq!(plan.local().unwrap().start, 0);
        assert_eq!(plan.local().unwrap().count, 2);
        assert_eq!(plan.get(&remote("a:1")).unwrap().start, 2);
    }

    #[test]
    fn round_robin_respects_caps() {
        let hosts = HostMap::new()
            .with("local", capped(1))
            .with("a:1", HostSpec::unbounded())
            .with("b:1", capped(2));
        let plan = divide(6, &hosts).unwrap();
        assert_eq!(plan.local().unwrap().count, 1);
        assert_eq!(plan.get(&remote("b:1")).unwrap().count, 2);
        assert_eq!(plan.get(&remote("a:1")).unwrap().count, 3);
        plan.validate().unwrap();
    }

    #[test]
    fn overallocation_when_capacity_is_short() {
        let hosts = HostMap::new()
            .with("local", capped(1))
            .with("a:1", capped(1));
        let plan = divide(5, &hosts).unwrap();
        let total: usize = plan.entries().iter().map(|e| e.count).sum();
        assert_eq!(total, 5);
        // caps exhausted after two ranks, then strict alternation
        assert_eq!(plan.local().unwrap().count, 3);
        assert_eq!(plan.get(&remote("a:1")).unwrap().count, 2);
        plan.validate().unwrap();
    }

    #[test]
    fn idle_hosts_are_left_out() {
        let hosts = HostMap::new()
            .with("local", HostSpec::unbounded())
            .with("a:1", HostSpec::unbounded())
            .with("b:1", HostSpec::unbounded());
        let plan = divide(2, &hosts).unwrap();
        assert_eq!(plan.entries().len(), 2);
        assert!(plan.get(&remote("b:1")).is_none());
    }

    #[test]
    fn plans_tile_and_are_deterministic() {
        let capacities = [None, Some(1), Some(2), Some(3), Some(7)];
        for size in 1..40 {
            for a in capacities {
                for b in capacities {
                    let hosts = HostMap::new()
                        .with("x:1", HostSpec::new(a, ""))
                        .with("local", HostSpec::new(b, ""))
                        .with("y:1", capped(2));
                    let plan = divide(size, &hosts).unwrap();
                    plan.validate().unwrap();
                    assert_eq!(plan, divide(size, &hosts).unwrap());
                }
            }
        }
    }

    #[test]
    fn relabel_renames_exactly_two_entries() {
        let plan = plan_of(
            vec![
                (PlanHost::Local, 0, 5),
                (remote("peerA"), 5, 4),
                (remote("peerB"), 9, 2),
            ],
            11,
        );
        let relabelled = plan.relabel_for("peerA", 2222).unwrap();
        assert_eq!(
            relabelled,
            plan_of(
                vec![
                    (PlanHost::Parent { port: 2222 }, 0, 5),
                    (PlanHost::Local, 5, 4),
                    (remote("peerB"), 9, 2),
                ],
                11,
            )
        );
    }

    #[test]
    fn relabel_for_unknown_host_fails() {
        let plan = plan_of(vec![(PlanHost::Local, 0, 1)], 1);
        assert!(plan.relabel_for("peerZ", 1).is_err());
    }

    #[test]
    fn validate_rejects_gaps() {
        let plan = plan_of(vec![(PlanHost::Local, 0, 2), (remote("a"), 3, 1)], 4);
        assert!(plan.validate().is_err());
    }
}
