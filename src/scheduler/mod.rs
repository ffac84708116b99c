pub mod job;
pub mod planner;

pub use job::{HostKey, HostMap, HostSpec, JobDescriptor, Rank};
pub use planner::{divide, DistributionPlan, PlanEntry, PlanHost};
