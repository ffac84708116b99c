//! Local execution of a job's share: packaging the program for remote
//! beacons and spawning one worker process per rank.

pub mod executor;
pub mod packaging;

pub use executor::{JobRunner, LocalSubjob, OutputStream, RunnerEvent};
pub use packaging::{AppBundle, FilePackager, Packager};
