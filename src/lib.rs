pub mod beacon;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod process;
pub mod protocol;
pub mod remote;
pub mod router;
pub mod runner;
pub mod scheduler;
pub mod shutdown;

pub use error::{CohortError, Result};
