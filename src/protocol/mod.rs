//! Wire formats: message envelopes, monitor events and the three framed
//! protocols (beacon to beacon, submitter to beacon, beacon to worker).

pub mod codec;
pub mod frame;
pub mod message;

pub use codec::JsonCodec;
pub use frame::{Admission, ControlFrame, JobFrame, PeerFrame, WorkerFrame};
pub use message::{Envelope, Header, MonitorEvent};
