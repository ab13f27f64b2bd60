//! Request admission and stream relay.
//!
//! [`AdmissionQueue`] holds submitted requests and admits at most
//! `max_active` of them at a time. Each admitted request is served by a
//! [`StreamRelay`] task that forwards backend tokens into the request's
//! bounded output channel, read by the submitter through a [`RequestHandle`].

mod admission;
mod pending;
mod relay;

pub use admission::{AdmissionQueue, QueueStats, QueueWorker};
pub use pending::{OutputClosed, PendingRequest, RequestHandle, RequestPhase};
pub use relay::{RelayError, RelayOutcome, StreamRelay};
