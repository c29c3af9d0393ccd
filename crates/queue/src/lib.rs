//! The user operation pipeline: a batching queue service, the processor
//! that bundles and submits operations, and the reconciler that sweeps
//! stuck ones.
mod service;
mod timeout;
mod userop;

pub use service::{FailedMessage, Message, Processor, Service};
pub use timeout::{resolve_timeout, TimeoutReconciler};
pub use userop::{UserOpMessage, UserOpProcessor};
