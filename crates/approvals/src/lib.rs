//! Warden approvals - human-in-the-loop checkpoints
//!
//! When the matcher returns `approve` the operation is parked on an
//! [`ApprovalRequest`] owned by the [`ApprovalBroker`]. An approver resolves
//! it (grant or deny); if nobody does before the timeout it expires and the
//! rule's `on_timeout` fallback decides. Session teardown cancels a
//! session's pending requests.
//!
//! Waiting is a suspend point on one request: other operations, sessions and
//! the control surface keep running.

pub mod broker;
pub mod request;

pub use broker::{ApprovalBroker, ApprovalError};
pub use request::{ApprovalOutcome, ApprovalRequest, ApprovalState, Resolution};
