//! Warden audit - one durable record per decision
//!
//! Every operation the gateway decides on produces exactly one
//! [`AuditEvent`], written before the outcome is reported to the caller.
//! Storage: SQLite (`audit.db`, WAL, synchronous=FULL). When the database
//! cannot be written the event goes to a JSON-lines spill file and the log
//! reports itself degraded until the next successful write.

pub mod event;
pub mod log;
pub mod query;
pub mod spool;
pub mod store;

pub use event::{AuditEvent, Outcome};
pub use log::{AuditLog, Durability};
pub use query::{AuditQuery, AuditStats};
pub use spool::Spool;
pub use store::{AuditStore, StorageError};
