//! Warden - policy-enforced execution gateway for sandboxed coding agents
//!
//! Every command, network connection and file operation an agent attempts
//! inside its sandbox is intercepted, decided against a declarative policy,
//! optionally held for a human approval, audited, and only then allowed to
//! proceed. Output handed back to the agent passes through the DLP redactor.
//!
//! Interception happens in the enforcement backends (the forward proxy and
//! the command shims' RPC socket); every backend feeds the same [`Engine`].

pub mod command;
pub mod control;
pub mod daemon;
pub mod enforcer;
pub mod engine;
pub mod fsguard;
pub mod limits;
pub mod metrics;
pub mod proxy;
pub mod rpc;
pub mod session;
pub mod shim;

pub use command::{LineVerdict, SimpleCommand};
pub use enforcer::Enforcer;
pub use engine::{Caller, Engine, Pending, Verdict};
pub use fsguard::{FsError, QuarantineEntry};
pub use rpc::{RpcClient, RpcHandler};
pub use shim::{Invocation, Shim};
