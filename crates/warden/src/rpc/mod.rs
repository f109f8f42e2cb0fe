//! JSON-RPC 2.0 surface
//!
//! Served on the Unix socket the shims use and on the control surface's
//! `POST /rpc`.

pub mod client;
pub mod handler;
pub mod protocol;
pub mod server;

pub use client::{ClientError, RpcClient};
pub use handler::RpcHandler;
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcError};
