//! Enforcement backends
//!
//! A backend intercepts one or more operation kinds and feeds them to the
//! shared [`Engine`]. Which backends run is decided once at startup from the
//! `enforcement` section of the server config; nothing in the decision
//! pipeline knows which ones are active.

use crate::engine::Engine;
use crate::rpc::{server, RpcHandler};
use anyhow::{Context, Result};
use async_trait::async_trait;
use policy::OperationKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warden_core::config::{NetworkBackend, ProcessBackend};
use warden_core::{Paths, ServerConfig};

#[async_trait]
pub trait Enforcer: Send + Sync {
    fn name(&self) -> &str;

    /// Operation kinds this backend intercepts
    fn kinds(&self) -> Vec<OperationKind>;

    /// Run until `shutdown` fires. Binding failures are returned before any
    /// traffic is accepted.
    async fn run(&self, engine: Arc<Engine>, shutdown: CancellationToken) -> Result<()>;
}

/// HTTP/HTTPS forward proxy
pub struct ProxyEnforcer {
    listen: String,
}

impl ProxyEnforcer {
    pub fn new(listen: impl Into<String>) -> Self {
        Self { listen: listen.into() }
    }
}

#[async_trait]
impl Enforcer for ProxyEnforcer {
    fn name(&self) -> &str {
        "proxy"
    }

    fn kinds(&self) -> Vec<OperationKind> {
        vec![OperationKind::Network]
    }

    async fn run(&self, engine: Arc<Engine>, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .with_context(|| format!("Failed to bind proxy on {}", self.listen))?;
        crate::proxy::serve(engine, listener, shutdown)
            .await
            .context("Proxy stopped")
    }
}

/// Unix socket the command shims and file callers talk to
pub struct ShimSocketEnforcer {
    socket: PathBuf,
}

impl ShimSocketEnforcer {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Enforcer for ShimSocketEnforcer {
    fn name(&self) -> &str {
        "shim-socket"
    }

    fn kinds(&self) -> Vec<OperationKind> {
        vec![OperationKind::Command, OperationKind::File]
    }

    async fn run(&self, engine: Arc<Engine>, shutdown: CancellationToken) -> Result<()> {
        let listener = server::bind(&self.socket)
            .with_context(|| format!("Failed to bind rpc socket at {:?}", self.socket))?;
        let result = server::serve(RpcHandler::agent(engine), listener, shutdown).await;
        let _ = std::fs::remove_file(&self.socket);
        result.context("RPC socket stopped")
    }
}

/// Backends enabled by the config
pub fn select(config: &ServerConfig, paths: &Paths) -> Vec<Box<dyn Enforcer>> {
    let mut backends: Vec<Box<dyn Enforcer>> = Vec::new();
    if config.enforcement.network == NetworkBackend::Proxy {
        backends.push(Box::new(ProxyEnforcer::new(config.proxy.listen.clone())));
    }
    if config.enforcement.process == ProcessBackend::Shim {
        backends.push(Box::new(ShimSocketEnforcer::new(config.socket_path(paths))));
    }
    for backend in &backends {
        info!(backend = backend.name(), kinds = ?backend.kinds(), "enforcer selected");
    }
    backends
}
