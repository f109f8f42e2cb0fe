//! The long-running gateway process
//!
//! Opens the engine, starts the selected enforcement backends and the
//! control surface, runs housekeeping, and reacts to signals:
//! `SIGHUP` reloads the policy file, `SIGINT`/`SIGTERM` shut down.

use crate::engine::Engine;
use crate::enforcer;
use crate::limits::LimitMonitor;
use crate::rpc::{server, RpcHandler};
use anyhow::{bail, Context, Result};
use policy::ReloadOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use warden_core::{Paths, ServerConfig};

/// How long backends get to drain after shutdown is requested
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the gateway until a shutdown signal arrives
pub async fn serve(config: ServerConfig, paths: Paths) -> Result<()> {
    let engine = Arc::new(Engine::open(config, &paths)?);
    let shutdown = CancellationToken::new();
    let mut tasks = start(engine.clone(), &paths, shutdown.clone()).await?;

    spawn_housekeeping(engine.clone(), shutdown.clone());
    spawn_reload_on_hangup(engine.clone(), shutdown.clone());

    let result = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        Some(joined) = tasks.join_next() => match joined {
            Ok(Ok(())) => Err(anyhow::anyhow!("a backend stopped unexpectedly")),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(anyhow::anyhow!("backend task panicked: {}", e)),
        },
    };

    info!("shutting down");
    for session in engine.sessions().list() {
        engine.end_session(&session.id);
    }
    shutdown.cancel();

    let drain = async {
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Err(e)) = joined {
                warn!(error = %e, "backend stopped with error");
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("backends did not drain in time");
        tasks.abort_all();
    }

    if let Err(ref e) = result {
        error!(error = %e, "gateway stopped");
    }
    result
}

/// Bind and spawn the control surface and every enabled backend
async fn start(engine: Arc<Engine>, paths: &Paths, shutdown: CancellationToken) -> Result<JoinSet<Result<()>>> {
    let mut tasks = JoinSet::new();
    let backends = enforcer::select(engine.config(), paths);
    if backends.is_empty() {
        warn!("every enforcement backend is disabled; only the control surface is served");
    }
    engine.set_backends(backends.iter().map(|b| b.name().to_string()).collect());

    for backend in backends {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let name = backend.name().to_string();
            backend
                .run(engine, shutdown)
                .await
                .with_context(|| format!("{} backend failed", name))
        });
    }

    match engine.config().operator_socket_path(paths) {
        Some(socket) => {
            let listener = server::bind_private(&socket)
                .with_context(|| format!("Failed to bind operator socket at {:?}", socket))?;
            let handler = RpcHandler::operator(engine.clone());
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let result = server::serve(handler, listener, shutdown).await;
                let _ = std::fs::remove_file(&socket);
                result.context("Operator socket failed")
            });
        }
        None => info!("operator socket disabled"),
    }

    let listen = engine.config().control.listen.clone();
    if listen.is_empty() {
        info!("control surface disabled");
    } else {
        let listener = TcpListener::bind(&listen)
            .await
            .with_context(|| format!("Failed to bind control surface on {}", listen))?;
        tasks.spawn(async move {
            crate::control::serve(engine, listener, shutdown)
                .await
                .context("Control surface failed")
        });
    }

    if tasks.is_empty() {
        bail!("nothing to serve: enforcement backends, operator socket and control surface are all disabled");
    }
    Ok(tasks)
}

/// Periodic sweeps and the limit monitor
fn spawn_housekeeping(engine: Arc<Engine>, shutdown: CancellationToken) {
    let monitor = LimitMonitor::new(&engine.config().limits.cgroup_root);
    tokio::spawn(monitor.run(engine.clone(), shutdown.clone()));

    let every = engine.config().audit.sweep_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => engine.sweep().await,
            }
        }
    });
}

#[cfg(unix)]
fn spawn_reload_on_hangup(engine: Arc<Engine>, shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "cannot install SIGHUP handler; reload via the control surface only");
            return;
        }
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match engine.reload_policy().await {
                        Ok(ReloadOutcome::Updated { from, to }) => info!(from, to, "policy reloaded on SIGHUP"),
                        Ok(ReloadOutcome::Unchanged { version }) => info!(version, "policy unchanged on SIGHUP"),
                        Err(e) => warn!(error = %e, "SIGHUP reload rejected, keeping the active policy"),
                    }
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_engine: Arc<Engine>, _shutdown: CancellationToken) {}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
