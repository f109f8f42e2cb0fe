//! JSON-RPC over a Unix socket, one message per line

use super::handler::RpcHandler;
use std::io;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bind the socket, replacing a stale one left by a previous run
pub fn bind(path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
}

/// Bind a socket only its owner may connect to
pub fn bind_private(path: &Path) -> io::Result<UnixListener> {
    use std::os::unix::fs::PermissionsExt;

    let listener = bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Serve connections until `shutdown` fires
pub async fn serve(handler: RpcHandler, listener: UnixListener, shutdown: CancellationToken) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        if let Some(path) = addr.as_pathname() {
            info!(socket = %path.display(), "rpc socket listening");
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("rpc socket shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let handler = handler.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(handler, stream, shutdown).await {
                                debug!(error = %e, "rpc connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "rpc accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_connection(handler: RpcHandler, stream: UnixStream, shutdown: CancellationToken) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = reader.read_line(&mut line) => read?,
        };
        if bytes_read == 0 {
            break;
        }

        let message = line.trim();
        if message.is_empty() {
            continue;
        }

        if let Some(response) = handler.handle_message(message).await {
            let mut out = serde_json::to_vec(&response).map_err(io::Error::other)?;
            out.push(b'\n');
            write.write_all(&out).await?;
            write.flush().await?;
        }
    }
    Ok(())
}
