//! Client for the gateway's RPC socket

use super::protocol::{JsonRpcRequest, JsonRpcResponse};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot reach warden at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("warden connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response from warden: {0}")]
    Protocol(String),

    #[error("warden request timed out")]
    Timeout,

    #[error("{message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },
}

impl ClientError {
    /// The gateway answered, but refused the call on policy grounds
    pub fn is_denial(&self) -> bool {
        matches!(self, Self::Rpc { code, .. } if *code == super::protocol::POLICY_DENIED)
    }
}

pub struct RpcClient {
    socket_path: PathBuf,
    timeout: Option<Duration>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: None,
            next_id: AtomicU64::new(1),
        }
    }

    /// Bound each call. Approval waits can be long, so there is no default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Call a method and return its result
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let request = JsonRpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);
        let exchange = self.exchange(&request);
        let response = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| ClientError::Timeout)??,
            None => exchange.await?,
        };

        if let Some(error) = response.error {
            return Err(ClientError::Rpc {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        response
            .result
            .ok_or_else(|| ClientError::Protocol("response carries neither result nor error".to_string()))
    }

    async fn exchange(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, ClientError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;
        let (read, mut write) = stream.into_split();

        let mut line = serde_json::to_vec(request).map_err(|e| ClientError::Protocol(e.to_string()))?;
        line.push(b'\n');
        write.write_all(&line).await?;
        write.flush().await?;

        let mut reader = BufReader::new(read);
        let mut response = String::new();
        if reader.read_line(&mut response).await? == 0 {
            return Err(ClientError::Protocol("connection closed before a response".to_string()));
        }
        serde_json::from_str(response.trim()).map_err(|e| ClientError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::engine_with_policy;
    use crate::rpc::{server, RpcHandler};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_call_over_socket() {
        let (engine, dir) = engine_with_policy("version: 1\ndefaults:\n  command: deny\n");
        let socket = dir.path().join("run").join("warden.sock");
        let listener = server::bind(&socket).unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server::serve(
            RpcHandler::operator(Arc::new(engine)),
            listener,
            shutdown.clone(),
        ));

        let client = RpcClient::new(socket.clone()).with_timeout(Duration::from_secs(5));
        let status = client.call("status", Value::Null).await.unwrap();
        assert_eq!(status["policy_version"], 1);

        let result = client
            .call("command.check", serde_json::json!({"program": "curl"}))
            .await
            .unwrap();
        assert_eq!(result["allowed"], false);

        let err = client.call("missing", Value::Null).await.unwrap_err();
        assert!(matches!(err, ClientError::Rpc { code: -32601, .. }));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unreachable_socket() {
        let dir = tempfile::tempdir().unwrap();
        let client = RpcClient::new(dir.path().join("absent.sock"));
        let err = client.call("status", Value::Null).await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
        assert!(!err.is_denial());
    }
}
