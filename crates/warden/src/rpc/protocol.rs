//! JSON-RPC 2.0 message types
//!
//! The same envelope is used on the Unix socket (one message per line) and
//! on the control surface's `POST /rpc`.

use approvals::ApprovalError;
use audit::StorageError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::from(id)),
            method: method.to_string(),
            params: Some(params),
        }
    }
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self::error_with_data(id, code, message, None)
    }

    pub fn error_with_data(id: Option<Value>, code: i32, message: String, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError { code, message, data }),
        }
    }
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Standard JSON-RPC error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Gateway error codes
pub const POLICY_DENIED: i32 = -32001;
pub const ALREADY_RESOLVED: i32 = -32002;
pub const NOT_FOUND: i32 = -32003;
pub const STORAGE_ERROR: i32 = -32004;
pub const OPERATOR_ONLY: i32 = -32005;

/// Failure of one RPC method
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Denial signal, plus the audited verdict as error data
    #[error("{message}")]
    Denied { message: String, verdict: Value },

    #[error("{0}")]
    AlreadyResolved(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0} is not available on this socket")]
    OperatorOnly(String),

    #[error("audit storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Internal(String),
}

impl RpcError {
    pub fn code(&self) -> i32 {
        match self {
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::Denied { .. } => POLICY_DENIED,
            Self::AlreadyResolved(_) => ALREADY_RESOLVED,
            Self::NotFound(_) => NOT_FOUND,
            Self::Storage(_) => STORAGE_ERROR,
            Self::OperatorOnly(_) => OPERATOR_ONLY,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    pub fn into_response(self, id: Option<Value>) -> JsonRpcResponse {
        let code = self.code();
        match self {
            Self::Denied { message, verdict } => JsonRpcResponse::error_with_data(id, code, message, Some(verdict)),
            other => JsonRpcResponse::error(id, code, other.to_string()),
        }
    }
}

impl From<ApprovalError> for RpcError {
    fn from(e: ApprovalError) -> Self {
        match e {
            ApprovalError::NotFound(_) => Self::NotFound(e.to_string()),
            ApprovalError::AlreadyResolved { .. } => Self::AlreadyResolved(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approvals::ApprovalState;
    use uuid::Uuid;

    #[test]
    fn test_response_serialization() {
        let ok = JsonRpcResponse::success(Some(Value::from(1)), serde_json::json!({"a": 1}));
        let text = serde_json::to_string(&ok).unwrap();
        assert_eq!(text, r#"{"jsonrpc":"2.0","id":1,"result":{"a":1}}"#);

        let err = RpcError::MethodNotFound("nope".into()).into_response(None);
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains("-32601"));
        assert!(!text.contains("result"));
    }

    #[test]
    fn test_approval_errors_map_to_codes() {
        let id = Uuid::new_v4();
        assert_eq!(RpcError::from(ApprovalError::NotFound(id)).code(), NOT_FOUND);
        let resolved = ApprovalError::AlreadyResolved {
            id,
            state: ApprovalState::Granted,
        };
        assert_eq!(RpcError::from(resolved).code(), ALREADY_RESOLVED);
    }
}
