use axum::{
    Json,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::Value;

/// Failures of the management endpoints (`/new`, `/kill`).
///
/// Always rendered as a flat `{ok:false, error, message}` body with status 200;
/// none of them carries internal detail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("authentication failed")]
    AuthFailure,
    #[error("instance not running")]
    NotRunning,
    #[error("instance failed to start")]
    LaunchFailure,
    #[error("malformed request: {0}")]
    MalformedRequest(&'static str),
    #[error("internal error")]
    Internal,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    ok: bool,
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (error, message) = match self {
            ApiError::AuthFailure => ("nice try", None),
            ApiError::NotRunning => ("not_running", Some("No instance is running!")),
            ApiError::LaunchFailure => (
                "error_starting_chain",
                Some("An error occurred while starting the chain"),
            ),
            ApiError::MalformedRequest(msg) => ("invalid_request", Some(msg)),
            ApiError::Internal => ("internal_error", Some("An internal error occurred")),
        };
        Json(ErrorBody {
            ok: false,
            error,
            message,
        })
        .into_response()
    }
}

pub const INVALID_REQUEST: i64 = -32600;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// Envelope has an `id` but no string `method`.
    MalformedRequest,
    /// Unknown or expired instance id.
    NotFound,
    /// Method outside the allow-list without a valid credential.
    Forbidden,
    /// The node could not be reached.
    Upstream,
}

/// JSON-RPC error object answered by the proxy itself, echoing the caller's id.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub id: Value,
    pub kind: RpcErrorKind,
}

impl RpcError {
    pub fn new(id: Value, kind: RpcErrorKind) -> Self {
        Self { id, kind }
    }

    pub fn code(&self) -> i64 {
        match self.kind {
            RpcErrorKind::MalformedRequest | RpcErrorKind::Forbidden => INVALID_REQUEST,
            RpcErrorKind::NotFound => INVALID_PARAMS,
            RpcErrorKind::Upstream => INTERNAL_ERROR,
        }
    }

    pub fn message(&self) -> &'static str {
        match self.kind {
            RpcErrorKind::MalformedRequest | RpcErrorKind::Forbidden => "invalid request",
            RpcErrorKind::NotFound => "invalid uuid specified",
            RpcErrorKind::Upstream => "internal error",
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": self.id,
            "error": {
                "code": self.code(),
                "message": self.message(),
            },
        })
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        Json(self.to_json()).into_response()
    }
}
