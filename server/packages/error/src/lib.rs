//! Error taxonomy shared by the MCP proxy surfaces.
//!
//! Every failure the proxy can report is a [`ProxyError`]. The GET surface
//! renders errors as a plain [`ErrorBody`], the POST surface as a JSON-RPC
//! [`JsonRpcErrorResponse`]. The HTTP status differs per surface, so both are
//! exposed on [`ErrorType`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

pub const JSON_RPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ServerNotResolved,
    ParseError,
    UpstreamUnavailable,
    InvalidUpstreamResponse,
    UpstreamStream,
}

impl ErrorType {
    /// JSON-RPC 2.0 error code reported on the POST surface.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            Self::ServerNotResolved => JsonRpcErrorCode::InvalidParams.code(),
            Self::ParseError => JsonRpcErrorCode::ParseError.code(),
            Self::UpstreamUnavailable => JsonRpcErrorCode::InternalError.code(),
            Self::InvalidUpstreamResponse => JsonRpcErrorCode::InternalError.code(),
            Self::UpstreamStream => JsonRpcErrorCode::InternalError.code(),
        }
    }

    /// Status for the JSON-RPC (POST) surface.
    ///
    /// An unparseable upstream body is still a 200: the proxy hop succeeded
    /// and the failure travels inside the JSON-RPC payload.
    pub fn rpc_status_code(&self) -> u16 {
        match self {
            Self::ServerNotResolved => 400,
            Self::ParseError => 400,
            Self::UpstreamUnavailable => 500,
            Self::InvalidUpstreamResponse => 200,
            Self::UpstreamStream => 500,
        }
    }

    /// Status for the event-stream (GET) surface.
    pub fn stream_status_code(&self) -> u16 {
        match self {
            Self::ServerNotResolved => 404,
            Self::ParseError => 400,
            Self::UpstreamUnavailable => 500,
            Self::InvalidUpstreamResponse => 502,
            Self::UpstreamStream => 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonRpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
}

impl JsonRpcErrorCode {
    pub fn code(&self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: String,
    pub error: JsonRpcError,
    /// `null` whenever the request id could not be recovered.
    pub id: Value,
}

/// Body used by the event-stream surface, which has no JSON-RPC framing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Missing or invalid server parameter")]
    ServerNotResolved,
    #[error("Parse error")]
    ParseError { reason: String },
    #[error("Internal error: {message}")]
    UpstreamUnavailable { message: String },
    #[error("Internal error: Invalid JSON response from server")]
    InvalidUpstreamResponse { body_bytes: usize },
    #[error("upstream stream error: {message}")]
    UpstreamStream { message: String },
}

impl ProxyError {
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
        }
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::ServerNotResolved => ErrorType::ServerNotResolved,
            Self::ParseError { .. } => ErrorType::ParseError,
            Self::UpstreamUnavailable { .. } => ErrorType::UpstreamUnavailable,
            Self::InvalidUpstreamResponse { .. } => ErrorType::InvalidUpstreamResponse,
            Self::UpstreamStream { .. } => ErrorType::UpstreamStream,
        }
    }

    /// Render as a JSON-RPC error envelope. `id` is whatever the caller could
    /// recover from the request; `None` serializes as `null`.
    pub fn to_json_rpc(&self, id: Option<Value>) -> JsonRpcErrorResponse {
        JsonRpcErrorResponse {
            jsonrpc: JSON_RPC_VERSION.to_string(),
            error: JsonRpcError {
                code: self.error_type().json_rpc_code(),
                message: self.to_string(),
                data: None,
            },
            id: id.unwrap_or(Value::Null),
        }
    }

    /// Render for the event-stream surface.
    pub fn to_error_body(&self) -> ErrorBody {
        let error = match self {
            Self::ServerNotResolved => "MCP server not found or not specified".to_string(),
            Self::UpstreamUnavailable { .. } => "Failed to connect to MCP server".to_string(),
            other => other.to_string(),
        };
        ErrorBody { error }
    }
}

impl From<&ProxyError> for ErrorBody {
    fn from(value: &ProxyError) -> Self {
        value.to_error_body()
    }
}

impl From<ProxyError> for ErrorBody {
    fn from(value: ProxyError) -> Self {
        value.to_error_body()
    }
}
