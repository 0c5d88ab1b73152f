use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relay_core::wire::FrameError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("client {client_id} is offline")]
    AgentOffline { client_id: String },
    #[error("request {request_id} timed out after {timeout_ms} ms")]
    CorrelationTimeout { request_id: String, timeout_ms: u64 },
    #[error("client disconnected before answering request {request_id}")]
    AgentDisconnected { request_id: String },
    #[error("request id {request_id} is already pending")]
    DuplicateRequest { request_id: String },
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl BrokerError {
    pub fn status(&self) -> StatusCode {
        match self {
            BrokerError::AgentOffline { .. } => StatusCode::NOT_FOUND,
            BrokerError::CorrelationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            BrokerError::AgentDisconnected { .. } => StatusCode::BAD_GATEWAY,
            BrokerError::DuplicateRequest { .. } => StatusCode::CONFLICT,
            BrokerError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
            BrokerError::Frame(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            BrokerError::AgentOffline { .. } => "CLIENT_OFFLINE",
            BrokerError::CorrelationTimeout { .. } => "TIMEOUT",
            BrokerError::AgentDisconnected { .. } => "CLIENT_DISCONNECTED",
            BrokerError::DuplicateRequest { .. } => "DUPLICATE_REQUEST",
            BrokerError::InvalidCommand(_) => "INVALID_COMMAND",
            BrokerError::Frame(_) => "ENCODE_FAILED",
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        match &self {
            BrokerError::AgentOffline { .. } => body["online"] = json!(false),
            BrokerError::CorrelationTimeout { request_id, .. }
            | BrokerError::AgentDisconnected { request_id }
            | BrokerError::DuplicateRequest { request_id } => {
                body["request_id"] = json!(request_id)
            }
            _ => {}
        }
        (self.status(), Json(body)).into_response()
    }
}
