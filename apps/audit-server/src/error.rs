//! Error responses for the audit server

use audit_pipeline::error::PipelineError;
use audit_pipeline::ErrorKind;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::warn;

/// A pipeline failure on its way back to the caller
#[derive(Error, Debug)]
#[error("{error}")]
pub struct ApiError {
    pub error: PipelineError,
    /// Requested URL, echoed in the body when known
    pub url: Option<String>,
}

impl ApiError {
    pub fn new(error: PipelineError, url: Option<String>) -> Self {
        Self { error, url }
    }
}

impl From<PipelineError> for ApiError {
    fn from(error: PipelineError) -> Self {
        Self { error, url: None }
    }
}

/// HTTP status for each failure category
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidUrl | ErrorKind::InvalidProtocol => StatusCode::BAD_REQUEST,
        ErrorKind::MemoryExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::OversizedResponse => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::InvalidContent | ErrorKind::TooComplex => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::HttpError => StatusCode::BAD_GATEWAY,
        ErrorKind::SandboxTimeout | ErrorKind::AnalysisTimeout | ErrorKind::PollExhausted => {
            StatusCode::GATEWAY_TIMEOUT
        }
        ErrorKind::NetworkError
        | ErrorKind::EngineError
        | ErrorKind::ResultProcessingError
        | ErrorKind::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.error.kind);
        if status.is_server_error() {
            warn!(
                kind = %self.error.kind,
                phase = ?self.error.phase,
                "Analysis failed: {}",
                self.error.message
            );
        }

        let body = self.error.to_body(self.url.as_deref());
        (status, Json(body)).into_response()
    }
}
