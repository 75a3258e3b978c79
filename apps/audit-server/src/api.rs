//! API handlers for the audit server
//!
//! - `POST /api/analyze`: run one analysis
//! - `GET /health`: liveness plus memory snapshot

use audit_pipeline::error::PipelineError;
use audit_pipeline::governor::MemoryStatus;
use audit_pipeline::ErrorKind;
use axum::{extract::rejection::JsonRejection, extract::State, Json};
use serde::{Deserialize, Serialize};
use shared_types::BoundedReport;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// `healthy`, or `overloaded` while admission is closed
    pub status: String,
    pub service: String,
    pub version: String,
    pub memory: MemoryStatus,
}

/// Health check endpoint
pub async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let memory = state.pipeline.governor().status();
    let status = if memory.admitting {
        "healthy"
    } else {
        "overloaded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        service: "audit-server".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        memory,
    })
}

/// Analyze request body
#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub url: String,
}

/// Analyze endpoint
pub async fn handle_analyze(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Json<BoundedReport>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        debug!("Rejected analyze body: {}", rejection.body_text());
        ApiError::new(
            PipelineError::new(
                ErrorKind::InvalidUrl,
                "Request body must be JSON with a \"url\" field",
            ),
            None,
        )
    })?;

    info!("Analyze request: {}", request.url);

    match state.pipeline.run(&request.url).await {
        Ok(report) => {
            info!(
                "Analyzed {} in {}ms: {} violations",
                report.url, report.elapsed_ms, report.totals.violations
            );
            Ok(Json(report))
        }
        Err(error) => Err(ApiError::new(error, Some(request.url))),
    }
}
