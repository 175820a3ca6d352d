use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::models::SourceKind;
use crate::services::pipeline::SharedRunState;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// "ok", "degraded" (stale or missing sources, or the last run failed),
    /// or "starting" (no run has completed yet)
    pub status: String,
    /// API version
    pub version: String,
    /// Completion time of the published run
    pub last_run_at: Option<DateTime<Utc>>,
    /// Sources served from an expired cache entry
    pub stale_sources: Vec<SourceKind>,
    /// Sources missing from the published run
    pub unavailable_sources: Vec<SourceKind>,
    /// Error from the most recent failed run, if it failed
    pub last_error: Option<String>,
}

/// Health check endpoint.
///
/// Always 200 so load balancers can tell a degraded service from a dead one.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service status", body = HealthResponse),
    )
)]
pub async fn health_check(State(state): State<SharedRunState>) -> Json<HealthResponse> {
    let s = state.read().await;

    let (last_run_at, stale_sources, unavailable_sources) = match &s.latest {
        Some(report) => (
            Some(report.completed_at),
            report.stale_sources(),
            report.unavailable_sources(),
        ),
        None => (None, Vec::new(), Vec::new()),
    };

    let status = if s.latest.is_none() {
        "starting"
    } else if s.last_error.is_some() || !stale_sources.is_empty() || !unavailable_sources.is_empty() {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        last_run_at,
        stale_sources,
        unavailable_sources,
        last_error: s.last_error.clone(),
    })
}
