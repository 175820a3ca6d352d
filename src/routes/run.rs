//! Run summary HTTP endpoint.
//!
//! GET /api/v1/run: source states, override errors, and diagnostics of the
//! published run, plus refresher bookkeeping.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::{AppError, Diagnostic, ErrorResponse};
use crate::routes::{latest_report, stale_headers};
use crate::services::overrides::OverrideRowError;
use crate::services::pipeline::{SharedRunState, SourceStatus};

#[derive(Debug, Serialize, ToSchema)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub as_of: NaiveDate,
    pub airport_count: usize,
    pub eligible_count: usize,
    /// Airports per map marker
    pub marker_counts: BTreeMap<String, usize>,
    pub used_stale_data: bool,
    pub sources: Vec<SourceStatus>,
    pub override_errors: Vec<OverrideRowError>,
    pub diagnostics: Vec<Diagnostic>,
    pub total_runs: u64,
    pub last_error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Get the summary of the published run.
#[utoipa::path(
    get,
    path = "/api/v1/run",
    tag = "Run",
    responses(
        (status = 200, description = "Published run summary", body = RunSummary,
         headers(
             ("X-Data-Stale" = String, description = "Set to 'true' when the run used an expired cache entry")
         )),
        (status = 503, description = "No run has completed yet", body = ErrorResponse),
    )
)]
pub async fn get_run(
    State(state): State<SharedRunState>,
) -> Result<(HeaderMap, Json<RunSummary>), AppError> {
    let report = latest_report(&state).await?;
    let (total_runs, last_error, next_run_at) = {
        let s = state.read().await;
        (s.total_runs, s.last_error.clone(), s.next_run_at)
    };

    let mut marker_counts = BTreeMap::new();
    for a in &report.airports {
        *marker_counts
            .entry(a.classification.marker.name().to_string())
            .or_insert(0) += 1;
    }

    let summary = RunSummary {
        run_id: report.run_id,
        started_at: report.started_at,
        completed_at: report.completed_at,
        as_of: report.as_of,
        airport_count: report.airports.len(),
        eligible_count: report
            .airports
            .iter()
            .filter(|a| a.classification.verdict.is_eligible())
            .count(),
        marker_counts,
        used_stale_data: report.used_stale_data(),
        sources: report.sources.clone(),
        override_errors: report.override_errors.clone(),
        diagnostics: report.diagnostics.clone(),
        total_runs,
        last_error,
        next_run_at,
    };

    Ok((stale_headers(&report), Json(summary)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{fixtures, STALE_HEADER};

    #[tokio::test]
    async fn test_not_ready_before_first_run() {
        let result = get_run(State(fixtures::state(None))).await;
        assert!(matches!(result, Err(AppError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let (headers, Json(summary)) = get_run(State(fixtures::state(Some(fixtures::report(false)))))
            .await
            .unwrap();
        assert!(headers.get(STALE_HEADER).is_none());
        assert_eq!(summary.airport_count, 3);
        assert_eq!(summary.eligible_count, 2);
        assert_eq!(summary.marker_counts.get("blue"), Some(&1));
        assert_eq!(summary.sources.len(), 4);
    }

    #[tokio::test]
    async fn test_stale_run_sets_header() {
        let (headers, Json(summary)) = get_run(State(fixtures::state(Some(fixtures::report(true)))))
            .await
            .unwrap();
        assert_eq!(headers.get(STALE_HEADER).unwrap(), "true");
        assert!(summary.used_stale_data);
    }
}
