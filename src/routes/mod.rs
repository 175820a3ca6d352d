pub mod airports;
pub mod health;
pub mod run;

use axum::http::{HeaderMap, HeaderValue};
use std::sync::Arc;

use crate::errors::AppError;
use crate::services::pipeline::{RunReport, SharedRunState};

/// Response header set when the served run fell back to expired cache data.
pub const STALE_HEADER: &str = "X-Data-Stale";

/// The last published run, or 503 before the first run completes.
pub(crate) async fn latest_report(state: &SharedRunState) -> Result<Arc<RunReport>, AppError> {
    let s = state.read().await;
    s.latest.clone().ok_or_else(|| {
        AppError::NotReady(match &s.last_error {
            Some(e) => format!("no completed run yet (last attempt failed: {})", e),
            None => "no completed run yet".to_string(),
        })
    })
}

pub(crate) fn stale_headers(report: &RunReport) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if report.used_stale_data() {
        headers.insert(STALE_HEADER, HeaderValue::from_static("true"));
    }
    headers
}
