use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::errors::{AppError, ErrorResponse};
use crate::helpers::opt_dec_to_f64;
use crate::models::{
    ClassificationResult, FieldOrigin, ListMembership, Marker, RunwayLda, Verdict,
};
use crate::routes::{latest_report, stale_headers};
use crate::services::identifiers::normalize_identifier;
use crate::services::pipeline::{ClassifiedAirport, RunReport, SharedRunState};

// ---------------------------------------------------------------------------
// Query parameter structs
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct AirportQuery {
    /// Only airports with this map marker (e.g. "blue", "red-diamond")
    pub marker: Option<String>,
    /// Drop ineligible airports
    #[serde(default)]
    pub eligible_only: bool,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct AirportSummary {
    pub id: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub lda_ft: Option<u32>,
    pub verdict: Verdict,
    pub marker: Marker,
    /// Primary reason behind the verdict
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AirportListResponse {
    pub run_id: Uuid,
    pub as_of: NaiveDate,
    pub count: usize,
    pub airports: Vec<AirportSummary>,
}

/// Where one merged field came from.
#[derive(Debug, Serialize, ToSchema)]
pub struct FieldSource {
    pub field: String,
    /// "override" or the source name
    pub origin: String,
    pub fetched_at: Option<DateTime<Utc>>,
    pub stale: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AirportDetail {
    pub id: String,
    pub faa_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub lda_ft: Option<u32>,
    pub runways: Vec<RunwayLda>,
    pub military: Option<bool>,
    pub contract_fuel: Option<bool>,
    pub jasu: Option<bool>,
    /// Restriction category, 0 when unrestricted
    pub category: u8,
    pub list: ListMembership,
    pub comment: Option<String>,
    pub last_landed: Option<NaiveDate>,
    pub crew: Option<String>,
    pub landing_issues: bool,
    pub classification: ClassificationResult,
    pub provenance: Vec<FieldSource>,
}

fn summary(a: &ClassifiedAirport) -> AirportSummary {
    AirportSummary {
        id: a.record.id.to_string(),
        latitude: opt_dec_to_f64(a.record.latitude),
        longitude: opt_dec_to_f64(a.record.longitude),
        lda_ft: a.record.lda_ft,
        verdict: a.classification.verdict,
        marker: a.classification.marker,
        reason: a.classification.reasons.first().cloned(),
    }
}

fn detail(a: &ClassifiedAirport) -> AirportDetail {
    let r = &a.record;
    let provenance = r
        .provenance
        .iter()
        .map(|(field, origin)| match origin {
            FieldOrigin::Override => FieldSource {
                field: field.label().to_string(),
                origin: "override".to_string(),
                fetched_at: None,
                stale: false,
            },
            FieldOrigin::Source {
                source,
                fetched_at,
                stale,
            } => FieldSource {
                field: field.label().to_string(),
                origin: source.name().to_string(),
                fetched_at: Some(*fetched_at),
                stale: *stale,
            },
        })
        .collect();

    AirportDetail {
        id: r.id.to_string(),
        faa_id: r.faa_id.clone(),
        latitude: opt_dec_to_f64(r.latitude),
        longitude: opt_dec_to_f64(r.longitude),
        lda_ft: r.lda_ft,
        runways: r.runways.clone(),
        military: r.military,
        contract_fuel: r.contract_fuel,
        jasu: r.jasu,
        category: r.category.number(),
        list: r.list,
        comment: r.comment.as_ref().map(|c| c.to_string()),
        last_landed: r.last_landed,
        crew: r.crew.clone(),
        landing_issues: r.landing_issues,
        classification: a.classification.clone(),
        provenance,
    }
}

/// Find an airport by canonical id, falling back to its FAA location id.
fn find_airport<'a>(report: &'a RunReport, code: &str) -> Option<&'a ClassifiedAirport> {
    report
        .airports
        .iter()
        .find(|a| a.record.id.as_str() == code)
        .or_else(|| {
            report
                .airports
                .iter()
                .find(|a| a.record.faa_id.as_deref() == Some(code))
        })
}

/// List classified airports of the published run.
#[utoipa::path(
    get,
    path = "/api/v1/airports",
    tag = "Airports",
    params(AirportQuery),
    responses(
        (status = 200, description = "Classified airports, ordered by identifier", body = AirportListResponse,
         headers(
             ("X-Data-Stale" = String, description = "Set to 'true' when the run used an expired cache entry")
         )),
        (status = 400, description = "Unknown marker", body = ErrorResponse),
        (status = 503, description = "No run has completed yet", body = ErrorResponse),
    )
)]
pub async fn list_airports(
    State(state): State<SharedRunState>,
    Query(params): Query<AirportQuery>,
) -> Result<(HeaderMap, Json<AirportListResponse>), AppError> {
    let marker = match params.marker.as_deref() {
        Some(raw) => Some(
            Marker::parse(raw)
                .ok_or_else(|| AppError::BadRequest(format!("Unknown marker '{}'", raw)))?,
        ),
        None => None,
    };

    let report = latest_report(&state).await?;
    let airports: Vec<AirportSummary> = report
        .airports
        .iter()
        .filter(|a| marker.map_or(true, |m| a.classification.marker == m))
        .filter(|a| !params.eligible_only || a.classification.verdict.is_eligible())
        .map(summary)
        .collect();

    let response = AirportListResponse {
        run_id: report.run_id,
        as_of: report.as_of,
        count: airports.len(),
        airports,
    };
    Ok((stale_headers(&report), Json(response)))
}

/// Get one airport's merged record, provenance, and classification.
#[utoipa::path(
    get,
    path = "/api/v1/airports/{id}",
    tag = "Airports",
    params(
        ("id" = String, Path, description = "ICAO or FAA identifier (case-insensitive)"),
    ),
    responses(
        (status = 200, description = "Airport detail", body = AirportDetail,
         headers(
             ("X-Data-Stale" = String, description = "Set to 'true' when the run used an expired cache entry")
         )),
        (status = 400, description = "Malformed identifier", body = ErrorResponse),
        (status = 404, description = "Airport not in the published run", body = ErrorResponse),
        (status = 503, description = "No run has completed yet", body = ErrorResponse),
    )
)]
pub async fn get_airport(
    State(state): State<SharedRunState>,
    Path(id): Path<String>,
) -> Result<(HeaderMap, Json<AirportDetail>), AppError> {
    let code = normalize_identifier(&id)
        .ok_or_else(|| AppError::BadRequest(format!("'{}' is not an airport identifier", id)))?;
    let report = latest_report(&state).await?;
    let airport = find_airport(&report, &code)
        .ok_or_else(|| AppError::NotFound(format!("Airport {} not found", code)))?;

    Ok((stale_headers(&report), Json(detail(airport))))
}
