//! One refresh run, end to end, plus the background refresher that repeats it.
//!
//! Architecture:
//! - Acquire every source in parallel through the cache (one future per source)
//! - Build the alias table from the runway master records + fixed aliases
//! - Resolve each source and the override sheet onto canonical airports
//! - Merge, then classify every airport against the run's `as_of` date
//! - Publish the complete [`RunReport`] (never a partial one) into shared state
//!
//! A run only fails when the override sheet is unreadable or no source at all
//! could be acquired (not even from an expired cache entry).

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::{Diagnostic, RunError};
use crate::models::{AirportId, AirportRecord, ClassificationResult, SourceKind};
use crate::services::cache::{CacheManager, SourceState};
use crate::services::classify::{Classifier, ClassifierConfig};
use crate::services::identifiers::AliasTable;
use crate::services::kml::write_exports;
use crate::services::merge::{merge, FieldAuthority, SourceSnapshot};
use crate::services::normalize::resolve_identifiers;
use crate::services::overrides::{load_overrides, resolve_overrides, OverrideRowError};
use crate::services::sources::SourceFetcher;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Publication cycle for the chart supplement and NASR runway data (days).
pub const SUPPLEMENT_CYCLE_DAYS: i64 = 56;

/// Cycle for the fuel listing and flight history (days).
pub const MONTHLY_CYCLE_DAYS: i64 = 28;

/// Upper bound on the sleep after a failed run (seconds). A shorter refresh
/// interval is used as is.
const REFRESH_RETRY_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub cycles: BTreeMap<SourceKind, i64>,
    /// Fixed alias → canonical id pairs applied on top of the runway records.
    pub fixed_aliases: BTreeMap<String, String>,
    pub overrides_path: PathBuf,
    pub min_lda_ft: u32,
    pub recent_landing_days: i64,
    pub authority: FieldAuthority,
}

impl PipelineConfig {
    pub fn default_cycles() -> BTreeMap<SourceKind, i64> {
        BTreeMap::from([
            (SourceKind::Runways, SUPPLEMENT_CYCLE_DAYS),
            (SourceKind::ChartSupplement, SUPPLEMENT_CYCLE_DAYS),
            (SourceKind::Fuel, MONTHLY_CYCLE_DAYS),
            (SourceKind::Flights, MONTHLY_CYCLE_DAYS),
        ])
    }

    pub fn cycle_days(&self, source: SourceKind) -> i64 {
        self.cycles
            .get(&source)
            .copied()
            .unwrap_or(MONTHLY_CYCLE_DAYS)
    }
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

/// Acquisition outcome for one source in one run.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SourceStatus {
    pub source: SourceKind,
    /// `None` when the source was unavailable with no cache to fall back on.
    pub state: Option<SourceState>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub records: usize,
    /// Fetch failure (for stale fallbacks and unavailable sources).
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedAirport {
    pub record: AirportRecord,
    pub classification: ClassificationResult,
}

/// Everything one run produced. Airports are ordered by identifier.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub as_of: NaiveDate,
    pub sources: Vec<SourceStatus>,
    pub override_errors: Vec<OverrideRowError>,
    pub diagnostics: Vec<Diagnostic>,
    pub airports: Vec<ClassifiedAirport>,
}

impl RunReport {
    pub fn stale_sources(&self) -> Vec<SourceKind> {
        self.sources
            .iter()
            .filter(|s| s.state == Some(SourceState::StaleFallback))
            .map(|s| s.source)
            .collect()
    }

    pub fn unavailable_sources(&self) -> Vec<SourceKind> {
        self.sources
            .iter()
            .filter(|s| s.state.is_none())
            .map(|s| s.source)
            .collect()
    }

    /// True when any source came from an expired cache entry.
    pub fn used_stale_data(&self) -> bool {
        !self.stale_sources().is_empty()
    }

    pub fn airport(&self, id: &AirportId) -> Option<&ClassifiedAirport> {
        self.airports
            .binary_search_by(|a| a.record.id.cmp(id))
            .ok()
            .map(|idx| &self.airports[idx])
    }
}

// ---------------------------------------------------------------------------
// Run state (in-memory, shared via Arc<RwLock<>>)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunState {
    /// Last successfully completed run.
    pub latest: Option<Arc<RunReport>>,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }
}

pub type SharedRunState = Arc<RwLock<RunState>>;

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline<F> {
    fetcher: F,
    cache: CacheManager,
    config: PipelineConfig,
}

impl<F: SourceFetcher> Pipeline<F> {
    pub fn new(fetcher: F, cache: CacheManager, config: PipelineConfig) -> Self {
        Self {
            fetcher,
            cache,
            config,
        }
    }

    /// Run against an explicit clock. `now` drives cache freshness and `as_of`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!("Run {} started (as of {})", run_id, now.date_naive());

        self.cache.ensure_dir().await?;
        let sheet = load_overrides(&self.config.overrides_path).await?;

        // 1. Acquire all sources in parallel
        let acquisitions = SourceKind::ALL.map(move |source| async move {
            let result = self
                .cache
                .get_or_fetch_at(source, self.config.cycle_days(source), now, move || {
                    self.fetcher.fetch(source)
                })
                .await;
            (source, result)
        });

        let mut statuses = Vec::new();
        let mut diagnostics = Vec::new();
        let mut acquired = Vec::new();
        let mut failures = Vec::new();
        for (source, result) in join_all(acquisitions).await {
            match result {
                Ok(cached) => {
                    if cached.is_stale() {
                        tracing::warn!(
                            "[{}] using stale cache from {}: {}",
                            source,
                            cached.fetched_at,
                            cached.fallback_reason.as_deref().unwrap_or("fetch failed")
                        );
                    }
                    statuses.push(SourceStatus {
                        source,
                        state: Some(cached.state),
                        fetched_at: Some(cached.fetched_at),
                        records: cached.records.len(),
                        error: cached.fallback_reason.clone(),
                    });
                    acquired.push(cached);
                }
                Err(e) => {
                    tracing::error!("[{}] unavailable: {}", source, e);
                    failures.push(e.to_string());
                    statuses.push(SourceStatus {
                        source,
                        state: None,
                        fetched_at: None,
                        records: 0,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if acquired.is_empty() {
            return Err(RunError::AllSourcesUnavailable(failures));
        }

        // 2. Alias table from the runway master records
        let aliases = AliasTable::from_runway_records(
            acquired
                .iter()
                .filter(|c| c.source == SourceKind::Runways)
                .flat_map(|c| c.records.iter()),
            &self.config.fixed_aliases,
        );

        // 3. Resolve every source onto canonical airports
        let mut snapshots = BTreeMap::new();
        for mut cached in acquired {
            diagnostics.append(&mut cached.diagnostics);
            let stale = cached.is_stale();
            let mut resolved = resolve_identifiers(cached.records, &aliases);
            diagnostics.append(&mut resolved.diagnostics);
            snapshots.insert(
                cached.source,
                SourceSnapshot {
                    source: cached.source,
                    fetched_at: cached.fetched_at,
                    stale,
                    records: resolved.records,
                },
            );
        }

        // 4. Overrides, merge, classify
        let (overrides, mut override_diagnostics) = resolve_overrides(sheet.rows, &aliases);
        diagnostics.append(&mut override_diagnostics);
        if !overrides.is_empty() {
            tracing::debug!("Applying {} override rows", overrides.len());
        }

        let merged = merge(&snapshots, &overrides, &self.config.authority);
        let classifier = Classifier::new(ClassifierConfig {
            min_lda_ft: self.config.min_lda_ft,
            recent_landing_days: self.config.recent_landing_days,
            as_of: now.date_naive(),
        });
        let airports: Vec<ClassifiedAirport> = merged
            .into_values()
            .map(|record| {
                let classification = classifier.classify(&record);
                ClassifiedAirport {
                    record,
                    classification,
                }
            })
            .collect();

        let report = RunReport {
            run_id,
            started_at,
            completed_at: Utc::now(),
            as_of: now.date_naive(),
            sources: statuses,
            override_errors: sheet.errors,
            diagnostics,
            airports,
        };

        tracing::info!(
            "Run {} complete: {} airports, {} eligible, {} diagnostics, stale sources: {:?}",
            run_id,
            report.airports.len(),
            report
                .airports
                .iter()
                .filter(|a| a.classification.verdict.is_eligible())
                .count(),
            report.diagnostics.len(),
            report.stale_sources()
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Background refresher
// ---------------------------------------------------------------------------

fn retry_delay(interval: StdDuration) -> StdDuration {
    interval.min(StdDuration::from_secs(REFRESH_RETRY_SECS))
}

/// Re-run the pipeline forever, publishing each completed report and writing
/// the KML/TSV exports. A failed run keeps the previous report published.
pub async fn run_refresher<F: SourceFetcher + 'static>(
    pipeline: Arc<Pipeline<F>>,
    state: SharedRunState,
    interval: StdDuration,
    output_dir: PathBuf,
) {
    tracing::info!(
        "Background refresher started (interval {} hours)",
        interval.as_secs() / 3600
    );

    loop {
        let attempt_at = Utc::now();
        state.write().await.last_attempt_at = Some(attempt_at);

        let sleep_for = match pipeline.run_at(attempt_at).await {
            Ok(report) => {
                if let Err(e) = write_exports(&report, &output_dir).await {
                    tracing::error!("Refresher: export failed: {}", e);
                }
                let mut s = state.write().await;
                s.latest = Some(Arc::new(report));
                s.last_error = None;
                interval
            }
            Err(e) => {
                tracing::error!("Refresher: run failed: {}", e);
                state.write().await.last_error = Some(e.to_string());
                retry_delay(interval)
            }
        };

        {
            let mut s = state.write().await;
            s.total_runs += 1;
            s.next_run_at = chrono::Duration::from_std(sleep_for)
                .ok()
                .map(|d| Utc::now() + d);
        }

        tokio::time::sleep(sleep_for).await;
    }
}
