//! On-disk source cache with publication-cycle freshness.
//!
//! One JSON file per source under the cache directory (`<source>.json`),
//! holding the parsed (pre-alias) records and the time they were fetched.
//!
//! Lookup order for [`CacheManager::get_or_fetch`]:
//! 1. fresh entry (younger than the source's cycle) → returned, fetch not called
//! 2. otherwise fetch + parse → persisted, returned as `Fetched`
//! 3. fetch or parse failed but an older entry exists → returned as `StaleFallback`
//! 4. nothing usable → `AppError::SourceUnavailable`
//!
//! Writes go through a per-source lease file and an atomic rename, so a crash
//! or a failed fetch never leaves a truncated entry behind.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, Instant, SystemTime};
use utoipa::ToSchema;

use crate::errors::{AppError, CacheError, Diagnostic};
use crate::helpers::write_atomic_file;
use crate::models::{SourceKind, SourcePartialRecord};
use crate::services::normalize::{parse_payload, NormalizeConfig, RawPayload};

/// Poll interval while another writer holds a lease.
const LEASE_RETRY_MS: u64 = 50;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// How long a writer waits for another writer's lease.
    pub lease_timeout: StdDuration,
    /// A lease file older than this is assumed abandoned and broken.
    pub lease_stale_after: StdDuration,
}

/// Persisted form of one source's last successful acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub source: SourceKind,
    pub fetched_at: DateTime<Utc>,
    pub cycle_days: i64,
    pub records: Vec<SourcePartialRecord>,
}

impl CacheEntry {
    /// Fresh while strictly younger than `cycle_days`. The caller's window
    /// applies, not the one recorded when the entry was written.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, cycle_days: i64) -> bool {
        now - self.fetched_at < Duration::days(cycle_days)
    }
}

/// How a source's data was obtained for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    /// Fresh cache entry reused without fetching.
    Cached,
    /// Fetched and parsed during this run.
    Fetched,
    /// Fetch failed; an expired cache entry was used instead.
    StaleFallback,
}

/// Result of a cache lookup for one source.
#[derive(Debug, Clone)]
pub struct CachedSource {
    pub source: SourceKind,
    pub fetched_at: DateTime<Utc>,
    pub state: SourceState,
    pub records: Vec<SourcePartialRecord>,
    /// Parse diagnostics (only on `Fetched`) and cache corruption notices.
    pub diagnostics: Vec<Diagnostic>,
    /// Why the fetch was abandoned, for `StaleFallback`.
    pub fallback_reason: Option<String>,
}

impl CachedSource {
    pub fn is_stale(&self) -> bool {
        self.state == SourceState::StaleFallback
    }
}

#[derive(Debug, Clone)]
pub struct CacheManager {
    config: CacheConfig,
    normalize: NormalizeConfig,
}

impl CacheManager {
    pub fn new(config: CacheConfig, normalize: NormalizeConfig) -> Self {
        Self { config, normalize }
    }

    pub fn entry_path(&self, source: SourceKind) -> PathBuf {
        self.config.dir.join(format!("{}.json", source.name()))
    }

    fn lease_path(&self, source: SourceKind) -> PathBuf {
        self.config.dir.join(format!("{}.lock", source.name()))
    }

    pub async fn ensure_dir(&self) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.config.dir).await?;
        Ok(())
    }

    /// Return the source's records, fetching only when the cache is not fresh.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        source: SourceKind,
        cycle_days: i64,
        fetch: F,
    ) -> Result<CachedSource, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RawPayload, AppError>>,
    {
        self.get_or_fetch_at(source, cycle_days, Utc::now(), fetch)
            .await
    }

    /// [`Self::get_or_fetch`] against an explicit clock.
    pub async fn get_or_fetch_at<F, Fut>(
        &self,
        source: SourceKind,
        cycle_days: i64,
        now: DateTime<Utc>,
        fetch: F,
    ) -> Result<CachedSource, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RawPayload, AppError>>,
    {
        let mut diagnostics = Vec::new();

        let existing = match self.load_entry(source, &mut diagnostics).await {
            Some(entry) if entry.is_fresh_at(now, cycle_days) => {
                tracing::debug!(
                    "[{}] cache hit (fetched {}, cycle {} days)",
                    source,
                    entry.fetched_at,
                    cycle_days
                );
                return Ok(CachedSource {
                    source,
                    fetched_at: entry.fetched_at,
                    state: SourceState::Cached,
                    records: entry.records,
                    diagnostics,
                    fallback_reason: None,
                });
            }
            other => other,
        };

        tracing::info!("[{}] cache miss or expired, fetching", source);
        let attempt = match fetch().await {
            Ok(raw) => parse_payload(source, raw, now, &self.normalize).map_err(|e| e.to_string()),
            Err(AppError::SourceUnavailable { reason, .. }) => Err(reason),
            Err(e) => Err(e.to_string()),
        };

        match attempt {
            Ok(parsed) => {
                let entry = CacheEntry {
                    source,
                    fetched_at: now,
                    cycle_days,
                    records: parsed.records,
                };
                if let Err(e) = self.store_entry(&entry).await {
                    tracing::warn!("[{}] failed to persist cache entry: {}", source, e);
                }
                diagnostics.extend(parsed.diagnostics);
                Ok(CachedSource {
                    source,
                    fetched_at: entry.fetched_at,
                    state: SourceState::Fetched,
                    records: entry.records,
                    diagnostics,
                    fallback_reason: None,
                })
            }
            Err(reason) => match existing {
                Some(entry) => {
                    tracing::warn!(
                        "[{}] fetch failed ({}); falling back to stale cache from {}",
                        source,
                        reason,
                        entry.fetched_at
                    );
                    Ok(CachedSource {
                        source,
                        fetched_at: entry.fetched_at,
                        state: SourceState::StaleFallback,
                        records: entry.records,
                        diagnostics,
                        fallback_reason: Some(reason),
                    })
                }
                None => {
                    tracing::error!("[{}] fetch failed with no cache to fall back on: {}", source, reason);
                    Err(AppError::source_unavailable(source, reason))
                }
            },
        }
    }

    /// Read the persisted entry. A corrupt entry is deleted and reported,
    /// and the lookup proceeds as a miss.
    async fn load_entry(
        &self,
        source: SourceKind,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<CacheEntry> {
        let path = self.entry_path(source);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("[{}] cannot read cache entry {}: {}", source, path.display(), e);
                return None;
            }
        };

        let problem = match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.source == source => return Some(entry),
            Ok(entry) => format!("entry belongs to source '{}'", entry.source),
            Err(e) => e.to_string(),
        };

        diagnostics.push(Diagnostic::cache_corruption(
            source,
            format!("discarding {}: {}", path.display(), problem),
        ));
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!("[{}] failed to remove corrupt cache entry: {}", source, e);
        }
        None
    }

    async fn store_entry(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(entry)?;
        let path = self.entry_path(entry.source);
        let lease_path = self.lease_path(entry.source);
        let (timeout, stale_after) = (self.config.lease_timeout, self.config.lease_stale_after);

        tokio::task::spawn_blocking(move || -> Result<(), CacheError> {
            let _lease = CacheLease::acquire(&lease_path, timeout, stale_after)?;
            write_atomic_file(&path, &bytes)?;
            Ok(())
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e.to_string())))??;

        tracing::debug!(
            "[{}] cache entry written ({} records)",
            entry.source,
            entry.records.len()
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Writer lease
// ---------------------------------------------------------------------------

/// Exclusive writer lease held as a `create_new` lock file; removed on drop.
struct CacheLease {
    path: PathBuf,
}

impl CacheLease {
    fn acquire(path: &Path, timeout: StdDuration, stale_after: StdDuration) -> Result<Self, CacheError> {
        let started = Instant::now();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lease_age(path).is_some_and(|age| age >= stale_after) {
                        tracing::warn!("Breaking abandoned cache lease {}", path.display());
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    if started.elapsed() >= timeout {
                        return Err(CacheError::LeaseTimeout(path.to_path_buf()));
                    }
                    std::thread::sleep(StdDuration::from_millis(LEASE_RETRY_MS));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lease_age(path: &Path) -> Option<StdDuration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DiagnosticKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(dir: &Path) -> CacheManager {
        CacheManager::new(
            CacheConfig {
                dir: dir.to_path_buf(),
                lease_timeout: StdDuration::from_millis(200),
                lease_stale_after: StdDuration::from_secs(60),
            },
            NormalizeConfig {
                flight_history_days: 365,
            },
        )
    }

    fn fuel_payload(ids: &[&str]) -> RawPayload {
        let mut csv = String::from("ICAO,LOCATION\n");
        for id in ids {
            csv.push_str(id);
            csv.push_str(",SOMEWHERE\n");
        }
        RawPayload::Fuel { csv }
    }

    fn t0() -> DateTime<Utc> {
        "2026-06-01T00:00:00Z".parse().unwrap()
    }

    async fn seed(cache: &CacheManager, ids: &[&str]) {
        let payload = fuel_payload(ids);
        cache
            .get_or_fetch_at(SourceKind::Fuel, 28, t0(), || async move { Ok(payload) })
            .await
            .unwrap();
    }

    #[test]
    fn test_freshness_boundary() {
        let entry = CacheEntry {
            source: SourceKind::Fuel,
            fetched_at: t0(),
            cycle_days: 28,
            records: Vec::new(),
        };
        assert!(entry.is_fresh_at(t0() + Duration::days(27), 28));
        assert!(!entry.is_fresh_at(t0() + Duration::days(28), 28));
        assert!(!entry.is_fresh_at(t0() + Duration::days(29), 28));
        assert!(entry.is_fresh_at(t0() + Duration::days(29), 56));
    }

    #[tokio::test]
    async fn test_fresh_entry_is_reused_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());
        seed(&cache, &["KELP"]).await;

        let calls = AtomicUsize::new(0);
        let result = cache
            .get_or_fetch_at(SourceKind::Fuel, 28, t0() + Duration::days(27), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(fuel_payload(&["KSAT"]))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.state, SourceState::Cached);
        assert_eq!(result.fetched_at, t0());
        assert_eq!(result.records[0].source_id, "KELP");
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());
        seed(&cache, &["KELP"]).await;

        let now = t0() + Duration::days(29);
        let calls = AtomicUsize::new(0);
        let result = cache
            .get_or_fetch_at(SourceKind::Fuel, 28, now, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(fuel_payload(&["KSAT"]))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.state, SourceState::Fetched);
        assert_eq!(result.fetched_at, now);

        let on_disk: CacheEntry =
            serde_json::from_slice(&std::fs::read(cache.entry_path(SourceKind::Fuel)).unwrap()).unwrap();
        assert_eq!(on_disk.fetched_at, now);
        assert_eq!(on_disk.records[0].source_id, "KSAT");
    }

    #[tokio::test]
    async fn test_failed_fetch_falls_back_to_stale_and_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());
        seed(&cache, &["KELP"]).await;
        let before = std::fs::read(cache.entry_path(SourceKind::Fuel)).unwrap();

        let result = cache
            .get_or_fetch_at(SourceKind::Fuel, 28, t0() + Duration::days(40), || async {
                Err(AppError::source_unavailable(SourceKind::Fuel, "HTTP 503"))
            })
            .await
            .unwrap();

        assert!(result.is_stale());
        assert_eq!(result.fetched_at, t0());
        assert!(result.fallback_reason.unwrap().contains("503"));
        assert_eq!(std::fs::read(cache.entry_path(SourceKind::Fuel)).unwrap(), before);
    }

    #[tokio::test]
    async fn test_unparseable_payload_falls_back_to_stale() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());
        seed(&cache, &["KELP"]).await;

        let result = cache
            .get_or_fetch_at(SourceKind::Fuel, 28, t0() + Duration::days(40), || async {
                Ok(RawPayload::Fuel {
                    csv: "no header here\n".to_string(),
                })
            })
            .await
            .unwrap();
        assert_eq!(result.state, SourceState::StaleFallback);
    }

    #[tokio::test]
    async fn test_no_entry_and_failed_fetch_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());

        let err = cache
            .get_or_fetch_at(SourceKind::Fuel, 28, t0(), || async {
                Err(AppError::source_unavailable(SourceKind::Fuel, "connection refused"))
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::SourceUnavailable {
                kind: SourceKind::Fuel,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_shorter_configured_cycle_overrides_stored_one() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());
        let payload = fuel_payload(&["KELP"]);
        cache
            .get_or_fetch_at(SourceKind::Fuel, 56, t0(), || async move { Ok(payload) })
            .await
            .unwrap();

        let calls = AtomicUsize::new(0);
        let result = cache
            .get_or_fetch_at(SourceKind::Fuel, 28, t0() + Duration::days(29), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(fuel_payload(&["KSAT"]))
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.state, SourceState::Fetched);
        assert_eq!(result.records[0].source_id, "KSAT");
    }

    #[tokio::test]
    async fn test_get_or_fetch_uses_wall_clock() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());

        let first = cache
            .get_or_fetch(SourceKind::Fuel, 28, || async { Ok(fuel_payload(&["KELP"])) })
            .await
            .unwrap();
        assert_eq!(first.state, SourceState::Fetched);
        assert!(cache.entry_path(SourceKind::Fuel).exists());

        let second = cache
            .get_or_fetch(SourceKind::Fuel, 28, || async {
                Err(AppError::InternalError("must not be called".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(second.state, SourceState::Cached);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_discarded_and_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());
        std::fs::write(cache.entry_path(SourceKind::Fuel), b"{\"source\": \"fuel\", \"fetch").unwrap();

        let result = cache
            .get_or_fetch_at(SourceKind::Fuel, 28, t0(), || async { Ok(fuel_payload(&["KELP"])) })
            .await
            .unwrap();

        assert_eq!(result.state, SourceState::Fetched);
        assert!(result
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::CacheCorruption));
    }

    #[tokio::test]
    async fn test_entry_for_other_source_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let cache = manager(dir.path());
        seed(&cache, &["KELP"]).await;
        std::fs::copy(
            cache.entry_path(SourceKind::Fuel),
            cache.entry_path(SourceKind::Flights),
        )
        .unwrap();

        let err = cache
            .get_or_fetch_at(SourceKind::Flights, 28, t0(), || async {
                Err(AppError::source_unavailable(SourceKind::Flights, "down"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SourceUnavailable { .. }));
        assert!(!cache.entry_path(SourceKind::Flights).exists());
    }

    #[test]
    fn test_lease_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fuel.lock");
        let short = StdDuration::from_millis(120);
        let long = StdDuration::from_secs(60);

        let held = CacheLease::acquire(&path, short, long).unwrap();
        assert!(matches!(
            CacheLease::acquire(&path, short, long),
            Err(CacheError::LeaseTimeout(_))
        ));
        drop(held);
        assert!(CacheLease::acquire(&path, short, long).is_ok());
    }

    #[test]
    fn test_abandoned_lease_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fuel.lock");
        std::fs::write(&path, b"").unwrap();
        let lease = CacheLease::acquire(&path, StdDuration::from_millis(100), StdDuration::ZERO);
        assert!(lease.is_ok());
    }
}
