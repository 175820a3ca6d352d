use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::models::SourceKind;
use crate::services::cache::CacheConfig;
use crate::services::identifiers::normalize_identifier;
use crate::services::merge::FieldAuthority;
use crate::services::normalize::NormalizeConfig;
use crate::services::pipeline::{PipelineConfig, MONTHLY_CYCLE_DAYS, SUPPLEMENT_CYCLE_DAYS};
use crate::services::sources::{RetryPolicy, SourceEndpoints};

/// How long a cache writer waits for another writer's lease (seconds).
const CACHE_LEASE_TIMEOUT_SECS: u64 = 30;
/// A lease file older than this is treated as abandoned (seconds).
const CACHE_LEASE_STALE_SECS: u64 = 600;

/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub cache_dir: PathBuf,
    /// Directory the KML and TSV exports are written to.
    pub output_dir: PathBuf,
    pub overrides_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_attempts: u32,
    pub http_retry_backoff_ms: u64,
    pub refresh_interval_hours: u64,
    pub min_lda_ft: u32,
    pub recent_landing_days: i64,
    /// Years of flight history kept when parsing the flights source.
    pub years_included: i64,
    pub cycles: BTreeMap<SourceKind, i64>,
    pub endpoints: SourceEndpoints,
    pub fixed_aliases: BTreeMap<String, String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let cycles = BTreeMap::from([
            (
                SourceKind::Runways,
                env_parse("RUNWAYS_CYCLE_DAYS", SUPPLEMENT_CYCLE_DAYS),
            ),
            (
                SourceKind::ChartSupplement,
                env_parse("CHART_SUPPLEMENT_CYCLE_DAYS", SUPPLEMENT_CYCLE_DAYS),
            ),
            (SourceKind::Fuel, env_parse("FUEL_CYCLE_DAYS", MONTHLY_CYCLE_DAYS)),
            (
                SourceKind::Flights,
                env_parse("FLIGHTS_CYCLE_DAYS", MONTHLY_CYCLE_DAYS),
            ),
        ]);

        Self {
            port: env_parse("PORT", 8080),
            cache_dir: env_or("CACHE_DIR", "./cache").into(),
            output_dir: env_or("OUTPUT_DIR", "./output").into(),
            overrides_path: env_or("OVERRIDES_PATH", "./data/overrides.csv").into(),
            user_agent: env_or("USER_AGENT", "PlanAid/0.1 (T-38 airfield planning)"),
            http_timeout_secs: env_parse("HTTP_TIMEOUT_SECS", 60),
            http_max_attempts: env_parse("HTTP_MAX_ATTEMPTS", 3),
            http_retry_backoff_ms: env_parse("HTTP_RETRY_BACKOFF_MS", 2000),
            refresh_interval_hours: env_parse("REFRESH_INTERVAL_HOURS", 24),
            min_lda_ft: env_parse("MIN_LDA_FT", 7000),
            recent_landing_days: env_parse("RECENT_LANDING_DAYS", 365),
            years_included: env_parse("YEARS_INCLUDED", 4),
            cycles,
            endpoints: SourceEndpoints {
                runways_base_url: env_opt("RUNWAYS_BASE_URL"),
                chart_supplement_url: env_opt("CHART_SUPPLEMENT_URL"),
                fuel_check_url: env_opt("FUEL_CHECK_URL"),
                fuel_download_url: env_opt("FUEL_DOWNLOAD_URL"),
                flights_url: env_opt("FLIGHTS_URL"),
            },
            fixed_aliases: parse_fixed_aliases(&env_or("FIXED_ALIASES", "")),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.http_max_attempts,
            backoff: Duration::from_millis(self.http_retry_backoff_ms),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_hours.max(1) * 3600)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            dir: self.cache_dir.clone(),
            lease_timeout: Duration::from_secs(CACHE_LEASE_TIMEOUT_SECS),
            lease_stale_after: Duration::from_secs(CACHE_LEASE_STALE_SECS),
        }
    }

    pub fn normalize_config(&self) -> NormalizeConfig {
        NormalizeConfig {
            flight_history_days: self.years_included * 365,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            cycles: self.cycles.clone(),
            fixed_aliases: self.fixed_aliases.clone(),
            overrides_path: self.overrides_path.clone(),
            min_lda_ft: self.min_lda_ft,
            recent_landing_days: self.recent_landing_days,
            authority: FieldAuthority::default(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|_| panic!("{} must be a valid {}", key, std::any::type_name::<T>())),
        Err(_) => default,
    }
}

/// Parse `"HOU:KHOU, ELP:KELP"` into alias → canonical pairs.
fn parse_fixed_aliases(raw: &str) -> BTreeMap<String, String> {
    let mut aliases = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let parsed = pair
            .split_once(':')
            .and_then(|(a, c)| Some((normalize_identifier(a)?, normalize_identifier(c)?)));
        match parsed {
            Some((alias, canonical)) => {
                aliases.insert(alias, canonical);
            }
            None => tracing::warn!("Ignoring malformed FIXED_ALIASES entry '{}'", pair),
        }
    }
    aliases
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        // NOTE: set_var/remove_var is unsafe when tests run in parallel. This is
        // the only test in the crate that touches the environment.
        unsafe {
            for key in [
                "PORT",
                "CACHE_DIR",
                "MIN_LDA_FT",
                "YEARS_INCLUDED",
                "FUEL_CYCLE_DAYS",
                "FLIGHTS_URL",
                "FIXED_ALIASES",
            ] {
                std::env::remove_var(key);
            }
        }

        let config = AppConfig::from_env();

        assert_eq!(config.port, 8080);
        assert_eq!(config.cache_dir, PathBuf::from("./cache"));
        assert_eq!(config.min_lda_ft, 7000);
        assert_eq!(config.cycles[&SourceKind::Runways], 56);
        assert_eq!(config.cycles[&SourceKind::Fuel], 28);
        assert_eq!(config.normalize_config().flight_history_days, 4 * 365);
        assert!(config.endpoints.flights_url.is_none());
        assert!(config.fixed_aliases.is_empty());
        assert!(config.user_agent.contains("PlanAid"));
    }

    #[test]
    fn test_parse_fixed_aliases() {
        let aliases = parse_fixed_aliases(" hou:KHOU , ELP:kelp,broken,:KXXX");
        assert_eq!(aliases.len(), 2);
        assert_eq!(aliases["HOU"], "KHOU");
        assert_eq!(aliases["ELP"], "KELP");
    }
}
