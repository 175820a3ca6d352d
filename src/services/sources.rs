//! HTTP clients for the four automated sources.
//!
//! Each fetch returns a [`RawPayload`] for the normalizer, or
//! `AppError::SourceUnavailable` once retries are exhausted. Transport errors
//! and 429/5xx responses are retried with linear backoff; any other non-2xx
//! status fails immediately.

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;

use crate::errors::AppError;
use crate::models::SourceKind;
use crate::services::normalize::RawPayload;

/// NASR CSV document names under the runway base URL.
const NASR_BASE_CSV: &str = "APT_BASE.csv";
const NASR_RWY_CSV: &str = "APT_RWY.csv";
const NASR_RWY_END_CSV: &str = "APT_RWY_END.csv";

/// Anything that can produce a raw payload for a source.
///
/// [`SourceClient`] is the production implementation; tests substitute stubs.
pub trait SourceFetcher: Send + Sync {
    fn fetch(&self, source: SourceKind) -> impl Future<Output = Result<RawPayload, AppError>> + Send;
}

/// Where each source lives. `None` means the source is not configured and
/// always reports unavailable (so the cache is the only way to get it).
#[derive(Debug, Clone, Default)]
pub struct SourceEndpoints {
    /// Directory URL holding the NASR APT_*.csv documents.
    pub runways_base_url: Option<String>,
    /// JSON array of extracted chart supplement page texts.
    pub chart_supplement_url: Option<String>,
    /// DLA page that must be visited first to establish a session.
    pub fuel_check_url: Option<String>,
    pub fuel_download_url: Option<String>,
    pub flights_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct SourceClient {
    client: reqwest::Client,
    endpoints: SourceEndpoints,
    retry: RetryPolicy,
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || matches!(status.as_u16(), 500 | 502 | 503 | 504)
}

impl SourceClient {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        endpoints: SourceEndpoints,
        retry: RetryPolicy,
    ) -> Result<Self, AppError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent)
                .map_err(|e| AppError::InternalError(format!("Invalid User-Agent: {}", e)))?,
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::InternalError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoints,
            retry,
        })
    }

    fn endpoint<'a>(&self, source: SourceKind, url: &'a Option<String>) -> Result<&'a str, AppError> {
        url.as_deref()
            .ok_or_else(|| AppError::source_unavailable(source, "no URL configured"))
    }

    /// GET with retry. Returns the successful response.
    async fn get(&self, source: SourceKind, url: &str) -> Result<reqwest::Response, AppError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retry.backoff * (attempt - 1)).await;
            }
            match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if is_retryable(response.status()) => {
                    last_error = format!("HTTP {}", response.status());
                }
                Ok(response) => {
                    return Err(AppError::source_unavailable(
                        source,
                        format!("{} returned HTTP {}", url, response.status()),
                    ));
                }
                Err(e) => {
                    last_error = format!("request failed: {}", e);
                }
            }
            tracing::warn!(
                "[{}] GET {} attempt {}/{} failed: {}",
                source,
                url,
                attempt,
                attempts,
                last_error
            );
        }

        Err(AppError::source_unavailable(
            source,
            format!("{} after {} attempts: {}", url, attempts, last_error),
        ))
    }

    async fn get_text(&self, source: SourceKind, url: &str) -> Result<String, AppError> {
        self.get(source, url)
            .await?
            .text()
            .await
            .map_err(|e| AppError::source_unavailable(source, format!("reading body: {}", e)))
    }

    async fn get_json(&self, source: SourceKind, url: &str) -> Result<serde_json::Value, AppError> {
        self.get(source, url)
            .await?
            .json()
            .await
            .map_err(|e| AppError::source_unavailable(source, format!("JSON parse error: {}", e)))
    }

    pub async fn fetch_runways(&self) -> Result<RawPayload, AppError> {
        let source = SourceKind::Runways;
        let base = self.endpoint(source, &self.endpoints.runways_base_url)?.trim_end_matches('/');
        let (apt, rwy, rwy_end) = futures::future::try_join3(
            self.get_text(source, &format!("{}/{}", base, NASR_BASE_CSV)),
            self.get_text(source, &format!("{}/{}", base, NASR_RWY_CSV)),
            self.get_text(source, &format!("{}/{}", base, NASR_RWY_END_CSV)),
        )
        .await?;
        Ok(RawPayload::Runways {
            base: apt,
            runways: rwy,
            runway_ends: rwy_end,
        })
    }

    pub async fn fetch_chart_supplement(&self) -> Result<RawPayload, AppError> {
        let source = SourceKind::ChartSupplement;
        let url = self.endpoint(source, &self.endpoints.chart_supplement_url)?;
        let pages: Vec<String> = serde_json::from_value(self.get_json(source, url).await?)
            .map_err(|e| AppError::source_unavailable(source, format!("expected an array of page texts: {}", e)))?;
        Ok(RawPayload::ChartSupplement { pages })
    }

    pub async fn fetch_fuel(&self) -> Result<RawPayload, AppError> {
        let source = SourceKind::Fuel;
        if let Some(check) = &self.endpoints.fuel_check_url {
            // Session warm-up; the download still decides success.
            if let Err(e) = self.get(source, check).await {
                tracing::debug!("[{}] check page failed: {}", source, e);
            }
        }
        let url = self.endpoint(source, &self.endpoints.fuel_download_url)?;
        let csv = self.get_text(source, url).await?;
        Ok(RawPayload::Fuel { csv })
    }

    pub async fn fetch_flights(&self) -> Result<RawPayload, AppError> {
        let source = SourceKind::Flights;
        let url = self.endpoint(source, &self.endpoints.flights_url)?;
        let json = self.get_json(source, url).await?;
        Ok(RawPayload::Flights { json })
    }
}

impl SourceFetcher for SourceClient {
    async fn fetch(&self, source: SourceKind) -> Result<RawPayload, AppError> {
        match source {
            SourceKind::Runways => self.fetch_runways().await,
            SourceKind::ChartSupplement => self.fetch_chart_supplement().await,
            SourceKind::Fuel => self.fetch_fuel().await,
            SourceKind::Flights => self.fetch_flights().await,
        }
    }
}
