//! Price feed adapter
//!
//! Fetches hourly prices from a configured HTTP endpoint returning a JSON
//! array of `{starts_at, total}` points. Responses are cached; the engine
//! never blocks its tick on a fresh fetch more than once per cache window.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::config::PricingConfig;
use crate::error::{DriverError, Result};
use crate::pricing::PricePoint;

/// HTTP client with a time-bounded cache
pub struct PriceFeed {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    cache_ttl: Duration,
    cache: Option<(Instant, Vec<PricePoint>)>,
}

impl PriceFeed {
    pub fn new(config: &PricingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DriverError::PriceFeed(format!("client build failed: {e}")))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            token: (!config.token.is_empty()).then(|| config.token.clone()),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            cache: None,
        })
    }

    /// Current price list, served from cache while it is fresh.
    ///
    /// A failed refresh falls back to stale cached data when available, so a
    /// flaky feed degrades the strategy instead of the whole tick.
    pub async fn prices(&mut self) -> Result<Vec<PricePoint>> {
        if let Some((fetched_at, points)) = &self.cache {
            if fetched_at.elapsed() < self.cache_ttl {
                return Ok(points.clone());
            }
        }

        match self.fetch().await {
            Ok(points) => {
                debug!("Price feed refreshed: {} points", points.len());
                self.cache = Some((Instant::now(), points.clone()));
                Ok(points)
            },
            Err(e) => {
                if let Some((_, points)) = &self.cache {
                    warn!("Price feed refresh failed, serving stale data: {e}");
                    Ok(points.clone())
                } else {
                    Err(e)
                }
            },
        }
    }

    /// One fetch with up to two retries and jittered backoff
    async fn fetch(&self) -> Result<Vec<PricePoint>> {
        let mut last_error = None;

        for attempt in 1..=3u32 {
            if attempt > 1 {
                let base_ms = 500u64 * u64::from(attempt);
                let jitter = rand::thread_rng().gen_range(0..250);
                tokio::time::sleep(Duration::from_millis(base_ms + jitter)).await;
            }

            match self.fetch_once().await {
                Ok(points) => return Ok(points),
                Err(e) => {
                    warn!("Price feed attempt {attempt}/3 failed: {e}");
                    last_error = Some(e);
                },
            }
        }

        Err(last_error
            .unwrap_or_else(|| DriverError::PriceFeed("no attempts made".into())))
    }

    async fn fetch_once(&self) -> Result<Vec<PricePoint>> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DriverError::PriceFeed(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(DriverError::PriceFeed(format!(
                "feed returned HTTP {}",
                response.status()
            )));
        }

        let mut points: Vec<PricePoint> = response
            .json()
            .await
            .map_err(|e| DriverError::PriceFeed(format!("invalid feed payload: {e}")))?;
        points.sort_by_key(|p| p.starts_at);
        Ok(points)
    }
}
