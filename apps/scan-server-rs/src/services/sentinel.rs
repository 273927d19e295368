use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value as JsonValue};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::services::naip::make_bbox;
use crate::services::trends::MonthlyNdvi;

const TOKEN_URL: &str =
    "https://identity.dataspace.copernicus.eu/auth/realms/CDSE/protocol/openid-connect/token";
const STATS_URL: &str = "https://sh.dataspace.copernicus.eu/api/v1/statistics";

// The statistical backend returns all-zero aggregates when asked by
// resolution; it must be asked for an explicit pixel grid.
const STATS_GRID: (u32, u32) = (50, 50);

// The data-mask band must be declared on both input and output or cloudy
// pixels silently count as NDVI zero.
const NDVI_EVALSCRIPT: &str = r#"//VERSION=3
function setup() {
  return {
    input: [{bands: ["B04", "B08", "dataMask"]}],
    output: [
      {id: "ndvi", bands: 1, sampleType: "FLOAT32"},
      {id: "dataMask", bands: 1}
    ]
  };
}
function evaluatePixel(sample) {
  if (sample.dataMask === 0) {
    return { ndvi: [0], dataMask: [0] };
  }
  let ndvi = (sample.B08 - sample.B04) / (sample.B08 + sample.B04);
  return { ndvi: [ndvi], dataMask: [1] };
}
"#;

/// Sliding-window request limiter. Shared across all pass workers; acquire()
/// sleeps until a slot inside the window frees up.
pub struct MinuteLimiter {
    window: Duration,
    limit: usize,
    stamps: Mutex<VecDeque<Instant>>,
}

impl MinuteLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            window: Duration::from_secs(60),
            limit: limit.max(1) as usize,
            stamps: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut stamps = self.stamps.lock().await;
                let now = Instant::now();
                while let Some(front) = stamps.front() {
                    if now.duration_since(*front) >= self.window {
                        stamps.pop_front();
                    } else {
                        break;
                    }
                }
                if stamps.len() < self.limit {
                    stamps.push_back(now);
                    None
                } else {
                    stamps
                        .front()
                        .map(|front| self.window.saturating_sub(now.duration_since(*front)))
                }
            };
            match wait {
                None => return,
                Some(delay) => sleep(delay.max(Duration::from_millis(50))).await,
            }
        }
    }

    #[cfg(test)]
    pub async fn in_window(&self) -> usize {
        self.stamps.lock().await.len()
    }
}

struct TokenState {
    access_token: String,
    expires_at: Instant,
}

/// Quota-bounded satellite NDVI statistics client (OAuth client-credentials).
pub struct SentinelClient {
    http: Client,
    client_id: String,
    client_secret: String,
    limiter: MinuteLimiter,
    monthly_budget: u32,
    requests_this_month: AtomicU32,
    token: Mutex<Option<TokenState>>,
}

impl SentinelClient {
    pub fn new(
        http: Client,
        client_id: String,
        client_secret: String,
        requests_per_minute: u32,
        monthly_budget: u32,
    ) -> Self {
        Self {
            http,
            client_id,
            client_secret,
            limiter: MinuteLimiter::new(requests_per_minute),
            monthly_budget,
            requests_this_month: AtomicU32::new(0),
            token: Mutex::new(None),
        }
    }

    async fn fetch_token(&self) -> Result<String> {
        let resp: JsonValue = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .context("satellite token request failed")?
            .error_for_status()
            .context("satellite token endpoint rejected credentials")?
            .json()
            .await
            .context("failed to decode satellite token response")?;

        let access_token = resp
            .get("access_token")
            .and_then(JsonValue::as_str)
            .context("satellite token response missing access_token")?
            .to_string();
        let expires_in = resp
            .get("expires_in")
            .and_then(JsonValue::as_u64)
            .unwrap_or(600);

        let mut guard = self.token.lock().await;
        *guard = Some(TokenState {
            access_token: access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in.saturating_sub(60)),
        });
        Ok(access_token)
    }

    async fn current_token(&self) -> Result<String> {
        {
            let guard = self.token.lock().await;
            if let Some(state) = guard.as_ref() {
                if Instant::now() < state.expires_at {
                    return Ok(state.access_token.clone());
                }
            }
        }
        self.fetch_token().await
    }

    fn consume_budget(&self) -> Result<()> {
        let used = self.requests_this_month.fetch_add(1, Ordering::Relaxed);
        if used >= self.monthly_budget {
            anyhow::bail!(
                "satellite monthly request budget exhausted ({} used)",
                self.monthly_budget
            );
        }
        Ok(())
    }

    /// Monthly mean NDVI for a point over a lookback window. One statistical
    /// request per call; rate-limit retries are handled internally and never
    /// surface as per-parcel failures.
    pub async fn monthly_ndvi(&self, lat: f64, lng: f64, months: u32) -> Result<Vec<MonthlyNdvi>> {
        let bbox = make_bbox(lat, lng, 50.0);
        let end = Utc::now().date_naive();
        let start = end - ChronoDuration::days(i64::from(months) * 30);

        let body = json!({
            "input": {
                "bounds": {
                    "bbox": [bbox.0, bbox.1, bbox.2, bbox.3],
                    "properties": {"crs": "http://www.opengis.net/def/crs/EPSG/0/4326"}
                },
                "data": [{
                    "type": "sentinel-2-l2a",
                    "dataFilter": {"maxCloudCoverage": 50}
                }]
            },
            "aggregation": {
                "timeRange": {
                    "from": format!("{start}T00:00:00Z"),
                    "to": format!("{end}T23:59:59Z")
                },
                "aggregationInterval": {"of": "P1M"},
                "width": STATS_GRID.0,
                "height": STATS_GRID.1,
                "evalscript": NDVI_EVALSCRIPT
            }
        });

        let mut auth_retried = false;
        let mut backoff = Duration::from_secs(5);
        loop {
            self.limiter.acquire().await;
            self.consume_budget()?;
            let token = self.current_token().await?;

            let resp = self
                .http
                .post(STATS_URL)
                .bearer_auth(&token)
                .json(&body)
                .send()
                .await
                .context("satellite statistics request failed")?;

            match resp.status() {
                status if status.is_success() => {
                    let payload: JsonValue = resp
                        .json()
                        .await
                        .context("failed to decode satellite statistics response")?;
                    return Ok(parse_monthly_stats(&payload));
                }
                StatusCode::UNAUTHORIZED => {
                    // Refresh once; a second 401 is operator-actionable.
                    if auth_retried {
                        anyhow::bail!("satellite credentials rejected after token refresh");
                    }
                    auth_retried = true;
                    self.token.lock().await.take();
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    let wait = retry_after.unwrap_or(backoff).max(backoff);
                    tracing::warn!(wait_secs = wait.as_secs(), "satellite rate limited");
                    sleep(wait).await;
                    backoff = (backoff * 2).min(Duration::from_secs(120));
                }
                status => {
                    anyhow::bail!("satellite statistics endpoint returned {status}");
                }
            }
        }
    }
}

/// Statistical responses nest the NDVI mean under
/// `data[].outputs.ndvi.bands.B0.stats.mean`. Months whose aggregate carried
/// no valid pixels are dropped rather than reported as zero.
pub fn parse_monthly_stats(payload: &JsonValue) -> Vec<MonthlyNdvi> {
    let mut out = Vec::new();
    let intervals = payload
        .get("data")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for interval in intervals {
        let month = interval
            .get("interval")
            .and_then(|i| i.get("from"))
            .and_then(JsonValue::as_str)
            .map(|from| from.chars().take(7).collect::<String>())
            .unwrap_or_default();
        let stats = interval
            .pointer("/outputs/ndvi/bands/B0/stats");
        let sample_count = stats
            .and_then(|s| s.get("sampleCount"))
            .and_then(JsonValue::as_i64);
        let no_data = stats
            .and_then(|s| s.get("noDataCount"))
            .and_then(JsonValue::as_i64)
            .unwrap_or(0);
        let valid_pixels = sample_count.map(|c| c - no_data);
        if valid_pixels == Some(0) {
            continue;
        }
        let mean = stats
            .and_then(|s| s.get("mean"))
            .and_then(JsonValue::as_f64)
            .filter(|m| m.is_finite());
        if month.is_empty() || mean.is_none() {
            continue;
        }
        out.push(MonthlyNdvi {
            month,
            mean_ndvi: mean,
            valid_pixels,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_monthly_means_and_drops_empty_aggregates() {
        let payload = json!({
            "data": [
                {
                    "interval": {"from": "2025-01-01T00:00:00Z"},
                    "outputs": {"ndvi": {"bands": {"B0": {"stats": {
                        "mean": 0.41, "sampleCount": 2500, "noDataCount": 100
                    }}}}}
                },
                {
                    "interval": {"from": "2025-02-01T00:00:00Z"},
                    "outputs": {"ndvi": {"bands": {"B0": {"stats": {
                        "mean": 0.0, "sampleCount": 2500, "noDataCount": 2500
                    }}}}}
                }
            ]
        });
        let months = parse_monthly_stats(&payload);
        assert_eq!(months.len(), 1);
        assert_eq!(months[0].month, "2025-01");
        assert_eq!(months[0].mean_ndvi, Some(0.41));
        assert_eq!(months[0].valid_pixels, Some(2400));
    }

    #[test]
    fn evalscript_declares_data_mask_on_both_sides() {
        assert!(NDVI_EVALSCRIPT.contains(r#"input: [{bands: ["B04", "B08", "dataMask"]}]"#));
        assert!(NDVI_EVALSCRIPT.contains(r#"{id: "dataMask", bands: 1}"#));
    }

    #[tokio::test]
    async fn limiter_admits_up_to_the_window_limit() {
        let limiter = MinuteLimiter::new(5);
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.in_window().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_delays_the_over_limit_request() {
        let limiter = MinuteLimiter::new(2);
        limiter.acquire().await;
        limiter.acquire().await;

        let start = tokio::time::Instant::now();
        limiter.acquire().await;
        // The third acquire had to wait out the window.
        assert!(start.elapsed() >= Duration::from_secs(59));
    }
}
