use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use crate::services::http_cache::DiskCache;
use crate::services::naip::NaipClient;

const STAC_SEARCH_URL: &str = "https://planetarycomputer.microsoft.com/api/stac/v1/search";
const CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One historical vintage discovered at a point.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StacVintage {
    pub year: i32,
    pub date: String,
}

/// Historical aerial vintages via the STAC archive.
///
/// The archive is used for vintage discovery only; the per-year NDVI read goes
/// through the imagery server's year-filtered mosaic, which serves the same
/// rasters without needing a COG reader in-process.
pub struct StacHistoryClient {
    http: Client,
    cache: DiskCache,
}

impl StacHistoryClient {
    pub fn new(http: Client, cache_dir: PathBuf) -> Self {
        Self {
            http,
            cache: DiskCache::new(cache_dir.join("naip_stac"), CACHE_TTL),
        }
    }

    /// Vintage years with coverage at a point, ascending. Points sitting on a
    /// tile boundary return two archive items per year; a `seen_years` set
    /// keeps the first (most recent) item only.
    pub async fn search_vintages(&self, lat: f64, lng: f64) -> Result<Vec<StacVintage>> {
        let cache_key = DiskCache::key("stac_search", &json!({"lat": lat, "lng": lng}));
        if let Some(cached) = self.cache.get::<Vec<StacVintage>>(&cache_key) {
            return Ok(cached);
        }

        let payload = json!({
            "collections": ["naip"],
            "intersects": {"type": "Point", "coordinates": [lng, lat]},
            "limit": 20,
            "sortby": [{"field": "datetime", "direction": "desc"}],
        });

        let body: JsonValue = self
            .http
            .post(STAC_SEARCH_URL)
            .json(&payload)
            .send()
            .await
            .context("STAC search request failed")?
            .error_for_status()
            .context("STAC search returned error status")?
            .json()
            .await
            .context("failed to decode STAC search response")?;

        let vintages = parse_vintages(&body);
        self.cache.put(&cache_key, &vintages);
        tracing::debug!(
            lat,
            lng,
            vintages = vintages.len(),
            "STAC vintage search complete"
        );
        Ok(vintages)
    }

    /// Lazy pull-based sequence of `(year, NDVI)` pairs for a point, ascending
    /// by year, finite, restartable.
    pub async fn historical_ndvi<'a>(
        &self,
        naip: &'a NaipClient,
        lat: f64,
        lng: f64,
    ) -> Result<HistoricalNdvi<'a>> {
        let vintages = self.search_vintages(lat, lng).await?;
        Ok(HistoricalNdvi::new(naip, lat, lng, vintages))
    }
}

/// The vintage year attribute arrives as a string or a number depending on
/// catalog era; both normalize to i32.
fn parse_year(props: &JsonValue) -> Option<i32> {
    let raw = props.get("naip:year")?;
    if let Some(n) = raw.as_i64() {
        return i32::try_from(n).ok();
    }
    raw.as_str()?.trim().parse::<i32>().ok()
}

fn parse_vintages(body: &JsonValue) -> Vec<StacVintage> {
    let mut seen_years: HashSet<i32> = HashSet::new();
    let mut vintages = Vec::new();

    let features = body
        .get("features")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for feat in features {
        let Some(props) = feat.get("properties") else {
            continue;
        };
        let Some(year) = parse_year(props) else {
            continue;
        };
        if !seen_years.insert(year) {
            continue;
        }
        let date = props
            .get("datetime")
            .and_then(JsonValue::as_str)
            .map(|dt| dt.chars().take(10).collect())
            .unwrap_or_else(|| format!("{year}-01-01"));
        vintages.push(StacVintage { year, date });
    }

    vintages.sort_by_key(|v| v.year);
    vintages
}

/// Pull-based iterator over historical `(year, NDVI)` pairs at one point.
/// Each `next()` performs at most one upstream read; vintages whose pixel
/// read fails are skipped, keeping the sequence finite.
pub struct HistoricalNdvi<'a> {
    naip: &'a NaipClient,
    lat: f64,
    lng: f64,
    pending: VecDeque<StacVintage>,
    yielded_years: HashSet<i32>,
}

impl<'a> HistoricalNdvi<'a> {
    pub fn new(naip: &'a NaipClient, lat: f64, lng: f64, vintages: Vec<StacVintage>) -> Self {
        Self {
            naip,
            lat,
            lng,
            pending: vintages.into(),
            yielded_years: HashSet::new(),
        }
    }

    pub async fn next(&mut self) -> Option<(i32, f64)> {
        while let Some(vintage) = self.pending.pop_front() {
            if !self.yielded_years.insert(vintage.year) {
                continue;
            }
            let pixel = self.naip.ndvi_for_year(self.lat, self.lng, vintage.year).await;
            match pixel.ndvi {
                Some(ndvi) => return Some((vintage.year, ndvi)),
                None => {
                    tracing::debug!(
                        year = vintage.year,
                        error = pixel.error.as_deref().unwrap_or("unknown"),
                        "historical vintage had no readable pixel"
                    );
                }
            }
        }
        None
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_boundary_duplicates_collapse_to_one_item_per_year() {
        let body = json!({
            "features": [
                {"properties": {"naip:year": 2022, "datetime": "2022-06-10T00:00:00Z"}},
                {"properties": {"naip:year": 2022, "datetime": "2022-06-09T00:00:00Z"}},
                {"properties": {"naip:year": "2020", "datetime": "2020-07-01T00:00:00Z"}},
            ]
        });
        let vintages = parse_vintages(&body);
        assert_eq!(vintages.len(), 2);
        assert_eq!(vintages[0].year, 2020);
        assert_eq!(vintages[1].year, 2022);
        // first (most recent) item per year wins
        assert_eq!(vintages[1].date, "2022-06-10");
    }

    #[test]
    fn string_years_normalize_to_integers() {
        let body = json!({
            "features": [
                {"properties": {"naip:year": "2018", "datetime": "2018-05-01T00:00:00Z"}},
            ]
        });
        let vintages = parse_vintages(&body);
        assert_eq!(vintages[0].year, 2018);
    }

    #[test]
    fn missing_or_malformed_years_are_skipped() {
        let body = json!({
            "features": [
                {"properties": {"datetime": "2018-05-01T00:00:00Z"}},
                {"properties": {"naip:year": "20x8"}},
            ]
        });
        assert!(parse_vintages(&body).is_empty());
    }
}
