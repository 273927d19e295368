use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;

use crate::services::http_cache::DiskCache;

const NAIP_BASE_URL: &str =
    "https://imagery.nationalmap.gov/arcgis/rest/services/USGSNAIPPlus/ImageServer";
const CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const MAX_ATTEMPTS: usize = 3;
const RETRY_DELAY_MS: u64 = 1_000;

/// Vegetation density buckets used for the persisted `ndvi_category` column.
pub fn categorize_ndvi(ndvi: Option<f64>) -> &'static str {
    match ndvi {
        None => "no_data",
        Some(v) if v < 0.10 => "bare",
        Some(v) if v < 0.30 => "minimal",
        Some(v) if v < 0.50 => "sparse",
        Some(v) if v < 0.65 => "moderate",
        Some(_) => "dense",
    }
}

#[derive(Debug, Clone)]
pub struct BandValues {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
    pub nir: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PointNdvi {
    pub ndvi: Option<f64>,
    pub bands: Option<BandValues>,
    pub acquisition_date: Option<String>,
    pub error: Option<String>,
}

/// Client for the free aerial imagery ArcGIS ImageServer.
///
/// One shared reqwest::Client across all workers; GETs only. Identify
/// responses are cached on disk for 7 days keyed on the request parameters.
pub struct NaipClient {
    http: Client,
    base_url: String,
    cache: DiskCache,
}

impl NaipClient {
    pub fn new(http: Client, cache_dir: PathBuf) -> Self {
        Self {
            http,
            base_url: NAIP_BASE_URL.to_string(),
            cache: DiskCache::new(cache_dir.join("naip"), CACHE_TTL),
        }
    }

    async fn get_json(&self, url: &str, params: &[(&str, String)]) -> Result<JsonValue> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let resp = self.http.get(url).query(params).send().await;
            match resp {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json::<JsonValue>()
                            .await
                            .context("failed to decode imagery response");
                    }
                    if attempt >= MAX_ATTEMPTS
                        || !(status.as_u16() == 429 || status.is_server_error())
                    {
                        anyhow::bail!("imagery service returned {status}");
                    }
                }
                Err(err) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(err).context("imagery request failed");
                    }
                }
            }
            sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64)).await;
        }
    }

    /// Pixel values and catalog metadata at a point, optionally restricted by
    /// a mosaic rule (used for year-specific reads).
    pub async fn identify(
        &self,
        lat: f64,
        lng: f64,
        mosaic_rule: Option<&JsonValue>,
    ) -> Result<JsonValue> {
        let cache_key = DiskCache::key(
            "identify",
            &json!({
                "lat": lat,
                "lng": lng,
                "mosaic": mosaic_rule.map(|r| r.to_string()).unwrap_or_else(|| "default".into()),
            }),
        );
        if let Some(cached) = self.cache.get::<JsonValue>(&cache_key) {
            tracing::debug!(lat, lng, "identify cache hit");
            return Ok(cached);
        }

        let geometry = json!({"x": lng, "y": lat, "spatialReference": {"wkid": 4326}});
        let mut params = vec![
            ("geometry", geometry.to_string()),
            ("geometryType", "esriGeometryPoint".to_string()),
            ("returnCatalogItems", "true".to_string()),
            ("returnGeometry", "false".to_string()),
            ("f", "json".to_string()),
        ];
        if let Some(rule) = mosaic_rule {
            params.push(("mosaicRule", rule.to_string()));
        }

        let url = format!("{}/identify", self.base_url);
        let data = self.get_json(&url, &params).await?;
        self.cache.put(&cache_key, &data);
        Ok(data)
    }

    /// Current NDVI at a point from the latest vintage. Single API call, no
    /// history, no image export. The bulk Pass 1 path.
    pub async fn ndvi_fast(&self, lat: f64, lng: f64) -> PointNdvi {
        match self.identify(lat, lng, None).await {
            Ok(data) => {
                let mut parsed = parse_bands_and_ndvi(data.get("value").and_then(JsonValue::as_str));
                parsed.acquisition_date = extract_acquisition_date(data.get("catalogItems"));
                parsed
            }
            Err(err) => PointNdvi {
                error: Some(format!("identify_failed: {err:#}")),
                ..Default::default()
            },
        }
    }

    /// NDVI at a point for one specific vintage year.
    pub async fn ndvi_for_year(&self, lat: f64, lng: f64, year: i32) -> PointNdvi {
        let rule = json!({
            "mosaicMethod": "esriMosaicAttribute",
            "sortField": "Year",
            "sortValue": year.to_string(),
            "ascending": true,
            "where": format!("Year = {year} AND Category = 1"),
        });
        match self.identify(lat, lng, Some(&rule)).await {
            Ok(data) => {
                let mut parsed = parse_bands_and_ndvi(data.get("value").and_then(JsonValue::as_str));
                parsed.acquisition_date = extract_acquisition_date(data.get("catalogItems"))
                    .or_else(|| Some(format!("{year}-01-01")));
                parsed
            }
            Err(err) => PointNdvi {
                acquisition_date: Some(format!("{year}-01-01")),
                error: Some(format!("query_failed: {err:#}")),
                ..Default::default()
            },
        }
    }

    /// Export a PNG for a bounding box (on-demand baseline endpoint only).
    pub async fn export_image(
        &self,
        bbox: (f64, f64, f64, f64),
        width: u32,
        height: u32,
        rendering_rule: Option<&str>,
    ) -> Result<Vec<u8>> {
        let (min_lng, min_lat, max_lng, max_lat) = bbox;
        let mut params = vec![
            ("bbox", format!("{min_lng},{min_lat},{max_lng},{max_lat}")),
            ("bboxSR", "4326".to_string()),
            ("imageSR", "4326".to_string()),
            ("size", format!("{width},{height}")),
            ("format", "png".to_string()),
            ("f", "image".to_string()),
        ];
        if let Some(rule) = rendering_rule {
            params.push(("renderingRule", json!({"rasterFunction": rule}).to_string()));
        }

        let url = format!("{}/exportImage", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await
            .context("image export request failed")?
            .error_for_status()
            .context("image export returned error status")?;

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.contains("image") {
            anyhow::bail!("image export returned non-image content type {content_type}");
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Bounding box around a point. buffer_meters=50 gives roughly one parcel.
pub fn make_bbox(lat: f64, lng: f64, buffer_meters: f64) -> (f64, f64, f64, f64) {
    let lat_offset = buffer_meters / 111_000.0;
    let lng_offset = buffer_meters / (111_000.0 * lat.to_radians().cos());
    (
        lng - lng_offset,
        lat - lat_offset,
        lng + lng_offset,
        lat + lat_offset,
    )
}

/// Bands arrive as a comma or space separated string, ordered
/// Red, Green, Blue, NIR. NDVI = (NIR - Red) / (NIR + Red).
pub fn parse_bands_and_ndvi(value: Option<&str>) -> PointNdvi {
    let Some(raw) = value else {
        return PointNdvi {
            error: Some("no_imagery_at_location".to_string()),
            ..Default::default()
        };
    };
    if raw.is_empty() || raw == "NoData" || raw == "Pixel value is NoData" {
        return PointNdvi {
            error: Some("no_imagery_at_location".to_string()),
            ..Default::default()
        };
    }

    let values: Vec<f64> = raw
        .replace(',', " ")
        .split_whitespace()
        .filter_map(|part| part.parse::<f64>().ok())
        .collect();

    match values.len() {
        n if n >= 4 => {
            let bands = BandValues {
                red: values[0],
                green: values[1],
                blue: values[2],
                nir: values[3],
            };
            let denominator = bands.nir + bands.red;
            let ndvi = if denominator == 0.0 {
                0.0
            } else {
                (bands.nir - bands.red) / denominator
            };
            PointNdvi {
                ndvi: Some(ndvi),
                bands: Some(bands),
                acquisition_date: None,
                error: None,
            }
        }
        3 => PointNdvi {
            error: Some("no_nir_band".to_string()),
            ..Default::default()
        },
        n => PointNdvi {
            error: Some(format!("unexpected_band_count: {n}")),
            ..Default::default()
        },
    }
}

/// Acquisition date from identify catalog items. Only primary-resolution
/// records (Category = 1) carry a usable date; the field is lowercase
/// `acquisition_date` holding epoch milliseconds. Falls back to the `Year`
/// attribute on any record.
pub fn extract_acquisition_date(catalog: Option<&JsonValue>) -> Option<String> {
    let features = catalog?.get("features")?.as_array()?;

    for feat in features {
        let Some(attrs) = feat.get("attributes") else {
            continue;
        };
        if attrs.get("Category").and_then(JsonValue::as_i64) != Some(1) {
            continue;
        }
        if let Some(epoch_ms) = attrs.get("acquisition_date").and_then(JsonValue::as_f64) {
            if epoch_ms > 1e10 {
                let ts = DateTime::<Utc>::from_timestamp_millis(epoch_ms as i64)?;
                return Some(ts.format("%Y-%m-%d").to_string());
            }
        }
    }

    for feat in features {
        if let Some(year) = feat
            .get("attributes")
            .and_then(|attrs| attrs.get("Year"))
            .and_then(JsonValue::as_i64)
        {
            return Some(format!("{year}-01-01"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndvi_from_four_bands() {
        let parsed = parse_bands_and_ndvi(Some("100, 120, 90, 180"));
        let ndvi = parsed.ndvi.unwrap();
        assert!((ndvi - (180.0 - 100.0) / (180.0 + 100.0)).abs() < 1e-9);
        assert!(parsed.error.is_none());
    }

    #[test]
    fn nodata_pixel_is_an_error_not_a_zero() {
        let parsed = parse_bands_and_ndvi(Some("NoData"));
        assert!(parsed.ndvi.is_none());
        assert_eq!(parsed.error.as_deref(), Some("no_imagery_at_location"));
    }

    #[test]
    fn three_band_tile_reports_missing_nir() {
        let parsed = parse_bands_and_ndvi(Some("100 120 90"));
        assert_eq!(parsed.error.as_deref(), Some("no_nir_band"));
    }

    #[test]
    fn zero_denominator_yields_zero_ndvi() {
        let parsed = parse_bands_and_ndvi(Some("0, 0, 0, 0"));
        assert_eq!(parsed.ndvi, Some(0.0));
    }

    #[test]
    fn category_thresholds() {
        assert_eq!(categorize_ndvi(None), "no_data");
        assert_eq!(categorize_ndvi(Some(0.05)), "bare");
        assert_eq!(categorize_ndvi(Some(0.10)), "minimal");
        assert_eq!(categorize_ndvi(Some(0.49)), "sparse");
        assert_eq!(categorize_ndvi(Some(0.64)), "moderate");
        assert_eq!(categorize_ndvi(Some(0.65)), "dense");
    }

    #[test]
    fn acquisition_date_only_from_primary_category() {
        let catalog = json!({
            "features": [
                {"attributes": {"Category": 2, "acquisition_date": 1_655_000_000_000.0}},
                {"attributes": {"Category": 1, "acquisition_date": 1_655_078_400_000.0}},
            ]
        });
        let date = extract_acquisition_date(Some(&catalog)).unwrap();
        // the Category-1 record's date, not the Category-2 one
        assert_eq!(date, "2022-06-13");
    }

    #[test]
    fn acquisition_date_falls_back_to_year() {
        let catalog = json!({
            "features": [{"attributes": {"Category": 2, "Year": 2020}}]
        });
        assert_eq!(
            extract_acquisition_date(Some(&catalog)).as_deref(),
            Some("2020-01-01")
        );
    }

    #[test]
    fn bbox_is_centered_on_the_point() {
        let (min_lng, min_lat, max_lng, max_lat) = make_bbox(35.25, -81.15, 50.0);
        assert!(min_lat < 35.25 && 35.25 < max_lat);
        assert!(min_lng < -81.15 && -81.15 < max_lng);
        assert!((max_lat - min_lat) > 0.0 && (max_lat - min_lat) < 0.01);
    }
}
