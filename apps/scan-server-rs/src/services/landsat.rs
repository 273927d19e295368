use anyhow::{Context, Result};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use reqwest::Client;
use serde_json::{json, Value as JsonValue};

use crate::services::trends::MonthlyNdvi;

const SERVICE_URL: &str =
    "https://landsat2.arcgis.com/arcgis/rest/services/Landsat/MS/ImageServer";

/// Free satellite NDVI fallback. Same identify REST shape as the aerial
/// imagery service, different endpoint and band layout (Red = band 4,
/// NIR = band 5, zero-indexed 3 and 4). Used when the primary satellite
/// statistics client returns no monthly data for a point.
pub struct LandsatClient {
    http: Client,
}

impl LandsatClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    async fn identify(&self, lat: f64, lng: f64, time_filter: Option<&str>) -> Result<JsonValue> {
        let geometry = json!({"x": lng, "y": lat, "spatialReference": {"wkid": 4326}});
        // Mosaic rule selects the most recent acquisition inside the window.
        let mosaic_rule = json!({
            "mosaicMethod": "esriMosaicAttribute",
            "sortField": "AcquisitionDate",
            "sortValue": "2099-01-01",
            "ascending": false,
        });
        let mut params = vec![
            ("geometry", geometry.to_string()),
            ("geometryType", "esriGeometryPoint".to_string()),
            ("returnGeometry", "false".to_string()),
            ("returnCatalogItems", "false".to_string()),
            ("mosaicRule", mosaic_rule.to_string()),
            ("f", "json".to_string()),
        ];
        if let Some(window) = time_filter {
            params.push(("time", window.to_string()));
        }

        self.http
            .get(format!("{SERVICE_URL}/identify"))
            .query(&params)
            .send()
            .await
            .context("landsat identify request failed")?
            .error_for_status()
            .context("landsat identify returned error status")?
            .json()
            .await
            .context("failed to decode landsat identify response")
    }

    /// Monthly NDVI over the lookback window, one identify call per month,
    /// chronologically ascending. Months without a clear pixel are omitted.
    pub async fn monthly_ndvi(&self, lat: f64, lng: f64, months: u32) -> Result<Vec<MonthlyNdvi>> {
        let mut out = Vec::new();
        let today = Utc::now().date_naive();

        for i in 0..months {
            let target = today - ChronoDuration::days(30 * i64::from(i));
            let month_start = NaiveDate::from_ymd_opt(target.year(), target.month(), 1)
                .unwrap_or(target);
            let month_end = next_month(month_start);

            let start_ms = month_start
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc().timestamp_millis())
                .unwrap_or_default();
            let end_ms = month_end
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc().timestamp_millis())
                .unwrap_or_default();

            let data = match self
                .identify(lat, lng, Some(&format!("{start_ms},{end_ms}")))
                .await
            {
                Ok(data) => data,
                Err(err) => {
                    tracing::debug!(month = %month_start.format("%Y-%m"), error = %err, "landsat month skipped");
                    continue;
                }
            };

            if let Some(ndvi) = parse_landsat_ndvi(data.get("value").and_then(JsonValue::as_str)) {
                out.push(MonthlyNdvi {
                    month: month_start.format("%Y-%m").to_string(),
                    mean_ndvi: Some(ndvi),
                    valid_pixels: None,
                });
            }
        }

        out.sort_by(|a, b| a.month.cmp(&b.month));
        tracing::debug!(lat, lng, months = out.len(), "landsat monthly series built");
        Ok(out)
    }
}

fn next_month(date: NaiveDate) -> NaiveDate {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1).unwrap_or(date)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1).unwrap_or(date)
    }
}

/// Multispectral pixel values: coastal, blue, green, red, nir, swir1, swir2.
pub fn parse_landsat_ndvi(value: Option<&str>) -> Option<f64> {
    let raw = value?;
    if raw.is_empty() || raw == "NoData" {
        return None;
    }
    let bands: Vec<f64> = raw
        .split_whitespace()
        .filter_map(|p| p.parse::<f64>().ok())
        .collect();
    if bands.len() < 5 {
        return None;
    }
    let red = bands[3];
    let nir = bands[4];
    let denom = nir + red;
    if denom <= 0.0 {
        return None;
    }
    let ndvi = (nir - red) / denom;
    ndvi.is_finite().then_some(ndvi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndvi_uses_bands_four_and_five() {
        let ndvi = parse_landsat_ndvi(Some("0.1 0.2 0.3 0.2 0.6 0.1 0.1")).unwrap();
        assert!((ndvi - (0.6 - 0.2) / (0.6 + 0.2)).abs() < 1e-9);
    }

    #[test]
    fn nodata_and_short_pixels_yield_nothing() {
        assert!(parse_landsat_ndvi(None).is_none());
        assert!(parse_landsat_ndvi(Some("NoData")).is_none());
        assert!(parse_landsat_ndvi(Some("0.1 0.2 0.3")).is_none());
    }

    #[test]
    fn month_rollover_handles_december() {
        let dec = NaiveDate::from_ymd_opt(2024, 12, 1).unwrap();
        assert_eq!(next_month(dec), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
    }
}
