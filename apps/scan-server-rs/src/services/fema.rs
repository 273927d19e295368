use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use std::path::PathBuf;
use std::time::Duration;

use crate::services::http_cache::DiskCache;

const FEMA_BASE_URL: &str =
    "https://hazards.fema.gov/arcgis/rest/services/public/NFHL/MapServer";
// Layer 28 = flood hazard areas polygon layer.
const FLOOD_HAZARD_LAYER: u32 = 28;
// Flood zones change rarely.
const CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

const HIGH_RISK_ZONES: [&str; 5] = ["A", "AE", "AO", "VE", "V"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloodRisk {
    High,
    Moderate,
    Low,
    None,
}

impl FloodRisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            FloodRisk::High => "high",
            FloodRisk::Moderate => "moderate",
            FloodRisk::Low => "low",
            FloodRisk::None => "none",
        }
    }

    /// Normalization used by the composite formula.
    pub fn composite_weight(&self) -> f64 {
        match self {
            FloodRisk::High => 1.0,
            FloodRisk::Moderate => 0.6,
            FloodRisk::Low => 0.2,
            FloodRisk::None => 0.0,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FloodZone {
    pub flood_zone: Option<String>,
    pub zone_subtype: Option<String>,
    pub is_sfha: bool,
    pub risk: FloodRisk,
}

/// Zone X needs its subtype inspected: "AREA OF MINIMAL FLOOD HAZARD" is low
/// risk, "0.2 PCT ANNUAL CHANCE..." (the 500-year band) is moderate.
pub fn classify_risk(zone: Option<&str>, subtype: Option<&str>, sfha: bool) -> FloodRisk {
    let Some(zone) = zone.map(str::trim).filter(|z| !z.is_empty()) else {
        return FloodRisk::None;
    };
    if sfha || HIGH_RISK_ZONES.contains(&zone) {
        return FloodRisk::High;
    }
    if zone == "X" {
        let subtype = subtype.unwrap_or_default().to_uppercase();
        if subtype.contains("500") || subtype.contains("0.2") {
            return FloodRisk::Moderate;
        }
        return FloodRisk::Low;
    }
    FloodRisk::Low
}

/// Client for the public flood hazard map service. Free, no key.
pub struct FemaClient {
    http: Client,
    cache: DiskCache,
}

impl FemaClient {
    pub fn new(http: Client, cache_dir: PathBuf) -> Self {
        Self {
            http,
            cache: DiskCache::new(cache_dir.join("fema"), CACHE_TTL),
        }
    }

    pub async fn query_flood_zone(&self, lat: f64, lng: f64) -> Result<FloodZone> {
        let cache_key = DiskCache::key("flood_zone", &json!({"lat": lat, "lng": lng}));
        if let Some(cached) = self.cache.get::<FloodZone>(&cache_key) {
            return Ok(cached);
        }

        let geometry = json!({"x": lng, "y": lat, "spatialReference": {"wkid": 4326}});
        // FLOODWAY is not an available field on this layer; requesting it
        // fails the whole query.
        let params = [
            ("geometry", geometry.to_string()),
            ("geometryType", "esriGeometryPoint".to_string()),
            ("spatialRel", "esriSpatialRelIntersects".to_string()),
            (
                "outFields",
                "FLD_ZONE,SFHA_TF,ZONE_SUBTY,FLD_AR_ID,STATIC_BFE".to_string(),
            ),
            ("returnGeometry", "false".to_string()),
            ("f", "json".to_string()),
        ];

        let url = format!("{FEMA_BASE_URL}/{FLOOD_HAZARD_LAYER}/query");
        let data: JsonValue = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await
            .context("flood zone query failed")?
            .error_for_status()
            .context("flood zone query returned error status")?
            .json()
            .await
            .context("failed to decode flood zone response")?;

        let zone = parse_flood_zone(&data);
        self.cache.put(&cache_key, &zone);
        tracing::debug!(
            lat,
            lng,
            zone = zone.flood_zone.as_deref().unwrap_or("-"),
            risk = zone.risk.as_str(),
            "flood zone resolved"
        );
        Ok(zone)
    }

    /// PNG overlay tile of the hazard layer (on-demand flood-lookup only).
    pub async fn export_map_tile(&self, bbox: (f64, f64, f64, f64)) -> Result<Vec<u8>> {
        let (min_lng, min_lat, max_lng, max_lat) = bbox;
        let params = [
            ("bbox", format!("{min_lng},{min_lat},{max_lng},{max_lat}")),
            ("bboxSR", "4326".to_string()),
            ("imageSR", "4326".to_string()),
            ("size", "512,512".to_string()),
            ("format", "png".to_string()),
            ("transparent", "true".to_string()),
            ("layers", format!("show:{FLOOD_HAZARD_LAYER}")),
            ("f", "image".to_string()),
        ];

        let url = format!("{FEMA_BASE_URL}/export");
        let resp = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await
            .context("flood map export failed")?
            .error_for_status()
            .context("flood map export returned error status")?;
        Ok(resp.bytes().await?.to_vec())
    }
}

fn parse_flood_zone(data: &JsonValue) -> FloodZone {
    let Some(attrs) = data
        .get("features")
        .and_then(JsonValue::as_array)
        .and_then(|f| f.first())
        .and_then(|f| f.get("attributes"))
    else {
        return FloodZone {
            flood_zone: None,
            zone_subtype: None,
            is_sfha: false,
            risk: FloodRisk::None,
        };
    };

    let zone = attrs
        .get("FLD_ZONE")
        .and_then(JsonValue::as_str)
        .map(|z| z.trim().to_string())
        .filter(|z| !z.is_empty());
    let subtype = attrs
        .get("ZONE_SUBTY")
        .and_then(JsonValue::as_str)
        .map(|s| s.to_string());
    let is_sfha = attrs.get("SFHA_TF").and_then(JsonValue::as_str) == Some("T");
    let risk = classify_risk(zone.as_deref(), subtype.as_deref(), is_sfha);

    FloodZone {
        flood_zone: zone,
        zone_subtype: subtype,
        is_sfha,
        risk,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sfha_zones_are_high_risk() {
        for zone in ["A", "AE", "AO", "VE", "V"] {
            assert_eq!(classify_risk(Some(zone), None, false), FloodRisk::High);
        }
        assert_eq!(classify_risk(Some("X"), None, true), FloodRisk::High);
    }

    #[test]
    fn zone_x_minimal_is_low_and_500_year_is_moderate() {
        assert_eq!(
            classify_risk(Some("X"), Some("AREA OF MINIMAL FLOOD HAZARD"), false),
            FloodRisk::Low
        );
        assert_eq!(
            classify_risk(Some("X"), Some("0.2 PCT ANNUAL CHANCE FLOOD HAZARD"), false),
            FloodRisk::Moderate
        );
        assert_eq!(
            classify_risk(Some("X"), Some("500-YEAR FLOODPLAIN"), false),
            FloodRisk::Moderate
        );
    }

    #[test]
    fn no_feature_means_no_risk() {
        assert_eq!(classify_risk(None, None, false), FloodRisk::None);
        let parsed = parse_flood_zone(&json!({"features": []}));
        assert_eq!(parsed.risk, FloodRisk::None);
        assert!(parsed.flood_zone.is_none());
    }

    #[test]
    fn composite_weights_follow_risk_order() {
        assert_eq!(FloodRisk::High.composite_weight(), 1.0);
        assert_eq!(FloodRisk::Moderate.composite_weight(), 0.6);
        assert_eq!(FloodRisk::Low.composite_weight(), 0.2);
        assert_eq!(FloodRisk::None.composite_weight(), 0.0);
    }

    #[test]
    fn parses_feature_attributes() {
        let data = json!({
            "features": [{
                "attributes": {
                    "FLD_ZONE": "AE",
                    "SFHA_TF": "T",
                    "ZONE_SUBTY": null,
                }
            }]
        });
        let zone = parse_flood_zone(&data);
        assert_eq!(zone.flood_zone.as_deref(), Some("AE"));
        assert!(zone.is_sfha);
        assert_eq!(zone.risk, FloodRisk::High);
    }
}
