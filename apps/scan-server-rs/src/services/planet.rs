use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use reqwest::Client;
use serde_json::{json, Value as JsonValue};

const DATA_API: &str = "https://api.planet.com/data/v1";
const TILES_API: &str = "https://tiles.planet.com/data/v1";

// Temporal pair selection: baseline scene must sit 6-12 months behind the
// latest scene to be a useful comparison.
const MIN_TEMPORAL_SPAN_DAYS: i64 = 180;
const MAX_TEMPORAL_SPAN_DAYS: i64 = 365;

#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanetScene {
    pub id: String,
    pub acquired: Option<String>,
    pub cloud_cover: Option<f64>,
    pub item_type: String,
}

impl PlanetScene {
    fn acquired_date(&self) -> Option<NaiveDate> {
        let raw = self.acquired.as_deref()?;
        NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()
    }
}

/// Result of the two-window temporal pair acquisition.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PlanetRefinement {
    pub scene_count: i32,
    pub latest_date: Option<String>,
    pub earliest_date: Option<String>,
    pub temporal_span_days: Option<i32>,
    pub thumbnail_latest_url: Option<String>,
    pub thumbnail_earliest_url: Option<String>,
    pub change_score: Option<f64>,
}

/// Paid high-resolution imagery client. Budgeted (30k request trial), so
/// each refinement is exactly two narrow searches; callers enforce the
/// 60-day re-run guard before invoking.
pub struct PlanetClient {
    http: Client,
    api_key: String,
}

impl PlanetClient {
    pub fn new(http: Client, api_key: String) -> Self {
        Self { http, api_key }
    }

    /// Scene search at a point over an explicit date window,
    /// most-recent-first. One API request.
    pub async fn quick_search(
        &self,
        lat: f64,
        lng: f64,
        start: NaiveDate,
        end: NaiveDate,
        cloud_cover_max: f64,
        limit: usize,
    ) -> Result<Vec<PlanetScene>> {
        let body = json!({
            "item_types": ["PSScene"],
            "filter": {
                "type": "AndFilter",
                "config": [
                    {
                        "type": "GeometryFilter",
                        "field_name": "geometry",
                        "config": {"type": "Point", "coordinates": [lng, lat]},
                    },
                    {
                        "type": "DateRangeFilter",
                        "field_name": "acquired",
                        "config": {
                            "gte": format!("{start}T00:00:00Z"),
                            "lte": format!("{end}T23:59:59Z"),
                        },
                    },
                    {
                        "type": "RangeFilter",
                        "field_name": "cloud_cover",
                        "config": {"lte": cloud_cover_max},
                    },
                ],
            },
        });

        let data: JsonValue = self
            .http
            .post(format!("{DATA_API}/quick-search"))
            .header("Authorization", format!("api-key {}", self.api_key))
            .json(&body)
            .send()
            .await
            .context("high-res scene search failed")?
            .error_for_status()
            .context("high-res scene search returned error status")?
            .json()
            .await
            .context("failed to decode high-res search response")?;

        let mut scenes: Vec<PlanetScene> = data
            .get("features")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .take(limit)
            .filter_map(parse_scene)
            .collect();
        scenes.sort_by(|a, b| b.acquired.cmp(&a.acquired));
        Ok(scenes)
    }

    pub fn thumbnail_url(&self, scene: &PlanetScene) -> String {
        format!(
            "{TILES_API}/item-types/{}/items/{}/thumb",
            scene.item_type, scene.id
        )
    }

    /// Temporal pair acquisition: one narrow recent search plus one narrow
    /// baseline search 6-12 months behind the latest scene, picking a single
    /// scene from each. Two wide searches would cost the same budget and
    /// return noise in between.
    pub async fn temporal_pair(&self, lat: f64, lng: f64) -> Result<PlanetRefinement> {
        let today = Utc::now().date_naive();
        let recent = self
            .quick_search(lat, lng, today - ChronoDuration::days(30), today, 0.30, 5)
            .await?;

        let mut refinement = PlanetRefinement {
            scene_count: recent.len() as i32,
            ..Default::default()
        };

        let Some(latest) = recent.iter().find(|s| s.acquired_date().is_some()) else {
            return Ok(refinement);
        };
        let latest_dt = latest.acquired_date().unwrap_or(today);
        refinement.latest_date = latest.acquired.as_deref().map(|a| a[..10.min(a.len())].to_string());
        refinement.thumbnail_latest_url = Some(self.thumbnail_url(latest));

        let hist_end = latest_dt - ChronoDuration::days(MIN_TEMPORAL_SPAN_DAYS);
        let hist_start = latest_dt - ChronoDuration::days(MAX_TEMPORAL_SPAN_DAYS);
        // Stricter cloud ceiling for the comparison baseline.
        let historical = self
            .quick_search(lat, lng, hist_start, hist_end, 0.20, 5)
            .await?;
        refinement.scene_count += historical.len() as i32;

        let earliest = select_baseline(&historical, latest_dt);
        if let Some(earliest) = earliest {
            let span = latest_dt
                - earliest.acquired_date().unwrap_or(latest_dt);
            refinement.earliest_date = earliest
                .acquired
                .as_deref()
                .map(|a| a[..10.min(a.len())].to_string());
            refinement.temporal_span_days = i32::try_from(span.num_days()).ok();
            if earliest.id != latest.id {
                refinement.thumbnail_earliest_url = Some(self.thumbnail_url(earliest));
            }
        }

        tracing::info!(
            lat,
            lng,
            scenes = refinement.scene_count,
            span_days = refinement.temporal_span_days,
            "high-res temporal pair acquired"
        );
        Ok(refinement)
    }
}

fn parse_scene(feat: &JsonValue) -> Option<PlanetScene> {
    let id = feat.get("id")?.as_str()?.to_string();
    let props = feat.get("properties")?;
    Some(PlanetScene {
        id,
        acquired: props
            .get("acquired")
            .and_then(JsonValue::as_str)
            .map(str::to_string),
        cloud_cover: props.get("cloud_cover").and_then(JsonValue::as_f64),
        item_type: props
            .get("item_type")
            .and_then(JsonValue::as_str)
            .unwrap_or("PSScene")
            .to_string(),
    })
}

/// Oldest baseline scene whose span to the latest scene falls inside the
/// 6-12 month band.
fn select_baseline(scenes: &[PlanetScene], latest_dt: NaiveDate) -> Option<&PlanetScene> {
    let mut dated: Vec<(&PlanetScene, NaiveDate)> = scenes
        .iter()
        .filter_map(|s| s.acquired_date().map(|d| (s, d)))
        .collect();
    dated.sort_by_key(|(_, d)| *d);

    for (scene, scene_dt) in dated {
        let span = (latest_dt - scene_dt).num_days();
        if span > MAX_TEMPORAL_SPAN_DAYS {
            continue;
        }
        if span >= MIN_TEMPORAL_SPAN_DAYS {
            return Some(scene);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene(id: &str, acquired: &str) -> PlanetScene {
        PlanetScene {
            id: id.to_string(),
            acquired: Some(format!("{acquired}T14:00:00Z")),
            cloud_cover: Some(0.05),
            item_type: "PSScene".to_string(),
        }
    }

    #[test]
    fn baseline_must_sit_inside_the_span_band() {
        let latest = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let scenes = vec![
            scene("too-old", "2024-01-15"),
            scene("good", "2025-09-01"),
            scene("too-recent", "2026-05-01"),
        ];
        let picked = select_baseline(&scenes, latest).unwrap();
        assert_eq!(picked.id, "good");
    }

    #[test]
    fn no_baseline_when_everything_is_too_recent() {
        let latest = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let scenes = vec![scene("a", "2026-04-01"), scene("b", "2026-05-20")];
        assert!(select_baseline(&scenes, latest).is_none());
    }

    #[test]
    fn scene_parse_pulls_id_and_acquired() {
        let feat = json!({
            "id": "20260601_143210_12_2486",
            "properties": {"acquired": "2026-06-01T14:32:10Z", "cloud_cover": 0.02}
        });
        let scene = parse_scene(&feat).unwrap();
        assert_eq!(scene.id, "20260601_143210_12_2486");
        assert_eq!(scene.acquired_date(), NaiveDate::from_ymd_opt(2026, 6, 1));
    }
}
