use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::error::{AppError, AppResult};
use crate::services::flags::{generate_flags, AerialEvidence, EvidenceBundle, VacancyEvidence};
use crate::services::naip::{categorize_ndvi, make_bbox};
use crate::services::scoring::distress_score;
use crate::services::trends::{compute_trend, ols_slope, NdviTrend, TrendDirection};
use crate::state::AppState;
use crate::store::parcels::{get_planet_scan_date, update_parcel_planet, PlanetUpdate};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/scan/free", get(scan_free))
        .route("/scan/full", get(scan_full))
        .route("/scan/enrich-satellite", get(enrich_satellite))
        .route("/scan/check-vacancy", get(check_vacancy))
        .route("/scan/baseline", get(baseline))
        .route("/scan/flood-lookup", get(flood_lookup))
        .route("/scan/high-res-search", get(high_res_search))
}

#[derive(Debug, Deserialize)]
struct PointQuery {
    lat: f64,
    lng: f64,
    parcel_id: Option<String>,
    county: Option<String>,
    #[allow(dead_code)]
    state: Option<String>,
    #[serde(default)]
    force: bool,
    months: Option<u32>,
}

fn validate_point(query: &PointQuery) -> AppResult<()> {
    if !(-90.0..=90.0).contains(&query.lat) || !(-180.0..=180.0).contains(&query.lng) {
        return Err(AppError::bad_request("lat/lng out of range"));
    }
    Ok(())
}

/// Free-data scan: aerial NDVI + flood zone, flags, distress score. The same
/// evaluators the bulk pass runs, without any persistence.
async fn scan_free(
    State(state): State<AppState>,
    Query(query): Query<PointQuery>,
) -> AppResult<Json<JsonValue>> {
    validate_point(&query)?;
    let clients = &state.clients;

    let aerial = clients.naip.ndvi_fast(query.lat, query.lng).await;
    let flood = clients.fema.query_flood_zone(query.lat, query.lng).await.ok();

    let bundle = EvidenceBundle {
        aerial: aerial.ndvi.map(|ndvi| AerialEvidence {
            current_ndvi: Some(ndvi),
            baseline_ndvi: None,
        }),
        flood: flood.clone(),
        ..Default::default()
    };
    let flags = generate_flags(&bundle);
    let score = distress_score(&flags);

    Ok(Json(json!({
        "lat": query.lat,
        "lng": query.lng,
        "scan_date": Utc::now().format("%Y-%m-%d").to_string(),
        "aerial": {
            "ndvi": aerial.ndvi,
            "category": categorize_ndvi(aerial.ndvi),
            "acquisition_date": aerial.acquisition_date,
            "error": aerial.error,
        },
        "flood": flood.map(|z| json!({
            "flood_zone": z.flood_zone,
            "zone_subtype": z.zone_subtype,
            "is_sfha": z.is_sfha,
            "risk": z.risk.as_str(),
        })),
        "flags": flags_json(&flags),
        "distress_score": score,
    })))
}

/// Full scan: free-data sources plus historical baseline and satellite
/// trend, all in one response.
async fn scan_full(
    State(state): State<AppState>,
    Query(query): Query<PointQuery>,
) -> AppResult<Json<JsonValue>> {
    validate_point(&query)?;
    let clients = &state.clients;
    let months = query.months.unwrap_or(12);

    let aerial = clients.naip.ndvi_fast(query.lat, query.lng).await;
    let flood = clients.fema.query_flood_zone(query.lat, query.lng).await.ok();

    let history = historical_points(&state, query.lat, query.lng).await?;
    let baseline = baseline_mean(&history);
    let trend = satellite_trend(&state, query.lat, query.lng, months).await;

    let bundle = EvidenceBundle {
        aerial: aerial.ndvi.map(|ndvi| AerialEvidence {
            current_ndvi: Some(ndvi),
            baseline_ndvi: baseline,
        }),
        trend: trend
            .as_ref()
            .filter(|t| t.direction != TrendDirection::Insufficient)
            .cloned(),
        flood: flood.clone(),
        ..Default::default()
    };
    let flags = generate_flags(&bundle);
    let score = distress_score(&flags);

    Ok(Json(json!({
        "lat": query.lat,
        "lng": query.lng,
        "scan_date": Utc::now().format("%Y-%m-%d").to_string(),
        "aerial": {
            "ndvi": aerial.ndvi,
            "category": categorize_ndvi(aerial.ndvi),
            "acquisition_date": aerial.acquisition_date,
            "baseline_ndvi": baseline,
            "history": history.iter().map(|(year, ndvi)| json!({"year": year, "ndvi": ndvi})).collect::<Vec<_>>(),
        },
        "satellite": trend.map(trend_json),
        "flood": flood.map(|z| json!({
            "flood_zone": z.flood_zone,
            "is_sfha": z.is_sfha,
            "risk": z.risk.as_str(),
        })),
        "flags": flags_json(&flags),
        "distress_score": score,
    })))
}

async fn enrich_satellite(
    State(state): State<AppState>,
    Query(query): Query<PointQuery>,
) -> AppResult<Json<JsonValue>> {
    validate_point(&query)?;
    let months = query.months.unwrap_or(12);
    let trend = satellite_trend(&state, query.lat, query.lng, months).await
        .ok_or_else(|| AppError::bad_gateway("no satellite data available for point"))?;
    Ok(Json(trend_json(trend)))
}

#[derive(Debug, Deserialize)]
struct VacancyQuery {
    street: String,
    city: Option<String>,
    state: Option<String>,
    zip: Option<String>,
}

async fn check_vacancy(
    State(state): State<AppState>,
    Query(query): Query<VacancyQuery>,
) -> AppResult<Json<JsonValue>> {
    let Some(client) = state.clients.usps.first() else {
        return Err(AppError::bad_request("no carrier-vacancy credentials configured"));
    };
    if query.city.is_none() && query.zip.is_none() {
        return Err(AppError::bad_request("city or zip is required"));
    }

    let record = client
        .check_address(
            &query.street,
            query.city.as_deref(),
            query.state.as_deref(),
            query.zip.as_deref(),
        )
        .await;

    let flag = crate::services::flags::evaluate_usps_vacancy(Some(&VacancyEvidence {
        vacant: record.vacant,
        dpv_confirmed: record.dpv_confirmed,
        address_mismatch: record.address_mismatch,
    }));

    Ok(Json(json!({
        "usps_address": record.usps_address,
        "usps_city": record.usps_city,
        "usps_state": record.usps_state,
        "usps_zip": record.usps_zip,
        "usps_zip4": record.usps_zip4,
        "vacant": record.vacant,
        "dpv_confirmed": record.dpv_confirmed,
        "business": record.business,
        "address_mismatch": record.address_mismatch,
        "error": record.error,
        "flag_vacancy": flag.is_some(),
        "vacancy_confidence": flag.map(|f| f.confidence),
    })))
}

/// Historical NDVI baseline: vintage pairs, mean, and slope at the point.
async fn baseline(
    State(state): State<AppState>,
    Query(query): Query<PointQuery>,
) -> AppResult<Json<JsonValue>> {
    validate_point(&query)?;
    let history = historical_points(&state, query.lat, query.lng).await?;
    let slope = ols_slope(
        &history
            .iter()
            .map(|(year, ndvi)| (f64::from(*year), *ndvi))
            .collect::<Vec<_>>(),
    );

    Ok(Json(json!({
        "lat": query.lat,
        "lng": query.lng,
        "vintages": history.iter().map(|(year, ndvi)| json!({"year": year, "ndvi": ndvi})).collect::<Vec<_>>(),
        "baseline_mean": baseline_mean(&history),
        "slope": slope,
    })))
}

async fn flood_lookup(
    State(state): State<AppState>,
    Query(query): Query<PointQuery>,
) -> AppResult<Json<JsonValue>> {
    validate_point(&query)?;
    let zone = state
        .clients
        .fema
        .query_flood_zone(query.lat, query.lng)
        .await
        .map_err(|err| AppError::bad_gateway(format!("flood lookup failed: {err:#}")))?;

    Ok(Json(json!({
        "lat": query.lat,
        "lng": query.lng,
        "flood_zone": zone.flood_zone,
        "zone_subtype": zone.zone_subtype,
        "is_sfha": zone.is_sfha,
        "risk": zone.risk.as_str(),
        "bbox": make_bbox(query.lat, query.lng, 200.0),
    })))
}

/// High-res temporal pair search. When the parcel is identified and was
/// scanned inside the guard window, the request is refused unless forced.
async fn high_res_search(
    State(state): State<AppState>,
    Query(query): Query<PointQuery>,
) -> AppResult<Json<JsonValue>> {
    validate_point(&query)?;
    let Some(planet) = &state.clients.planet else {
        return Err(AppError::bad_request("high-res imagery key not configured"));
    };

    if let (Some(parcel_id), Some(county)) = (&query.parcel_id, &query.county) {
        if !query.force {
            let last = get_planet_scan_date(&state.db, parcel_id, county)
                .await
                .map_err(|err| AppError::internal(err.to_string()))?;
            if let Some(last) = last {
                let age = Utc::now().naive_utc() - last;
                if age.num_days() < state.config.planet_rescan_guard_days {
                    return Err(AppError::bad_request(format!(
                        "high-res scan ran {} days ago; pass force=true to override",
                        age.num_days()
                    )));
                }
            }
        }
    }

    let refinement = planet
        .temporal_pair(query.lat, query.lng)
        .await
        .map_err(|err| AppError::bad_gateway(format!("high-res search failed: {err:#}")))?;

    if let (Some(parcel_id), Some(county)) = (&query.parcel_id, &query.county) {
        update_parcel_planet(
            &state.db,
            &PlanetUpdate {
                parcel_id: parcel_id.clone(),
                county: county.clone(),
                scene_count: i16::try_from(refinement.scene_count).ok(),
                change_score: refinement.change_score,
                temporal_span: refinement.temporal_span_days.and_then(|d| i16::try_from(d).ok()),
                latest_date: refinement.latest_date.clone(),
                earliest_date: refinement.earliest_date.clone(),
                thumb_latest_url: refinement.thumbnail_latest_url.clone(),
                thumb_earliest_url: refinement.thumbnail_earliest_url.clone(),
            },
        )
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;
    }

    Ok(Json(serde_json::to_value(&refinement).unwrap_or_default()))
}

async fn historical_points(
    state: &AppState,
    lat: f64,
    lng: f64,
) -> AppResult<Vec<(i32, f64)>> {
    let clients = &state.clients;
    let mut sequence = clients
        .stac
        .historical_ndvi(&clients.naip, lat, lng)
        .await
        .map_err(|err| AppError::bad_gateway(format!("historical search failed: {err:#}")))?;

    let mut points = Vec::new();
    while let Some(pair) = sequence.next().await {
        points.push(pair);
    }
    Ok(points)
}

fn baseline_mean(history: &[(i32, f64)]) -> Option<f64> {
    if history.is_empty() {
        return None;
    }
    Some(history.iter().map(|(_, ndvi)| ndvi).sum::<f64>() / history.len() as f64)
}

async fn satellite_trend(state: &AppState, lat: f64, lng: f64, months: u32) -> Option<NdviTrend> {
    let clients = &state.clients;
    if let Some(sentinel) = &clients.sentinel {
        if let Ok(monthly) = sentinel.monthly_ndvi(lat, lng, months).await {
            if !monthly.is_empty() {
                return Some(compute_trend(&monthly));
            }
        }
    }
    match clients.landsat.monthly_ndvi(lat, lng, months.min(12)).await {
        Ok(monthly) if !monthly.is_empty() => Some(compute_trend(&monthly)),
        _ => None,
    }
}

fn trend_json(trend: NdviTrend) -> JsonValue {
    json!({
        "trend_direction": trend.direction.as_str(),
        "trend_slope": trend.slope,
        "latest_ndvi": trend.latest_ndvi,
        "earliest_ndvi": trend.earliest_ndvi,
        "mean_ndvi": trend.mean_ndvi,
        "months_with_data": trend.months_with_data,
    })
}

fn flags_json(flags: &[crate::services::flags::FlagResult]) -> Vec<JsonValue> {
    flags
        .iter()
        .map(|f| {
            json!({
                "signal_code": f.code.as_str(),
                "confidence": f.confidence,
                "evidence": f.evidence,
            })
        })
        .collect()
}
