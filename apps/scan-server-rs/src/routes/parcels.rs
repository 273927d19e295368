use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::error::{map_db_error, AppResult};
use crate::state::AppState;
use crate::store::parcels::{query_parcels, ParcelDetailRow, ParcelFilters};

pub fn router() -> Router<AppState> {
    Router::new().route("/parcels", get(list_parcels))
}

#[derive(Debug, Deserialize)]
struct ParcelsQuery {
    county: Option<String>,
    state: Option<String>,
    property_class: Option<String>,
    zip: Option<String>,
    min_value: Option<f64>,
    max_value: Option<f64>,
    min_sqft: Option<f64>,
    max_sqft: Option<f64>,
    min_score: Option<f64>,
    max_score: Option<f64>,
    fema_zone: Option<String>,
    flag_veg: Option<bool>,
    flag_flood: Option<bool>,
    flag_structural: Option<bool>,
    flag_neglect: Option<bool>,
    flag_vacancy: Option<bool>,
    #[serde(default)]
    scanned_only: bool,
    sort: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_parcels(
    State(state): State<AppState>,
    Query(query): Query<ParcelsQuery>,
) -> AppResult<Json<JsonValue>> {
    let filters = ParcelFilters {
        county: query.county,
        state: query.state,
        property_class: query.property_class,
        zip: query.zip,
        min_value: query.min_value,
        max_value: query.max_value,
        min_sqft: query.min_sqft,
        max_sqft: query.max_sqft,
        min_score: query.min_score,
        max_score: query.max_score,
        fema_zone: query.fema_zone,
        flag_veg: query.flag_veg,
        flag_flood: query.flag_flood,
        flag_structural: query.flag_structural,
        flag_neglect: query.flag_neglect,
        flag_vacancy: query.flag_vacancy,
        scanned_only: query.scanned_only,
        sort: query.sort,
        limit: query.limit.unwrap_or(100),
        offset: query.offset.unwrap_or(0),
    };

    let rows = query_parcels(&state.db, &filters)
        .await
        .map_err(|err| match err.downcast::<sqlx::Error>() {
            Ok(db_err) => map_db_error(db_err),
            Err(other) => crate::error::AppError::internal(other.to_string()),
        })?;

    let parcels: Vec<JsonValue> = rows.iter().map(parcel_json).collect();
    Ok(Json(json!({
        "count": parcels.len(),
        "parcels": parcels,
    })))
}

/// Group the flat row into the nested band sub-objects consumers read.
/// Vacancy keys keep their prefixes; consumers must not rely on bare names.
fn parcel_json(row: &ParcelDetailRow) -> JsonValue {
    json!({
        "parcel_id": row.parcel_id,
        "county": row.county,
        "state_code": row.state_code,
        "latitude": row.latitude,
        "longitude": row.longitude,
        "situs_address": row.situs_address,
        "property_class": row.property_class,
        "total_value": row.total_value,
        "scan_pass": row.scan_pass,
        "scan_date": row.scan_date.map(|d| d.to_string()),
        "sentinel_worthy": row.sentinel_worthy,
        "flags": {
            "distress_flags": row.distress_flags,
            "flag_veg": row.flag_veg,
            "flag_flood": row.flag_flood,
            "flag_structural": row.flag_structural,
            "flag_neglect": row.flag_neglect,
            "flag_vacancy": row.flag_vacancy,
            "veg_confidence": row.veg_confidence,
            "flood_confidence": row.flood_confidence,
            "vacancy_confidence": row.vacancy_confidence,
        },
        "aerial": {
            "ndvi_score": row.ndvi_score,
            "ndvi_date": row.ndvi_date,
            "ndvi_category": row.ndvi_category,
            "ndvi_slope_5yr": row.ndvi_slope_5yr,
            "ndvi_slope_pctile": row.ndvi_slope_pctile,
        },
        "flood": {
            "fema_zone": row.fema_zone,
            "fema_risk": row.fema_risk,
            "fema_sfha": row.fema_sfha,
        },
        "satellite": {
            "trend_direction": row.sentinel_trend_direction,
            "trend_slope": row.sentinel_trend_slope,
            "latest_ndvi": row.sentinel_latest_ndvi,
            "months_data": row.sentinel_months_data,
            "mean_ndvi": row.sentinel_mean_ndvi,
            "data_source": row.sentinel_data_source,
            "scan_date": row.sentinel_scan_date.map(|d| d.to_string()),
        },
        "vacancy": {
            "usps_vacant": row.usps_vacant,
            "usps_dpv_confirmed": row.usps_dpv_confirmed,
            "usps_address": row.usps_address,
            "usps_city": row.usps_city,
            "usps_zip": row.usps_zip,
            "usps_zip4": row.usps_zip4,
            "usps_address_mismatch": row.usps_address_mismatch,
            "usps_check_date": row.usps_check_date.map(|d| d.to_string()),
        },
        "high_res": {
            "scene_count": row.planet_scene_count,
            "change_score": row.planet_change_score,
            "latest_date": row.planet_latest_date,
            "thumb_latest_url": row.planet_thumb_latest_url,
            "scan_date": row.planet_scan_date.map(|d| d.to_string()),
        },
        "scores": {
            "distress_score": row.distress_score,
            "distress_composite": row.distress_composite,
            "conviction_score": row.conviction_score,
        },
        "conviction": {
            "score": row.conviction_score,
            "base_score": row.conviction_base_score,
            "vacancy_bonus": row.conviction_vacancy_bonus,
            "mc_score": row.conviction_mc_score,
            "mc_signals": row.conviction_mc_signals,
            "mc_codes": row.conviction_mc_codes,
            "components": row.conviction_components,
        },
    })
}
