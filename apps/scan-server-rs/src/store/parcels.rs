use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};

const CHUNK_SIZE: usize = 500;

// parcel_id is unique only within a county; every UPDATE in this module is
// keyed on (parcel_id, county), and cross-table joins add state_code.

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Pass1Candidate {
    pub parcel_id: String,
    pub county: String,
    pub state_code: String,
    pub latitude: f64,
    pub longitude: f64,
}

pub async fn select_unscanned(
    pool: &PgPool,
    county: &str,
    state: &str,
    property_class: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<Pass1Candidate>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        SELECT parcel_id, county, state_code,
               latitude::float8 AS latitude, longitude::float8 AS longitude
        FROM gis_parcels_core
        WHERE latitude IS NOT NULL AND longitude IS NOT NULL
          AND scan_date IS NULL
          AND county = "#,
    );
    qb.push_bind(county);
    qb.push(" AND state_code = ").push_bind(state);
    if let Some(class) = property_class {
        qb.push(" AND property_class = ").push_bind(class);
    }
    // Deterministic shuffle: geographic diversity without a full-table sort.
    qb.push(" ORDER BY md5(parcel_id)");
    if let Some(limit) = limit {
        qb.push(" LIMIT ").push_bind(limit);
    }

    qb.build_query_as()
        .fetch_all(pool)
        .await
        .context("failed selecting unscanned parcels")
}

/// One parcel's Pass 1 output, ready to persist.
#[derive(Debug, Clone)]
pub struct Pass1Update {
    pub parcel_id: String,
    pub county: String,
    pub ndvi_score: Option<f64>,
    pub ndvi_date: Option<String>,
    pub ndvi_category: String,
    pub fema_zone: Option<String>,
    pub fema_risk: Option<String>,
    pub fema_sfha: bool,
    pub distress_score: Option<f64>,
    pub distress_flags: Option<String>,
    pub flag_veg: bool,
    pub flag_flood: bool,
    pub flag_structural: bool,
    pub flag_neglect: bool,
    pub veg_confidence: Option<f64>,
    pub flood_confidence: Option<f64>,
    pub scan_date: NaiveDateTime,
    pub sentinel_worthy: bool,
    pub scan_error: Option<String>,
}

/// Chunked UPDATE of the Pass-1 band. Returns the committed payload length;
/// driver row counts are unreliable for multi-statement batches.
pub async fn batch_update_scan_results(
    conn: &mut PgConnection,
    results: &[Pass1Update],
) -> Result<usize> {
    for chunk in results.chunks(CHUNK_SIZE) {
        let mut tx = sqlx::Connection::begin(&mut *conn)
            .await
            .context("failed to begin scan flush transaction")?;
        for row in chunk {
            sqlx::query(
                r#"
                UPDATE gis_parcels_core SET
                    ndvi_score = $1,
                    ndvi_date = $2,
                    ndvi_category = $3,
                    fema_zone = $4,
                    fema_risk = $5,
                    fema_sfha = $6,
                    distress_score = $7,
                    distress_flags = $8,
                    flag_veg = $9,
                    flag_flood = $10,
                    flag_structural = $11,
                    flag_neglect = $12,
                    veg_confidence = $13,
                    flood_confidence = $14,
                    scan_date = $15,
                    scan_pass = GREATEST(COALESCE(scan_pass, 0), 1),
                    sentinel_worthy = $16,
                    scan_error = $17
                WHERE parcel_id = $18 AND county = $19
                "#,
            )
            .bind(row.ndvi_score)
            .bind(row.ndvi_date.as_deref())
            .bind(&row.ndvi_category)
            .bind(row.fema_zone.as_deref())
            .bind(row.fema_risk.as_deref())
            .bind(row.fema_sfha)
            .bind(row.distress_score)
            .bind(row.distress_flags.as_deref())
            .bind(row.flag_veg)
            .bind(row.flag_flood)
            .bind(row.flag_structural)
            .bind(row.flag_neglect)
            .bind(row.veg_confidence)
            .bind(row.flood_confidence)
            .bind(row.scan_date)
            .bind(row.sentinel_worthy)
            .bind(row.scan_error.as_deref())
            .bind(&row.parcel_id)
            .bind(&row.county)
            .execute(&mut *tx)
            .await
            .context("scan row update failed")?;
        }
        tx.commit().await.context("scan flush commit failed")?;
    }
    Ok(results.len())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SlopeCandidate {
    pub parcel_id: String,
    pub county: String,
    pub state_code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub ndvi_score: Option<f64>,
    pub ndvi_date: Option<String>,
}

pub async fn select_needing_slope(
    pool: &PgPool,
    county: &str,
    state: &str,
    limit: Option<i64>,
) -> Result<Vec<SlopeCandidate>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        SELECT parcel_id, county, state_code,
               latitude::float8 AS latitude, longitude::float8 AS longitude,
               ndvi_score::float8 AS ndvi_score, ndvi_date
        FROM gis_parcels_core
        WHERE ndvi_score IS NOT NULL
          AND ndvi_slope_5yr IS NULL
          AND latitude IS NOT NULL AND longitude IS NOT NULL
          AND county = "#,
    );
    qb.push_bind(county);
    qb.push(" AND state_code = ").push_bind(state);
    qb.push(" ORDER BY md5(parcel_id)");
    if let Some(limit) = limit {
        qb.push(" LIMIT ").push_bind(limit);
    }

    qb.build_query_as()
        .fetch_all(pool)
        .await
        .context("failed selecting slope candidates")
}

#[derive(Debug, Clone)]
pub struct SlopeUpdate {
    pub parcel_id: String,
    pub county: String,
    pub ndvi_slope_5yr: Option<f64>,
    pub ndvi_history_count: i16,
    pub ndvi_history_years: Option<String>,
}

pub async fn batch_update_slope_results(
    conn: &mut PgConnection,
    results: &[SlopeUpdate],
) -> Result<usize> {
    for chunk in results.chunks(CHUNK_SIZE) {
        let mut tx = sqlx::Connection::begin(&mut *conn)
            .await
            .context("failed to begin slope flush transaction")?;
        for row in chunk {
            sqlx::query(
                r#"
                UPDATE gis_parcels_core SET
                    ndvi_slope_5yr = $1,
                    ndvi_history_count = $2,
                    ndvi_history_years = $3
                WHERE parcel_id = $4 AND county = $5
                "#,
            )
            .bind(row.ndvi_slope_5yr)
            .bind(row.ndvi_history_count)
            .bind(row.ndvi_history_years.as_deref())
            .bind(&row.parcel_id)
            .bind(&row.county)
            .execute(&mut *tx)
            .await
            .context("slope row update failed")?;
        }
        tx.commit().await.context("slope flush commit failed")?;
    }
    Ok(results.len())
}

/// County-scoped percentile rank + composite, in one transaction.
///
/// The percentile is a PERCENT_RANK window over parcels of this county that
/// have a slope, so it lands in [0, 1] and is monotone in the slope. The
/// composite blends it with the normalized flood risk and scales to [0, 10].
pub async fn compute_composite_scores(
    pool: &PgPool,
    county: &str,
    state: &str,
) -> Result<(u64, u64)> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin composite transaction")?;

    let pctile = sqlx::query(
        r#"
        WITH ranked AS (
            SELECT parcel_id,
                   PERCENT_RANK() OVER (ORDER BY ndvi_slope_5yr ASC) AS pctile
            FROM gis_parcels_core
            WHERE county = $1 AND state_code = $2 AND ndvi_slope_5yr IS NOT NULL
        )
        UPDATE gis_parcels_core g
        SET ndvi_slope_pctile = r.pctile
        FROM ranked r
        WHERE g.parcel_id = r.parcel_id AND g.county = $1 AND g.state_code = $2
        "#,
    )
    .bind(county)
    .bind(state)
    .execute(&mut *tx)
    .await
    .context("percentile rank update failed")?;

    let composite = sqlx::query(
        r#"
        UPDATE gis_parcels_core
        SET distress_composite = ROUND(CAST(
                (0.70 * COALESCE(ndvi_slope_pctile, 0) +
                 0.30 * CASE
                    WHEN fema_sfha = TRUE THEN 1.0
                    WHEN fema_risk = 'high' THEN 1.0
                    WHEN fema_risk = 'moderate' THEN 0.6
                    WHEN fema_risk = 'low' THEN 0.2
                    ELSE 0.0
                 END) * 10.0
            AS NUMERIC), 2),
            composite_date = NOW()
        WHERE county = $1 AND state_code = $2
          AND (ndvi_slope_5yr IS NOT NULL OR fema_zone IS NOT NULL)
        "#,
    )
    .bind(county)
    .bind(state)
    .execute(&mut *tx)
    .await
    .context("composite update failed")?;

    tx.commit().await.context("composite commit failed")?;
    Ok((pctile.rows_affected(), composite.rows_affected()))
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SentinelCandidate {
    pub parcel_id: String,
    pub county: String,
    pub state_code: String,
    pub latitude: f64,
    pub longitude: f64,
    pub ndvi_score: Option<f64>,
    pub fema_zone: Option<String>,
    pub fema_risk: Option<String>,
    pub fema_sfha: Option<bool>,
}

pub async fn select_sentinel_worthy(
    pool: &PgPool,
    county: &str,
    state: &str,
    limit: Option<i64>,
) -> Result<Vec<SentinelCandidate>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        SELECT parcel_id, county, state_code,
               latitude::float8 AS latitude, longitude::float8 AS longitude,
               ndvi_score::float8 AS ndvi_score, fema_zone, fema_risk, fema_sfha
        FROM gis_parcels_core
        WHERE sentinel_worthy = TRUE
          AND sentinel_scan_date IS NULL
          AND latitude IS NOT NULL AND longitude IS NOT NULL
          AND county = "#,
    );
    qb.push_bind(county);
    qb.push(" AND state_code = ").push_bind(state);
    qb.push(" ORDER BY distress_score DESC NULLS LAST");
    if let Some(limit) = limit {
        qb.push(" LIMIT ").push_bind(limit);
    }

    qb.build_query_as()
        .fetch_all(pool)
        .await
        .context("failed selecting satellite-worthy parcels")
}

#[derive(Debug, Clone)]
pub struct SentinelUpdate {
    pub parcel_id: String,
    pub county: String,
    pub trend_direction: String,
    pub trend_slope: Option<f64>,
    pub latest_ndvi: Option<f64>,
    pub months_data: i16,
    pub mean_ndvi: Option<f64>,
    pub data_source: Option<String>,
    pub chart_url: Option<String>,
    pub scan_date: NaiveDateTime,
    pub distress_score: Option<f64>,
    pub distress_flags: Option<String>,
    pub flag_veg: bool,
    pub flag_flood: bool,
    pub flag_structural: bool,
    pub flag_neglect: bool,
    pub veg_confidence: Option<f64>,
    pub flood_confidence: Option<f64>,
}

pub async fn batch_update_sentinel_results(
    conn: &mut PgConnection,
    results: &[SentinelUpdate],
) -> Result<usize> {
    for chunk in results.chunks(CHUNK_SIZE) {
        let mut tx = sqlx::Connection::begin(&mut *conn)
            .await
            .context("failed to begin satellite flush transaction")?;
        for row in chunk {
            sqlx::query(
                r#"
                UPDATE gis_parcels_core SET
                    sentinel_trend_direction = $1,
                    sentinel_trend_slope = $2,
                    sentinel_latest_ndvi = $3,
                    sentinel_months_data = $4,
                    sentinel_mean_ndvi = $5,
                    sentinel_data_source = $6,
                    sentinel_chart_url = $7,
                    sentinel_scan_date = $8,
                    distress_score = $9,
                    distress_flags = $10,
                    flag_veg = $11,
                    flag_flood = $12,
                    flag_structural = $13,
                    flag_neglect = $14,
                    veg_confidence = $15,
                    flood_confidence = $16,
                    scan_pass = GREATEST(COALESCE(scan_pass, 0), 2)
                WHERE parcel_id = $17 AND county = $18
                "#,
            )
            .bind(&row.trend_direction)
            .bind(row.trend_slope)
            .bind(row.latest_ndvi)
            .bind(row.months_data)
            .bind(row.mean_ndvi)
            .bind(row.data_source.as_deref())
            .bind(row.chart_url.as_deref())
            .bind(row.scan_date)
            .bind(row.distress_score)
            .bind(row.distress_flags.as_deref())
            .bind(row.flag_veg)
            .bind(row.flag_flood)
            .bind(row.flag_structural)
            .bind(row.flag_neglect)
            .bind(row.veg_confidence)
            .bind(row.flood_confidence)
            .bind(&row.parcel_id)
            .bind(&row.county)
            .execute(&mut *tx)
            .await
            .context("satellite row update failed")?;
        }
        tx.commit().await.context("satellite flush commit failed")?;
    }
    Ok(results.len())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VacancyCandidate {
    pub parcel_id: String,
    pub county: String,
    pub state_code: String,
    pub situs_address: Option<String>,
    pub mailing_city: Option<String>,
    pub mailing_zip: Option<String>,
    pub mailing_state: Option<String>,
    pub distress_composite: Option<f64>,
}

/// Top leads by composite that were never checked, are stale, or failed a
/// retryable check.
pub async fn select_needing_vacancy(
    pool: &PgPool,
    county: &str,
    state: &str,
    min_composite: f64,
    cache_days: i64,
    limit: Option<i64>,
) -> Result<Vec<VacancyCandidate>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        SELECT parcel_id, county, state_code, situs_address,
               mailing_city, mailing_zip, mailing_state,
               distress_composite::float8 AS distress_composite
        FROM gis_parcels_core
        WHERE situs_address IS NOT NULL
          AND latitude IS NOT NULL AND longitude IS NOT NULL
          AND county = "#,
    );
    qb.push_bind(county);
    qb.push(" AND state_code = ").push_bind(state);
    qb.push(" AND distress_composite >= ").push_bind(min_composite);
    qb.push(" AND (usps_check_date IS NULL OR usps_check_date < NOW() - make_interval(days => ");
    qb.push_bind(cache_days as i32);
    qb.push(") OR usps_error IS NOT NULL)");
    qb.push(" ORDER BY distress_composite DESC NULLS LAST");
    if let Some(limit) = limit {
        qb.push(" LIMIT ").push_bind(limit);
    }

    qb.build_query_as()
        .fetch_all(pool)
        .await
        .context("failed selecting vacancy candidates")
}

#[derive(Debug, Clone)]
pub struct VacancyUpdate {
    pub parcel_id: String,
    pub county: String,
    pub vacant: Option<bool>,
    pub dpv_confirmed: Option<bool>,
    pub usps_address: Option<String>,
    pub usps_city: Option<String>,
    pub usps_zip: Option<String>,
    pub usps_zip4: Option<String>,
    pub business: Option<bool>,
    pub address_mismatch: Option<bool>,
    pub error: Option<String>,
    pub flag_vacancy: bool,
    pub vacancy_confidence: Option<f64>,
    /// Transient errors must not stamp the check date: the parcel stays
    /// eligible for retry on the next run.
    pub transient_error: bool,
}

pub async fn batch_update_vacancy_results(
    conn: &mut PgConnection,
    results: &[VacancyUpdate],
) -> Result<usize> {
    for chunk in results.chunks(CHUNK_SIZE) {
        let mut tx = sqlx::Connection::begin(&mut *conn)
            .await
            .context("failed to begin vacancy flush transaction")?;
        for row in chunk {
            if row.error.is_none() {
                sqlx::query(
                    r#"
                    UPDATE gis_parcels_core SET
                        usps_vacant = $1,
                        usps_dpv_confirmed = $2,
                        usps_address = $3,
                        usps_city = $4,
                        usps_zip = $5,
                        usps_zip4 = $6,
                        usps_business = $7,
                        usps_address_mismatch = $8,
                        usps_check_date = NOW(),
                        usps_error = NULL,
                        flag_vacancy = $9,
                        vacancy_confidence = $10
                    WHERE parcel_id = $11 AND county = $12
                    "#,
                )
                .bind(row.vacant)
                .bind(row.dpv_confirmed)
                .bind(row.usps_address.as_deref())
                .bind(row.usps_city.as_deref())
                .bind(row.usps_zip.as_deref())
                .bind(row.usps_zip4.as_deref())
                .bind(row.business)
                .bind(row.address_mismatch)
                .bind(row.flag_vacancy)
                .bind(row.vacancy_confidence)
                .bind(&row.parcel_id)
                .bind(&row.county)
                .execute(&mut *tx)
                .await
                .context("vacancy row update failed")?;
            } else if row.transient_error {
                sqlx::query(
                    r#"
                    UPDATE gis_parcels_core SET
                        usps_error = $1,
                        flag_vacancy = FALSE,
                        vacancy_confidence = NULL
                    WHERE parcel_id = $2 AND county = $3
                    "#,
                )
                .bind(row.error.as_deref())
                .bind(&row.parcel_id)
                .bind(&row.county)
                .execute(&mut *tx)
                .await
                .context("vacancy transient-error update failed")?;
            } else {
                // Permanent errors stamp the check date so known-bad
                // addresses are not re-probed against the quota.
                sqlx::query(
                    r#"
                    UPDATE gis_parcels_core SET
                        usps_error = $1,
                        usps_check_date = NOW(),
                        flag_vacancy = FALSE,
                        vacancy_confidence = NULL
                    WHERE parcel_id = $2 AND county = $3
                    "#,
                )
                .bind(row.error.as_deref())
                .bind(&row.parcel_id)
                .bind(&row.county)
                .execute(&mut *tx)
                .await
                .context("vacancy permanent-error update failed")?;
            }
        }
        tx.commit().await.context("vacancy flush commit failed")?;
    }
    Ok(results.len())
}

pub async fn get_planet_scan_date(
    pool: &PgPool,
    parcel_id: &str,
    county: &str,
) -> Result<Option<NaiveDateTime>> {
    let row: Option<(Option<NaiveDateTime>,)> = sqlx::query_as(
        r#"
        SELECT planet_scan_date FROM gis_parcels_core
        WHERE parcel_id = $1 AND county = $2
        "#,
    )
    .bind(parcel_id)
    .bind(county)
    .fetch_optional(pool)
    .await
    .context("failed reading high-res scan date")?;
    Ok(row.and_then(|(date,)| date))
}

#[derive(Debug, Clone)]
pub struct PlanetUpdate {
    pub parcel_id: String,
    pub county: String,
    pub scene_count: Option<i16>,
    pub change_score: Option<f64>,
    pub temporal_span: Option<i16>,
    pub latest_date: Option<String>,
    pub earliest_date: Option<String>,
    pub thumb_latest_url: Option<String>,
    pub thumb_earliest_url: Option<String>,
}

pub async fn update_parcel_planet(pool: &PgPool, row: &PlanetUpdate) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE gis_parcels_core SET
            planet_scan_date = NOW(),
            planet_scene_count = $1,
            planet_change_score = $2,
            planet_temporal_span = $3,
            planet_latest_date = $4,
            planet_earliest_date = $5,
            planet_thumb_latest_url = $6,
            planet_thumb_earliest_url = $7
        WHERE parcel_id = $8 AND county = $9
        "#,
    )
    .bind(row.scene_count)
    .bind(row.change_score)
    .bind(row.temporal_span)
    .bind(row.latest_date.as_deref())
    .bind(row.earliest_date.as_deref())
    .bind(row.thumb_latest_url.as_deref())
    .bind(row.thumb_earliest_url.as_deref())
    .bind(&row.parcel_id)
    .bind(&row.county)
    .execute(pool)
    .await
    .context("failed persisting high-res results")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ConvictionUpdate {
    pub parcel_id: String,
    pub county: String,
    pub conviction_score: Option<f64>,
    pub conviction_base_score: Option<f64>,
    pub conviction_vacancy_bonus: Option<f64>,
    pub conviction_mc_score: Option<f64>,
    pub conviction_mc_signals: Option<i32>,
    pub conviction_mc_codes: Option<String>,
    pub conviction_components: Option<String>,
}

pub async fn batch_update_conviction(
    conn: &mut PgConnection,
    results: &[ConvictionUpdate],
) -> Result<usize> {
    for chunk in results.chunks(CHUNK_SIZE) {
        let mut tx = sqlx::Connection::begin(&mut *conn)
            .await
            .context("failed to begin conviction flush transaction")?;
        for row in chunk {
            sqlx::query(
                r#"
                UPDATE gis_parcels_core SET
                    conviction_score = $1,
                    conviction_base_score = $2,
                    conviction_vacancy_bonus = $3,
                    conviction_mc_score = $4,
                    conviction_mc_signals = $5,
                    conviction_mc_codes = $6,
                    conviction_components = $7,
                    conviction_date = NOW()
                WHERE parcel_id = $8 AND county = $9
                "#,
            )
            .bind(row.conviction_score)
            .bind(row.conviction_base_score)
            .bind(row.conviction_vacancy_bonus)
            .bind(row.conviction_mc_score)
            .bind(row.conviction_mc_signals)
            .bind(row.conviction_mc_codes.as_deref())
            .bind(row.conviction_components.as_deref())
            .bind(&row.parcel_id)
            .bind(&row.county)
            .execute(&mut *tx)
            .await
            .context("conviction row update failed")?;
        }
        tx.commit().await.context("conviction flush commit failed")?;
    }
    Ok(results.len())
}

/// Filter set accepted by the read endpoint.
#[derive(Debug, Clone, Default)]
pub struct ParcelFilters {
    pub county: Option<String>,
    pub state: Option<String>,
    pub property_class: Option<String>,
    pub zip: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub min_sqft: Option<f64>,
    pub max_sqft: Option<f64>,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    pub fema_zone: Option<String>,
    pub flag_veg: Option<bool>,
    pub flag_flood: Option<bool>,
    pub flag_structural: Option<bool>,
    pub flag_neglect: Option<bool>,
    pub flag_vacancy: Option<bool>,
    pub scanned_only: bool,
    pub sort: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

const SORTABLE: [&str; 6] = [
    "distress_score",
    "distress_composite",
    "conviction_score",
    "ndvi_score",
    "scan_date",
    "total_value",
];

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ParcelDetailRow {
    pub parcel_id: String,
    pub county: String,
    pub state_code: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub situs_address: Option<String>,
    pub property_class: Option<String>,
    pub total_value: Option<f64>,
    pub ndvi_score: Option<f64>,
    pub ndvi_date: Option<String>,
    pub ndvi_category: Option<String>,
    pub fema_zone: Option<String>,
    pub fema_risk: Option<String>,
    pub fema_sfha: Option<bool>,
    pub distress_score: Option<f64>,
    pub distress_flags: Option<String>,
    pub flag_veg: Option<bool>,
    pub flag_flood: Option<bool>,
    pub flag_structural: Option<bool>,
    pub flag_neglect: Option<bool>,
    pub veg_confidence: Option<f64>,
    pub flood_confidence: Option<f64>,
    pub scan_date: Option<NaiveDateTime>,
    pub scan_pass: Option<i16>,
    pub sentinel_worthy: Option<bool>,
    pub ndvi_slope_5yr: Option<f64>,
    pub ndvi_slope_pctile: Option<f64>,
    pub distress_composite: Option<f64>,
    pub sentinel_trend_direction: Option<String>,
    pub sentinel_trend_slope: Option<f64>,
    pub sentinel_latest_ndvi: Option<f64>,
    pub sentinel_months_data: Option<i16>,
    pub sentinel_mean_ndvi: Option<f64>,
    pub sentinel_data_source: Option<String>,
    pub sentinel_scan_date: Option<NaiveDateTime>,
    pub usps_vacant: Option<bool>,
    pub usps_dpv_confirmed: Option<bool>,
    pub usps_address: Option<String>,
    pub usps_city: Option<String>,
    pub usps_zip: Option<String>,
    pub usps_zip4: Option<String>,
    pub usps_address_mismatch: Option<bool>,
    pub usps_check_date: Option<NaiveDateTime>,
    pub flag_vacancy: Option<bool>,
    pub vacancy_confidence: Option<f64>,
    pub planet_scene_count: Option<i16>,
    pub planet_change_score: Option<f64>,
    pub planet_latest_date: Option<String>,
    pub planet_thumb_latest_url: Option<String>,
    pub planet_scan_date: Option<NaiveDateTime>,
    pub conviction_score: Option<f64>,
    pub conviction_base_score: Option<f64>,
    pub conviction_vacancy_bonus: Option<f64>,
    pub conviction_mc_score: Option<f64>,
    pub conviction_mc_signals: Option<i32>,
    pub conviction_mc_codes: Option<String>,
    pub conviction_components: Option<String>,
}

pub async fn query_parcels(pool: &PgPool, filters: &ParcelFilters) -> Result<Vec<ParcelDetailRow>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        SELECT parcel_id, county, state_code,
               latitude::float8 AS latitude, longitude::float8 AS longitude,
               situs_address, property_class, total_value::float8 AS total_value,
               ndvi_score::float8 AS ndvi_score, ndvi_date, ndvi_category,
               fema_zone, fema_risk, fema_sfha,
               distress_score::float8 AS distress_score, distress_flags,
               flag_veg, flag_flood, flag_structural, flag_neglect,
               veg_confidence::float8 AS veg_confidence,
               flood_confidence::float8 AS flood_confidence,
               scan_date, scan_pass, sentinel_worthy,
               ndvi_slope_5yr::float8 AS ndvi_slope_5yr,
               ndvi_slope_pctile::float8 AS ndvi_slope_pctile,
               distress_composite::float8 AS distress_composite,
               sentinel_trend_direction,
               sentinel_trend_slope::float8 AS sentinel_trend_slope,
               sentinel_latest_ndvi::float8 AS sentinel_latest_ndvi,
               sentinel_months_data,
               sentinel_mean_ndvi::float8 AS sentinel_mean_ndvi,
               sentinel_data_source, sentinel_scan_date,
               usps_vacant, usps_dpv_confirmed, usps_address, usps_city,
               usps_zip, usps_zip4, usps_address_mismatch, usps_check_date,
               flag_vacancy, vacancy_confidence::float8 AS vacancy_confidence,
               planet_scene_count, planet_change_score::float8 AS planet_change_score,
               planet_latest_date, planet_thumb_latest_url, planet_scan_date,
               conviction_score::float8 AS conviction_score,
               conviction_base_score::float8 AS conviction_base_score,
               conviction_vacancy_bonus::float8 AS conviction_vacancy_bonus,
               conviction_mc_score::float8 AS conviction_mc_score,
               conviction_mc_signals, conviction_mc_codes, conviction_components
        FROM gis_parcels_core
        WHERE 1 = 1"#,
    );

    if let Some(county) = &filters.county {
        qb.push(" AND county = ").push_bind(county.clone());
    }
    if let Some(state) = &filters.state {
        qb.push(" AND state_code = ").push_bind(state.clone());
    }
    if let Some(class) = &filters.property_class {
        qb.push(" AND property_class = ").push_bind(class.clone());
    }
    if let Some(zip) = &filters.zip {
        let prefix: String = zip.chars().take(5).collect();
        qb.push(" AND SUBSTRING(mailing_zip FROM 1 FOR 5) = ")
            .push_bind(prefix);
    }
    if let Some(min) = filters.min_value {
        qb.push(" AND total_value >= ").push_bind(min);
    }
    if let Some(max) = filters.max_value {
        qb.push(" AND total_value <= ").push_bind(max);
    }
    if let Some(min) = filters.min_sqft {
        qb.push(" AND sqft >= ").push_bind(min);
    }
    if let Some(max) = filters.max_sqft {
        qb.push(" AND sqft <= ").push_bind(max);
    }
    if let Some(min) = filters.min_score {
        qb.push(" AND distress_score >= ").push_bind(min);
    }
    if let Some(max) = filters.max_score {
        qb.push(" AND distress_score <= ").push_bind(max);
    }
    if let Some(zone) = &filters.fema_zone {
        qb.push(" AND fema_zone = ").push_bind(zone.clone());
    }
    for (column, value) in [
        ("flag_veg", filters.flag_veg),
        ("flag_flood", filters.flag_flood),
        ("flag_structural", filters.flag_structural),
        ("flag_neglect", filters.flag_neglect),
        ("flag_vacancy", filters.flag_vacancy),
    ] {
        if let Some(value) = value {
            qb.push(format!(" AND {column} = ")).push_bind(value);
        }
    }
    if filters.scanned_only {
        qb.push(" AND scan_date IS NOT NULL");
    }

    // Sort column is allow-listed; anything else falls back to identity
    // order so user input never reaches the SQL text.
    let sort = filters
        .sort
        .as_deref()
        .filter(|s| SORTABLE.contains(s))
        .unwrap_or("parcel_id");
    if sort == "parcel_id" {
        qb.push(" ORDER BY parcel_id");
    } else {
        qb.push(format!(" ORDER BY {sort} DESC NULLS LAST"));
    }

    qb.push(" LIMIT ").push_bind(filters.limit.clamp(1, 1000));
    qb.push(" OFFSET ").push_bind(filters.offset.max(0));

    qb.build_query_as()
        .fetch_all(pool)
        .await
        .context("parcel filter query failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_allow_list_rejects_unknown_columns() {
        assert!(SORTABLE.contains(&"conviction_score"));
        assert!(!SORTABLE.contains(&"parcel_id; DROP TABLE gis_parcels_core"));
    }
}
