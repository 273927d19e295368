use anyhow::{Context, Result};
use sqlx::types::Json as SqlJson;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::services::scoring::MODEL_VERSION;
use crate::services::usps::VacancyRecord;

/// Get or create the county row, returning its UUID.
pub async fn ensure_county(pool: &PgPool, name: &str, state_code: &str) -> Result<Uuid> {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO counties (name, state_code)
        VALUES ($1, $2)
        ON CONFLICT (name, state_code) DO UPDATE SET name = EXCLUDED.name
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(state_code)
    .fetch_one(pool)
    .await
    .context("failed ensuring county row")?;
    Ok(id)
}

/// Sync one parcel from the GIS table into the shared parcels table so the
/// audit row has a UUID to reference.
pub async fn sync_parcel_from_gis(
    pool: &PgPool,
    county_id: Uuid,
    county_name: &str,
    parcel_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO parcels (county_id, parcel_id, owner_name, address_full)
        SELECT $1, gpc.parcel_id, gpc.owner_name, gpc.situs_address
        FROM gis_parcels_core gpc
        WHERE gpc.county = $2 AND gpc.parcel_id = $3
        ON CONFLICT (county_id, parcel_id) DO UPDATE SET
            owner_name = COALESCE(EXCLUDED.owner_name, parcels.owner_name),
            address_full = COALESCE(EXCLUDED.address_full, parcels.address_full)
        "#,
    )
    .bind(county_id)
    .bind(county_name)
    .bind(parcel_id)
    .execute(pool)
    .await
    .context("failed syncing parcel into shared table")?;
    Ok(())
}

pub async fn parcel_uuid(pool: &PgPool, county_id: Uuid, parcel_id: &str) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT id FROM parcels
        WHERE county_id = $1 AND parcel_id = $2
        "#,
    )
    .bind(county_id)
    .bind(parcel_id)
    .fetch_optional(pool)
    .await
    .context("failed resolving parcel uuid")?;
    Ok(row.map(|(id,)| id))
}

/// Append one row to the shared vacancy audit log. Best-effort: any failure
/// is logged and swallowed so it never blocks the parcel update.
pub async fn save_vacancy_audit(
    pool: &PgPool,
    county: &str,
    state: &str,
    parcel_id: &str,
    record: &VacancyRecord,
    account: u8,
) {
    let result = async {
        let county_id = ensure_county(pool, county, state).await?;
        sync_parcel_from_gis(pool, county_id, county, parcel_id).await?;
        let Some(uuid) = parcel_uuid(pool, county_id, parcel_id).await? else {
            anyhow::bail!("parcel {parcel_id} not present in shared parcels table");
        };

        sqlx::query(
            r#"
            INSERT INTO usps_vacancy_checks (
                parcel_id, input_address, input_state,
                usps_address, usps_city, usps_state, usps_zip, usps_zip4,
                vacant, dpv_confirmed, business, address_mismatch,
                account, error, raw_response
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(uuid)
        .bind(&record.street_address)
        .bind(record.state.as_deref())
        .bind(record.usps_address.as_deref())
        .bind(record.usps_city.as_deref())
        .bind(record.usps_state.as_deref())
        .bind(record.usps_zip.as_deref())
        .bind(record.usps_zip4.as_deref())
        .bind(record.vacant)
        .bind(record.dpv_confirmed)
        .bind(record.business)
        .bind(record.address_mismatch)
        .bind(account as i16)
        .bind(record.error.as_deref())
        .bind(record.raw_response.clone().map(SqlJson))
        .execute(pool)
        .await
        .context("audit insert failed")?;
        Ok::<(), anyhow::Error>(())
    }
    .await;

    if let Err(err) = result {
        tracing::warn!(parcel_id, error = %err, "vacancy audit write skipped");
    }
}

/// One parcel's conviction inputs: the composite, vacancy facts, and the
/// motivation-signal aggregate.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConvictionInputRow {
    pub parcel_id: String,
    pub distress_composite: Option<f64>,
    pub flag_vacancy: Option<bool>,
    pub vacancy_confidence: Option<f64>,
    pub usps_error: Option<String>,
    pub mc_raw_score: f64,
    pub mc_signal_count: i64,
    pub mc_signal_codes: Option<String>,
}

/// Fetch conviction inputs for every parcel of a county.
///
/// Motivation signals are joined strictly through the
/// `(county_name, state_code)` compound key: bare parcel_id collides across
/// counties (about 1,870 observed collisions), so the parcels join is scoped
/// to the county row first.
pub async fn fetch_conviction_inputs(
    pool: &PgPool,
    county: &str,
    state: &str,
) -> Result<Vec<ConvictionInputRow>> {
    sqlx::query_as(
        r#"
        SELECT
            g.parcel_id,
            g.distress_composite::float8 AS distress_composite,
            g.flag_vacancy,
            g.vacancy_confidence::float8 AS vacancy_confidence,
            g.usps_error,
            COALESCE(SUM(st.base_weight * LEAST(GREATEST(ps.confidence, 0), 1)), 0)::float8
                AS mc_raw_score,
            COUNT(ps.id) AS mc_signal_count,
            STRING_AGG(DISTINCT st.code, ',' ORDER BY st.code) AS mc_signal_codes
        FROM gis_parcels_core g
        JOIN counties c
            ON lower(c.name) = lower(g.county)
            AND c.state_code = g.state_code
        LEFT JOIN parcels p
            ON p.county_id = c.id
            AND p.parcel_id = g.parcel_id
        LEFT JOIN parcel_signals ps
            ON ps.parcel_id = p.id
            AND ps.is_active = true
            AND (ps.expires_at IS NULL OR ps.expires_at > NOW())
        LEFT JOIN signal_types st
            ON st.id = ps.signal_type_id
            AND st.is_active = true
        WHERE g.county = $1 AND g.state_code = $2
        GROUP BY g.parcel_id, g.distress_composite, g.flag_vacancy,
                 g.vacancy_confidence, g.usps_error
        "#,
    )
    .bind(county)
    .bind(state)
    .fetch_all(pool)
    .await
    .context("failed fetching conviction inputs")
}

#[derive(Debug, Clone)]
pub struct MotivationBackfillRow {
    pub parcel_id: String,
    pub mc_raw_score: f64,
    pub mc_signal_count: i64,
    pub mc_signal_codes: Option<String>,
}

/// Rewrite the motivation-score backfill for one county.
///
/// The table's uniqueness key is `(parcel_id, computed_at)`, not parcel_id
/// alone, so ON CONFLICT upserts cannot express "replace the county's
/// scores". A county-scoped DELETE followed by INSERT inside one transaction
/// gives the same result.
pub async fn backfill_motivation_scores(
    conn: &mut PgConnection,
    county: &str,
    state: &str,
    rows: &[MotivationBackfillRow],
) -> Result<(u64, usize)> {
    let mut tx = sqlx::Connection::begin(&mut *conn)
        .await
        .context("failed to begin motivation backfill transaction")?;

    let deleted = sqlx::query(
        r#"
        DELETE FROM motivation_scores WHERE parcel_id IN (
            SELECT p.id FROM parcels p
            JOIN counties c ON p.county_id = c.id
            WHERE lower(c.name) = lower($1) AND c.state_code = $2
        )
        "#,
    )
    .bind(county)
    .bind(state)
    .execute(&mut *tx)
    .await
    .context("motivation score delete failed")?
    .rows_affected();

    let mut inserted = 0usize;
    for row in rows {
        if row.mc_signal_count == 0 {
            continue;
        }
        let breakdown = serde_json::json!({
            "signals": row
                .mc_signal_codes
                .as_deref()
                .unwrap_or_default()
                .split(',')
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>(),
            "raw_score": row.mc_raw_score,
            "model": MODEL_VERSION,
        });
        sqlx::query(
            r#"
            INSERT INTO motivation_scores (parcel_id, total_score, signal_count, score_breakdown, computed_at)
            SELECT p.id, $1, $2, $3, NOW()
            FROM parcels p
            JOIN counties c ON p.county_id = c.id
            WHERE p.parcel_id = $4
              AND lower(c.name) = lower($5)
              AND c.state_code = $6
            "#,
        )
        .bind(row.mc_raw_score)
        .bind(row.mc_signal_count as i32)
        .bind(SqlJson(breakdown))
        .bind(&row.parcel_id)
        .bind(county)
        .bind(state)
        .execute(&mut *tx)
        .await
        .context("motivation score insert failed")?;
        inserted += 1;
    }

    tx.commit()
        .await
        .context("motivation backfill commit failed")?;
    Ok((deleted, inserted))
}
