use anyhow::{Context, Result};
use sqlx::PgPool;
use std::collections::HashSet;

const PARCEL_TABLE: &str = "gis_parcels_core";

/// Named column groups, one per enrichment band. Each group runs
/// idempotently at process start.
struct ColumnGroup {
    name: &'static str,
    columns: &'static [(&'static str, &'static str)],
}

const SCAN_GROUP: ColumnGroup = ColumnGroup {
    name: "scan",
    columns: &[
        ("ndvi_score", "REAL"),
        ("ndvi_date", "TEXT"),
        ("ndvi_category", "TEXT"),
        ("fema_zone", "TEXT"),
        ("fema_risk", "TEXT"),
        ("fema_sfha", "BOOLEAN"),
        ("distress_score", "REAL"),
        ("distress_flags", "TEXT"),
        ("flag_veg", "BOOLEAN DEFAULT FALSE"),
        ("flag_flood", "BOOLEAN DEFAULT FALSE"),
        ("flag_structural", "BOOLEAN DEFAULT FALSE"),
        ("flag_neglect", "BOOLEAN DEFAULT FALSE"),
        ("veg_confidence", "REAL"),
        ("flood_confidence", "REAL"),
        ("scan_date", "TIMESTAMP"),
        ("scan_pass", "SMALLINT"),
        ("sentinel_worthy", "BOOLEAN DEFAULT FALSE"),
        ("scan_error", "TEXT"),
    ],
};

const COMPOSITE_GROUP: ColumnGroup = ColumnGroup {
    name: "composite",
    columns: &[
        ("ndvi_slope_5yr", "REAL"),
        ("ndvi_slope_pctile", "REAL"),
        ("ndvi_history_count", "SMALLINT"),
        ("ndvi_history_years", "TEXT"),
        ("distress_composite", "REAL"),
        ("composite_date", "TIMESTAMP"),
    ],
};

const SATELLITE_GROUP: ColumnGroup = ColumnGroup {
    name: "satellite",
    columns: &[
        ("sentinel_trend_direction", "TEXT"),
        ("sentinel_trend_slope", "REAL"),
        ("sentinel_latest_ndvi", "REAL"),
        ("sentinel_months_data", "SMALLINT"),
        ("sentinel_mean_ndvi", "REAL"),
        ("sentinel_data_source", "TEXT"),
        ("sentinel_chart_url", "TEXT"),
        ("sentinel_scan_date", "TIMESTAMP"),
    ],
};

const VACANCY_GROUP: ColumnGroup = ColumnGroup {
    name: "vacancy",
    columns: &[
        ("usps_vacant", "BOOLEAN"),
        ("usps_dpv_confirmed", "BOOLEAN"),
        ("usps_address", "TEXT"),
        ("usps_city", "TEXT"),
        ("usps_zip", "TEXT"),
        ("usps_zip4", "TEXT"),
        ("usps_business", "BOOLEAN"),
        ("usps_address_mismatch", "BOOLEAN"),
        ("usps_check_date", "TIMESTAMP"),
        ("usps_error", "TEXT"),
        ("flag_vacancy", "BOOLEAN DEFAULT FALSE"),
        ("vacancy_confidence", "REAL"),
    ],
};

const PLANET_GROUP: ColumnGroup = ColumnGroup {
    name: "high-res",
    columns: &[
        ("planet_scene_count", "SMALLINT"),
        ("planet_change_score", "REAL"),
        ("planet_temporal_span", "SMALLINT"),
        ("planet_latest_date", "TEXT"),
        ("planet_earliest_date", "TEXT"),
        ("planet_thumb_latest_url", "TEXT"),
        ("planet_thumb_earliest_url", "TEXT"),
        ("planet_scan_date", "TIMESTAMP"),
    ],
};

const CONVICTION_GROUP: ColumnGroup = ColumnGroup {
    name: "conviction",
    columns: &[
        ("conviction_score", "REAL"),
        ("conviction_base_score", "REAL"),
        ("conviction_vacancy_bonus", "REAL"),
        ("conviction_mc_score", "REAL"),
        ("conviction_mc_signals", "INTEGER"),
        ("conviction_mc_codes", "TEXT"),
        ("conviction_components", "TEXT"),
        ("conviction_date", "TIMESTAMP"),
    ],
};

const GROUPS: [&ColumnGroup; 6] = [
    &SCAN_GROUP,
    &COMPOSITE_GROUP,
    &SATELLITE_GROUP,
    &VACANCY_GROUP,
    &PLANET_GROUP,
    &CONVICTION_GROUP,
];

/// Run every migration group. Long-running scans hold row locks on the
/// parcel table, so the column catalog is consulted first: a group whose
/// columns all exist issues no DDL at all (ALTER TABLE would queue behind an
/// ACCESS EXCLUSIVE lock and deadlock against them).
pub async fn run_all(pool: &PgPool) -> Result<()> {
    let existing = existing_columns(pool).await?;

    for group in GROUPS {
        let missing: Vec<&(&str, &str)> = group
            .columns
            .iter()
            .filter(|(name, _)| !existing.contains(*name))
            .collect();

        if missing.is_empty() {
            tracing::debug!(group = group.name, "migration group already applied");
            continue;
        }

        for (name, col_type) in &missing {
            let ddl = format!(
                r#"
                DO $$ BEGIN
                    ALTER TABLE {PARCEL_TABLE} ADD COLUMN {name} {col_type};
                EXCEPTION WHEN duplicate_column THEN NULL;
                END $$;
                "#
            );
            sqlx::query(&ddl)
                .execute(pool)
                .await
                .with_context(|| format!("failed adding column {name}"))?;
        }
        tracing::info!(
            group = group.name,
            columns_added = missing.len(),
            "migration group applied"
        );
    }

    create_indexes(pool).await?;
    create_shared_tables(pool).await?;
    Ok(())
}

async fn existing_columns(pool: &PgPool) -> Result<HashSet<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT column_name FROM information_schema.columns
        WHERE table_name = $1
        "#,
    )
    .bind(PARCEL_TABLE)
    .fetch_all(pool)
    .await
    .context("failed to read column catalog")?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

async fn create_indexes(pool: &PgPool) -> Result<()> {
    let simple: [(&str, &str); 11] = [
        ("idx_gpc_ndvi_score", "ndvi_score"),
        ("idx_gpc_distress_score", "distress_score"),
        ("idx_gpc_fema_zone", "fema_zone"),
        ("idx_gpc_flag_veg", "flag_veg"),
        ("idx_gpc_flag_flood", "flag_flood"),
        ("idx_gpc_flag_neglect", "flag_neglect"),
        ("idx_gpc_scan_date", "scan_date"),
        ("idx_gpc_sentinel_scan_date", "sentinel_scan_date"),
        ("idx_gpc_sentinel_trend", "sentinel_trend_direction"),
        ("idx_gpc_usps_vacant", "usps_vacant"),
        ("idx_gpc_usps_check_date", "usps_check_date"),
    ];
    for (name, column) in simple {
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {name} ON {PARCEL_TABLE} ({column})"
        ))
        .execute(pool)
        .await
        .with_context(|| format!("failed creating index {name}"))?;
    }

    // Sorted-read index for the conviction leaderboard.
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_gpc_conviction_score \
         ON {PARCEL_TABLE} (conviction_score DESC NULLS LAST)"
    ))
    .execute(pool)
    .await?;

    // Pending-work queues.
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_gpc_slope_pending \
         ON {PARCEL_TABLE} (parcel_id) \
         WHERE ndvi_score IS NOT NULL AND ndvi_slope_5yr IS NULL"
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_gpc_sentinel_pending \
         ON {PARCEL_TABLE} (distress_score DESC NULLS LAST) \
         WHERE sentinel_worthy = TRUE AND sentinel_scan_date IS NULL"
    ))
    .execute(pool)
    .await?;

    Ok(())
}

/// The vacancy audit table and motivation-score backfill table are shared
/// with the motivation-signal producer; creation is a no-op when it already
/// provisioned them.
async fn create_shared_tables(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usps_vacancy_checks (
            id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            parcel_id       UUID NOT NULL REFERENCES parcels(id),
            checked_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            input_address   TEXT NOT NULL,
            input_state     TEXT,
            usps_address    TEXT,
            usps_city       TEXT,
            usps_state      TEXT,
            usps_zip        TEXT,
            usps_zip4       TEXT,
            vacant          BOOLEAN,
            dpv_confirmed   BOOLEAN,
            business        BOOLEAN,
            address_mismatch BOOLEAN DEFAULT false,
            account         SMALLINT,
            error           TEXT,
            raw_response    JSONB
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed ensuring vacancy audit table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_usps_vacancy_checks_parcel_date
        ON usps_vacancy_checks (parcel_id, checked_at DESC)
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_usps_vacancy_checks_vacant
        ON usps_vacancy_checks (vacant) WHERE vacant = true
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS motivation_scores (
            id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            parcel_id       UUID NOT NULL REFERENCES parcels(id),
            total_score     REAL NOT NULL,
            signal_count    INTEGER NOT NULL,
            score_breakdown JSONB,
            computed_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (parcel_id, computed_at)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed ensuring motivation_scores table")?;

    Ok(())
}
