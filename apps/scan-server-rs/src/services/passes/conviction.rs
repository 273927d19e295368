use anyhow::Result;
use tokio_util::sync::CancellationToken;

use super::PassSummary;
use crate::db;
use crate::services::scoring::{conviction, ConvictionInput};
use crate::state::AppState;
use crate::store::parcels::{batch_update_conviction, ConvictionUpdate};
use crate::store::signals::{
    backfill_motivation_scores, fetch_conviction_inputs, ConvictionInputRow,
    MotivationBackfillRow,
};

#[derive(Debug, Clone)]
pub struct ConvictionOptions {
    pub county: String,
    pub state: String,
    pub dry_run: bool,
    pub skip_motivation_backfill: bool,
}

/// Pass 2.5: fuse the composite, motivation signals, and carrier vacancy
/// into the conviction band for one county, then rewrite the county's
/// motivation-score backfill.
pub async fn run(
    state: &AppState,
    opts: &ConvictionOptions,
    cancel: CancellationToken,
) -> Result<PassSummary> {
    let rows = fetch_conviction_inputs(&state.db, &opts.county, &opts.state).await?;
    tracing::info!(
        county = %opts.county,
        parcels = rows.len(),
        with_mc = rows.iter().filter(|r| r.mc_signal_count > 0).count(),
        with_composite = rows.iter().filter(|r| r.distress_composite.is_some()).count(),
        "conviction fusion starting"
    );

    let mut summary = PassSummary::default();
    let mut updates = Vec::with_capacity(rows.len());
    for row in &rows {
        if cancel.is_cancelled() {
            summary.skipped += 1;
            continue;
        }
        updates.push(score_row(row, &opts.county));
        summary.scanned += 1;
    }
    summary.flagged = updates
        .iter()
        .filter(|u| u.conviction_score.is_some())
        .count();

    if opts.dry_run {
        let mut top: Vec<&ConvictionUpdate> = updates.iter().collect();
        top.sort_by(|a, b| {
            b.conviction_score
                .partial_cmp(&a.conviction_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for row in top.iter().take(10) {
            tracing::info!(
                parcel_id = %row.parcel_id,
                score = ?row.conviction_score,
                base = ?row.conviction_base_score,
                bonus = ?row.conviction_vacancy_bonus,
                components = row.conviction_components.as_deref().unwrap_or("-"),
                "dry run"
            );
        }
        return Ok(summary);
    }

    let url = &state.config.database_url;
    let written = {
        let mut conn = db::connect_flush(url).await?;
        batch_update_conviction(&mut conn, &updates).await?
    };
    tracing::info!(written, "conviction scores written");

    if !opts.skip_motivation_backfill {
        let backfill: Vec<MotivationBackfillRow> = rows
            .iter()
            .map(|row| MotivationBackfillRow {
                parcel_id: row.parcel_id.clone(),
                mc_raw_score: row.mc_raw_score,
                mc_signal_count: row.mc_signal_count,
                mc_signal_codes: row.mc_signal_codes.clone(),
            })
            .collect();
        let mut conn = db::connect_flush(url).await?;
        let (deleted, inserted) =
            backfill_motivation_scores(&mut conn, &opts.county, &opts.state, &backfill).await?;
        tracing::info!(deleted, inserted, "motivation scores backfilled");
    }

    tracing::info!(county = %opts.county, %summary, "conviction fusion complete");
    Ok(summary)
}

fn score_row(row: &ConvictionInputRow, county: &str) -> ConvictionUpdate {
    let result = conviction(&ConvictionInput {
        distress_composite: row.distress_composite,
        mc_raw: row.mc_raw_score,
        mc_count: row.mc_signal_count,
        flag_vacancy: row.flag_vacancy.unwrap_or(false),
        vacancy_confidence: row.vacancy_confidence,
        vacancy_error: row.usps_error.is_some(),
    });

    let has_mc = row.mc_signal_count > 0;
    ConvictionUpdate {
        parcel_id: row.parcel_id.clone(),
        county: county.to_string(),
        conviction_score: result.score,
        conviction_base_score: result.base,
        conviction_vacancy_bonus: Some(result.vacancy_bonus),
        conviction_mc_score: has_mc.then_some(row.mc_raw_score),
        conviction_mc_signals: has_mc.then_some(row.mc_signal_count as i32),
        conviction_mc_codes: row.mc_signal_codes.clone(),
        conviction_components: (!result.components.is_empty())
            .then(|| result.components.join(",")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_row(
        parcel_id: &str,
        composite: Option<f64>,
        mc_raw: f64,
        mc_count: i64,
    ) -> ConvictionInputRow {
        ConvictionInputRow {
            parcel_id: parcel_id.into(),
            distress_composite: composite,
            flag_vacancy: Some(false),
            vacancy_confidence: None,
            usps_error: None,
            mc_raw_score: mc_raw,
            mc_signal_count: mc_count,
            mc_signal_codes: (mc_count > 0).then(|| "absentee_owner,tax_delinquent".into()),
        }
    }

    #[test]
    fn ds_only_row_passes_composite_through() {
        let update = score_row(&input_row("p1", Some(7.59), 0.0, 0), "Gaston");
        assert_eq!(update.conviction_score, Some(7.59));
        assert_eq!(update.conviction_mc_score, None);
        assert_eq!(update.conviction_mc_signals, None);
        assert_eq!(update.conviction_components.as_deref(), Some("DS"));
    }

    #[test]
    fn unrankable_row_writes_nulls_not_zeros() {
        let update = score_row(&input_row("p2", None, 0.0, 0), "Gaston");
        assert_eq!(update.conviction_score, None);
        assert_eq!(update.conviction_base_score, None);
        assert_eq!(update.conviction_components, None);
    }

    #[test]
    fn same_parcel_id_in_two_counties_scores_independently() {
        // The aggregate query is county-scoped, so each county's row arrives
        // with its own MC aggregate; identical parcel_ids do not bleed.
        let gaston = score_row(&input_row("123456", Some(8.0), 3.5, 2), "Gaston");
        let meck = score_row(&input_row("123456", Some(4.0), 0.0, 0), "Mecklenburg");
        assert_ne!(gaston.conviction_score, meck.conviction_score);
        assert_eq!(meck.conviction_components.as_deref(), Some("DS"));
        assert_eq!(gaston.conviction_components.as_deref(), Some("DS,MC"));
    }
}
