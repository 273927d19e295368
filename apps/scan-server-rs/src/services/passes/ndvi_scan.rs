use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use super::{FlagRollup, PassSummary};
use crate::db;
use crate::services::flags::{generate_flags, AerialEvidence, EvidenceBundle};
use crate::services::scoring::distress_score;
use crate::state::AppState;
use crate::store::parcels::{
    batch_update_scan_results, select_unscanned, Pass1Candidate, Pass1Update,
};

// A parcel is worth a satellite request when Pass 1 saw real vegetation
// density, any flag fired, or the weighted score cleared the floor.
const SENTINEL_WORTHY_NDVI: f64 = 0.50;
const SENTINEL_WORTHY_SCORE: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct Pass1Options {
    pub county: String,
    pub state: String,
    pub property_class: Option<String>,
    pub limit: Option<i64>,
    pub workers: usize,
    pub flush_every: usize,
    pub dry_run: bool,
}

/// Pass 1: bulk NDVI + flood over every unscanned parcel with coordinates.
/// Ten workers share one HTTP session; results flush in committed chunks on
/// fresh connections, so cancellation at any point leaves the table
/// consistent and the pass resumable.
pub async fn run(
    state: &AppState,
    opts: &Pass1Options,
    cancel: CancellationToken,
) -> Result<PassSummary> {
    let candidates = select_unscanned(
        &state.db,
        &opts.county,
        &opts.state,
        opts.property_class.as_deref(),
        opts.limit,
    )
    .await?;
    let total = candidates.len();
    tracing::info!(
        county = %opts.county,
        state = %opts.state,
        total,
        workers = opts.workers,
        "bulk scan starting"
    );
    if total == 0 {
        return Ok(PassSummary::default());
    }

    let semaphore = Arc::new(Semaphore::new(opts.workers.max(1)));
    let buffer: Arc<Mutex<Vec<Pass1Update>>> = Arc::new(Mutex::new(Vec::new()));
    let mut summary = PassSummary::default();
    let mut join_set = tokio::task::JoinSet::new();

    for candidate in candidates {
        if cancel.is_cancelled() {
            summary.skipped += 1;
            continue;
        }
        let permit = semaphore.clone().acquire_owned().await?;
        let app = state.clone();
        let buffer_task = buffer.clone();
        join_set.spawn(async move {
            let _permit = permit;
            let update = scan_one(&app, &candidate).await;
            let had_error = update.scan_error.is_some();
            let flagged = update.distress_flags.is_some();
            buffer_task.lock().await.push(update);
            (had_error, flagged)
        });

        // Opportunistic flush whenever the buffer clears the threshold.
        maybe_flush(state, &buffer, opts.flush_every, opts.dry_run, false).await?;

        while let Some(joined) = join_set.try_join_next() {
            tally(&mut summary, Some(joined));
        }
    }

    while let Some(joined) = join_set.join_next().await {
        tally(&mut summary, Some(joined));
    }

    // Final flush regardless of threshold.
    maybe_flush(state, &buffer, opts.flush_every, opts.dry_run, true).await?;

    tracing::info!(county = %opts.county, %summary, "bulk scan complete");
    Ok(summary)
}

fn tally(
    summary: &mut PassSummary,
    joined: Option<Result<(bool, bool), tokio::task::JoinError>>,
) {
    match joined {
        Some(Ok((had_error, flagged))) => {
            if had_error {
                summary.errors += 1;
            } else {
                summary.scanned += 1;
            }
            if flagged {
                summary.flagged += 1;
            }
        }
        Some(Err(err)) => {
            tracing::warn!(error = %err, "scan worker panicked");
            summary.errors += 1;
        }
        None => {}
    }
}

/// One parcel: aerial-fast + flood, evaluate flags, compute the score.
/// Upstream failures produce an error row so the parcel is marked scanned
/// and the batch keeps moving.
async fn scan_one(state: &AppState, candidate: &Pass1Candidate) -> Pass1Update {
    let clients = &state.clients;
    let scan_date = Utc::now().naive_utc();

    let aerial = clients
        .naip
        .ndvi_fast(candidate.latitude, candidate.longitude)
        .await;

    let mut flood_error = None;
    let flood = match clients
        .fema
        .query_flood_zone(candidate.latitude, candidate.longitude)
        .await
    {
        Ok(zone) => Some(zone),
        Err(err) => {
            tracing::debug!(parcel_id = %candidate.parcel_id, error = %err, "flood lookup skipped");
            flood_error = Some(format!("fema: {err:#}"));
            None
        }
    };

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
    let rollup = FlagRollup::from_flags(&flags);

    let sentinel_worthy = aerial.ndvi.is_some_and(|v| v > SENTINEL_WORTHY_NDVI)
        || score >= SENTINEL_WORTHY_SCORE
        || rollup.flag_neglect
        || !flags.is_empty();

    // Any failed source sets the per-parcel error column. The scan date
    // still lands so the pass does not re-select the parcel forever.
    let scan_error = aerial.error.clone().or(flood_error);

    Pass1Update {
        parcel_id: candidate.parcel_id.clone(),
        county: candidate.county.clone(),
        ndvi_score: aerial.ndvi,
        ndvi_date: aerial.acquisition_date.clone(),
        ndvi_category: crate::services::naip::categorize_ndvi(aerial.ndvi).to_string(),
        fema_zone: flood.as_ref().and_then(|z| z.flood_zone.clone()),
        fema_risk: flood.as_ref().map(|z| z.risk.as_str().to_string()),
        fema_sfha: flood.as_ref().is_some_and(|z| z.is_sfha),
        distress_score: Some(score),
        distress_flags: rollup.distress_flags,
        flag_veg: rollup.flag_veg,
        flag_flood: rollup.flag_flood,
        flag_structural: rollup.flag_structural,
        flag_neglect: rollup.flag_neglect,
        veg_confidence: rollup.veg_confidence,
        flood_confidence: rollup.flood_confidence,
        scan_date,
        sentinel_worthy,
        scan_error,
    }
}

/// Drain and persist the buffer when it clears the threshold (or at the
/// final flush). A fresh connection per flush; one retry on transient
/// failure, then the chunk fails.
async fn maybe_flush(
    state: &AppState,
    buffer: &Arc<Mutex<Vec<Pass1Update>>>,
    flush_every: usize,
    dry_run: bool,
    force: bool,
) -> Result<()> {
    let batch = {
        let mut guard = buffer.lock().await;
        if guard.is_empty() || (!force && guard.len() < flush_every) {
            return Ok(());
        }
        std::mem::take(&mut *guard)
    };

    if dry_run {
        for row in &batch {
            tracing::info!(
                parcel_id = %row.parcel_id,
                ndvi = ?row.ndvi_score,
                score = ?row.distress_score,
                flags = row.distress_flags.as_deref().unwrap_or("-"),
                "dry run"
            );
        }
        return Ok(());
    }

    let url = &state.config.database_url;
    let first = {
        let mut conn = db::connect_flush(url).await?;
        batch_update_scan_results(&mut conn, &batch).await
    };
    match first {
        Ok(written) => {
            tracing::info!(batch = batch.len(), written, "scan buffer flushed");
            Ok(())
        }
        Err(err) => {
            tracing::warn!(error = %err, "scan flush failed, retrying on a fresh connection");
            let mut conn = db::connect_flush(url).await?;
            let written = batch_update_scan_results(&mut conn, &batch).await?;
            tracing::info!(batch = batch.len(), written, "scan buffer flushed on retry");
            Ok(())
        }
    }
}
