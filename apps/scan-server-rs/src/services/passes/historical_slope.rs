use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use super::PassSummary;
use crate::db;
use crate::services::trends::ols_slope;
use crate::state::AppState;
use crate::store::parcels::{
    batch_update_slope_results, compute_composite_scores, select_needing_slope, SlopeCandidate,
    SlopeUpdate,
};

#[derive(Debug, Clone)]
pub struct SlopeOptions {
    pub county: String,
    pub state: String,
    pub limit: Option<i64>,
    pub workers: usize,
    pub flush_every: usize,
    pub dry_run: bool,
    /// Skip the per-parcel reads and only recompute the county's percentile
    /// ranks and composites from already-persisted slopes.
    pub composite_only: bool,
}

/// Pass 1.5: five-year NDVI slope per parcel, then a county-wide SQL pass
/// that ranks the slopes and blends in flood risk. Archive reads are heavy,
/// so concurrency stays low.
pub async fn run(
    state: &AppState,
    opts: &SlopeOptions,
    cancel: CancellationToken,
) -> Result<PassSummary> {
    let mut summary = PassSummary::default();

    if !opts.composite_only {
        summary = compute_slopes(state, opts, cancel).await?;
    }

    if opts.dry_run {
        tracing::info!("dry run: composite recomputation skipped");
        return Ok(summary);
    }

    let (pctile_rows, composite_rows) =
        compute_composite_scores(&state.db, &opts.county, &opts.state).await?;
    tracing::info!(
        county = %opts.county,
        pctile_rows,
        composite_rows,
        "county composites recomputed"
    );
    Ok(summary)
}

async fn compute_slopes(
    state: &AppState,
    opts: &SlopeOptions,
    cancel: CancellationToken,
) -> Result<PassSummary> {
    let candidates = select_needing_slope(&state.db, &opts.county, &opts.state, opts.limit).await?;
    let total = candidates.len();
    tracing::info!(county = %opts.county, total, "slope pass starting");

    let semaphore = Arc::new(Semaphore::new(opts.workers.max(1)));
    let buffer: Arc<Mutex<Vec<SlopeUpdate>>> = Arc::new(Mutex::new(Vec::new()));
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
            match slope_for_parcel(&app, &candidate).await {
                Ok(update) => {
                    let with_slope = update.ndvi_slope_5yr.is_some();
                    buffer_task.lock().await.push(update);
                    Ok(with_slope)
                }
                Err(err) => {
                    tracing::warn!(parcel_id = %candidate.parcel_id, error = %err, "slope computation failed");
                    Err(())
                }
            }
        });

        flush_buffer(state, &buffer, opts.flush_every, opts.dry_run, false).await?;

        while let Some(joined) = join_set.try_join_next() {
            tally(&mut summary, Some(joined));
        }
    }

    while let Some(joined) = join_set.join_next().await {
        tally(&mut summary, Some(joined));
    }
    flush_buffer(state, &buffer, opts.flush_every, opts.dry_run, true).await?;

    tracing::info!(county = %opts.county, %summary, "slope pass complete");
    Ok(summary)
}

fn tally(
    summary: &mut PassSummary,
    joined: Option<Result<Result<bool, ()>, tokio::task::JoinError>>,
) {
    match joined {
        Some(Ok(Ok(with_slope))) => {
            summary.scanned += 1;
            if with_slope {
                summary.flagged += 1;
            }
        }
        Some(Ok(Err(()))) | Some(Err(_)) => summary.errors += 1,
        None => {}
    }
}

/// Pull the lazy historical sequence, append the current reading when its
/// year is not already covered, and fit the slope.
async fn slope_for_parcel(state: &AppState, candidate: &SlopeCandidate) -> Result<SlopeUpdate> {
    let clients = &state.clients;
    let mut sequence = clients
        .stac
        .historical_ndvi(&clients.naip, candidate.latitude, candidate.longitude)
        .await?;

    let mut points: Vec<(i32, f64)> = Vec::new();
    while let Some((year, ndvi)) = sequence.next().await {
        points.push((year, ndvi));
    }

    if let (Some(current), Some(date)) = (candidate.ndvi_score, candidate.ndvi_date.as_deref()) {
        if let Ok(current_year) = date.chars().take(4).collect::<String>().parse::<i32>() {
            if !points.iter().any(|(year, _)| *year == current_year) {
                points.push((current_year, current));
            }
        }
    }
    points.sort_by_key(|(year, _)| *year);

    let slope = ols_slope(
        &points
            .iter()
            .map(|(year, ndvi)| (f64::from(*year), *ndvi))
            .collect::<Vec<_>>(),
    );
    let years: Vec<String> = points.iter().map(|(year, _)| year.to_string()).collect();

    Ok(SlopeUpdate {
        parcel_id: candidate.parcel_id.clone(),
        county: candidate.county.clone(),
        ndvi_slope_5yr: slope,
        ndvi_history_count: points.len() as i16,
        ndvi_history_years: (!years.is_empty()).then(|| years.join(",")),
    })
}

async fn flush_buffer(
    state: &AppState,
    buffer: &Arc<Mutex<Vec<SlopeUpdate>>>,
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
                slope = ?row.ndvi_slope_5yr,
                points = row.ndvi_history_count,
                years = row.ndvi_history_years.as_deref().unwrap_or("-"),
                "dry run"
            );
        }
        return Ok(());
    }

    let url = &state.config.database_url;
    let first = {
        let mut conn = db::connect_flush(url).await?;
        batch_update_slope_results(&mut conn, &batch).await
    };
    match first {
        Ok(written) => {
            tracing::info!(batch = batch.len(), written, "slope buffer flushed");
            Ok(())
        }
        Err(err) => {
            tracing::warn!(error = %err, "slope flush failed, retrying on a fresh connection");
            let mut conn = db::connect_flush(url).await?;
            batch_update_slope_results(&mut conn, &batch).await?;
            Ok(())
        }
    }
}
