use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::{FlagRollup, PassSummary};
use crate::db;
use crate::services::fema::{classify_risk, FloodZone};
use crate::services::flags::{generate_flags, AerialEvidence, EvidenceBundle};
use crate::services::scoring::distress_score;
use crate::services::trends::{compute_trend, NdviTrend, TrendDirection};
use crate::state::AppState;
use crate::store::parcels::{
    batch_update_sentinel_results, select_sentinel_worthy, SentinelCandidate, SentinelUpdate,
};

#[derive(Debug, Clone)]
pub struct SentinelOptions {
    pub county: String,
    pub state: String,
    pub limit: Option<i64>,
    pub months: u32,
    pub flush_every: usize,
    pub dry_run: bool,
}

/// Pass 1.5b: satellite trend enrichment for flagged parcels, highest
/// distress first. Throughput is governed entirely by the satellite client's
/// own minute limiter; the pass itself runs serially so the limiter's
/// budget is the only throttle. Falls back to the free satellite source per
/// point, then re-scores flags with trend evidence and advances the pass.
pub async fn run(
    state: &AppState,
    opts: &SentinelOptions,
    cancel: CancellationToken,
) -> Result<PassSummary> {
    let candidates =
        select_sentinel_worthy(&state.db, &opts.county, &opts.state, opts.limit).await?;
    let total = candidates.len();
    tracing::info!(county = %opts.county, total, "satellite enrichment starting");

    let mut summary = PassSummary::default();
    let mut buffer: Vec<SentinelUpdate> = Vec::new();

    for candidate in candidates {
        if cancel.is_cancelled() {
            summary.skipped += 1;
            continue;
        }

        match enrich_one(state, &candidate, opts.months).await {
            Ok(update) => {
                if update.distress_flags.is_some() {
                    summary.flagged += 1;
                }
                summary.scanned += 1;
                buffer.push(update);
            }
            Err(err) => {
                // Auth failures are operator-actionable and fail the pass;
                // anything else skips the parcel and keeps the batch alive.
                if err.to_string().contains("credentials rejected") {
                    return Err(err);
                }
                tracing::warn!(parcel_id = %candidate.parcel_id, error = %err, "satellite enrichment failed");
                summary.errors += 1;
            }
        }

        if buffer.len() >= opts.flush_every {
            flush(state, &mut buffer, opts.dry_run).await?;
        }
    }

    flush(state, &mut buffer, opts.dry_run).await?;
    tracing::info!(county = %opts.county, %summary, "satellite enrichment complete");
    Ok(summary)
}

async fn enrich_one(
    state: &AppState,
    candidate: &SentinelCandidate,
    months: u32,
) -> Result<SentinelUpdate> {
    let clients = &state.clients;

    // Primary satellite source, then the free fallback when it comes back
    // empty for the point.
    let mut source: Option<&'static str> = None;
    let mut trend: Option<NdviTrend> = None;

    if let Some(sentinel) = &clients.sentinel {
        match sentinel
            .monthly_ndvi(candidate.latitude, candidate.longitude, months)
            .await
        {
            Ok(monthly) if !monthly.is_empty() => {
                trend = Some(compute_trend(&monthly));
                source = Some("Sentinel-2");
            }
            Ok(_) => {}
            Err(err) if err.to_string().contains("credentials rejected") => return Err(err),
            Err(err) => {
                tracing::warn!(parcel_id = %candidate.parcel_id, error = %err, "primary satellite source failed");
            }
        }
    }

    if trend.is_none() {
        let monthly = clients
            .landsat
            .monthly_ndvi(candidate.latitude, candidate.longitude, months.min(12))
            .await?;
        if !monthly.is_empty() {
            trend = Some(compute_trend(&monthly));
            source = Some("Landsat");
        }
    }

    let trend = trend.unwrap_or_else(NdviTrend::insufficient);

    // Re-evaluate with the Pass-1 aerial/flood columns plus the new trend.
    let flood = candidate.fema_zone.as_ref().map(|zone| {
        let sfha = candidate.fema_sfha.unwrap_or(false);
        FloodZone {
            flood_zone: Some(zone.clone()),
            zone_subtype: None,
            is_sfha: sfha,
            risk: match candidate.fema_risk.as_deref() {
                Some("high") => crate::services::fema::FloodRisk::High,
                Some("moderate") => crate::services::fema::FloodRisk::Moderate,
                Some("low") => crate::services::fema::FloodRisk::Low,
                Some("none") | None => classify_risk(Some(zone), None, sfha),
                Some(_) => classify_risk(Some(zone), None, sfha),
            },
        }
    });

    let bundle = EvidenceBundle {
        aerial: candidate.ndvi_score.map(|ndvi| AerialEvidence {
            current_ndvi: Some(ndvi),
            baseline_ndvi: None,
        }),
        trend: (trend.direction != TrendDirection::Insufficient).then(|| trend.clone()),
        flood,
        ..Default::default()
    };
    let flags = generate_flags(&bundle);
    let score = distress_score(&flags);
    let rollup = FlagRollup::from_flags(&flags);

    Ok(SentinelUpdate {
        parcel_id: candidate.parcel_id.clone(),
        county: candidate.county.clone(),
        trend_direction: trend.direction.as_str().to_string(),
        trend_slope: trend.slope,
        latest_ndvi: trend.latest_ndvi,
        months_data: trend.months_with_data as i16,
        mean_ndvi: trend.mean_ndvi,
        data_source: source.map(str::to_string),
        chart_url: None,
        scan_date: Utc::now().naive_utc(),
        distress_score: Some(score),
        distress_flags: rollup.distress_flags,
        flag_veg: rollup.flag_veg,
        flag_flood: rollup.flag_flood,
        flag_structural: rollup.flag_structural,
        flag_neglect: rollup.flag_neglect,
        veg_confidence: rollup.veg_confidence,
        flood_confidence: rollup.flood_confidence,
    })
}

async fn flush(state: &AppState, buffer: &mut Vec<SentinelUpdate>, dry_run: bool) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let batch = std::mem::take(buffer);

    if dry_run {
        for row in &batch {
            tracing::info!(
                parcel_id = %row.parcel_id,
                trend = %row.trend_direction,
                months = row.months_data,
                source = row.data_source.as_deref().unwrap_or("-"),
                "dry run"
            );
        }
        return Ok(());
    }

    let url = &state.config.database_url;
    let first = {
        let mut conn = db::connect_flush(url).await?;
        batch_update_sentinel_results(&mut conn, &batch).await
    };
    match first {
        Ok(written) => {
            tracing::info!(batch = batch.len(), written, "satellite buffer flushed");
            Ok(())
        }
        Err(err) => {
            tracing::warn!(error = %err, "satellite flush failed, retrying on a fresh connection");
            let mut conn = db::connect_flush(url).await?;
            batch_update_sentinel_results(&mut conn, &batch).await?;
            Ok(())
        }
    }
}
