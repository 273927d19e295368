use anyhow::Result;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::PassSummary;
use crate::db;
use crate::services::flags::{evaluate_usps_vacancy, VacancyEvidence};
use crate::services::usps::{is_transient_error, split_situs, UspsAccountClient};
use crate::state::AppState;
use crate::store::parcels::{
    batch_update_vacancy_results, select_needing_vacancy, VacancyCandidate, VacancyUpdate,
};
use crate::store::signals::save_vacancy_audit;

#[derive(Debug, Clone)]
pub struct VacancyOptions {
    pub county: String,
    pub state: String,
    pub min_composite: f64,
    pub cache_days: i64,
    pub limit: Option<i64>,
    pub flush_every: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
struct ResolvedAddress {
    candidate: VacancyCandidate,
    street: String,
    city: Option<String>,
    state: String,
    zip: Option<String>,
}

/// Pass 2: carrier-vacancy enrichment of the top composite leads.
///
/// Two phases. Addresses are pre-resolved from the situs line (with the
/// mailing address as a same-state fallback); the probes then drain a shared
/// queue with exactly one in-flight request per credential account, each
/// account pacing itself with its own randomized delay clock.
pub async fn run(
    state: &AppState,
    opts: &VacancyOptions,
    cancel: CancellationToken,
) -> Result<PassSummary> {
    if state.clients.usps.is_empty() {
        anyhow::bail!("no carrier-vacancy credentials configured");
    }

    let candidates = select_needing_vacancy(
        &state.db,
        &opts.county,
        &opts.state,
        opts.min_composite,
        opts.cache_days,
        opts.limit,
    )
    .await?;
    tracing::info!(
        county = %opts.county,
        total = candidates.len(),
        accounts = state.clients.usps.len(),
        min_composite = opts.min_composite,
        "vacancy enrichment starting"
    );

    let mut summary = PassSummary::default();

    // Phase A: resolve addresses locally; unresolvable parcels are skips,
    // not errors.
    let mut queue: VecDeque<ResolvedAddress> = VecDeque::new();
    for candidate in candidates {
        match resolve_address(&candidate, &opts.state) {
            Some(resolved) => queue.push_back(resolved),
            None => {
                tracing::debug!(parcel_id = %candidate.parcel_id, "no usable address, skipping");
                summary.skipped += 1;
            }
        }
    }

    if opts.dry_run {
        for item in &queue {
            tracing::info!(
                parcel_id = %item.candidate.parcel_id,
                street = %item.street,
                city = item.city.as_deref().unwrap_or("-"),
                zip = item.zip.as_deref().unwrap_or("-"),
                "dry run"
            );
        }
        summary.scanned = queue.len();
        return Ok(summary);
    }

    // Phase B: one worker per credential account over the shared queue.
    let queue = Arc::new(Mutex::new(queue));
    let buffer: Arc<Mutex<Vec<VacancyUpdate>>> = Arc::new(Mutex::new(Vec::new()));
    let counters = Arc::new(Mutex::new(PassSummary::default()));
    let mut join_set = tokio::task::JoinSet::new();

    for client in &state.clients.usps {
        let client = client.clone();
        let queue = queue.clone();
        let buffer = buffer.clone();
        let counters = counters.clone();
        let app = state.clone();
        let cancel = cancel.clone();
        let county = opts.county.clone();
        let pass_state = opts.state.clone();
        let flush_every = opts.flush_every;

        join_set.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(item) = queue.lock().await.pop_front() else {
                    break;
                };

                let update = check_one(&app, &client, &county, &pass_state, &item).await;
                {
                    let mut stats = counters.lock().await;
                    if update.error.is_some() {
                        stats.errors += 1;
                    } else {
                        stats.scanned += 1;
                        if update.flag_vacancy {
                            stats.flagged += 1;
                        }
                    }
                }
                buffer.lock().await.push(update);

                let should_flush = buffer.lock().await.len() >= flush_every;
                if should_flush {
                    if let Err(err) = flush(&app, &buffer).await {
                        tracing::error!(error = %err, "vacancy flush failed");
                    }
                }
            }
        });
    }

    while join_set.join_next().await.is_some() {}
    flush(state, &buffer).await?;

    let worker_stats = *counters.lock().await;
    summary.scanned += worker_stats.scanned;
    summary.flagged += worker_stats.flagged;
    summary.errors += worker_stats.errors;

    tracing::info!(county = %opts.county, %summary, "vacancy enrichment complete");
    Ok(summary)
}

/// Situs parse first; when the situs yields neither city nor ZIP, fall back
/// to the mailing address, but only when the mailing state matches the
/// parcel's state (out-of-state investor mail would probe the wrong town).
fn resolve_address(candidate: &VacancyCandidate, state: &str) -> Option<ResolvedAddress> {
    let situs = candidate.situs_address.as_deref()?.trim();
    if situs.is_empty() {
        return None;
    }

    let parts = split_situs(situs, Some(state), None);
    if parts.street.trim().is_empty() {
        return None;
    }

    let mut city = parts.city;
    let mut zip = parts.zip_code;

    if city.is_none() && zip.is_none() {
        let mailing_state = candidate
            .mailing_state
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_uppercase();
        if mailing_state == state.to_uppercase() {
            city = candidate
                .mailing_city
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            zip = candidate
                .mailing_zip
                .as_deref()
                .map(|z| z.trim().chars().take(5).collect::<String>())
                .filter(|z| !z.is_empty());
        }
    }

    // The address API needs a city or a ZIP alongside the street.
    if city.is_none() && zip.is_none() {
        return None;
    }

    Some(ResolvedAddress {
        candidate: candidate.clone(),
        street: parts.street,
        city,
        state: parts.state.unwrap_or_else(|| state.to_string()),
        zip,
    })
}

async fn check_one(
    state: &AppState,
    client: &UspsAccountClient,
    county: &str,
    pass_state: &str,
    item: &ResolvedAddress,
) -> VacancyUpdate {
    let record = client
        .check_address(
            &item.street,
            item.city.as_deref(),
            Some(&item.state),
            item.zip.as_deref(),
        )
        .await;

    // Audit log is best-effort and never blocks the parcel update.
    save_vacancy_audit(
        &state.db,
        county,
        pass_state,
        &item.candidate.parcel_id,
        &record,
        client.account,
    )
    .await;

    let flag = evaluate_usps_vacancy(Some(&VacancyEvidence {
        vacant: record.vacant,
        dpv_confirmed: record.dpv_confirmed,
        address_mismatch: record.address_mismatch,
    }));

    let transient = record
        .error
        .as_deref()
        .is_some_and(is_transient_error);

    VacancyUpdate {
        parcel_id: item.candidate.parcel_id.clone(),
        county: item.candidate.county.clone(),
        vacant: record.vacant,
        dpv_confirmed: record.dpv_confirmed,
        usps_address: record.usps_address,
        usps_city: record.usps_city,
        usps_zip: record.usps_zip,
        usps_zip4: record.usps_zip4,
        business: record.business,
        address_mismatch: Some(record.address_mismatch),
        error: record.error,
        flag_vacancy: flag.is_some(),
        vacancy_confidence: flag.map(|f| f.confidence),
        transient_error: transient,
    }
}

async fn flush(state: &AppState, buffer: &Arc<Mutex<Vec<VacancyUpdate>>>) -> Result<()> {
    let batch = {
        let mut guard = buffer.lock().await;
        if guard.is_empty() {
            return Ok(());
        }
        std::mem::take(&mut *guard)
    };

    let url = &state.config.database_url;
    let first = {
        let mut conn = db::connect_flush(url).await?;
        batch_update_vacancy_results(&mut conn, &batch).await
    };
    match first {
        Ok(written) => {
            tracing::info!(batch = batch.len(), written, "vacancy buffer flushed");
            Ok(())
        }
        Err(err) => {
            tracing::warn!(error = %err, "vacancy flush failed, retrying on a fresh connection");
            let mut conn = db::connect_flush(url).await?;
            batch_update_vacancy_results(&mut conn, &batch).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(situs: &str, mailing: Option<(&str, &str, &str)>) -> VacancyCandidate {
        VacancyCandidate {
            parcel_id: "181441".into(),
            county: "Gaston".into(),
            state_code: "NC".into(),
            situs_address: Some(situs.into()),
            mailing_city: mailing.map(|(city, _, _)| city.into()),
            mailing_zip: mailing.map(|(_, zip, _)| zip.into()),
            mailing_state: mailing.map(|(_, _, state)| state.into()),
            distress_composite: Some(8.1),
        }
    }

    #[test]
    fn situs_with_city_and_state_resolves_directly() {
        let resolved = resolve_address(&candidate("123 MAIN ST GASTONIA NC", None), "NC").unwrap();
        assert_eq!(resolved.street, "123 MAIN ST");
        assert_eq!(resolved.city.as_deref(), Some("GASTONIA"));
    }

    #[test]
    fn mailing_fallback_requires_matching_state() {
        // same-state mailing address fills in the missing city/zip
        let same = candidate("123 MAIN ST", Some(("DALLAS", "28034-1234", "NC")));
        let resolved = resolve_address(&same, "NC").unwrap();
        assert_eq!(resolved.city.as_deref(), Some("DALLAS"));
        assert_eq!(resolved.zip.as_deref(), Some("28034"));

        // out-of-state mailing address is not a usable fallback
        let other = candidate("123 MAIN ST", Some(("TAMPA", "33601", "FL")));
        assert!(resolve_address(&other, "NC").is_none());
    }

    #[test]
    fn empty_situs_is_skipped() {
        assert!(resolve_address(&candidate("   ", None), "NC").is_none());
    }
}
