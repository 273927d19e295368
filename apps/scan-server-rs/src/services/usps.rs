use anyhow::{Context, Result};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::config::UspsAccount;

const PROD_TOKEN_URL: &str = "https://apis.usps.com/oauth2/v3/token";
const PROD_ADDRESS_URL: &str = "https://apis.usps.com/addresses/v3/address";
// Test environment mirror: identical credentials, separate quota.
const TEST_TOKEN_URL: &str = "https://apis-tem.usps.com/oauth2/v3/token";
const TEST_ADDRESS_URL: &str = "https://apis-tem.usps.com/addresses/v3/address";

// 429 backoff: start here, double per consecutive 429, cap at the max.
const BACKOFF_START_SECS: u64 = 120;
const BACKOFF_MAX_SECS: u64 = 900;

/// Result of one carrier-vacancy probe.
#[derive(Debug, Clone)]
pub struct VacancyRecord {
    pub street_address: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub vacant: Option<bool>,
    pub dpv_confirmed: Option<bool>,
    pub business: Option<bool>,
    pub usps_address: Option<String>,
    pub usps_city: Option<String>,
    pub usps_state: Option<String>,
    pub usps_zip: Option<String>,
    pub usps_zip4: Option<String>,
    pub address_mismatch: bool,
    pub raw_response: Option<JsonValue>,
    pub error: Option<String>,
}

impl VacancyRecord {
    fn errored(street: &str, city: Option<&str>, state: Option<&str>, zip: Option<&str>, error: String) -> Self {
        Self {
            street_address: street.to_string(),
            city: city.map(str::to_string),
            state: state.map(str::to_string),
            zip_code: zip.map(str::to_string),
            vacant: None,
            dpv_confirmed: None,
            business: None,
            usps_address: None,
            usps_city: None,
            usps_state: None,
            usps_zip: None,
            usps_zip4: None,
            address_mismatch: false,
            raw_response: None,
            error: Some(error),
        }
    }
}

/// Error codes that should not cache the check (the parcel stays eligible
/// for retry on the next run).
pub fn is_transient_error(code: &str) -> bool {
    matches!(
        code,
        "rate_limited" | "http_500" | "http_502" | "http_503" | "http_504"
    )
}

struct TokenState {
    access_token: String,
    expires_at: Instant,
}

struct PacingState {
    last_request: Option<Instant>,
    consecutive_429s: u32,
}

/// One credential pair against the carrier-vacancy address API.
///
/// The 60/hour quota is token-scoped, so each account owns its own token,
/// pacing clock, and backoff state. Inter-call delays are drawn uniformly
/// from [delay_min, delay_max]: fixed spacing trips gateway bot heuristics,
/// and the hourly quota is subdivided into short spike windows that uniform
/// jitter spreads across.
pub struct UspsAccountClient {
    http: Client,
    pub account: u8,
    client_id: String,
    client_secret: String,
    token_url: &'static str,
    address_url: &'static str,
    delay_min: f64,
    delay_max: f64,
    token: Mutex<Option<TokenState>>,
    pacing: Mutex<PacingState>,
}

impl UspsAccountClient {
    pub fn new(
        http: Client,
        account: &UspsAccount,
        delay_min: f64,
        delay_max: f64,
        test_env: bool,
    ) -> Self {
        let (token_url, address_url) = if test_env {
            (TEST_TOKEN_URL, TEST_ADDRESS_URL)
        } else {
            (PROD_TOKEN_URL, PROD_ADDRESS_URL)
        };
        Self {
            http,
            account: account.account,
            client_id: account.client_id.clone(),
            client_secret: account.client_secret.clone(),
            token_url,
            address_url,
            delay_min,
            delay_max: delay_max.max(delay_min),
            token: Mutex::new(None),
            pacing: Mutex::new(PacingState {
                last_request: None,
                consecutive_429s: 0,
            }),
        }
    }

    async fn authenticate(&self) -> Result<String> {
        {
            let guard = self.token.lock().await;
            if let Some(state) = guard.as_ref() {
                if Instant::now() < state.expires_at {
                    return Ok(state.access_token.clone());
                }
            }
        }

        let resp: JsonValue = self
            .http
            .post(self.token_url)
            .json(&serde_json::json!({
                "client_id": self.client_id,
                "client_secret": self.client_secret,
                "grant_type": "client_credentials",
            }))
            .send()
            .await
            .context("vacancy token request failed")?
            .error_for_status()
            .context("vacancy token endpoint rejected credentials")?
            .json()
            .await
            .context("failed to decode vacancy token response")?;

        let access_token = resp
            .get("access_token")
            .and_then(JsonValue::as_str)
            .context("vacancy token response missing access_token")?
            .to_string();
        let expires_in = resp
            .get("expires_in")
            .and_then(JsonValue::as_u64)
            .unwrap_or(3600);

        let mut guard = self.token.lock().await;
        *guard = Some(TokenState {
            access_token: access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in.saturating_sub(60)),
        });
        tracing::info!(account = self.account, "vacancy client authenticated");
        Ok(access_token)
    }

    /// Wait out the randomized inter-call interval. No wait before the first
    /// request of a run.
    async fn pace(&self) {
        let wait = {
            let pacing = self.pacing.lock().await;
            let Some(last) = pacing.last_request else {
                return;
            };
            let target = {
                let mut rng = rand::thread_rng();
                rng.gen_range(self.delay_min..=self.delay_max)
            };
            let elapsed = last.elapsed().as_secs_f64();
            (target - elapsed).max(0.0)
        };
        if wait > 0.0 {
            tracing::debug!(account = self.account, wait_secs = wait, "pacing delay");
            sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    async fn backoff_429(&self, retry_after: Option<u64>) {
        let consecutive = {
            let mut pacing = self.pacing.lock().await;
            pacing.consecutive_429s += 1;
            pacing.consecutive_429s
        };

        let computed = BACKOFF_START_SECS
            .saturating_mul(2u64.saturating_pow(consecutive.saturating_sub(1)))
            .min(BACKOFF_MAX_SECS);
        // Retry-After wins only when it asks for more than we already would.
        let base = retry_after.map_or(computed, |ra| ra.max(computed));
        let jitter = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0.0..(base as f64 * 0.25))
        };
        let wait = base as f64 + jitter;

        tracing::warn!(
            account = self.account,
            consecutive,
            wait_secs = wait,
            retry_after,
            "vacancy rate limited, backing off"
        );
        sleep(Duration::from_secs_f64(wait)).await;
    }

    /// Probe one address. Rate-limit responses back off and report
    /// `rate_limited` (transient, retryable); they are not parcel failures.
    pub async fn check_address(
        &self,
        street: &str,
        city: Option<&str>,
        state: Option<&str>,
        zip_code: Option<&str>,
    ) -> VacancyRecord {
        let token = match self.authenticate().await {
            Ok(token) => token,
            Err(err) => {
                return VacancyRecord::errored(street, city, state, zip_code, format!("auth: {err:#}"));
            }
        };

        self.pace().await;

        let mut params: Vec<(&str, &str)> = vec![("streetAddress", street)];
        if let Some(city) = city {
            params.push(("city", city));
        }
        if let Some(state) = state {
            params.push(("state", state));
        }
        if let Some(zip) = zip_code {
            params.push(("ZIPCode", zip));
        }

        let resp = self
            .http
            .get(self.address_url)
            .query(&params)
            .bearer_auth(&token)
            .send()
            .await;

        {
            let mut pacing = self.pacing.lock().await;
            pacing.last_request = Some(Instant::now());
        }

        let resp = match resp {
            Ok(resp) => resp,
            Err(err) => {
                return VacancyRecord::errored(street, city, state, zip_code, format!("request: {err}"));
            }
        };

        match resp.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                self.backoff_429(retry_after).await;
                VacancyRecord::errored(street, city, state, zip_code, "rate_limited".to_string())
            }
            status if !status.is_success() => {
                // Auth expiry mid-run: clear the token so the next probe
                // refreshes once; a repeat 401 on fresh tokens fails upstream.
                if status == StatusCode::UNAUTHORIZED {
                    self.token.lock().await.take();
                }
                VacancyRecord::errored(
                    street,
                    city,
                    state,
                    zip_code,
                    format!("http_{}", status.as_u16()),
                )
            }
            _ => {
                {
                    let mut pacing = self.pacing.lock().await;
                    pacing.consecutive_429s = 0;
                }
                match resp.json::<JsonValue>().await {
                    Ok(data) => parse_vacancy_response(street, city, state, zip_code, data),
                    Err(err) => VacancyRecord::errored(
                        street,
                        city,
                        state,
                        zip_code,
                        format!("decode: {err}"),
                    ),
                }
            }
        }
    }
}

fn yn_flag(value: Option<&str>) -> Option<bool> {
    match value {
        Some("Y") => Some(true),
        Some("N") => Some(false),
        _ => None,
    }
}

fn parse_vacancy_response(
    street: &str,
    city: Option<&str>,
    state: Option<&str>,
    zip_code: Option<&str>,
    data: JsonValue,
) -> VacancyRecord {
    let addr = data.get("address").cloned().unwrap_or_default();
    let info = data.get("additionalInfo").cloned().unwrap_or_default();

    let get = |obj: &JsonValue, key: &str| -> Option<String> {
        obj.get(key)
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .filter(|v| !v.is_empty())
    };

    let usps_street = get(&addr, "streetAddress");
    let vacant = yn_flag(info.get("vacant").and_then(JsonValue::as_str));
    // DPV confirmation codes: Y = full, S/D = partial (unit issues), N = not
    // deliverable. Anything partial or negative counts as not confirmed.
    let dpv_confirmed = match info.get("DPVConfirmation").and_then(JsonValue::as_str) {
        Some("Y") => Some(true),
        Some("N") | Some("S") | Some("D") => Some(false),
        _ => None,
    };
    let business = yn_flag(info.get("business").and_then(JsonValue::as_str));
    let address_mismatch = detect_mismatch(street, usps_street.as_deref());

    VacancyRecord {
        street_address: street.to_string(),
        city: city.map(str::to_string),
        state: state.map(str::to_string),
        zip_code: zip_code.map(str::to_string),
        vacant,
        dpv_confirmed,
        business,
        usps_address: usps_street,
        usps_city: get(&addr, "city"),
        usps_state: get(&addr, "state"),
        usps_zip: get(&addr, "ZIPCode"),
        usps_zip4: get(&addr, "ZIPPlus4"),
        address_mismatch,
        raw_response: Some(data),
        error: None,
    }
}

/// True when the resolved street is meaningfully different from the input.
/// Containment either way, or a shared house number, is treated as
/// formatting rather than a mismatch.
pub fn detect_mismatch(input_addr: &str, usps_addr: Option<&str>) -> bool {
    let Some(usps_addr) = usps_addr else {
        return false;
    };
    let a = normalize_street(input_addr);
    let b = normalize_street(usps_addr);
    if a.contains(&b) || b.contains(&a) {
        return false;
    }
    let a_first = a.split_whitespace().next();
    let b_first = b.split_whitespace().next();
    if let (Some(a_first), Some(b_first)) = (a_first, b_first) {
        if a_first == b_first {
            return false;
        }
    }
    true
}

fn normalize_street(addr: &str) -> String {
    addr.to_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SitusParts {
    pub street: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
}

static STATE_CODES: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN",
        "IA", "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV",
        "NH", "NJ", "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN",
        "TX", "UT", "VT", "VA", "WA", "WV", "WI", "WY", "DC",
    ]
    .into_iter()
    .collect()
});

// Tokens that read as both a state code and a street suffix (CT is
// Connecticut or Court). Resolved against the fallback state.
static AMBIGUOUS_STATE_SUFFIX: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| ["CT", "IN", "AL", "ME", "OR"].into_iter().collect());

static STREET_SUFFIXES: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "ST", "AVE", "AV", "RD", "DR", "LN", "CT", "CIR", "BLVD", "WAY", "PL", "TRL", "LOOP",
        "HWY", "PKY", "PKWY", "COVE", "CV", "RUN", "PATH", "PASS", "PT", "PIKE", "SQ", "TER",
        "TERR", "ALY", "ROW", "WALK", "XING", "EXT", "BND", "CRES", "GRV", "HOLW", "IS",
        "KNL", "LK", "LNDG", "MALL", "MNR", "MDW", "MDWS", "ML", "MLS", "OVAL", "PARK",
        "PLZ", "RIDGE", "RDG", "SHR", "SPG", "SPUR", "TRCE", "VLY", "VW", "VISTA",
    ]
    .into_iter()
    .collect()
});

static SKIP_CITY_TOKENS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    ["UNINC", "UNINCORP", "UNINCORPORATED", "COUNTY", "TWP", "TOWNSHIP"]
        .into_iter()
        .collect()
});

/// Split a raw situs string into street / city / state / zip for the address
/// API. County GIS exports bake the city and state into the street line in
/// inconsistent ways; this walks backwards from a trailing state code to find
/// the city boundary.
pub fn split_situs(situs: &str, fallback_state: Option<&str>, fallback_city: Option<&str>) -> SitusParts {
    let mut parts: Vec<&str> = situs.split_whitespace().collect();
    let fallback = |street: String, zip: Option<String>| SitusParts {
        street,
        city: fallback_city.map(str::to_string),
        state: fallback_state.map(str::to_string),
        zip_code: zip,
    };

    if parts.is_empty() {
        return fallback(situs.trim().to_string(), None);
    }

    // Strip a trailing ZIP or ZIP+4.
    let mut zip_code = None;
    if let Some(last) = parts.last() {
        if last.len() == 5 && last.chars().all(|c| c.is_ascii_digit()) {
            zip_code = Some(last.to_string());
            parts.pop();
        } else if last.len() == 10
            && last.is_ascii()
            && last.as_bytes()[5] == b'-'
            && last[..5].chars().all(|c| c.is_ascii_digit())
            && last[6..].chars().all(|c| c.is_ascii_digit())
        {
            zip_code = Some(last[..5].to_string());
            parts.pop();
        }
    }

    if parts.is_empty() {
        return fallback(situs.trim().to_string(), zip_code);
    }

    let last_upper = parts.last().map(|p| p.to_uppercase()).unwrap_or_default();
    if parts.len() >= 3 && STATE_CODES.contains(last_upper.as_str()) {
        let state = last_upper;

        // An ambiguous trailing token that disagrees with the known state is
        // a street suffix, not a state code.
        if AMBIGUOUS_STATE_SUFFIX.contains(state.as_str()) {
            if let Some(known) = fallback_state {
                if state != known.to_uppercase() {
                    return fallback(parts.join(" "), zip_code);
                }
            }
        }

        let city_candidate = parts[parts.len() - 2].to_uppercase();
        if SKIP_CITY_TOKENS.contains(city_candidate.as_str())
            || city_candidate.chars().all(|c| c.is_ascii_digit())
        {
            let street = parts[..parts.len() - 2].join(" ");
            return SitusParts {
                street,
                city: fallback_city.map(str::to_string),
                state: Some(state),
                zip_code,
            };
        }

        // Walk backwards from the state code until a street suffix marks the
        // end of the street portion.
        let mut idx = parts.len() - 2;
        let mut city_parts: Vec<&str> = Vec::new();
        while idx > 0 {
            let token = parts[idx]
                .to_uppercase()
                .trim_end_matches([',', '.'])
                .to_string();
            if STREET_SUFFIXES.contains(token.as_str()) {
                break;
            }
            city_parts.insert(0, parts[idx]);
            idx -= 1;
        }

        if !city_parts.is_empty() {
            return SitusParts {
                street: parts[..=idx].join(" "),
                city: Some(city_parts.join(" ")),
                state: Some(state),
                zip_code,
            };
        }
        return SitusParts {
            street: parts[..parts.len() - 2].join(" "),
            city: Some(parts[parts.len() - 2].to_string()),
            state: Some(state),
            zip_code,
        };
    }

    fallback(parts.join(" "), zip_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_street_city_state() {
        let parts = split_situs("123 MAIN ST CHARLOTTE NC", Some("NC"), None);
        assert_eq!(parts.street, "123 MAIN ST");
        assert_eq!(parts.city.as_deref(), Some("CHARLOTTE"));
        assert_eq!(parts.state.as_deref(), Some("NC"));
        assert!(parts.zip_code.is_none());
    }

    #[test]
    fn strips_trailing_zip_and_zip4() {
        let parts = split_situs("123 MAIN ST CHARLOTTE NC 28083", Some("NC"), None);
        assert_eq!(parts.zip_code.as_deref(), Some("28083"));
        let parts = split_situs("123 MAIN ST CHARLOTTE NC 28083-1234", Some("NC"), None);
        assert_eq!(parts.zip_code.as_deref(), Some("28083"));
        assert_eq!(parts.city.as_deref(), Some("CHARLOTTE"));
    }

    #[test]
    fn street_only_uses_fallbacks() {
        let parts = split_situs("123 MAIN ST", Some("NC"), Some("GASTONIA"));
        assert_eq!(parts.street, "123 MAIN ST");
        assert_eq!(parts.city.as_deref(), Some("GASTONIA"));
        assert_eq!(parts.state.as_deref(), Some("NC"));
    }

    #[test]
    fn ambiguous_ct_resolves_to_court_for_nc_parcels() {
        // "CT" trailing a North Carolina situs is a Court suffix, not
        // Connecticut.
        let parts = split_situs("9010 WINDY CREEK CT", Some("NC"), None);
        assert_eq!(parts.street, "9010 WINDY CREEK CT");
        assert_eq!(parts.state.as_deref(), Some("NC"));
    }

    #[test]
    fn uninc_token_is_not_a_city() {
        let parts = split_situs("411 RIVER RD UNINC NC", Some("NC"), Some("DALLAS"));
        assert_eq!(parts.street, "411 RIVER RD");
        assert_eq!(parts.city.as_deref(), Some("DALLAS"));
        assert_eq!(parts.state.as_deref(), Some("NC"));
    }

    #[test]
    fn multiword_cities_walk_back_to_the_suffix() {
        let parts = split_situs("77 OAK AVE KINGS MOUNTAIN NC", Some("NC"), None);
        assert_eq!(parts.street, "77 OAK AVE");
        assert_eq!(parts.city.as_deref(), Some("KINGS MOUNTAIN"));
    }

    #[test]
    fn mismatch_requires_a_real_difference() {
        assert!(!detect_mismatch("123 MAIN ST", Some("123 MAIN ST")));
        assert!(!detect_mismatch("123 Main St", Some("123 MAIN ST APT 2")));
        // same house number is formatting, not a different address
        assert!(!detect_mismatch("123 MAIN ST", Some("123 N MAIN STREET")));
        assert!(detect_mismatch("123 MAIN ST", Some("500 ELM AVE")));
    }

    #[test]
    fn transient_error_codes() {
        assert!(is_transient_error("rate_limited"));
        assert!(is_transient_error("http_503"));
        assert!(!is_transient_error("http_404"));
        assert!(!is_transient_error("no_situs"));
    }

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        let schedule: Vec<u64> = (1u32..=5)
            .map(|n| {
                BACKOFF_START_SECS
                    .saturating_mul(2u64.saturating_pow(n.saturating_sub(1)))
                    .min(BACKOFF_MAX_SECS)
            })
            .collect();
        assert_eq!(schedule, vec![120, 240, 480, 900, 900]);
    }

    #[test]
    fn dpv_partial_codes_are_not_confirmed() {
        let data = serde_json::json!({
            "address": {"streetAddress": "123 MAIN ST", "city": "GASTONIA", "state": "NC",
                        "ZIPCode": "28052", "ZIPPlus4": "1234"},
            "additionalInfo": {"vacant": "Y", "DPVConfirmation": "S", "business": "N"}
        });
        let record = parse_vacancy_response("123 MAIN ST", None, None, None, data);
        assert_eq!(record.vacant, Some(true));
        assert_eq!(record.dpv_confirmed, Some(false));
        assert_eq!(record.business, Some(false));
        assert_eq!(record.usps_zip4.as_deref(), Some("1234"));
    }
}
