use anyhow::{Context, Result};
use std::path::PathBuf;

/// One USPS credential pair. Account 1 comes from the unsuffixed env vars,
/// accounts 2+ from `USPS_CLIENT_ID_2` / `USPS_CLIENT_SECRET_2` and so on.
#[derive(Debug, Clone)]
pub struct UspsAccount {
    pub account: u8,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub database_url: String,
    pub cache_dir: PathBuf,

    pub sentinel_client_id: Option<String>,
    pub sentinel_client_secret: Option<String>,
    pub sentinel_requests_per_minute: u32,
    pub sentinel_monthly_budget: u32,

    pub planet_api_key: Option<String>,
    pub planet_rescan_guard_days: i64,

    pub usps_accounts: Vec<UspsAccount>,
    pub usps_delay_min_secs: f64,
    pub usps_delay_max_secs: f64,
    pub usps_test_env: bool,
    pub usps_cache_days: i64,

    pub pass1_workers: usize,
    pub slope_workers: usize,
    pub flush_every: usize,
    pub vacancy_min_composite: f64,
}

impl ScanConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env_optional_string("SCAN_DATABASE_URL")
            .or_else(|| env_optional_string("DATABASE_URL"))
            .context("SCAN_DATABASE_URL must be set for the scanner runtime")?;
        let database_url = normalize_database_url(database_url);
        if database_url.trim().is_empty() {
            anyhow::bail!("SCAN_DATABASE_URL resolved to an empty value");
        }

        let cache_dir = env_optional_string("SCAN_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data/cache"));

        let sentinel_client_id = env_optional_string("SH_CLIENT_ID");
        let sentinel_client_secret = env_optional_string("SH_CLIENT_SECRET");
        let sentinel_requests_per_minute =
            env_u32("SCAN_SENTINEL_RPM", 300).clamp(1, 300);
        let sentinel_monthly_budget = env_u32("SCAN_SENTINEL_MONTHLY_BUDGET", 10_000);

        let planet_api_key = env_optional_string("PLANET_API_KEY");
        let planet_rescan_guard_days =
            env_u64("SCAN_PLANET_GUARD_DAYS", 60).clamp(1, 365) as i64;

        let usps_accounts = load_usps_accounts();
        let usps_delay_min_secs = env_f64("USPS_DELAY_MIN", 30.0).max(0.0);
        let usps_delay_max_secs =
            env_f64("USPS_DELAY_MAX", 55.0).max(usps_delay_min_secs);
        let usps_test_env = env_bool("USPS_TEST_ENV", false);
        let usps_cache_days = env_u64("USPS_CACHE_DAYS", 60).clamp(1, 365) as i64;

        let pass1_workers = env_u64("SCAN_PASS1_WORKERS", 10).clamp(1, 32) as usize;
        let slope_workers = env_u64("SCAN_SLOPE_WORKERS", 2).clamp(1, 8) as usize;
        let flush_every = env_u64("SCAN_FLUSH_EVERY", 100).clamp(10, 1000) as usize;
        let vacancy_min_composite = env_f64("SCAN_VACANCY_MIN_COMPOSITE", 7.5);

        Ok(Self {
            database_url,
            cache_dir,
            sentinel_client_id,
            sentinel_client_secret,
            sentinel_requests_per_minute,
            sentinel_monthly_budget,
            planet_api_key,
            planet_rescan_guard_days,
            usps_accounts,
            usps_delay_min_secs,
            usps_delay_max_secs,
            usps_test_env,
            usps_cache_days,
            pass1_workers,
            slope_workers,
            flush_every,
            vacancy_min_composite,
        })
    }
}

fn load_usps_accounts() -> Vec<UspsAccount> {
    let mut accounts = Vec::new();
    if let (Some(id), Some(secret)) = (
        env_optional_string("USPS_CLIENT_ID"),
        env_optional_string("USPS_CLIENT_SECRET"),
    ) {
        accounts.push(UspsAccount {
            account: 1,
            client_id: id,
            client_secret: secret,
        });
    }
    for n in 2u8..=9 {
        let id = env_optional_string(&format!("USPS_CLIENT_ID_{n}"));
        let secret = env_optional_string(&format!("USPS_CLIENT_SECRET_{n}"));
        if let (Some(id), Some(secret)) = (id, secret) {
            accounts.push(UspsAccount {
                account: n,
                client_id: id,
                client_secret: secret,
            });
        }
    }
    accounts
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key)
        .ok()
        .map(|value| value.trim().to_lowercase())
    {
        Some(value) if value == "1" || value == "true" || value == "yes" => true,
        Some(value) if value == "0" || value == "false" || value == "no" => false,
        _ => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_sqlalchemy_style_urls() {
        assert_eq!(
            normalize_database_url("postgresql+psycopg://u:p@host/db".to_string()),
            "postgresql://u:p@host/db"
        );
        assert_eq!(
            normalize_database_url("postgresql://u:p@host/db".to_string()),
            "postgresql://u:p@host/db"
        );
    }

}
