use axum::extract::FromRef;
use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;

use crate::config::ScanConfig;
use crate::services::fema::FemaClient;
use crate::services::landsat::LandsatClient;
use crate::services::naip::NaipClient;
use crate::services::naip_history::StacHistoryClient;
use crate::services::planet::PlanetClient;
use crate::services::sentinel::SentinelClient;
use crate::services::usps::UspsAccountClient;

/// The single registry of remote-source clients. Each client owns its own
/// rate envelope; the HTTP session is shared (GETs only).
pub struct ClientRegistry {
    pub naip: NaipClient,
    pub stac: StacHistoryClient,
    pub fema: FemaClient,
    pub landsat: LandsatClient,
    pub sentinel: Option<SentinelClient>,
    pub planet: Option<PlanetClient>,
    pub usps: Vec<Arc<UspsAccountClient>>,
}

impl ClientRegistry {
    pub fn from_config(config: &ScanConfig, http: Client) -> Self {
        let sentinel = match (&config.sentinel_client_id, &config.sentinel_client_secret) {
            (Some(id), Some(secret)) => Some(SentinelClient::new(
                http.clone(),
                id.clone(),
                secret.clone(),
                config.sentinel_requests_per_minute,
                config.sentinel_monthly_budget,
            )),
            _ => None,
        };
        let planet = config
            .planet_api_key
            .as_ref()
            .map(|key| PlanetClient::new(http.clone(), key.clone()));
        let usps = config
            .usps_accounts
            .iter()
            .map(|account| {
                Arc::new(UspsAccountClient::new(
                    http.clone(),
                    account,
                    config.usps_delay_min_secs,
                    config.usps_delay_max_secs,
                    config.usps_test_env,
                ))
            })
            .collect();

        Self {
            naip: NaipClient::new(http.clone(), config.cache_dir.clone()),
            stac: StacHistoryClient::new(http.clone(), config.cache_dir.clone()),
            fema: FemaClient::new(http.clone(), config.cache_dir.clone()),
            landsat: LandsatClient::new(http.clone()),
            sentinel,
            planet,
            usps,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: ScanConfig,
    pub db: PgPool,
    pub clients: Arc<ClientRegistry>,
    pub http: Client,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.db.clone()
    }
}
