use anyhow::{Context, Result};
use clap::Parser;
use scan_server_rs::services::passes::vacancy_enrich::{self, VacancyOptions};
use scan_server_rs::state::{AppState, ClientRegistry};
use scan_server_rs::{config, db, store};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    about = "Pass 2: carrier-vacancy checks for the top composite leads, one in-flight request per credential account."
)]
struct Args {
    #[arg(long)]
    county: String,
    #[arg(long, default_value = "NC")]
    state: String,
    #[arg(long)]
    limit: Option<i64>,
    #[arg(long)]
    min_composite: Option<f64>,
    #[arg(long)]
    cache_days: Option<i64>,
    #[arg(long)]
    flush_every: Option<usize>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::ScanConfig::from_env()?;
    let pool = db::connect_lazy(&config.database_url)?;
    store::migrations::run_all(&pool)
        .await
        .context("migrations failed")?;

    let http = reqwest::Client::new();
    let clients = Arc::new(ClientRegistry::from_config(&config, http.clone()));
    let opts = VacancyOptions {
        county: args.county,
        state: args.state,
        min_composite: args.min_composite.unwrap_or(config.vacancy_min_composite),
        cache_days: args.cache_days.unwrap_or(config.usps_cache_days),
        limit: args.limit,
        flush_every: args.flush_every.unwrap_or(10),
        dry_run: args.dry_run,
    };
    let state = AppState {
        config,
        db: pool,
        clients,
        http,
    };

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, draining in-flight checks and flushing");
            handler_token.cancel();
        }
    });

    let summary = vacancy_enrich::run(&state, &opts, cancel).await?;
    println!("{summary}");
    Ok(())
}
