use anyhow::{Context, Result};
use clap::Parser;
use scan_server_rs::services::passes::historical_slope::{self, SlopeOptions};
use scan_server_rs::state::{AppState, ClientRegistry};
use scan_server_rs::{config, db, store};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    about = "Pass 1.5: historical NDVI slope per parcel, then county percentile ranks and distress composites."
)]
struct Args {
    #[arg(long)]
    county: String,
    #[arg(long, default_value = "NC")]
    state: String,
    #[arg(long)]
    limit: Option<i64>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    flush_every: Option<usize>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Recompute percentiles and composites from existing slopes only.
    #[arg(long, default_value_t = false)]
    composite_only: bool,
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
    let opts = SlopeOptions {
        county: args.county,
        state: args.state,
        limit: args.limit,
        workers: args.workers.unwrap_or(config.slope_workers),
        flush_every: args.flush_every.unwrap_or(50),
        dry_run: args.dry_run,
        composite_only: args.composite_only,
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
            tracing::warn!("interrupt received, flushing partial results");
            handler_token.cancel();
        }
    });

    let summary = historical_slope::run(&state, &opts, cancel).await?;
    println!("{summary}");
    Ok(())
}
