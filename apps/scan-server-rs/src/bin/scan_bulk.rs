use anyhow::{Context, Result};
use clap::Parser;
use scan_server_rs::services::passes::ndvi_scan::{self, Pass1Options};
use scan_server_rs::state::{AppState, ClientRegistry};
use scan_server_rs::{config, db, store};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(about = "Pass 1: bulk aerial NDVI + flood scan over unscanned parcels of a county.")]
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
    #[arg(long)]
    property_class: Option<String>,
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
    let opts = Pass1Options {
        county: args.county,
        state: args.state,
        property_class: args.property_class,
        limit: args.limit,
        workers: args.workers.unwrap_or(config.pass1_workers),
        flush_every: args.flush_every.unwrap_or(config.flush_every),
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
            tracing::warn!("interrupt received, finishing in-flight parcels and flushing");
            handler_token.cancel();
        }
    });

    let summary = ndvi_scan::run(&state, &opts, cancel).await?;
    println!("{summary}");
    Ok(())
}
