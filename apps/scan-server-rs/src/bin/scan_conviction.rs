use anyhow::{Context, Result};
use clap::Parser;
use scan_server_rs::services::passes::conviction::{self, ConvictionOptions};
use scan_server_rs::state::{AppState, ClientRegistry};
use scan_server_rs::{config, db, store};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    about = "Pass 2.5: fuse composite, motivation signals, and carrier vacancy into conviction scores for a county."
)]
struct Args {
    #[arg(long)]
    county: String,
    #[arg(long, default_value = "NC")]
    state: String,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    #[arg(long, default_value_t = false)]
    skip_motivation: bool,
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
    let opts = ConvictionOptions {
        county: args.county,
        state: args.state,
        dry_run: args.dry_run,
        skip_motivation_backfill: args.skip_motivation,
    };
    let state = AppState {
        config,
        db: pool,
        clients,
        http,
    };

    let summary = conviction::run(&state, &opts, CancellationToken::new()).await?;
    println!("{summary}");
    Ok(())
}
