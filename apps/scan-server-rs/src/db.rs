use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use sqlx::Connection;
use std::time::Duration;

pub fn connect_lazy(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .with_context(|| format!("Failed to create lazy database pool for {database_url}"))
}

/// Open a fresh single connection for a batch flush. The managed host drops
/// connections idle for more than about a minute, so batch passes never hold
/// one across an entire run.
pub async fn connect_flush(database_url: &str) -> Result<PgConnection> {
    PgConnection::connect(database_url)
        .await
        .context("failed to open flush connection")
}
