//! Demo worker: competes for a named lock and holds it through a
//! simulated critical section.
//!
//! Run several copies against the same database to watch the lease
//! protocol at work:
//!
//! ```text
//! export PGHOST=localhost PGPORT=5432 PGUSER=postgres PGDATABASE=postgres
//! cargo run --example worker -- --create-table
//! cargo run --example worker
//! ```

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use pglease::config::{PgConfig, Settings};
use pglease::{AcquireOptions, Client};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let create_table = parse_args()?;
    let settings = Settings::load().context("failed to load settings")?;
    let pg = PgConfig::from_env();
    let pool = pglease::connect::create_pool(&pg, settings.pool_size)
        .await
        .context("failed to build connection pool")?;
    let client = Client::builder()
        .table_name(&settings.table_name)
        .lease_duration(settings.lease_duration())
        .heartbeat_frequency(settings.heartbeat_frequency())
        .build(pool)?;

    if create_table {
        client.create_table().await?;
        info!(table = %settings.table_name, "lock table created");
        return Ok(());
    }

    let worker = format!("worker-{}", std::process::id());
    info!(%worker, "competing for the demo lock");
    client
        .with_lock(
            "demo",
            AcquireOptions::new().data(worker.as_bytes()).replace_data(true),
            |lock| async move {
                info!(
                    rvn = lock.record_version_number(),
                    "lock held, starting critical section"
                );
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {
                        info!("critical section finished");
                    }
                    _ = lock.cancelled() => {
                        info!("lease lost, winding down");
                    }
                }
            },
        )
        .await?;
    info!(%worker, "done");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn parse_args() -> Result<bool> {
    let mut create_table = false;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--create-table" => create_table = true,
            "--help" | "-h" => {
                println!("Usage: worker [--create-table]");
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(create_table)
}
