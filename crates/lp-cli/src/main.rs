//! Single-invocation LunchPlanner sync job. All behavior is parameterized
//! through the environment; record-level failures end up in the error log and
//! never affect the exit code.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lp_source::{TakeawayClient, TakeawayClientConfig};
use lp_store::{JsonlErrorSink, PgCatalogStore, SchemaManager};
use lp_sync::{SyncConfig, SyncPipeline};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lunchplanner")]
#[command(about = "Sync the Takeaway catalog and area restaurants into Postgres", version)]
struct Cli {}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SyncConfig::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("connecting to the store")?;

    let provider = TakeawayClient::new(TakeawayClientConfig {
        base_url: config.source_base_url.clone(),
        language: config.language.clone(),
        app_version: config.app_version.clone(),
        user_agent: config.user_agent.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        ..TakeawayClientConfig::default()
    })
    .context("building source client")?;

    let mut pipeline = SyncPipeline::new(
        config.clone(),
        Arc::new(SchemaManager::new(pool.clone())),
        Arc::new(provider),
        Arc::new(PgCatalogStore::new(pool)),
        Arc::new(JsonlErrorSink::new(config.error_log.clone())),
    );

    let summary = pipeline.run().await.context("sync run aborted")?;

    println!(
        "sync completed: run_id={} started={} finished={}",
        summary.run_id, summary.started_at, summary.finished_at
    );
    println!("  kitchens:     {}", summary.kitchens);
    println!("  subkitchens:  {}", summary.sub_kitchens);
    println!("  restaurants:  {}", summary.restaurants);
    println!("  associations: {}", summary.associations);
    println!("  total:        {}", summary.totals());
    if summary.totals().failed > 0 {
        println!("  failure details: {}", config.error_log.display());
    }

    Ok(())
}
