use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use hubcast::config;
use hubcast::db;
use hubcast::gateway::HttpProviderGateway;
use hubcast::reconcile::{Reconciler, SyncOptions};
use hubcast::worker;

#[derive(Debug, Parser)]
#[command(author, version, about = "Run the dispatch reconciliation worker")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/hubcast.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let gateway = Arc::new(HttpProviderGateway::from_config(&cfg)?);
    let reconciler = Reconciler::new(
        pool.clone(),
        gateway,
        SyncOptions {
            concurrency: cfg.app.poll_concurrency,
            status_timeout: Duration::from_millis(cfg.app.status_timeout_ms),
        },
    );

    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let resync_interval = cfg.app.resync_interval_seconds as i64;
    let max_backoff = cfg.app.max_backoff_seconds as i64;

    info!("starting reconciliation worker");
    loop {
        match worker::process_next_due(&pool, &reconciler, resync_interval, max_backoff).await {
            Ok(processed) => {
                if !processed {
                    tokio::time::sleep(poll_sleep).await;
                }
            }
            Err(err) => {
                error!(?err, "reconciliation worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
