use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use hubcast::config;
use hubcast::db;
use hubcast::gateway::HttpProviderGateway;
use hubcast::reconcile::{Reconciler, SyncOptions};
use hubcast::worker;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Reconcile all pending messages against the provider and exit when complete"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Exit immediately when only backed-off messages remain
    #[arg(long)]
    skip_backlogged: bool,

    /// Maximum poll attempts before a message is considered stuck (default: 5)
    #[arg(long, default_value = "5")]
    max_attempts: i32,
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
    let resync_interval = cfg.app.resync_interval_seconds as i64;
    let max_backoff = cfg.app.max_backoff_seconds as i64;

    let pending = db::count_pollable(&pool).await?;
    info!(pending, "starting one-shot reconciliation");
    if pending == 0 {
        info!("nothing to reconcile, exiting");
        return Ok(());
    }

    let mut processed_count = 0_u64;
    loop {
        match worker::process_next_due(&pool, &reconciler, resync_interval, max_backoff).await {
            Ok(true) => {
                processed_count += 1;
                if processed_count % 10 == 0 {
                    let remaining = db::count_pollable(&pool).await?;
                    info!(processed = processed_count, remaining, "reconciliation progress");
                }
            }
            Ok(false) => {
                let remaining = db::count_pollable(&pool).await?;
                if remaining == 0 {
                    info!(total_processed = processed_count, "all messages reconciled");
                    break;
                }

                // Nothing due but messages remain: everything is waiting on
                // a future poll time (steady re-poll or provider backoff).
                let waiting: Vec<(i64, i32, String)> = sqlx::query_as(
                    "SELECT id, poll_attempt, next_poll_at FROM messages \
                     WHERE next_poll_at IS NOT NULL",
                )
                .fetch_all(&pool)
                .await?;

                let max_attempt = waiting.iter().map(|(_, a, _)| *a).max().unwrap_or(0);
                let next_due = waiting
                    .iter()
                    .map(|(_, _, due)| due.as_str())
                    .min()
                    .unwrap_or("unknown");
                warn!(
                    remaining,
                    max_attempt,
                    next_due_at = %next_due,
                    "no due messages; {} still waiting",
                    remaining
                );

                if max_attempt >= args.max_attempts {
                    error!(
                        max_attempt,
                        threshold = args.max_attempts,
                        "messages exceeded maximum poll attempts, exiting"
                    );
                    break;
                }
                if args.skip_backlogged {
                    warn!("--skip-backlogged specified, exiting with messages remaining");
                    break;
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Err(err) => {
                error!(?err, "error reconciling message");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }

    info!("one-shot reconciliation finished");
    Ok(())
}
