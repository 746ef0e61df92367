use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use hubcast::config::Config;
use hubcast::gateway::{HttpProviderGateway, ProviderGateway};

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Provider group id to inspect
    #[arg(long)]
    group_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let raw = fs::read_to_string(&args.config)?;
    let cfg: Config = serde_yaml::from_str(&raw)?;
    let gateway = HttpProviderGateway::from_config(&cfg)?;

    let snapshot = gateway.query_status(&args.group_id).await?;
    println!("Group: {}", args.group_id);
    println!(
        "  total: {}  success: {}  fail: {}  sending: {}",
        snapshot.counts.total,
        snapshot.counts.success,
        snapshot.counts.fail,
        snapshot.counts.sending
    );
    println!("  captured_at: {}", snapshot.captured_at);
    match snapshot.failed_addresses {
        Some(failed) => println!("  failed recipients ({}): {:?}", failed.len(), failed),
        None => println!("  failed recipients: not exposed by provider"),
    }
    Ok(())
}
