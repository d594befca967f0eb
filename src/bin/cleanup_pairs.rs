// src/bin/cleanup_pairs.rs
use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use newscluster_lib::pairs::lease_from_secs;
use newscluster_lib::{config, db, PairCatalog, PgStore};

#[derive(Parser, Debug)]
#[command(name = "cleanup_pairs")]
#[command(about = "Reset the pair catalog or clear out stale claims")]
struct Args {
    /// Delete pairs claimed before this date (YYYY-MM-DD). Without it the catalog is dropped.
    #[arg(long)]
    cutoff: Option<String>,

    /// Only list unprocessed pairs (added before --cutoff, if given); nothing is deleted
    #[arg(long)]
    unprocessed: bool,

    /// Return unfinished claims older than this many seconds to the pool instead of deleting
    #[arg(long)]
    release_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();
    db::load_env();

    let pool = db::connect()
        .await
        .context("Failed to connect to database")?;
    db::ensure_schema(&pool).await?;
    let store = PgStore::new(pool);
    let catalog = PairCatalog::new(&store, config::DEFAULT_SAVE_BATCH_SIZE)?;

    if args.unprocessed {
        let pairs = catalog.unprocessed(args.cutoff.as_deref()).await?;
        info!("{} unprocessed pairs", pairs.len());
        println!("{}", serde_json::to_string_pretty(&pairs)?);
        return Ok(());
    }

    if let Some(secs) = args.release_secs {
        let released = catalog.release_expired(lease_from_secs(secs)?).await?;
        println!("{}", serde_json::json!({ "released": released }));
        return Ok(());
    }

    let deleted = catalog.cleanup(args.cutoff.as_deref()).await?;
    match args.cutoff {
        Some(cutoff) => info!("Removed {} pairs claimed before {}", deleted, cutoff),
        None => info!("Pair catalog dropped and recreated"),
    }
    println!("{}", serde_json::json!({ "deleted": deleted }));
    Ok(())
}
