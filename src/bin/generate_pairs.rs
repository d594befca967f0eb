// src/bin/generate_pairs.rs
use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::time::Instant;

use newscluster_lib::{config, db, run_pair_generation, PgStore, SelectionConfig};

#[derive(Parser, Debug)]
#[command(name = "generate_pairs")]
#[command(about = "Select high-engagement items and fill the pair catalog with every pair of them")]
struct Args {
    /// Items qualify when combined_count / combined_av exceeds this
    #[arg(long, default_value_t = config::DEFAULT_SELECTION_THRESHOLD)]
    threshold: f64,

    /// Total number of items to select across all sources
    #[arg(long, default_value_t = config::DEFAULT_MAX_ITEMS)]
    max_items: usize,

    /// Pairs written per insert
    #[arg(long, default_value_t = config::DEFAULT_SAVE_BATCH_SIZE)]
    save_batch_size: usize,

    /// Drop the existing pair catalog first
    #[arg(long)]
    clean: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    info!("Starting pair generation");
    let start_time = Instant::now();
    db::load_env();

    let pool = db::connect()
        .await
        .context("Failed to connect to database")?;
    db::ensure_schema(&pool).await?;
    let store = PgStore::new(pool);

    let selection = SelectionConfig {
        threshold: args.threshold,
        max_items: args.max_items,
    };
    let stats = run_pair_generation(&store, selection, args.save_batch_size, args.clean).await?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    info!("Pair generation completed in {:.2?}", start_time.elapsed());
    Ok(())
}
