// src/bin/score_pairs.rs
use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::time::{Duration, Instant};

use newscluster_lib::pairs::lease_from_secs;
use newscluster_lib::{config, db, run_scoring, ClusterError, JaccardRule, PgStore, ScoringConfig};

#[derive(Parser, Debug)]
#[command(name = "score_pairs")]
#[command(about = "Claim pairs from the catalog, score them and save the similar ones")]
struct Args {
    /// Worker identity recorded on claimed pairs. Defaults to <host>-<pid>.
    #[arg(long)]
    worker: Option<String>,

    /// Pairs claimed per round
    #[arg(long, default_value_t = config::DEFAULT_CLAIM_LIMIT)]
    sample_limit: usize,

    /// Smallest combined score worth saving; 0 keeps any positive score
    #[arg(long, default_value_t = 0.0)]
    epsilon: f64,

    /// Seconds to pause after each claim
    #[arg(long, default_value_t = 0.0)]
    wait: f64,

    /// Stop after claiming this many pairs
    #[arg(long)]
    max_pairs: Option<usize>,

    /// Similarity rows written per upsert
    #[arg(long, default_value_t = config::DEFAULT_SAVE_BATCH_SIZE)]
    save_batch_size: usize,

    /// Worker loops to run in this process
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Release claims older than this many seconds before each claim
    #[arg(long)]
    lease_secs: Option<u64>,

    #[arg(long, value_enum, default_value_t = JaccardRule::Legacy)]
    jaccard_rule: JaccardRule,

    /// Clear the similarity table and every pair claim first
    #[arg(long)]
    clean: bool,
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    let poll_delay = Duration::try_from_secs_f64(args.wait)
        .map_err(|e| ClusterError::validation(format!("invalid --wait {}: {}", args.wait, e)))?;
    let lease = args.lease_secs.map(lease_from_secs).transpose()?;
    let scoring = ScoringConfig {
        epsilon: args.epsilon,
        save_batch_size: args.save_batch_size,
        claim_limit: args.sample_limit,
        poll_delay,
        max_pairs: args.max_pairs,
        lease,
        rule: args.jaccard_rule,
    };
    scoring.validate()?;
    let worker = args.worker.unwrap_or_else(default_worker_id);

    info!("Starting similarity scoring as {}", worker);
    let start_time = Instant::now();
    db::load_env();

    let pool = db::connect()
        .await
        .context("Failed to connect to database")?;
    db::ensure_schema(&pool).await?;
    let store = PgStore::new(pool);

    let stats = run_scoring(&store, &worker, args.concurrency, &scoring, args.clean).await?;

    println!("{}", serde_json::to_string_pretty(&stats)?);
    info!(
        "Scored {} pairs in {:.2?}",
        stats.iter().map(|s| s.pairs_scored).sum::<usize>(),
        start_time.elapsed()
    );
    Ok(())
}
