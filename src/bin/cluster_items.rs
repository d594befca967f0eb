// src/bin/cluster_items.rs
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use log::info;
use serde::Serialize;
use std::time::Instant;

use newscluster_lib::{config, db, run_clustering, ClusterConfig, PgStore, ReportOptions, ScoreKey};

#[derive(Parser, Debug)]
#[command(name = "cluster_items")]
#[command(about = "Cluster recent items over the similarity graph and report the results")]
struct Args {
    /// Smallest similarity for two items to count as neighbours
    #[arg(long)]
    epsilon: f64,

    /// Neighbours an item needs to seed a cluster
    #[arg(long)]
    min_pts: usize,

    /// Base clusters on items newer than this many days
    #[arg(long, default_value_t = config::DEFAULT_DAYS_BACK)]
    days_back: i64,

    /// Print cluster membership
    #[arg(long)]
    clusters: bool,

    /// Print every materialized cluster member
    #[arg(long)]
    members: bool,

    /// Print cluster statistics
    #[arg(long)]
    stats: bool,

    /// Print the best cluster and item
    #[arg(long)]
    best: bool,

    /// Print the best item of each interesting cluster
    #[arg(long)]
    interesting: bool,

    /// Fixed score cutoff for --interesting instead of the adaptive percentile
    #[arg(long)]
    min_score: Option<f64>,

    #[arg(long, value_enum, default_value_t = ScoreKey::MaxScore)]
    score_key: ScoreKey,

    /// Print the top N keywords of each cluster
    #[arg(long)]
    keywords: Option<usize>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    info!("Starting clustering");
    let start_time = Instant::now();
    db::load_env();

    let pool = db::connect()
        .await
        .context("Failed to connect to database")?;
    db::ensure_schema(&pool).await?;
    let store = PgStore::new(pool);

    let cluster_config = ClusterConfig {
        epsilon: args.epsilon,
        min_pts: args.min_pts,
        days_back: args.days_back,
    };
    let options = ReportOptions {
        min_score: args.min_score,
        score_key: args.score_key,
        keywords: args.keywords,
    };
    let report = run_clustering(&store, cluster_config, options, Utc::now().naive_utc()).await?;

    if args.clusters {
        print_json(&report.clustering.clusters)?;
    }
    if args.members {
        print_json(&report.members)?;
    }
    if args.stats {
        print_json(&report.stats)?;
    }
    if args.best {
        print_json(&report.best)?;
    }
    if args.interesting {
        print_json(&report.interesting)?;
    }
    if report.keywords.is_some() {
        print_json(&report.keywords)?;
    }

    info!(
        "Clustering completed in {:.2?}: {} clusters, {} noise",
        start_time.elapsed(),
        report.summary.clusters,
        report.summary.noise
    );
    Ok(())
}
