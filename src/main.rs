// src/main.rs
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use log::info;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use newscluster_lib::{
    config, db, run_clustering, run_pair_generation, run_scoring,
    results::{self, PipelineStats},
    ClusterConfig, JaccardRule, PgStore, ReportOptions, ScoreKey, ScoringConfig, SelectionConfig,
    Store,
};

#[derive(Parser, Debug)]
#[command(name = "newscluster")]
#[command(about = "Select, pair, score and cluster recent items in one run")]
struct Args {
    #[arg(long, default_value_t = config::DEFAULT_SELECTION_THRESHOLD)]
    threshold: f64,

    #[arg(long, default_value_t = config::DEFAULT_MAX_ITEMS)]
    max_items: usize,

    /// Minimum combined score for a pair to be saved
    #[arg(long, default_value_t = 0.0)]
    score_epsilon: f64,

    /// Minimum similarity for two items to be neighbours when clustering
    #[arg(long, default_value_t = 0.1)]
    cluster_epsilon: f64,

    #[arg(long, default_value_t = 2)]
    min_pts: usize,

    #[arg(long, default_value_t = config::DEFAULT_DAYS_BACK)]
    days_back: i64,

    /// Scoring worker loops to run concurrently
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    #[arg(long, value_enum, default_value_t = JaccardRule::Legacy)]
    jaccard_rule: JaccardRule,

    #[arg(long, default_value = "pipeline")]
    worker: String,

    /// Drop the pair catalog and similarity rows before running
    #[arg(long)]
    clean: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    info!("Starting newscluster pipeline");
    let start_time = Instant::now();
    db::load_env();

    // Connect to the database
    let pool = db::connect()
        .await
        .context("Failed to connect to database")?;
    info!("Successfully connected to the database");
    db::ensure_schema(&pool).await?;
    let store = PgStore::new(pool);

    // Capture timing information for each phase
    let mut phase_times = HashMap::new();
    let mut stats = run_pipeline(&store, &args, &mut phase_times).await?;
    stats.total_processing_time = start_time.elapsed().as_secs_f64();

    results::log_report(&stats, &phase_times);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    info!("Pipeline completed in {:.2?}", start_time.elapsed());
    Ok(())
}

async fn run_pipeline<S: Store + ?Sized>(
    store: &S,
    args: &Args,
    phase_times: &mut HashMap<String, Duration>,
) -> Result<PipelineStats> {
    let mut stats = PipelineStats::new(Some("Full pipeline run".to_string()));
    let clean = args.clean;
    info!("Run ID: {}", stats.run_id);

    // Phase 1: candidate selection and pair generation
    info!("Phase 1: Pair generation");
    let phase1_start = Instant::now();
    let selection = SelectionConfig {
        threshold: args.threshold,
        max_items: args.max_items,
    };
    stats.generation =
        run_pair_generation(store, selection, config::DEFAULT_SAVE_BATCH_SIZE, clean).await?;
    phase_times.insert("pair_generation".to_string(), phase1_start.elapsed());
    info!("Pipeline progress: [1/3] phases (33%)");

    // Phase 2: similarity scoring
    info!("Phase 2: Similarity scoring");
    let phase2_start = Instant::now();
    let scoring = ScoringConfig {
        epsilon: args.score_epsilon,
        rule: args.jaccard_rule,
        ..ScoringConfig::default()
    };
    stats.scoring = run_scoring(store, &args.worker, args.concurrency, &scoring, clean).await?;
    phase_times.insert("similarity_scoring".to_string(), phase2_start.elapsed());
    info!("Pipeline progress: [2/3] phases (67%)");

    // Phase 3: clustering
    info!("Phase 3: Clustering");
    let phase3_start = Instant::now();
    let cluster_config = ClusterConfig {
        epsilon: args.cluster_epsilon,
        min_pts: args.min_pts,
        days_back: args.days_back,
    };
    let options = ReportOptions {
        min_score: None,
        score_key: ScoreKey::MaxScore,
        keywords: None,
    };
    let report = run_clustering(store, cluster_config, options, Utc::now().naive_utc()).await?;
    stats.clustering = report.summary;
    phase_times.insert("clustering".to_string(), phase3_start.elapsed());
    info!("Pipeline progress: [3/3] phases (100%)");

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_is_opt_in() {
        let args = Args::try_parse_from(["newscluster"]).unwrap();
        assert!(!args.clean);
        let args = Args::try_parse_from(["newscluster", "--clean"]).unwrap();
        assert!(args.clean);
    }
}
