// src/results.rs

use std::collections::HashMap;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use log::info;
use serde::Serialize;
use uuid::Uuid;

/// Outcome of candidate selection plus pair generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PairGenerationStats {
    pub selected_items: usize,
    pub sources: usize,
    /// Pairs enumerated, including ones already in the catalog.
    pub pairs_generated: usize,
    pub duration_secs: f64,
}

/// What one scoring worker got through before the catalog ran dry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoringStats {
    pub worker_id: String,
    pub batches: usize,
    pub pairs_claimed: usize,
    pub pairs_scored: usize,
    /// Scored but failed the jaccard consistency check.
    pub pairs_skipped: usize,
    pub edges_saved: usize,
    pub duration_secs: f64,
}

impl ScoringStats {
    pub fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusteringStats {
    pub graph_items: usize,
    pub graph_edges: usize,
    pub clusters: usize,
    pub noise: usize,
    pub clustered_items: usize,
    pub interesting: usize,
    pub duration_secs: f64,
}

/// Complete pipeline run statistics
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub run_id: String,
    pub run_timestamp: NaiveDateTime,
    pub description: Option<String>,

    pub generation: PairGenerationStats,
    pub scoring: Vec<ScoringStats>,
    pub clustering: ClusteringStats,

    pub total_processing_time: f64,
}

impl PipelineStats {
    pub fn new(description: Option<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            run_timestamp: Utc::now().naive_utc(),
            description,
            generation: PairGenerationStats::default(),
            scoring: Vec::new(),
            clustering: ClusteringStats::default(),
            total_processing_time: 0.0,
        }
    }

    pub fn total_pairs_scored(&self) -> usize {
        self.scoring.iter().map(|s| s.pairs_scored).sum()
    }

    pub fn total_edges_saved(&self) -> usize {
        self.scoring.iter().map(|s| s.edges_saved).sum()
    }
}

/// Logs a summary of the run, phase by phase.
pub fn log_report(stats: &PipelineStats, phase_times: &HashMap<String, Duration>) {
    info!("========== NEWSCLUSTER PIPELINE REPORT ==========");
    info!("Run ID: {}", stats.run_id);
    info!("Timestamp: {}", stats.run_timestamp);
    if let Some(desc) = &stats.description {
        info!("Description: {}", desc);
    }

    info!("--- CANDIDATES ---");
    info!(
        "Selected {} items from {} sources, {} pairs",
        stats.generation.selected_items, stats.generation.sources, stats.generation.pairs_generated
    );

    info!("--- SCORING ---");
    for worker in &stats.scoring {
        info!(
            "Worker {}: {} batches, {} pairs scored, {} skipped, {} edges saved",
            worker.worker_id,
            worker.batches,
            worker.pairs_scored,
            worker.pairs_skipped,
            worker.edges_saved
        );
    }
    info!(
        "Total: {} pairs scored, {} edges saved",
        stats.total_pairs_scored(),
        stats.total_edges_saved()
    );

    info!("--- CLUSTERING ---");
    info!(
        "Graph of {} items and {} edges: {} clusters ({} items), {} noise, {} interesting",
        stats.clustering.graph_items,
        stats.clustering.graph_edges,
        stats.clustering.clusters,
        stats.clustering.clustered_items,
        stats.clustering.noise,
        stats.clustering.interesting
    );

    info!("--- TIMING ---");
    let mut phases: Vec<_> = phase_times.iter().collect();
    phases.sort_by(|a, b| a.0.cmp(b.0));
    for (phase, elapsed) in phases {
        info!("{}: {:.2?}", phase, elapsed);
    }
    info!("Total processing time: {:.2} seconds", stats.total_processing_time);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_totals() {
        let mut stats = PipelineStats::new(None);
        assert!(!stats.run_id.is_empty());

        let mut a = ScoringStats::new("host-1");
        a.pairs_scored = 10;
        a.edges_saved = 3;
        let mut b = ScoringStats::new("host-2");
        b.pairs_scored = 5;
        b.edges_saved = 1;
        stats.scoring = vec![a, b];

        assert_eq!(stats.total_pairs_scored(), 15);
        assert_eq!(stats.total_edges_saved(), 4);
    }
}
