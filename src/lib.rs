// src/lib.rs
pub mod analytics;
pub mod config;
pub mod db;
pub mod dbscan;
pub mod error;
pub mod models;
pub mod pairs;
pub mod results;
pub mod selection;
pub mod similarity;
pub mod store;

// Re-export common types for easier access
pub use error::ClusterError;
pub use models::{CandidatePair, ItemId, ItemRecord, SimilarityEdge, TermStore};

// Re-export important functionality
pub use analytics::{run_clustering, ClusterAnalytics, ClusterReport, ReportOptions, ScoreKey};
pub use db::PgPool;
pub use dbscan::{ClusterConfig, ClusterEngine, Clustering, SimilarityGraph};
pub use pairs::{run_pair_generation, PairCatalog};
pub use selection::{CandidateSelector, SelectionConfig};
pub use similarity::{run_scoring, JaccardRule, ScoringConfig, SimilarityScorer};
pub use store::{MemoryFixture, MemoryStore, PgStore, Store};
