// src/config.rs

// Candidate selection: combined_count / combined_av must exceed this
pub const DEFAULT_SELECTION_THRESHOLD: f64 = 0.5;

// Total number of items selected across all sources
pub const DEFAULT_MAX_ITEMS: usize = 2000;

// Pairs written per insert statement
pub const DEFAULT_SAVE_BATCH_SIZE: usize = 10_000;

// Pairs handed to a worker per claim
pub const DEFAULT_CLAIM_LIMIT: usize = 10_000;

// Score used for complete term overlap and for every shared link
pub const SIMILARITY_SENTINEL: f64 = 999.0;

// Clustering looks back this many days for root items
pub const DEFAULT_DAYS_BACK: i64 = 2;

// Adaptive cutoff for "interesting" clusters. Deliberate heuristics, not derived values.
pub const LARGE_CLUSTER_COUNT: usize = 20;
pub const MEDIUM_CLUSTER_COUNT: usize = 10;
pub const LARGE_PERCENTILE: f64 = 0.9;
pub const MEDIUM_PERCENTILE: f64 = 0.8;
pub const SMALL_PERCENTILE: f64 = 0.5;

// Cleanup cutoffs are plain calendar dates
pub const CUTOFF_DATE_FORMAT: &str = "%Y-%m-%d";
