// src/error.rs

use crate::models::ItemId;

/// Domain failures raised by the clustering core.
///
/// Storage failures are not represented here; they travel as `anyhow::Error` with context and
/// are left to the caller to retry.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Malformed cutoff date or invalid configuration. Fatal to the calling operation.
    #[error("validation error: {0}")]
    Validation(String),

    /// An id in the candidate set has no entry in the loaded similarity graph.
    /// Indicates upstream data corruption; the run must abort.
    #[error("missing neighbour data for item {0}")]
    MissingNeighborData(ItemId),

    /// Weighted jaccard produced an intersection larger than the union.
    #[error("jaccard error for items {id1} and {id2}: intersection {intersection} union {union}")]
    Scoring {
        id1: ItemId,
        id2: ItemId,
        intersection: i64,
        union: i64,
    },

    /// Statistics or rankings were requested before cluster members were materialized.
    #[error("{0} requires cluster members to be materialized first")]
    PrecursorMissing(&'static str),
}

impl ClusterError {
    pub fn validation(message: impl Into<String>) -> Self {
        ClusterError::Validation(message.into())
    }
}
