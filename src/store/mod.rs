// src/store/mod.rs
//
// Storage seams shared by every pipeline phase. The feature extractor owns the item tables;
// this crate only reads them and flips the `selected` / `processed` marks. Pairs and
// similarity rows are owned here.

pub mod memory;
pub mod postgres;

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};

use crate::models::{CandidatePair, ItemDetails, ItemId, LinkEdge, SimilarityEdge, TermStore};

pub use memory::{MemoryFixture, MemoryStore};
pub use postgres::PgStore;

/// Read access to extracted item features plus the selection/consideration marks.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Per-source number of items with `combined_count / combined_av > threshold`.
    async fn qualifying_counts(&self, threshold: f64) -> Result<BTreeMap<String, usize>>;

    /// Qualifying items of one source, highest engagement first.
    async fn top_qualifying(
        &self,
        source: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ItemId>>;

    async fn clear_selection(&self) -> Result<u64>;

    async fn mark_selected(&self, ids: &[ItemId], on: NaiveDate) -> Result<u64>;

    /// Words and bigrams of every extracted item, merged into one bag per item.
    ///
    /// Not limited to the current selection: pairs left open by an earlier selection run
    /// still have to score against their own terms.
    async fn load_terms(&self) -> Result<TermStore>;

    async fn load_links(&self) -> Result<Vec<LinkEdge>>;

    /// Timestamps items as having been through similarity scoring.
    async fn mark_considered(&self, ids: &[ItemId], at: NaiveDateTime) -> Result<u64>;

    /// Smallest item id created after `since`.
    async fn window_start(&self, since: NaiveDateTime) -> Result<Option<ItemId>>;

    /// Items marked considered with `id >= start`.
    async fn considered_since(&self, start: ItemId) -> Result<Vec<ItemId>>;

    async fn fetch_details(&self, ids: &[ItemId]) -> Result<HashMap<ItemId, ItemDetails>>;

    /// Single-word term counts (no bigrams) for the given items.
    async fn word_counts(&self, ids: &[ItemId]) -> Result<TermStore>;
}

/// The shared pair catalog workers coordinate through.
#[async_trait]
pub trait PairLedger: Send + Sync {
    /// Inserts pairs, leaving existing ones untouched. Returns rows actually inserted.
    async fn insert_pairs(&self, pairs: &[(ItemId, ItemId)], added: NaiveDateTime) -> Result<u64>;

    /// Atomically claims up to `limit` unclaimed, unprocessed pairs in `(id1, id2)` order.
    async fn claim_pairs(
        &self,
        worker_id: &str,
        limit: usize,
        now: NaiveDateTime,
    ) -> Result<Vec<CandidatePair>>;

    async fn complete_pairs(&self, pairs: &[(ItemId, ItemId)], at: NaiveDateTime) -> Result<u64>;

    /// Drops every pair.
    async fn reset_pairs(&self) -> Result<()>;

    async fn delete_claimed_before(&self, cutoff: NaiveDateTime) -> Result<u64>;

    /// Unclaims pairs claimed before `cutoff` that were never completed.
    async fn release_claimed_before(&self, cutoff: NaiveDateTime) -> Result<u64>;

    /// Clears claim and completion marks on every pair.
    async fn reset_claims(&self) -> Result<u64>;

    async fn unprocessed_pairs(
        &self,
        added_before: Option<NaiveDateTime>,
    ) -> Result<Vec<CandidatePair>>;
}

/// The persisted similarity graph.
#[async_trait]
pub trait SimilarityStore: Send + Sync {
    /// Inserts or overwrites edges keyed by `(id1, id2)`.
    async fn upsert_edges(&self, edges: &[SimilarityEdge]) -> Result<u64>;

    /// Edges whose smaller id is at least `start`.
    async fn edges_since(&self, start: ItemId) -> Result<Vec<SimilarityEdge>>;

    async fn reset_similarities(&self) -> Result<()>;
}

/// Everything a full pipeline run needs.
pub trait Store: FeatureStore + PairLedger + SimilarityStore {}

impl<T: FeatureStore + PairLedger + SimilarityStore + ?Sized> Store for T {}
