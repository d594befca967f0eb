// src/store/memory.rs

//! In-memory store
//!
//! Holds the same tables as the PostgreSQL schema behind one `tokio::sync::Mutex`, so every
//! trait call is atomic with respect to the others. Claims taken through a shared
//! `Arc<MemoryStore>` are therefore exclusive, which makes it a faithful stand-in for the
//! catalog in tests and fixture runs.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::Mutex;

use crate::models::{
    CandidatePair, ItemDetails, ItemId, LinkEdge, SimilarityEdge, TermCounts, TermStore,
};
use crate::store::{FeatureStore, PairLedger, SimilarityStore};

#[derive(Debug, Clone)]
struct FeatureRow {
    details: ItemDetails,
    selected: Option<NaiveDate>,
    processed: Option<NaiveDateTime>,
}

/// Item tables as the feature extractor would leave them.
#[derive(Debug, Clone, Default)]
pub struct MemoryFixture {
    items: BTreeMap<ItemId, ItemDetails>,
    baselines: HashMap<String, f64>,
    words: TermStore,
    bigrams: TermStore,
    links: Vec<LinkEdge>,
}

impl MemoryFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item(mut self, details: ItemDetails) -> Self {
        self.items.insert(details.id, details);
        self
    }

    /// Per-source engagement baseline (`users.combined_av`).
    pub fn baseline(mut self, source: impl Into<String>, combined_av: f64) -> Self {
        self.baselines.insert(source.into(), combined_av);
        self
    }

    pub fn words(mut self, id: ItemId, terms: &[(&str, i64)]) -> Self {
        self.words.insert_item(id, to_counts(terms));
        self
    }

    pub fn bigrams(mut self, id: ItemId, terms: &[(&str, i64)]) -> Self {
        self.bigrams.insert_item(id, to_counts(terms));
        self
    }

    pub fn link(mut self, id: ItemId, resource: &str) -> Self {
        self.links.push(LinkEdge::new(id, resource));
        self
    }
}

fn to_counts(terms: &[(&str, i64)]) -> TermCounts {
    let mut counts = TermCounts::new();
    for (term, count) in terms {
        *counts.entry(term.to_string()).or_insert(0) += count;
    }
    counts
}

#[derive(Debug, Default)]
struct MemoryState {
    features: BTreeMap<ItemId, FeatureRow>,
    baselines: HashMap<String, f64>,
    words: TermStore,
    bigrams: TermStore,
    links: Vec<LinkEdge>,
    pairs: BTreeMap<(ItemId, ItemId), CandidatePair>,
    similarity: BTreeMap<(ItemId, ItemId), SimilarityEdge>,
}

impl MemoryState {
    fn qualifies(&self, row: &FeatureRow, threshold: f64) -> bool {
        match self.baselines.get(&row.details.screen_name) {
            Some(&baseline) if baseline > 0.0 => {
                row.details.combined_count as f64 / baseline > threshold
            }
            _ => false,
        }
    }
}

/// Store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: MemoryFixture) -> Self {
        let features = fixture
            .items
            .into_iter()
            .map(|(id, details)| {
                (
                    id,
                    FeatureRow {
                        details,
                        selected: None,
                        processed: None,
                    },
                )
            })
            .collect();
        Self {
            state: Mutex::new(MemoryState {
                features,
                baselines: fixture.baselines,
                words: fixture.words,
                bigrams: fixture.bigrams,
                links: fixture.links,
                ..MemoryState::default()
            }),
        }
    }

    /// Every pair currently in the catalog, in key order.
    pub async fn pairs_snapshot(&self) -> Vec<CandidatePair> {
        let state = self.state.lock().await;
        state.pairs.values().cloned().collect()
    }

    /// Every persisted similarity edge, in key order.
    pub async fn similarity_snapshot(&self) -> Vec<SimilarityEdge> {
        let state = self.state.lock().await;
        state.similarity.values().cloned().collect()
    }

    pub async fn selected_ids(&self) -> Vec<ItemId> {
        let state = self.state.lock().await;
        state
            .features
            .iter()
            .filter(|(_, row)| row.selected.is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn considered_ids(&self) -> Vec<ItemId> {
        let state = self.state.lock().await;
        state
            .features
            .iter()
            .filter(|(_, row)| row.processed.is_some())
            .map(|(id, _)| *id)
            .collect()
    }
}

#[async_trait]
impl FeatureStore for MemoryStore {
    async fn qualifying_counts(&self, threshold: f64) -> Result<BTreeMap<String, usize>> {
        let state = self.state.lock().await;
        let mut counts = BTreeMap::new();
        for row in state.features.values() {
            if state.qualifies(row, threshold) {
                *counts.entry(row.details.screen_name.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn top_qualifying(
        &self,
        source: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ItemId>> {
        let state = self.state.lock().await;
        let mut candidates: Vec<&FeatureRow> = state
            .features
            .values()
            .filter(|row| row.details.screen_name == source && state.qualifies(row, threshold))
            .collect();
        candidates.sort_by(|a, b| {
            b.details
                .combined_count
                .cmp(&a.details.combined_count)
                .then(a.details.id.cmp(&b.details.id))
        });
        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|row| row.details.id)
            .collect())
    }

    async fn clear_selection(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut cleared = 0;
        for row in state.features.values_mut() {
            if row.selected.take().is_some() {
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn mark_selected(&self, ids: &[ItemId], on: NaiveDate) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut marked = 0;
        for id in ids {
            if let Some(row) = state.features.get_mut(id) {
                row.selected = Some(on);
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn load_terms(&self) -> Result<TermStore> {
        let state = self.state.lock().await;
        let mut terms = TermStore::new();
        for id in state.features.keys() {
            for source in [&state.words, &state.bigrams] {
                if let Some(counts) = source.get(*id) {
                    terms.insert_item(*id, counts.clone());
                }
            }
        }
        Ok(terms)
    }

    async fn load_links(&self) -> Result<Vec<LinkEdge>> {
        let state = self.state.lock().await;
        Ok(state.links.clone())
    }

    async fn mark_considered(&self, ids: &[ItemId], at: NaiveDateTime) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut marked = 0;
        for id in ids {
            if let Some(row) = state.features.get_mut(id) {
                row.processed = Some(at);
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn window_start(&self, since: NaiveDateTime) -> Result<Option<ItemId>> {
        let state = self.state.lock().await;
        Ok(state
            .features
            .values()
            .filter(|row| row.details.created_at > since)
            .map(|row| row.details.id)
            .min())
    }

    async fn considered_since(&self, start: ItemId) -> Result<Vec<ItemId>> {
        let state = self.state.lock().await;
        Ok(state
            .features
            .range(start..)
            .filter(|(_, row)| row.processed.is_some())
            .map(|(id, _)| *id)
            .collect())
    }

    async fn fetch_details(&self, ids: &[ItemId]) -> Result<HashMap<ItemId, ItemDetails>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.features.get(id).map(|row| (*id, row.details.clone())))
            .collect())
    }

    async fn word_counts(&self, ids: &[ItemId]) -> Result<TermStore> {
        let state = self.state.lock().await;
        let mut terms = TermStore::new();
        for id in ids {
            if let Some(counts) = state.words.get(*id) {
                if !terms.contains(*id) {
                    terms.insert_item(*id, counts.clone());
                }
            }
        }
        Ok(terms)
    }
}

#[async_trait]
impl PairLedger for MemoryStore {
    async fn insert_pairs(&self, pairs: &[(ItemId, ItemId)], added: NaiveDateTime) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for &(a, b) in pairs {
            let mut pair = CandidatePair::new(a, b);
            if state.pairs.contains_key(&pair.key()) {
                continue;
            }
            pair.added = Some(added);
            state.pairs.insert(pair.key(), pair);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn claim_pairs(
        &self,
        worker_id: &str,
        limit: usize,
        now: NaiveDateTime,
    ) -> Result<Vec<CandidatePair>> {
        let mut state = self.state.lock().await;
        let mut claimed = Vec::new();
        for pair in state.pairs.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if pair.is_claimable() {
                pair.claimed_by = Some(worker_id.to_string());
                pair.claimed_at = Some(now);
                claimed.push(pair.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_pairs(&self, pairs: &[(ItemId, ItemId)], at: NaiveDateTime) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut completed = 0;
        for key in pairs {
            if let Some(pair) = state.pairs.get_mut(key) {
                pair.processed_at = Some(at);
                completed += 1;
            }
        }
        Ok(completed)
    }

    async fn reset_pairs(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.pairs.clear();
        Ok(())
    }

    async fn delete_claimed_before(&self, cutoff: NaiveDateTime) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.pairs.len();
        state
            .pairs
            .retain(|_, pair| !matches!(pair.claimed_at, Some(at) if at < cutoff));
        Ok((before - state.pairs.len()) as u64)
    }

    async fn release_claimed_before(&self, cutoff: NaiveDateTime) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for pair in state.pairs.values_mut() {
            let expired = matches!(pair.claimed_at, Some(at) if at < cutoff);
            if expired && pair.processed_at.is_none() {
                pair.claimed_by = None;
                pair.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn reset_claims(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        for pair in state.pairs.values_mut() {
            pair.claimed_by = None;
            pair.claimed_at = None;
            pair.processed_at = None;
        }
        Ok(state.pairs.len() as u64)
    }

    async fn unprocessed_pairs(
        &self,
        added_before: Option<NaiveDateTime>,
    ) -> Result<Vec<CandidatePair>> {
        let state = self.state.lock().await;
        Ok(state
            .pairs
            .values()
            .filter(|pair| pair.processed_at.is_none())
            .filter(|pair| match (added_before, pair.added) {
                (Some(cutoff), Some(added)) => added < cutoff,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SimilarityStore for MemoryStore {
    async fn upsert_edges(&self, edges: &[SimilarityEdge]) -> Result<u64> {
        let mut state = self.state.lock().await;
        for edge in edges {
            let edge = SimilarityEdge::new(edge.id1, edge.id2, edge.jaccard, edge.links);
            state.similarity.insert(edge.key(), edge);
        }
        Ok(edges.len() as u64)
    }

    async fn edges_since(&self, start: ItemId) -> Result<Vec<SimilarityEdge>> {
        let state = self.state.lock().await;
        Ok(state
            .similarity
            .values()
            .filter(|edge| edge.id1 >= start)
            .cloned()
            .collect())
    }

    async fn reset_similarities(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.similarity.clear();
        Ok(())
    }
}
