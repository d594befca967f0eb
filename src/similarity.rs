// src/similarity.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::try_join_all;
use log::{debug, info, warn};
use serde::Serialize;

use crate::config;
use crate::error::ClusterError;
use crate::models::{
    canonical_pair, CandidatePair, ItemId, LinkEdge, SimilarityEdge, TermCounts, TermStore,
};
use crate::pairs::PairCatalog;
use crate::results::ScoringStats;
use crate::store::{FeatureStore, PairLedger, SimilarityStore, Store};

//------------------------------------------------------------------------------
// WEIGHTED JACCARD
//------------------------------------------------------------------------------

/// How the weighted overlap of two term bags is accumulated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum JaccardRule {
    /// Order dependent accumulation kept for score compatibility with existing graphs.
    /// Not symmetric when shared terms carry different weights.
    #[default]
    Legacy,
    /// Sum of per-term minimums over sum of per-term maximums.
    Symmetric,
}

/// Weighted jaccard of two term bags, expressed as `intersection / (union - intersection)`.
///
/// Full overlap scores [`config::SIMILARITY_SENTINEL`]. Under [`JaccardRule::Legacy`] an empty
/// bag counts as full overlap too; [`JaccardRule::Symmetric`] scores it 0.
pub fn weighted_jaccard(
    id1: ItemId,
    a: &TermCounts,
    id2: ItemId,
    b: &TermCounts,
    rule: JaccardRule,
) -> Result<f64, ClusterError> {
    let (intersection, union) = match rule {
        JaccardRule::Legacy => legacy_overlap(a, b),
        JaccardRule::Symmetric if a.is_empty() || b.is_empty() => return Ok(0.0),
        JaccardRule::Symmetric => symmetric_overlap(a, b),
    };

    if union == intersection {
        return Ok(config::SIMILARITY_SENTINEL);
    }
    if intersection > union {
        return Err(ClusterError::Scoring {
            id1,
            id2,
            intersection,
            union,
        });
    }
    Ok(intersection as f64 / (union - intersection) as f64)
}

// Every (term of a, term of b) combination writes b's weight and then a's weight into the
// union, so whichever write lands last for a term is the one that counts.
fn legacy_overlap(a: &TermCounts, b: &TermCounts) -> (i64, i64) {
    let mut intersection: HashMap<&str, i64> = HashMap::new();
    let mut union: HashMap<&str, i64> = HashMap::new();
    for (term_a, &weight_a) in a {
        for (term_b, &weight_b) in b {
            if term_a == term_b {
                intersection.insert(term_b.as_str(), weight_b);
            }
            union.insert(term_b.as_str(), weight_b);
            union.insert(term_a.as_str(), weight_a);
        }
    }
    (intersection.values().sum(), union.values().sum())
}

fn symmetric_overlap(a: &TermCounts, b: &TermCounts) -> (i64, i64) {
    let terms: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    let mut intersection = 0;
    let mut union = 0;
    for term in terms {
        let weight_a = a.get(term).copied().unwrap_or(0);
        let weight_b = b.get(term).copied().unwrap_or(0);
        intersection += weight_a.min(weight_b);
        union += weight_a.max(weight_b);
    }
    (intersection, union)
}

//------------------------------------------------------------------------------
// SHARED LINKS
//------------------------------------------------------------------------------

/// Resource -> items referencing it, plus the per-pair score derived from it.
#[derive(Debug, Clone, Default)]
pub struct LinkIndex {
    by_resource: BTreeMap<String, Vec<ItemId>>,
    pair_scores: HashMap<(ItemId, ItemId), f64>,
}

impl LinkIndex {
    pub fn from_edges(edges: &[LinkEdge]) -> Self {
        let mut by_resource: BTreeMap<String, Vec<ItemId>> = BTreeMap::new();
        for edge in edges {
            by_resource
                .entry(edge.resource.clone())
                .or_default()
                .push(edge.id);
        }

        let mut pair_scores = HashMap::new();
        for items in by_resource.values_mut() {
            items.sort_unstable();
            items.dedup();
            for (i, &a) in items.iter().enumerate() {
                for &b in &items[i + 1..] {
                    *pair_scores.entry((a, b)).or_insert(0.0) += config::SIMILARITY_SENTINEL;
                }
            }
        }
        Self {
            by_resource,
            pair_scores,
        }
    }

    /// Sentinel weight per resource both items reference.
    pub fn score(&self, a: ItemId, b: ItemId) -> f64 {
        self.pair_scores
            .get(&canonical_pair(a, b))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn items_for(&self, resource: &str) -> &[ItemId] {
        self.by_resource
            .get(resource)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn resource_count(&self) -> usize {
        self.by_resource.len()
    }
}

//------------------------------------------------------------------------------
// SCORER
//------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PairScore {
    pub jaccard: f64,
    pub links: f64,
}

impl PairScore {
    pub fn total(&self) -> f64 {
        self.jaccard + self.links
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    /// Minimum total score to persist. Zero keeps any positive score.
    pub epsilon: f64,
    pub save_batch_size: usize,
    /// Pairs claimed per round.
    pub claim_limit: usize,
    /// Pause between claiming and scoring.
    pub poll_delay: Duration,
    /// Stop after this many claimed pairs.
    pub max_pairs: Option<usize>,
    /// Release claims older than this before each claim.
    pub lease: Option<chrono::Duration>,
    pub rule: JaccardRule,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.0,
            save_batch_size: config::DEFAULT_SAVE_BATCH_SIZE,
            claim_limit: config::DEFAULT_CLAIM_LIMIT,
            poll_delay: Duration::ZERO,
            max_pairs: None,
            lease: None,
            rule: JaccardRule::default(),
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ClusterError> {
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(ClusterError::validation(format!(
                "epsilon must be a non-negative number, got {}",
                self.epsilon
            )));
        }
        if self.save_batch_size == 0 {
            return Err(ClusterError::validation("save_batch_size must be positive"));
        }
        if self.claim_limit == 0 {
            return Err(ClusterError::validation("sample limit must be positive"));
        }
        if matches!(self.lease, Some(lease) if lease <= chrono::Duration::zero()) {
            return Err(ClusterError::validation("lease must be positive"));
        }
        Ok(())
    }

    /// Whether a pair with this total is worth persisting.
    pub fn passes(&self, total: f64) -> bool {
        if self.epsilon == 0.0 {
            total > 0.0
        } else {
            total >= self.epsilon
        }
    }
}

/// Counts for one scored batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub scored: usize,
    pub saved: usize,
    pub skipped: usize,
}

/// Scores pairs from term bags and shared links held in memory.
#[derive(Debug, Clone, Default)]
pub struct SimilarityScorer {
    terms: TermStore,
    links: LinkIndex,
    rule: JaccardRule,
}

impl SimilarityScorer {
    pub fn new(terms: TermStore, links: LinkIndex, rule: JaccardRule) -> Self {
        Self { terms, links, rule }
    }

    /// Loads terms and links of every extracted item.
    pub async fn load<S: FeatureStore + ?Sized>(store: &S, rule: JaccardRule) -> Result<Self> {
        let start = Instant::now();
        let terms = store
            .load_terms()
            .await
            .context("Failed to load term counts")?;
        let edges = store
            .load_links()
            .await
            .context("Failed to load links")?;
        let links = LinkIndex::from_edges(&edges);
        info!(
            "Loaded terms for {} items and {} shared resources in {:.2?}",
            terms.len(),
            links.resource_count(),
            start.elapsed()
        );
        Ok(Self::new(terms, links, rule))
    }

    pub fn score(&self, a: ItemId, b: ItemId) -> Result<PairScore, ClusterError> {
        let jaccard = match (self.terms.get(a), self.terms.get(b)) {
            (Some(terms_a), Some(terms_b)) => weighted_jaccard(a, terms_a, b, terms_b, self.rule)?,
            _ => 0.0,
        };
        Ok(PairScore {
            jaccard,
            links: self.links.score(a, b),
        })
    }

    /// Scores a claimed batch, saves the edges that pass, then marks the batch's items
    /// considered and its pairs processed.
    pub async fn score_and_persist<S>(
        &self,
        store: &S,
        pairs: &[CandidatePair],
        config: &ScoringConfig,
    ) -> Result<BatchOutcome>
    where
        S: FeatureStore + PairLedger + SimilarityStore + ?Sized,
    {
        let mut outcome = BatchOutcome::default();
        let mut edges = Vec::new();
        for pair in pairs {
            match self.score(pair.id1, pair.id2) {
                Ok(score) => {
                    outcome.scored += 1;
                    if config.passes(score.total()) {
                        edges.push(SimilarityEdge::new(
                            pair.id1,
                            pair.id2,
                            score.jaccard,
                            score.links,
                        ));
                    }
                }
                Err(e) => {
                    warn!("Skipping pair ({}, {}): {}", pair.id1, pair.id2, e);
                    outcome.skipped += 1;
                }
            }
        }

        for chunk in edges.chunks(config.save_batch_size) {
            store
                .upsert_edges(chunk)
                .await
                .context("Failed to save similarity batch")?;
            outcome.saved += chunk.len();
        }

        let items: Vec<ItemId> = pairs
            .iter()
            .flat_map(|p| [p.id1, p.id2])
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !items.is_empty() {
            store
                .mark_considered(&items, Utc::now().naive_utc())
                .await
                .context("Failed to mark items considered")?;
        }

        let keys: Vec<(ItemId, ItemId)> = pairs.iter().map(CandidatePair::key).collect();
        PairCatalog::new(store, config.save_batch_size)?
            .complete(&keys)
            .await?;

        debug!(
            "Batch: {} scored, {} saved, {} skipped",
            outcome.scored, outcome.saved, outcome.skipped
        );
        Ok(outcome)
    }

    /// Claims, scores and persists until the catalog runs dry or `max_pairs` is reached.
    pub async fn scan_pairs<S>(
        &self,
        store: &S,
        worker_id: &str,
        config: &ScoringConfig,
    ) -> Result<ScoringStats>
    where
        S: FeatureStore + PairLedger + SimilarityStore + ?Sized,
    {
        config.validate()?;
        let start = Instant::now();
        let catalog = PairCatalog::new(store, config.save_batch_size)?;
        let mut stats = ScoringStats::new(worker_id);

        loop {
            let limit = match config.max_pairs {
                Some(max) if stats.pairs_claimed >= max => break,
                Some(max) => config.claim_limit.min(max - stats.pairs_claimed),
                None => config.claim_limit,
            };
            if let Some(lease) = config.lease {
                catalog.release_expired(lease).await?;
            }

            let claimed = catalog.claim(worker_id, limit).await?;
            if claimed.is_empty() {
                debug!("Worker {} found no more pairs", worker_id);
                break;
            }
            if !config.poll_delay.is_zero() {
                tokio::time::sleep(config.poll_delay).await;
            }

            let outcome = self.score_and_persist(store, &claimed, config).await?;
            stats.batches += 1;
            stats.pairs_claimed += claimed.len();
            stats.pairs_scored += outcome.scored;
            stats.edges_saved += outcome.saved;
            stats.pairs_skipped += outcome.skipped;
            info!(
                "Worker {}: batch {} done, {} pairs so far, {} edges saved",
                worker_id, stats.batches, stats.pairs_claimed, stats.edges_saved
            );
        }

        stats.duration_secs = start.elapsed().as_secs_f64();
        info!(
            "Worker {} finished: {} pairs, {} edges in {:.2?}",
            worker_id,
            stats.pairs_claimed,
            stats.edges_saved,
            start.elapsed()
        );
        Ok(stats)
    }
}

/// Wipes the similarity table and every claim so scoring starts over.
pub async fn reset_scoring<S>(store: &S) -> Result<()>
where
    S: PairLedger + SimilarityStore + ?Sized,
{
    store
        .reset_similarities()
        .await
        .context("Failed to reset similarity table")?;
    let reset = store
        .reset_claims()
        .await
        .context("Failed to reset pair claims")?;
    info!("Similarity table cleared and {} pair claims reset", reset);
    Ok(())
}

/// Runs `concurrency` worker loops named `<worker>-<n>` against one shared scorer.
pub async fn run_scoring<S>(
    store: &S,
    worker: &str,
    concurrency: usize,
    config: &ScoringConfig,
    clean: bool,
) -> Result<Vec<ScoringStats>>
where
    S: Store + ?Sized,
{
    config.validate()?;
    if concurrency == 0 {
        return Err(ClusterError::validation("concurrency must be positive").into());
    }
    if clean {
        reset_scoring(store).await?;
    }

    let scorer = SimilarityScorer::load(store, config.rule).await?;
    let worker_ids: Vec<String> = if concurrency == 1 {
        vec![worker.to_string()]
    } else {
        (1..=concurrency).map(|n| format!("{}-{}", worker, n)).collect()
    };
    info!("Starting {} scoring workers", worker_ids.len());

    let scorer = &scorer;
    try_join_all(
        worker_ids
            .iter()
            .map(|id| async move { scorer.scan_pairs(store, id, config).await }),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag(terms: &[(&str, i64)]) -> TermCounts {
        terms.iter().map(|(t, n)| (t.to_string(), *n)).collect()
    }

    fn legacy(a: &TermCounts, b: &TermCounts) -> Result<f64, ClusterError> {
        weighted_jaccard(ItemId(1), a, ItemId(2), b, JaccardRule::Legacy)
    }

    #[test]
    fn test_identical_bags_score_sentinel() {
        let a = bag(&[("a", 1), ("b", 1)]);
        assert_eq!(legacy(&a, &a.clone()).unwrap(), 999.0);
        let b = bag(&[("x", 4), ("y", 2)]);
        assert_eq!(
            weighted_jaccard(ItemId(1), &b, ItemId(2), &b, JaccardRule::Symmetric).unwrap(),
            999.0
        );
    }

    #[test]
    fn test_disjoint_bags_score_zero() {
        let a = bag(&[("a", 1), ("b", 1)]);
        let b = bag(&[("c", 1)]);
        assert_eq!(legacy(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn test_empty_bag_depends_on_rule() {
        let empty = TermCounts::new();
        let x = bag(&[("x", 1)]);
        assert_eq!(legacy(&empty, &x).unwrap(), 999.0);
        assert_eq!(legacy(&x, &empty).unwrap(), 999.0);
        assert_eq!(legacy(&empty, &empty).unwrap(), 999.0);

        let symmetric = |a: &TermCounts, b: &TermCounts| {
            weighted_jaccard(ItemId(1), a, ItemId(2), b, JaccardRule::Symmetric).unwrap()
        };
        assert_eq!(symmetric(&empty, &x), 0.0);
        assert_eq!(symmetric(&x, &empty), 0.0);
        assert_eq!(symmetric(&empty, &empty), 0.0);
    }

    #[test]
    fn test_legacy_symmetric_for_equal_weights() {
        let a = bag(&[("a", 1), ("b", 2), ("c", 1)]);
        let b = bag(&[("b", 2), ("d", 3)]);
        let ab = legacy(&a, &b).unwrap();
        let ba = legacy(&b, &a).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab, 2.0 / 5.0);
    }

    #[test]
    fn test_legacy_asymmetric_for_unequal_weights() {
        let a = bag(&[("a", 2), ("b", 1)]);
        let b = bag(&[("a", 1), ("c", 1)]);
        assert_eq!(legacy(&a, &b).unwrap(), 0.5);
        assert_eq!(legacy(&b, &a).unwrap(), 1.0);

        let sym_ab = weighted_jaccard(ItemId(1), &a, ItemId(2), &b, JaccardRule::Symmetric);
        let sym_ba = weighted_jaccard(ItemId(2), &b, ItemId(1), &a, JaccardRule::Symmetric);
        assert_eq!(sym_ab.unwrap(), sym_ba.unwrap());
    }

    #[test]
    fn test_intersection_above_union_is_error() {
        let a = bag(&[("a", 1)]);
        let b = bag(&[("a", 3)]);
        match legacy(&a, &b) {
            Err(ClusterError::Scoring {
                intersection,
                union,
                ..
            }) => {
                assert_eq!(intersection, 3);
                assert_eq!(union, 1);
            }
            other => panic!("expected scoring error, got {:?}", other),
        }
    }

    #[test]
    fn test_link_score_commutes_and_accumulates() {
        let links = LinkIndex::from_edges(&[
            LinkEdge::new(ItemId(1), "https://example.org/a"),
            LinkEdge::new(ItemId(2), "https://example.org/a"),
            LinkEdge::new(ItemId(2), "https://example.org/a"),
            LinkEdge::new(ItemId(1), "rt:77"),
            LinkEdge::new(ItemId(2), "rt:77"),
            LinkEdge::new(ItemId(3), "rt:77"),
        ]);
        assert_eq!(links.score(ItemId(1), ItemId(2)), 1998.0);
        assert_eq!(links.score(ItemId(2), ItemId(1)), 1998.0);
        assert_eq!(links.score(ItemId(3), ItemId(1)), 999.0);
        assert_eq!(links.score(ItemId(3), ItemId(4)), 0.0);
        assert_eq!(links.items_for("https://example.org/a"), &[ItemId(1), ItemId(2)]);
    }

    #[test]
    fn test_missing_terms_score_zero() {
        let mut terms = TermStore::new();
        terms.add(ItemId(1), "a", 1);
        let scorer = SimilarityScorer::new(terms, LinkIndex::default(), JaccardRule::Legacy);
        let score = scorer.score(ItemId(1), ItemId(9)).unwrap();
        assert_eq!(score.total(), 0.0);
    }

    #[test]
    fn test_epsilon_rule() {
        let mut config = ScoringConfig::default();
        assert!(!config.passes(0.0));
        assert!(config.passes(0.01));

        config.epsilon = 0.5;
        assert!(config.passes(0.5));
        assert!(!config.passes(0.49));

        config.epsilon = -1.0;
        assert!(config.validate().is_err());
    }
}
