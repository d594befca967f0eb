// src/analytics.rs

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use log::{debug, info, warn};
use serde::Serialize;

use crate::config;
use crate::dbscan::{ClusterConfig, ClusterEngine, Clustering, SimilarityGraph};
use crate::error::ClusterError;
use crate::models::{ItemId, ItemRecord};
use crate::results::ClusteringStats;
use crate::store::{FeatureStore, SimilarityStore};

/// Which per-cluster score ranks clusters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKey {
    #[default]
    MaxScore,
    AvgScore,
}

/// Per-cluster statistics as parallel vectors, one slot per cluster in `cluster_ids` order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterStats {
    pub cluster_ids: Vec<ItemId>,
    pub max_scores: Vec<i64>,
    pub avg_scores: Vec<f64>,
    pub cluster_sizes: Vec<usize>,
    pub best_items: Vec<ItemId>,
    /// Index into the cluster's materialized records.
    pub best_item_indices: Vec<usize>,
    pub top_cluster: Option<ItemId>,
    pub top_item: Option<ItemId>,
}

impl ClusterStats {
    pub fn scores(&self, key: ScoreKey) -> Vec<f64> {
        match key {
            ScoreKey::MaxScore => self.max_scores.iter().map(|&s| s as f64).collect(),
            ScoreKey::AvgScore => self.avg_scores.clone(),
        }
    }
}

/// The single most engaging item of the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestItem {
    pub cluster_id: ItemId,
    pub item_id: ItemId,
    pub item: ItemRecord,
}

/// Position of the score cutoff in ascending order for `n` clusters.
pub fn cutoff_index(n: usize) -> usize {
    let fraction = if n >= config::LARGE_CLUSTER_COUNT {
        config::LARGE_PERCENTILE
    } else if n >= config::MEDIUM_CLUSTER_COUNT {
        config::MEDIUM_PERCENTILE
    } else {
        config::SMALL_PERCENTILE
    };
    (n as f64 * fraction).floor() as usize
}

/// Turns a clustering into item records, statistics and rankings.
pub struct ClusterAnalytics<'a> {
    engine: &'a ClusterEngine,
    clustering: &'a Clustering,
    members: Option<BTreeMap<ItemId, Vec<ItemRecord>>>,
    stats: Option<ClusterStats>,
}

impl<'a> ClusterAnalytics<'a> {
    pub fn new(engine: &'a ClusterEngine, clustering: &'a Clustering) -> Self {
        Self {
            engine,
            clustering,
            members: None,
            stats: None,
        }
    }

    pub fn members(&self) -> Option<&BTreeMap<ItemId, Vec<ItemRecord>>> {
        self.members.as_ref()
    }

    pub fn stats(&self) -> Option<&ClusterStats> {
        self.stats.as_ref()
    }

    /// Expands every member of every cluster, as a root, into records for its neighbour list.
    pub async fn materialize<S: FeatureStore + ?Sized>(
        &mut self,
        store: &S,
    ) -> Result<&BTreeMap<ItemId, Vec<ItemRecord>>> {
        let start = Instant::now();

        let mut expansions: Vec<(ItemId, ItemId, Vec<ItemId>)> = Vec::new();
        let mut wanted: BTreeSet<ItemId> = BTreeSet::new();
        for (&cluster_id, members) in &self.clustering.clusters {
            for &root in members {
                let neighbors = self.engine.neighbors(root)?;
                wanted.extend(neighbors.iter().copied());
                expansions.push((cluster_id, root, neighbors));
            }
        }

        let wanted: Vec<ItemId> = wanted.into_iter().collect();
        let details = store
            .fetch_details(&wanted)
            .await
            .context("Failed to fetch item details for cluster members")?;

        let graph = self.engine.graph();
        let mut members: BTreeMap<ItemId, Vec<ItemRecord>> = BTreeMap::new();
        for (cluster_id, root, neighbors) in expansions {
            let records = members.entry(cluster_id).or_default();
            for id in neighbors {
                let Some(item) = details.get(&id) else {
                    warn!("No details for item {} in cluster {}; skipping", id, cluster_id);
                    continue;
                };
                let similarity = if id == root { None } else { graph.weight(root, id) };
                records.push(ItemRecord::from_details(root, similarity, item));
            }
        }

        info!(
            "Materialized {} records across {} clusters in {:.2?}",
            members.values().map(Vec::len).sum::<usize>(),
            members.len(),
            start.elapsed()
        );
        Ok(self.members.insert(members))
    }

    /// Engagement statistics per cluster plus the global top cluster and item.
    pub fn compute_stats(&mut self) -> Result<&ClusterStats, ClusterError> {
        let members = self
            .members
            .as_ref()
            .ok_or(ClusterError::PrecursorMissing("compute_stats"))?;

        let mut stats = ClusterStats::default();
        for (&cluster_id, records) in members {
            let Some(max_score) = records.iter().map(|r| r.combined_count).max() else {
                warn!(
                    "Cluster {} has no materialized records; leaving it out of stats",
                    cluster_id
                );
                continue;
            };
            let best_index = records
                .iter()
                .position(|r| r.combined_count == max_score)
                .unwrap_or(0);
            let total: i64 = records.iter().map(|r| r.combined_count).sum();

            stats.cluster_ids.push(cluster_id);
            stats.max_scores.push(max_score);
            stats.avg_scores.push(total as f64 / records.len() as f64);
            stats.cluster_sizes.push(records.len());
            stats.best_items.push(records[best_index].id);
            stats.best_item_indices.push(best_index);
        }

        if let Some(global_max) = stats.max_scores.iter().copied().max() {
            if let Some(index) = stats.max_scores.iter().position(|&s| s == global_max) {
                stats.top_cluster = Some(stats.cluster_ids[index]);
                stats.top_item = Some(stats.best_items[index]);
            }
        }
        debug!(
            "Stats for {} clusters, top cluster {:?}",
            stats.cluster_ids.len(),
            stats.top_cluster
        );
        Ok(self.stats.insert(stats))
    }

    /// Best record of every cluster scoring at or above `min_score`. Without a minimum the
    /// cutoff is a percentile of the scores that tightens as the cluster count grows.
    ///
    /// `None` until stats have been computed.
    pub fn interesting(
        &self,
        min_score: Option<f64>,
        key: ScoreKey,
    ) -> Option<BTreeMap<ItemId, ItemRecord>> {
        let stats = self.stats.as_ref()?;
        let members = self.members.as_ref()?;

        let scores = stats.scores(key);
        if scores.is_empty() {
            return Some(BTreeMap::new());
        }
        let min_score = min_score.unwrap_or_else(|| {
            let mut sorted = scores.clone();
            sorted.sort_by(f64::total_cmp);
            let cutoff = cutoff_index(sorted.len());
            debug!("Cutoff index {} of {} scores", cutoff, sorted.len());
            sorted[cutoff]
        });

        let mut interesting = BTreeMap::new();
        for (index, &score) in scores.iter().enumerate() {
            if score < min_score {
                continue;
            }
            let cluster_id = stats.cluster_ids[index];
            let record = members
                .get(&cluster_id)
                .and_then(|records| records.get(stats.best_item_indices[index]));
            if let Some(record) = record {
                interesting.insert(cluster_id, record.clone());
            }
        }
        Some(interesting)
    }

    /// The top item with its cluster. `None` until stats have been computed or when there
    /// are no clusters.
    pub fn best(&self) -> Option<BestItem> {
        let stats = self.stats.as_ref()?;
        let members = self.members.as_ref()?;
        let cluster_id = stats.top_cluster?;
        let index = stats.cluster_ids.iter().position(|&c| c == cluster_id)?;
        let item = members
            .get(&cluster_id)?
            .get(stats.best_item_indices[index])?
            .clone();
        Some(BestItem {
            cluster_id,
            item_id: item.id,
            item,
        })
    }

    /// Most frequent words per cluster, summed over every member's neighbour list.
    /// Items reachable from several members count once per appearance.
    pub async fn cluster_terms<S: FeatureStore + ?Sized>(
        &self,
        store: &S,
        limit: usize,
    ) -> Result<BTreeMap<ItemId, Vec<(String, i64)>>> {
        let mut appearances: BTreeMap<ItemId, Vec<ItemId>> = BTreeMap::new();
        let mut wanted: BTreeSet<ItemId> = BTreeSet::new();
        for (&cluster_id, members) in &self.clustering.clusters {
            let ids = appearances.entry(cluster_id).or_default();
            for &root in members {
                let neighbors = self.engine.neighbors(root)?;
                wanted.extend(neighbors.iter().copied());
                ids.extend(neighbors);
            }
        }

        let wanted: Vec<ItemId> = wanted.into_iter().collect();
        let words = store
            .word_counts(&wanted)
            .await
            .context("Failed to load word counts for cluster members")?;

        let mut terms = BTreeMap::new();
        for (cluster_id, ids) in appearances {
            let mut ranked: Vec<(String, i64)> = words.aggregate(&ids).into_iter().collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            ranked.truncate(limit);
            terms.insert(cluster_id, ranked);
        }
        Ok(terms)
    }
}

/// Ranking options for a clustering run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReportOptions {
    pub min_score: Option<f64>,
    pub score_key: ScoreKey,
    /// Top keywords per cluster. `None` skips the term query.
    pub keywords: Option<usize>,
}

/// Everything one clustering run produces.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterReport {
    pub clustering: Clustering,
    pub members: BTreeMap<ItemId, Vec<ItemRecord>>,
    pub stats: Option<ClusterStats>,
    pub best: Option<BestItem>,
    pub interesting: Option<BTreeMap<ItemId, ItemRecord>>,
    pub keywords: Option<BTreeMap<ItemId, Vec<(String, i64)>>>,
    pub summary: ClusteringStats,
}

/// Loads the graph for the lookback window, clusters it and derives every ranking.
pub async fn run_clustering<S>(
    store: &S,
    config: ClusterConfig,
    options: ReportOptions,
    now: NaiveDateTime,
) -> Result<ClusterReport>
where
    S: FeatureStore + SimilarityStore + ?Sized,
{
    let start = Instant::now();
    config.validate()?;
    let graph = SimilarityGraph::load(store, config.days_back, now).await?;
    let engine = ClusterEngine::new(graph, config)?;
    let clustering = engine.run()?;

    let mut analytics = ClusterAnalytics::new(&engine, &clustering);
    analytics.materialize(store).await?;
    let stats = analytics.compute_stats()?.clone();
    let interesting = analytics.interesting(options.min_score, options.score_key);
    let best = analytics.best();
    let keywords = match options.keywords {
        Some(limit) if limit > 0 => Some(analytics.cluster_terms(store, limit).await?),
        _ => None,
    };
    let members = analytics.members.take().unwrap_or_default();

    let summary = ClusteringStats {
        graph_items: engine.graph().node_count(),
        graph_edges: engine.graph().edge_count(),
        clusters: clustering.len(),
        noise: clustering.noise.len(),
        clustered_items: clustering.clusters.values().map(BTreeSet::len).sum(),
        interesting: interesting.as_ref().map(BTreeMap::len).unwrap_or(0),
        duration_secs: start.elapsed().as_secs_f64(),
    };
    info!(
        "Clustering finished: {} clusters, {} interesting in {:.2?}",
        summary.clusters,
        summary.interesting,
        start.elapsed()
    );

    Ok(ClusterReport {
        clustering,
        members,
        stats: Some(stats),
        best,
        interesting,
        keywords,
        summary,
    })
}
