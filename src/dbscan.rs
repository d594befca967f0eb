// src/dbscan.rs

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use log::{debug, info, warn};
use petgraph::graphmap::UnGraphMap;
use serde::Serialize;

use crate::config;
use crate::error::ClusterError;
use crate::models::{ItemId, SimilarityEdge};
use crate::store::{FeatureStore, SimilarityStore};

/// In-memory similarity graph: items are nodes, `jaccard + links` is the edge weight.
#[derive(Debug, Clone, Default)]
pub struct SimilarityGraph {
    graph: UnGraphMap<ItemId, f64>,
}

impl SimilarityGraph {
    /// Builds the graph from persisted edges. `extra_nodes` get an entry even without edges.
    pub fn from_edges<I>(edges: &[SimilarityEdge], extra_nodes: I) -> Self
    where
        I: IntoIterator<Item = ItemId>,
    {
        let mut graph = UnGraphMap::new();
        for edge in edges {
            if edge.id1 == edge.id2 {
                continue;
            }
            graph.add_edge(edge.id1, edge.id2, edge.score());
        }
        for id in extra_nodes {
            graph.add_node(id);
        }
        Self { graph }
    }

    /// Loads every edge rooted in the last `days_back` days relative to `now`.
    pub async fn load<S>(store: &S, days_back: i64, now: NaiveDateTime) -> Result<Self>
    where
        S: FeatureStore + SimilarityStore + ?Sized,
    {
        let start_time = Instant::now();
        let since = now - chrono::Duration::days(days_back);
        let start = match store
            .window_start(since)
            .await
            .context("Failed to find the first item in the lookback window")?
        {
            Some(id) => id,
            None => {
                warn!("No items created since {}; similarity graph is empty", since);
                return Ok(Self::default());
            }
        };
        debug!("Lookback window starts at item {}", start);

        let edges = store
            .edges_since(start)
            .await
            .context("Failed to load similarity edges")?;
        let considered = store
            .considered_since(start)
            .await
            .context("Failed to load considered items")?;
        let graph = Self::from_edges(&edges, considered);
        info!(
            "Loaded similarity graph with {} items and {} edges in {:.2?}",
            graph.node_count(),
            graph.edge_count(),
            start_time.elapsed()
        );
        Ok(graph)
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.graph.contains_node(id)
    }

    pub fn weight(&self, a: ItemId, b: ItemId) -> Option<f64> {
        self.graph.edge_weight(a, b).copied()
    }

    /// All items in ascending id order.
    pub fn nodes(&self) -> Vec<ItemId> {
        let mut nodes: Vec<ItemId> = self.graph.nodes().collect();
        nodes.sort_unstable();
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Items within `epsilon` of `id`, strongest first (ties by id), followed by `id` itself.
    pub fn neighbors(&self, id: ItemId, epsilon: f64) -> Result<Vec<ItemId>, ClusterError> {
        if !self.graph.contains_node(id) {
            return Err(ClusterError::MissingNeighborData(id));
        }
        let mut close: Vec<(ItemId, f64)> = self
            .graph
            .edges(id)
            .map(|(a, b, &w)| (if a == id { b } else { a }, w))
            .filter(|&(other, w)| other != id && w >= epsilon)
            .collect();
        close.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut neighbors: Vec<ItemId> = close.into_iter().map(|(other, _)| other).collect();
        neighbors.push(id);
        Ok(neighbors)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterConfig {
    /// Minimum edge weight for two items to be neighbours.
    pub epsilon: f64,
    /// Neighbour list length needed to seed a cluster.
    pub min_pts: usize,
    pub days_back: i64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            min_pts: 2,
            days_back: config::DEFAULT_DAYS_BACK,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), ClusterError> {
        if !self.epsilon.is_finite() {
            return Err(ClusterError::validation(format!(
                "epsilon must be finite, got {}",
                self.epsilon
            )));
        }
        if self.days_back < 0 {
            return Err(ClusterError::validation(format!(
                "days_back must not be negative, got {}",
                self.days_back
            )));
        }
        Ok(())
    }
}

/// Result of one clustering pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Clustering {
    /// Root item -> members, root included.
    pub clusters: BTreeMap<ItemId, BTreeSet<ItemId>>,
    pub noise: BTreeSet<ItemId>,
}

impl Clustering {
    pub fn cluster_of(&self, id: ItemId) -> Option<ItemId> {
        self.clusters
            .iter()
            .find(|(_, members)| members.contains(&id))
            .map(|(root, _)| *root)
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// Density clustering over a [`SimilarityGraph`].
#[derive(Debug, Clone)]
pub struct ClusterEngine {
    graph: SimilarityGraph,
    config: ClusterConfig,
}

impl ClusterEngine {
    pub fn new(graph: SimilarityGraph, config: ClusterConfig) -> Result<Self, ClusterError> {
        config.validate()?;
        Ok(Self { graph, config })
    }

    pub fn graph(&self) -> &SimilarityGraph {
        &self.graph
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn neighbors(&self, id: ItemId) -> Result<Vec<ItemId>, ClusterError> {
        self.graph.neighbors(id, self.config.epsilon)
    }

    /// Clusters every item in the graph, visiting them in ascending id order.
    pub fn run(&self) -> Result<Clustering, ClusterError> {
        let candidates = self.graph.nodes();
        self.run_with_candidates(&candidates)
    }

    /// Clusters an explicit candidate list in the given order. Every candidate must be in
    /// the graph.
    pub fn run_with_candidates(&self, candidates: &[ItemId]) -> Result<Clustering, ClusterError> {
        let start = Instant::now();
        let min_pts = self.config.min_pts;
        let mut result = Clustering::default();
        let mut clustered: HashSet<ItemId> = HashSet::new();
        let mut seen: HashSet<ItemId> = HashSet::new();

        for &root in candidates {
            if !seen.insert(root) {
                continue;
            }
            let neighbors = self.neighbors(root)?;
            if neighbors.len() < min_pts {
                result.noise.insert(root);
                continue;
            }

            let members = result.clusters.entry(root).or_default();
            members.insert(root);
            clustered.insert(root);

            let mut stack = neighbors;
            while let Some(id) = stack.pop() {
                if !seen.insert(id) {
                    continue;
                }
                let next = self.neighbors(id)?;
                // Expansion needs strictly more than min_pts, seeding only min_pts.
                if next.len() <= min_pts {
                    continue;
                }
                for n in next {
                    if !stack.contains(&n) {
                        stack.push(n);
                    }
                }
                if clustered.insert(id) {
                    members.insert(id);
                }
            }
            debug!("Cluster {} has {} members", root, members.len());
        }

        info!(
            "Found {} clusters and {} noise items among {} candidates in {:.2?}",
            result.clusters.len(),
            result.noise.len(),
            candidates.len(),
            start.elapsed()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(a: i64, b: i64, jaccard: f64) -> SimilarityEdge {
        SimilarityEdge::new(ItemId(a), ItemId(b), jaccard, 0.0)
    }

    fn engine(edges: &[SimilarityEdge], extra: &[i64], min_pts: usize) -> ClusterEngine {
        let graph = SimilarityGraph::from_edges(edges, extra.iter().map(|&i| ItemId(i)));
        ClusterEngine::new(
            graph,
            ClusterConfig {
                epsilon: 0.1,
                min_pts,
                days_back: 2,
            },
        )
        .unwrap()
    }

    fn set(ids: &[i64]) -> BTreeSet<ItemId> {
        ids.iter().map(|&i| ItemId(i)).collect()
    }

    #[test]
    fn test_neighbors_sorted_with_self_last() {
        let graph = SimilarityGraph::from_edges(
            &[edge(1, 2, 0.5), edge(1, 3, 2.0), edge(1, 4, 0.05), edge(1, 5, 0.5)],
            std::iter::empty(),
        );
        let neighbors = graph.neighbors(ItemId(1), 0.1).unwrap();
        assert_eq!(neighbors, vec![ItemId(3), ItemId(2), ItemId(5), ItemId(1)]);
        assert_eq!(graph.neighbors(ItemId(4), 0.1).unwrap(), vec![ItemId(4)]);
        assert_eq!(graph.weight(ItemId(3), ItemId(1)), Some(2.0));
    }

    #[test]
    fn test_missing_candidate_fails_loudly() {
        let engine = engine(&[edge(1, 2, 1.0)], &[], 2);
        let err = engine
            .run_with_candidates(&[ItemId(1), ItemId(7)])
            .unwrap_err();
        assert!(matches!(err, ClusterError::MissingNeighborData(ItemId(7))));
    }

    #[test]
    fn test_pair_with_full_overlap() {
        // Item 2 has exactly min_pts neighbours, enough to seed but not to expand.
        let engine = engine(&[edge(1, 2, 999.0)], &[3], 2);
        let clustering = engine.run().unwrap();
        assert_eq!(clustering.clusters.len(), 1);
        assert_eq!(clustering.clusters[&ItemId(1)], set(&[1]));
        assert_eq!(clustering.noise, set(&[3]));
    }

    #[test]
    fn test_seed_and_expansion_thresholds_differ() {
        // Triangle 1-2-3: every item has three neighbours including itself.
        let triangle = [edge(1, 2, 1.0), edge(1, 3, 1.0), edge(2, 3, 1.0)];

        let clustering = engine(&triangle, &[], 2).run().unwrap();
        assert_eq!(clustering.clusters[&ItemId(1)], set(&[1, 2, 3]));

        // With min_pts 3 the root still seeds (3 < 3 is false) but nobody expands (3 <= 3).
        let clustering = engine(&triangle, &[], 3).run().unwrap();
        assert_eq!(clustering.clusters[&ItemId(1)], set(&[1]));
        assert!(clustering.noise.is_empty());

        let clustering = engine(&triangle, &[], 4).run().unwrap();
        assert!(clustering.clusters.is_empty());
        assert_eq!(clustering.noise, set(&[1, 2, 3]));
    }

    #[test]
    fn test_chain_expansion_and_exclusive_membership() {
        let edges = [
            edge(1, 2, 1.0),
            edge(2, 3, 1.0),
            edge(3, 4, 1.0),
            edge(4, 5, 1.0),
            edge(10, 11, 1.0),
            edge(10, 12, 1.0),
            edge(11, 12, 1.0),
            edge(20, 21, 0.01),
        ];
        let clustering = engine(&edges, &[], 2).run().unwrap();
        assert_eq!(clustering.clusters[&ItemId(1)], set(&[1, 2, 3, 4]));
        assert_eq!(clustering.clusters[&ItemId(10)], set(&[10, 11, 12]));
        assert_eq!(clustering.noise, set(&[20, 21]));
        assert_eq!(clustering.cluster_of(ItemId(3)), Some(ItemId(1)));
        assert_eq!(clustering.cluster_of(ItemId(5)), None);

        let mut seen = BTreeSet::new();
        for members in clustering.clusters.values() {
            for id in members {
                assert!(seen.insert(*id), "{} is in two clusters", id);
            }
        }
    }

    #[test]
    fn test_clustering_is_idempotent() {
        let edges = [
            edge(1, 2, 0.4),
            edge(2, 3, 0.9),
            edge(1, 3, 0.2),
            edge(3, 4, 0.3),
            edge(5, 6, 999.0),
        ];
        let engine = engine(&edges, &[7], 2);
        let first = engine.run().unwrap();
        let second = engine.run().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClusterConfig {
            epsilon: f64::INFINITY,
            ..ClusterConfig::default()
        };
        assert!(ClusterEngine::new(SimilarityGraph::default(), config).is_err());
    }
}
