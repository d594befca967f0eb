// src/selection.rs

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::{debug, info};
use serde::Serialize;

use crate::config;
use crate::error::ClusterError;
use crate::models::ItemId;
use crate::store::FeatureStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionConfig {
    /// Items qualify when `combined_count / combined_av` exceeds this.
    pub threshold: f64,
    /// Upper bound on the selection before per-source rounding.
    pub max_items: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            threshold: config::DEFAULT_SELECTION_THRESHOLD,
            max_items: config::DEFAULT_MAX_ITEMS,
        }
    }
}

impl SelectionConfig {
    pub fn validate(&self) -> Result<(), ClusterError> {
        if !self.threshold.is_finite() {
            return Err(ClusterError::validation(format!(
                "selection threshold must be finite, got {}",
                self.threshold
            )));
        }
        if self.max_items == 0 {
            return Err(ClusterError::validation("max_items must be positive"));
        }
        Ok(())
    }
}

/// Outcome of one selection run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Selection {
    /// Sorted, duplicate free.
    pub ids: Vec<ItemId>,
    /// Slots granted per source.
    pub per_source: BTreeMap<String, usize>,
}

/// Splits `max_items` slots across sources in proportion to their qualifying counts.
///
/// Each source gets `ceil(max_items * k / K)`, so the total may overshoot `max_items` by less
/// than the number of sources.
pub fn allocate_slots(
    counts: &BTreeMap<String, usize>,
    max_items: usize,
) -> BTreeMap<String, usize> {
    let total: usize = counts.values().sum();
    if total == 0 {
        return BTreeMap::new();
    }
    counts
        .iter()
        .filter(|(_, &k)| k > 0)
        .map(|(source, &k)| (source.clone(), (max_items * k + total - 1) / total))
        .collect()
}

/// Picks a bounded, source-proportional sample of high-engagement items.
pub struct CandidateSelector<'a, S: FeatureStore + ?Sized> {
    store: &'a S,
    config: SelectionConfig,
}

impl<'a, S: FeatureStore + ?Sized> CandidateSelector<'a, S> {
    pub fn new(store: &'a S, config: SelectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// Replaces the previous selection with a fresh one marked with `today`.
    pub async fn select(&self, today: NaiveDate) -> Result<Selection> {
        let start = Instant::now();
        let threshold = self.config.threshold;

        let counts = self
            .store
            .qualifying_counts(threshold)
            .await
            .context("Failed to count qualifying items per source")?;
        let qualifying: usize = counts.values().sum();
        info!(
            "{} qualifying items across {} sources (threshold {})",
            qualifying,
            counts.len(),
            threshold
        );

        let cleared = self
            .store
            .clear_selection()
            .await
            .context("Failed to clear previous selection")?;
        debug!("Cleared {} previously selected items", cleared);

        let per_source = allocate_slots(&counts, self.config.max_items);
        let mut ids = Vec::new();
        for (source, &slots) in &per_source {
            let top = self
                .store
                .top_qualifying(source, threshold, slots)
                .await
                .with_context(|| format!("Failed to fetch top items for source {}", source))?;
            debug!("Source {}: {} slots, {} items", source, slots, top.len());
            ids.extend(top);
        }
        ids.sort_unstable();
        ids.dedup();

        if !ids.is_empty() {
            self.store
                .mark_selected(&ids, today)
                .await
                .context("Failed to mark selected items")?;
        }

        info!(
            "Selected {} items from {} sources in {:.2?}",
            ids.len(),
            per_source.len(),
            start.elapsed()
        );
        Ok(Selection { ids, per_source })
    }
}
