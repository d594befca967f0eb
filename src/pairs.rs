// src/pairs.rs

use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use log::{debug, info};

use crate::config;
use crate::error::ClusterError;
use crate::models::{CandidatePair, ItemId};
use crate::results::PairGenerationStats;
use crate::selection::{CandidateSelector, SelectionConfig};
use crate::store::{FeatureStore, PairLedger};

/// Sorts ids ascending and drops duplicates.
pub fn normalize_ids(ids: &[ItemId]) -> Vec<ItemId> {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Every `(ids[i], ids[j])` with `i < j`. With sorted input the first id is always smaller.
pub fn upper_triangle(ids: &[ItemId]) -> impl Iterator<Item = (ItemId, ItemId)> + '_ {
    ids.iter()
        .enumerate()
        .flat_map(move |(i, &a)| ids[i + 1..].iter().map(move |&b| (a, b)))
}

/// Parses a cleanup cutoff. Only `YYYY-MM-DD` naming a real calendar date is accepted.
pub fn parse_cutoff(raw: &str) -> Result<NaiveDateTime, ClusterError> {
    let bytes = raw.as_bytes();
    let shaped = bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
    if !shaped {
        return Err(ClusterError::validation(format!(
            "cutoff must look like YYYY-MM-DD, got {:?}",
            raw
        )));
    }
    let date = NaiveDate::parse_from_str(raw, config::CUTOFF_DATE_FORMAT)
        .map_err(|e| ClusterError::validation(format!("invalid cutoff date {:?}: {}", raw, e)))?;
    Ok(date.and_time(chrono::NaiveTime::MIN))
}

/// Claim lease given in whole seconds on the command line.
pub fn lease_from_secs(secs: u64) -> Result<chrono::Duration, ClusterError> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| {
            ClusterError::validation(format!("lease of {} seconds is out of range", secs))
        })
}

/// The shared catalog of candidate pairs and its claim protocol.
pub struct PairCatalog<'a, L: PairLedger + ?Sized> {
    ledger: &'a L,
    save_batch_size: usize,
}

impl<'a, L: PairLedger + ?Sized> PairCatalog<'a, L> {
    pub fn new(ledger: &'a L, save_batch_size: usize) -> Result<Self> {
        if save_batch_size == 0 {
            return Err(ClusterError::validation("save_batch_size must be positive").into());
        }
        Ok(Self {
            ledger,
            save_batch_size,
        })
    }

    /// Enumerates the upper triangle of `ids` and writes it in batches.
    /// Returns the number of pairs enumerated, whether or not they were new.
    pub async fn generate(&self, ids: &[ItemId]) -> Result<usize> {
        let start = Instant::now();
        let ids = normalize_ids(ids);
        let added = Utc::now().naive_utc();

        let mut batch = Vec::with_capacity(self.save_batch_size);
        let mut enumerated = 0usize;
        let mut inserted = 0u64;
        for pair in upper_triangle(&ids) {
            batch.push(pair);
            enumerated += 1;
            if batch.len() >= self.save_batch_size {
                inserted += self.flush(&batch, added).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            inserted += self.flush(&batch, added).await?;
        }

        info!(
            "Generated {} pairs from {} items ({} new) in {:.2?}",
            enumerated,
            ids.len(),
            inserted,
            start.elapsed()
        );
        Ok(enumerated)
    }

    async fn flush(&self, batch: &[(ItemId, ItemId)], added: NaiveDateTime) -> Result<u64> {
        let inserted = self
            .ledger
            .insert_pairs(batch, added)
            .await
            .context("Failed to save pair batch")?;
        debug!("Saved batch of {} pairs ({} new)", batch.len(), inserted);
        Ok(inserted)
    }

    /// Atomically takes up to `limit` open pairs for `worker_id`.
    pub async fn claim(&self, worker_id: &str, limit: usize) -> Result<Vec<CandidatePair>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let claimed = self
            .ledger
            .claim_pairs(worker_id, limit, Utc::now().naive_utc())
            .await
            .with_context(|| format!("Failed to claim pairs for worker {}", worker_id))?;
        debug!("Worker {} claimed {} pairs", worker_id, claimed.len());
        Ok(claimed)
    }

    pub async fn complete(&self, pairs: &[(ItemId, ItemId)]) -> Result<u64> {
        if pairs.is_empty() {
            return Ok(0);
        }
        self.ledger
            .complete_pairs(pairs, Utc::now().naive_utc())
            .await
            .context("Failed to mark pairs processed")
    }

    /// Drops every pair.
    pub async fn reset(&self) -> Result<()> {
        self.ledger
            .reset_pairs()
            .await
            .context("Failed to reset pair catalog")?;
        info!("Pair catalog reset");
        Ok(())
    }

    /// Without a cutoff, drops every pair. With one, deletes pairs claimed before that date.
    pub async fn cleanup(&self, cutoff: Option<&str>) -> Result<u64> {
        match cutoff {
            None => {
                self.reset().await?;
                Ok(0)
            }
            Some(raw) => {
                let cutoff = parse_cutoff(raw)?;
                let deleted = self
                    .ledger
                    .delete_claimed_before(cutoff)
                    .await
                    .context("Failed to delete old pairs")?;
                info!("Deleted {} pairs claimed before {}", deleted, raw);
                Ok(deleted)
            }
        }
    }

    /// Returns pairs claimed longer than `lease` ago, and never completed, to the pool.
    pub async fn release_expired(&self, lease: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now().naive_utc() - lease;
        let released = self
            .ledger
            .release_claimed_before(cutoff)
            .await
            .context("Failed to release expired claims")?;
        if released > 0 {
            info!("Released {} pairs with claims older than {}", released, cutoff);
        }
        Ok(released)
    }

    /// Pairs not yet processed, optionally only those added before `cutoff`.
    pub async fn unprocessed(&self, cutoff: Option<&str>) -> Result<Vec<CandidatePair>> {
        let added_before = cutoff.map(parse_cutoff).transpose()?;
        self.ledger
            .unprocessed_pairs(added_before)
            .await
            .context("Failed to list unprocessed pairs")
    }
}

/// Selects candidates and fills the catalog with their pairs.
pub async fn run_pair_generation<S>(
    store: &S,
    selection: SelectionConfig,
    save_batch_size: usize,
    clean: bool,
) -> Result<PairGenerationStats>
where
    S: FeatureStore + PairLedger + ?Sized,
{
    let start = Instant::now();
    let catalog = PairCatalog::new(store, save_batch_size)?;
    if clean {
        catalog.reset().await?;
    }

    let selector = CandidateSelector::new(store, selection)?;
    let selected = selector.select(Utc::now().date_naive()).await?;
    let pairs = catalog.generate(&selected.ids).await?;

    Ok(PairGenerationStats {
        selected_items: selected.ids.len(),
        sources: selected.per_source.len(),
        pairs_generated: pairs,
        duration_secs: start.elapsed().as_secs_f64(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn ids(raw: &[i64]) -> Vec<ItemId> {
        raw.iter().map(|&i| ItemId(i)).collect()
    }

    #[test]
    fn test_upper_triangle_count_and_order() {
        let ids = normalize_ids(&ids(&[9, 3, 5, 3, 1]));
        assert_eq!(ids, vec![ItemId(1), ItemId(3), ItemId(5), ItemId(9)]);
        let pairs: Vec<_> = upper_triangle(&ids).collect();
        assert_eq!(pairs.len(), 6);
        assert!(pairs.iter().all(|(a, b)| a < b));
        assert_eq!(pairs[0], (ItemId(1), ItemId(3)));
        assert_eq!(pairs[5], (ItemId(5), ItemId(9)));
    }

    #[test]
    fn test_upper_triangle_small_inputs() {
        assert_eq!(upper_triangle(&[]).count(), 0);
        assert_eq!(upper_triangle(&[ItemId(4)]).count(), 0);
    }

    #[test]
    fn test_lease_from_secs() {
        assert_eq!(lease_from_secs(90).unwrap(), chrono::Duration::seconds(90));
        assert!(lease_from_secs(u64::MAX).is_err());
    }

    #[test]
    fn test_parse_cutoff() {
        let cutoff = parse_cutoff("2024-02-29").unwrap();
        assert_eq!(cutoff.to_string(), "2024-02-29 00:00:00");

        for bad in ["2023-02-29", "2024-1-05", "20240105", "2024/01/05", "", "2024-01-05 "] {
            assert!(
                matches!(parse_cutoff(bad), Err(ClusterError::Validation(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_generate_in_batches_is_idempotent() {
        let store = MemoryStore::new();
        let catalog = PairCatalog::new(&store, 4).unwrap();

        let enumerated = catalog.generate(&ids(&[5, 1, 2, 3, 4])).await.unwrap();
        assert_eq!(enumerated, 10);
        assert_eq!(catalog.generate(&ids(&[1, 2, 3, 4, 5])).await.unwrap(), 10);

        let pairs = store.pairs_snapshot().await;
        assert_eq!(pairs.len(), 10);
        assert!(pairs.iter().all(|p| p.id1 < p.id2 && p.added.is_some()));
    }

    #[tokio::test]
    async fn test_claim_takes_lowest_pairs_once() {
        let store = MemoryStore::new();
        let catalog = PairCatalog::new(&store, 100).unwrap();
        catalog.generate(&ids(&[1, 2, 3, 4])).await.unwrap();

        assert!(catalog.claim("w", 0).await.unwrap().is_empty());

        let first = catalog.claim("w1", 4).await.unwrap();
        let keys: Vec<_> = first.iter().map(|p| p.key()).collect();
        assert_eq!(
            keys,
            vec![
                (ItemId(1), ItemId(2)),
                (ItemId(1), ItemId(3)),
                (ItemId(1), ItemId(4)),
                (ItemId(2), ItemId(3)),
            ]
        );
        assert!(first.iter().all(|p| p.claimed_by.as_deref() == Some("w1")));

        let second = catalog.claim("w2", 10).await.unwrap();
        assert_eq!(second.len(), 2);
        assert!(catalog.claim("w3", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_expired_and_unprocessed() {
        let store = MemoryStore::new();
        let catalog = PairCatalog::new(&store, 100).unwrap();
        catalog.generate(&ids(&[1, 2, 3])).await.unwrap();

        let claimed = catalog.claim("w1", 2).await.unwrap();
        let done: Vec<_> = claimed.iter().take(1).map(|p| p.key()).collect();
        catalog.complete(&done).await.unwrap();

        // Claims younger than the lease stay.
        assert_eq!(
            catalog.release_expired(chrono::Duration::hours(1)).await.unwrap(),
            0
        );
        // Negative lease: every open claim is stale. Completed pairs are left alone.
        assert_eq!(
            catalog.release_expired(chrono::Duration::hours(-1)).await.unwrap(),
            1
        );

        let open = catalog.unprocessed(None).await.unwrap();
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|p| p.is_claimable()));

        assert!(catalog.unprocessed(Some("2000-01-01")).await.unwrap().is_empty());
        assert!(catalog.unprocessed(Some("yesterday")).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup() {
        let store = MemoryStore::new();
        let catalog = PairCatalog::new(&store, 100).unwrap();
        catalog.generate(&ids(&[1, 2, 3])).await.unwrap();
        catalog.claim("w1", 1).await.unwrap();

        assert_eq!(catalog.cleanup(Some("2000-01-01")).await.unwrap(), 0);
        assert_eq!(catalog.cleanup(Some("2999-01-01")).await.unwrap(), 1);
        assert_eq!(store.pairs_snapshot().await.len(), 2);

        let err = catalog.cleanup(Some("01-01-2000")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClusterError>(),
            Some(ClusterError::Validation(_))
        ));

        catalog.cleanup(None).await.unwrap();
        assert!(store.pairs_snapshot().await.is_empty());
    }
}
