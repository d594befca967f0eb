// src/store/postgres.rs

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use log::debug;
use tokio_postgres::Row;

use crate::db::{self, PgPool};
use crate::models::{CandidatePair, ItemDetails, ItemId, LinkEdge, SimilarityEdge, TermStore};
use crate::store::{FeatureStore, PairLedger, SimilarityStore};

const QUALIFYING_FILTER: &str = "
    FROM features f
    JOIN users u ON u.screen_name = f.screen_name
    WHERE u.combined_av > 0
      AND f.combined_count / u.combined_av > $1";

const PAIR_COLUMNS: &str = "id1, id2, added, claimed_by, claimed_at, processed_at";

/// PostgreSQL-backed store over a bb8 pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn pair_from_row(row: &Row) -> CandidatePair {
    CandidatePair {
        id1: row.get("id1"),
        id2: row.get("id2"),
        added: row.get("added"),
        claimed_by: row.get("claimed_by"),
        claimed_at: row.get("claimed_at"),
        processed_at: row.get("processed_at"),
    }
}

fn split_keys(pairs: &[(ItemId, ItemId)]) -> (Vec<ItemId>, Vec<ItemId>) {
    pairs.iter().copied().unzip()
}

#[async_trait]
impl FeatureStore for PgStore {
    async fn qualifying_counts(&self, threshold: f64) -> Result<BTreeMap<String, usize>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for qualifying_counts")?;
        let query = format!(
            "SELECT f.screen_name, COUNT(*) AS qualifying {} GROUP BY f.screen_name",
            QUALIFYING_FILTER
        );
        let rows = conn
            .query(query.as_str(), &[&threshold])
            .await
            .context("Failed to count qualifying items per source")?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let source: String = row.get("screen_name");
            let qualifying: i64 = row.get("qualifying");
            counts.insert(source, qualifying.max(0) as usize);
        }
        Ok(counts)
    }

    async fn top_qualifying(
        &self,
        source: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ItemId>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for top_qualifying")?;
        let query = format!(
            "SELECT f.id {} AND f.screen_name = $2 ORDER BY f.combined_count DESC, f.id ASC LIMIT $3",
            QUALIFYING_FILTER
        );
        let rows = conn
            .query(query.as_str(), &[&threshold, &source, &(limit as i64)])
            .await
            .with_context(|| format!("Failed to fetch top items for source {}", source))?;
        Ok(rows.iter().map(|row| row.get::<_, ItemId>(0)).collect())
    }

    async fn clear_selection(&self) -> Result<u64> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for clear_selection")?;
        conn.execute(
            "UPDATE features SET selected = NULL WHERE selected IS NOT NULL",
            &[],
        )
        .await
        .context("Failed to clear previous selection")
    }

    async fn mark_selected(&self, ids: &[ItemId], on: NaiveDate) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for mark_selected")?;
        conn.execute(
            "UPDATE features SET selected = $1 WHERE id = ANY($2)",
            &[&on, &ids],
        )
        .await
        .context("Failed to mark selected items")
    }

    async fn load_terms(&self) -> Result<TermStore> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for load_terms")?;
        let rows = conn
            .query(
                "SELECT id, term, num FROM tweetwords
                 UNION ALL
                 SELECT id, term, num FROM tweetbigrams",
                &[],
            )
            .await
            .context("Failed to load item terms")?;

        let mut terms = TermStore::new();
        for row in &rows {
            let id: ItemId = row.get(0);
            let term: String = row.get(1);
            let num: i64 = row.get(2);
            terms.add(id, term, num);
        }
        debug!("Loaded {} term rows for {} items", rows.len(), terms.len());
        Ok(terms)
    }

    async fn load_links(&self) -> Result<Vec<LinkEdge>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for load_links")?;
        let rows = conn
            .query("SELECT id, link FROM links", &[])
            .await
            .context("Failed to load item links")?;
        Ok(rows
            .iter()
            .map(|row| LinkEdge::new(row.get(0), row.get::<_, String>(1)))
            .collect())
    }

    async fn mark_considered(&self, ids: &[ItemId], at: NaiveDateTime) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for mark_considered")?;
        conn.execute(
            "UPDATE features SET processed = $1 WHERE id = ANY($2)",
            &[&at, &ids],
        )
        .await
        .context("Failed to mark items as considered")
    }

    async fn window_start(&self, since: NaiveDateTime) -> Result<Option<ItemId>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for window_start")?;
        let row = conn
            .query_one("SELECT MIN(id) FROM features WHERE created_at > $1", &[&since])
            .await
            .context("Failed to find first item in lookback window")?;
        Ok(row.get::<_, Option<ItemId>>(0))
    }

    async fn considered_since(&self, start: ItemId) -> Result<Vec<ItemId>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for considered_since")?;
        let rows = conn
            .query(
                "SELECT id FROM features WHERE processed IS NOT NULL AND id >= $1",
                &[&start],
            )
            .await
            .context("Failed to fetch considered items")?;
        Ok(rows.iter().map(|row| row.get::<_, ItemId>(0)).collect())
    }

    async fn fetch_details(&self, ids: &[ItemId]) -> Result<HashMap<ItemId, ItemDetails>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for fetch_details")?;
        let rows = conn
            .query(
                "SELECT id, rawtext, combined_count, retweet_count, favorite_count,
                        screen_name, created_at
                 FROM features WHERE id = ANY($1)",
                &[&ids],
            )
            .await
            .context("Failed to fetch item details")?;

        let mut details = HashMap::with_capacity(rows.len());
        for row in rows {
            let item = ItemDetails {
                id: row.get("id"),
                text: row.get::<_, Option<String>>("rawtext").unwrap_or_default(),
                combined_count: row.get::<_, Option<i64>>("combined_count").unwrap_or(0),
                retweet_count: row.get::<_, Option<i64>>("retweet_count").unwrap_or(0),
                favorite_count: row.get::<_, Option<i64>>("favorite_count").unwrap_or(0),
                screen_name: row.get::<_, Option<String>>("screen_name").unwrap_or_default(),
                created_at: row.get("created_at"),
            };
            details.insert(item.id, item);
        }
        Ok(details)
    }

    async fn word_counts(&self, ids: &[ItemId]) -> Result<TermStore> {
        let mut terms = TermStore::new();
        if ids.is_empty() {
            return Ok(terms);
        }
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for word_counts")?;
        let rows = conn
            .query(
                "SELECT id, term, num FROM tweetwords WHERE id = ANY($1)",
                &[&ids],
            )
            .await
            .context("Failed to fetch word counts")?;
        for row in rows {
            let id: ItemId = row.get(0);
            let term: String = row.get(1);
            let num: i64 = row.get(2);
            terms.add(id, term, num);
        }
        Ok(terms)
    }
}

#[async_trait]
impl PairLedger for PgStore {
    async fn insert_pairs(&self, pairs: &[(ItemId, ItemId)], added: NaiveDateTime) -> Result<u64> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let (firsts, seconds) = split_keys(pairs);
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for insert_pairs")?;
        conn.execute(
            "INSERT INTO pairs (id1, id2, added)
             SELECT p.id1, p.id2, $3
             FROM UNNEST($1::BIGINT[], $2::BIGINT[]) AS p(id1, id2)
             ON CONFLICT (id1, id2) DO NOTHING",
            &[&firsts, &seconds, &added],
        )
        .await
        .with_context(|| format!("Failed to insert batch of {} pairs", pairs.len()))
    }

    async fn claim_pairs(
        &self,
        worker_id: &str,
        limit: usize,
        now: NaiveDateTime,
    ) -> Result<Vec<CandidatePair>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for claim_pairs")?;

        // Select and mark in one statement; SKIP LOCKED keeps concurrent claimers disjoint.
        let query = "
            WITH next_pairs AS (
                SELECT id1, id2 FROM pairs
                WHERE claimed_by IS NULL AND processed_at IS NULL
                ORDER BY id1, id2
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE pairs p
            SET claimed_by = $1, claimed_at = $2
            FROM next_pairs n
            WHERE p.id1 = n.id1 AND p.id2 = n.id2
            RETURNING p.id1, p.id2, p.added, p.claimed_by, p.claimed_at, p.processed_at";
        let rows = conn
            .query(query, &[&worker_id, &now, &(limit as i64)])
            .await
            .with_context(|| format!("Failed to claim pairs for worker {}", worker_id))?;

        let mut claimed: Vec<CandidatePair> = rows.iter().map(pair_from_row).collect();
        claimed.sort_by_key(|pair| pair.key());
        debug!("Worker {} claimed {} pairs", worker_id, claimed.len());
        Ok(claimed)
    }

    async fn complete_pairs(&self, pairs: &[(ItemId, ItemId)], at: NaiveDateTime) -> Result<u64> {
        if pairs.is_empty() {
            return Ok(0);
        }
        let (firsts, seconds) = split_keys(pairs);
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for complete_pairs")?;
        conn.execute(
            "UPDATE pairs p SET processed_at = $3
             FROM UNNEST($1::BIGINT[], $2::BIGINT[]) AS c(id1, id2)
             WHERE p.id1 = c.id1 AND p.id2 = c.id2",
            &[&firsts, &seconds, &at],
        )
        .await
        .context("Failed to mark pairs as processed")
    }

    async fn reset_pairs(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for reset_pairs")?;
        conn.batch_execute("DROP TABLE IF EXISTS pairs")
            .await
            .context("Failed to drop pairs table")?;
        conn.batch_execute(db::CREATE_PAIRS_SQL)
            .await
            .context("Failed to recreate pairs table")?;
        Ok(())
    }

    async fn delete_claimed_before(&self, cutoff: NaiveDateTime) -> Result<u64> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for delete_claimed_before")?;
        conn.execute("DELETE FROM pairs WHERE claimed_at < $1", &[&cutoff])
            .await
            .context("Failed to delete pairs claimed before cutoff")
    }

    async fn release_claimed_before(&self, cutoff: NaiveDateTime) -> Result<u64> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for release_claimed_before")?;
        conn.execute(
            "UPDATE pairs SET claimed_by = NULL, claimed_at = NULL
             WHERE processed_at IS NULL AND claimed_at < $1",
            &[&cutoff],
        )
        .await
        .context("Failed to release expired claims")
    }

    async fn reset_claims(&self) -> Result<u64> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for reset_claims")?;
        conn.execute(
            "UPDATE pairs SET claimed_by = NULL, claimed_at = NULL, processed_at = NULL",
            &[],
        )
        .await
        .context("Failed to reset pair claims")
    }

    async fn unprocessed_pairs(
        &self,
        added_before: Option<NaiveDateTime>,
    ) -> Result<Vec<CandidatePair>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for unprocessed_pairs")?;
        let rows = match added_before {
            Some(cutoff) => {
                let query = format!(
                    "SELECT {} FROM pairs WHERE processed_at IS NULL AND added < $1 ORDER BY id1, id2",
                    PAIR_COLUMNS
                );
                conn.query(query.as_str(), &[&cutoff]).await
            }
            None => {
                let query = format!(
                    "SELECT {} FROM pairs WHERE processed_at IS NULL ORDER BY id1, id2",
                    PAIR_COLUMNS
                );
                conn.query(query.as_str(), &[]).await
            }
        }
        .context("Failed to fetch unprocessed pairs")?;
        Ok(rows.iter().map(pair_from_row).collect())
    }
}

#[async_trait]
impl SimilarityStore for PgStore {
    async fn upsert_edges(&self, edges: &[SimilarityEdge]) -> Result<u64> {
        if edges.is_empty() {
            return Ok(0);
        }
        // A statement may not touch the same key twice; keep the last edge per key.
        let mut latest: BTreeMap<(ItemId, ItemId), &SimilarityEdge> = BTreeMap::new();
        for edge in edges {
            latest.insert(edge.key(), edge);
        }
        let mut firsts = Vec::with_capacity(latest.len());
        let mut seconds = Vec::with_capacity(latest.len());
        let mut jaccards = Vec::with_capacity(latest.len());
        let mut links = Vec::with_capacity(latest.len());
        for edge in latest.values() {
            firsts.push(edge.id1);
            seconds.push(edge.id2);
            jaccards.push(edge.jaccard);
            links.push(edge.links);
        }

        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for upsert_edges")?;
        conn.execute(
            "INSERT INTO similarity (id1, id2, jaccard, links)
             SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::FLOAT8[], $4::FLOAT8[])
             ON CONFLICT (id1, id2)
             DO UPDATE SET jaccard = EXCLUDED.jaccard, links = EXCLUDED.links",
            &[&firsts, &seconds, &jaccards, &links],
        )
        .await
        .with_context(|| format!("Failed to upsert {} similarity edges", firsts.len()))
    }

    async fn edges_since(&self, start: ItemId) -> Result<Vec<SimilarityEdge>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for edges_since")?;
        let rows = conn
            .query(
                "SELECT id1, id2, jaccard, links FROM similarity WHERE id1 >= $1",
                &[&start],
            )
            .await
            .context("Failed to load similarity edges")?;
        Ok(rows
            .iter()
            .map(|row| SimilarityEdge {
                id1: row.get("id1"),
                id2: row.get("id2"),
                jaccard: row.get("jaccard"),
                links: row.get("links"),
            })
            .collect())
    }

    async fn reset_similarities(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for reset_similarities")?;
        conn.batch_execute("DROP TABLE IF EXISTS similarity")
            .await
            .context("Failed to drop similarity table")?;
        conn.batch_execute(db::CREATE_SIMILARITY_SQL)
            .await
            .context("Failed to recreate similarity table")?;
        Ok(())
    }
}
