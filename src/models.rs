// src/models.rs

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;

use bytes::BytesMut;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type};

//------------------------------------------------------------------------------
// IDENTIFIER TYPES
//------------------------------------------------------------------------------

/// Strongly typed identifier for an item (a single post).
///
/// Ids are assigned by the upstream feed and increase with time, so ordering by id is
/// ordering by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToSql for ItemId {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        self.0.to_sql(ty, out)
    }

    fn accepts(ty: &Type) -> bool {
        <i64 as ToSql>::accepts(ty)
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        self.0.to_sql_checked(ty, out)
    }
}

impl<'a> FromSql<'a> for ItemId {
    fn from_sql(ty: &Type, raw: &[u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        let id = i64::from_sql(ty, raw)?;
        Ok(ItemId(id))
    }

    fn accepts(ty: &Type) -> bool {
        <i64 as FromSql>::accepts(ty)
    }
}

/// Orders two ids so the smaller one comes first.
pub fn canonical_pair(a: ItemId, b: ItemId) -> (ItemId, ItemId) {
    if a <= b { (a, b) } else { (b, a) }
}

//------------------------------------------------------------------------------
// TERM STORE
//------------------------------------------------------------------------------

/// Bag of weighted terms for one item: term -> occurrence count.
///
/// A `BTreeMap` keeps iteration order stable, which the legacy jaccard accumulation depends on.
pub type TermCounts = BTreeMap<String, i64>;

/// Two-level term store: item id -> term -> count.
///
/// Merging is additive: adding a term that is already present sums the counts. This is how
/// words and bigrams for the same item end up in one bag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TermStore {
    items: HashMap<ItemId, TermCounts>,
}

impl TermStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: ItemId, term: impl Into<String>, count: i64) {
        *self
            .items
            .entry(id)
            .or_default()
            .entry(term.into())
            .or_insert(0) += count;
    }

    pub fn insert_item(&mut self, id: ItemId, terms: TermCounts) {
        let entry = self.items.entry(id).or_default();
        for (term, count) in terms {
            *entry.entry(term).or_insert(0) += count;
        }
    }

    pub fn merge(&mut self, other: TermStore) {
        for (id, terms) in other.items {
            self.insert_item(id, terms);
        }
    }

    pub fn get(&self, id: ItemId) -> Option<&TermCounts> {
        self.items.get(&id)
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.items.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sums the term counts of every listed id. An id listed twice is counted twice.
    pub fn aggregate<'a, I>(&self, ids: I) -> TermCounts
    where
        I: IntoIterator<Item = &'a ItemId>,
    {
        let mut totals = TermCounts::new();
        for id in ids {
            if let Some(terms) = self.items.get(id) {
                for (term, count) in terms {
                    *totals.entry(term.clone()).or_insert(0) += count;
                }
            }
        }
        totals
    }
}

//------------------------------------------------------------------------------
// CORE DOMAIN MODELS
//------------------------------------------------------------------------------

/// Relation between an item and an external resource it references
/// (url, media, retweeted or quoted post).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEdge {
    pub id: ItemId,
    pub resource: String,
}

impl LinkEdge {
    pub fn new(id: ItemId, resource: impl Into<String>) -> Self {
        Self {
            id,
            resource: resource.into(),
        }
    }
}

/// A pair of item ids scheduled for comparison, with its claim metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePair {
    /// Always the smaller id.
    pub id1: ItemId,
    pub id2: ItemId,
    pub added: Option<NaiveDateTime>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<NaiveDateTime>,
    pub processed_at: Option<NaiveDateTime>,
}

impl CandidatePair {
    pub fn new(a: ItemId, b: ItemId) -> Self {
        let (id1, id2) = canonical_pair(a, b);
        Self {
            id1,
            id2,
            added: None,
            claimed_by: None,
            claimed_at: None,
            processed_at: None,
        }
    }

    pub fn key(&self) -> (ItemId, ItemId) {
        (self.id1, self.id2)
    }

    pub fn is_claimable(&self) -> bool {
        self.claimed_by.is_none() && self.processed_at.is_none()
    }
}

/// A persisted similarity score between two items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEdge {
    /// Always the smaller id.
    pub id1: ItemId,
    pub id2: ItemId,
    pub jaccard: f64,
    pub links: f64,
}

impl SimilarityEdge {
    pub fn new(a: ItemId, b: ItemId, jaccard: f64, links: f64) -> Self {
        let (id1, id2) = canonical_pair(a, b);
        Self {
            id1,
            id2,
            jaccard,
            links,
        }
    }

    pub fn key(&self) -> (ItemId, ItemId) {
        (self.id1, self.id2)
    }

    /// Combined relevance used as the graph weight.
    pub fn score(&self) -> f64 {
        self.jaccard + self.links
    }
}

/// Display fields of an item as stored by the feature extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDetails {
    pub id: ItemId,
    pub text: String,
    pub combined_count: i64,
    pub retweet_count: i64,
    pub favorite_count: i64,
    pub screen_name: String,
    pub created_at: NaiveDateTime,
}

/// An item materialized as a member of a cluster, relative to one root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub root: ItemId,
    /// `None` when the item is the root itself.
    pub root_similarity: Option<f64>,
    pub id: ItemId,
    pub text: String,
    pub combined_count: i64,
    pub retweet_count: i64,
    pub favorite_count: i64,
    pub screen_name: String,
    #[serde(with = "created_at_format")]
    pub created_at: NaiveDateTime,
}

impl ItemRecord {
    pub fn from_details(root: ItemId, root_similarity: Option<f64>, details: &ItemDetails) -> Self {
        Self {
            root,
            root_similarity,
            id: details.id,
            text: details.text.clone(),
            combined_count: details.combined_count,
            retweet_count: details.retweet_count,
            favorite_count: details.favorite_count,
            screen_name: details.screen_name.clone(),
            created_at: details.created_at,
        }
    }
}

mod created_at_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_ordering() {
        let edge = SimilarityEdge::new(ItemId(9), ItemId(3), 0.5, 0.0);
        assert_eq!(edge.key(), (ItemId(3), ItemId(9)));

        let pair = CandidatePair::new(ItemId(7), ItemId(2));
        assert_eq!(pair.key(), (ItemId(2), ItemId(7)));
        assert!(pair.is_claimable());
    }

    #[test]
    fn test_term_store_merge_is_additive() {
        let mut words = TermStore::new();
        words.add(ItemId(1), "storm", 2);
        words.add(ItemId(1), "coast", 1);

        let mut bigrams = TermStore::new();
        bigrams.add(ItemId(1), "storm coast", 1);
        bigrams.add(ItemId(1), "storm", 1);
        words.merge(bigrams);

        let terms = words.get(ItemId(1)).unwrap();
        assert_eq!(terms.get("storm"), Some(&3));
        assert_eq!(terms.get("storm coast"), Some(&1));
        assert_eq!(terms.len(), 3);
    }

    #[test]
    fn test_aggregate_counts_repeated_ids() {
        let mut store = TermStore::new();
        store.add(ItemId(1), "vote", 1);
        store.add(ItemId(2), "vote", 2);

        let totals = store.aggregate(&[ItemId(1), ItemId(2), ItemId(1), ItemId(5)]);
        assert_eq!(totals.get("vote"), Some(&4));
    }
}
