// tests/pipeline_tests.rs

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime, Utc};
use newscluster_lib::models::ItemDetails;
use newscluster_lib::store::PairLedger;
use newscluster_lib::{
    run_clustering, run_pair_generation, run_scoring, CandidateSelector, ClusterConfig, ItemId,
    JaccardRule, MemoryFixture, MemoryStore, PairCatalog, ReportOptions, ScoringConfig,
    SelectionConfig, SimilarityScorer,
};

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn item(id: i64, combined_count: i64) -> ItemDetails {
    ItemDetails {
        id: ItemId(id),
        text: format!("post number {}", id),
        combined_count,
        retweet_count: combined_count / 2,
        favorite_count: combined_count / 2,
        screen_name: "desk".to_string(),
        created_at: now() - Duration::hours(1),
    }
}

fn selection() -> SelectionConfig {
    SelectionConfig {
        threshold: 0.5,
        max_items: 100,
    }
}

fn cluster_config(epsilon: f64) -> ClusterConfig {
    ClusterConfig {
        epsilon,
        min_pts: 2,
        days_back: 2,
    }
}

/// Three items: 1 and 2 share every term, 3 shares none.
fn overlap_store() -> MemoryStore {
    MemoryStore::from_fixture(
        MemoryFixture::new()
            .baseline("desk", 1.0)
            .item(item(1, 10))
            .item(item(2, 20))
            .item(item(3, 30))
            .words(ItemId(1), &[("a", 1), ("b", 1)])
            .words(ItemId(2), &[("a", 1), ("b", 1)])
            .words(ItemId(3), &[("c", 1)]),
    )
}

fn numbered_store(n: i64) -> MemoryStore {
    let mut fixture = MemoryFixture::new().baseline("desk", 1.0);
    for id in 1..=n {
        fixture = fixture
            .item(item(id, 10 + id))
            .words(ItemId(id), &[("shared", 1), ("own", id)]);
    }
    MemoryStore::from_fixture(fixture)
}

#[tokio::test]
async fn full_overlap_pair_clusters_and_leaves_the_rest_as_noise() {
    let store = overlap_store();

    let generated = run_pair_generation(&store, selection(), 10, true)
        .await
        .unwrap();
    assert_eq!(generated.selected_items, 3);
    assert_eq!(generated.pairs_generated, 3);

    let scoring = run_scoring(&store, "solo", 1, &ScoringConfig::default(), false)
        .await
        .unwrap();
    assert_eq!(scoring.len(), 1);
    assert_eq!(scoring[0].pairs_scored, 3);
    assert_eq!(scoring[0].edges_saved, 1);

    let edges = store.similarity_snapshot().await;
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].key(), (ItemId(1), ItemId(2)));
    assert_eq!(edges[0].jaccard, 999.0);
    assert_eq!(edges[0].links, 0.0);
    assert_eq!(store.considered_ids().await.len(), 3);

    let report = run_clustering(&store, cluster_config(0.1), ReportOptions::default(), now())
        .await
        .unwrap();
    assert_eq!(report.clustering.clusters.len(), 1);
    assert!(report.clustering.clusters.contains_key(&ItemId(1)));
    assert_eq!(report.clustering.noise, BTreeSet::from([ItemId(3)]));

    // Item 2 only has min_pts neighbours, so it is reported through the root's neighbour list.
    let records = &report.members[&ItemId(1)];
    let ids: BTreeSet<ItemId> = records.iter().map(|r| r.id).collect();
    assert_eq!(ids, BTreeSet::from([ItemId(1), ItemId(2)]));

    let stats = report.stats.unwrap();
    assert_eq!(stats.top_cluster, Some(ItemId(1)));
    assert_eq!(stats.top_item, Some(ItemId(2)));
    assert_eq!(report.best.unwrap().item.combined_count, 20);
}

#[tokio::test]
async fn pairs_left_from_an_earlier_selection_still_score() {
    let store = overlap_store();
    run_pair_generation(&store, selection(), 10, true)
        .await
        .unwrap();

    // A later selection that only item 3 passes clears the marks on 1 and 2.
    let narrow = SelectionConfig {
        threshold: 25.0,
        max_items: 100,
    };
    CandidateSelector::new(&store, narrow)
        .unwrap()
        .select(Utc::now().date_naive())
        .await
        .unwrap();
    assert_eq!(store.selected_ids().await, vec![ItemId(3)]);

    let scoring = run_scoring(&store, "late", 1, &ScoringConfig::default(), false)
        .await
        .unwrap();
    assert_eq!(scoring[0].pairs_claimed, 3);

    let edges = store.similarity_snapshot().await;
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].key(), (ItemId(1), ItemId(2)));
    assert_eq!(edges[0].jaccard, 999.0);
}

#[tokio::test]
async fn inconsistent_pair_is_skipped_without_losing_the_batch() {
    let store = MemoryStore::from_fixture(
        MemoryFixture::new()
            .baseline("desk", 1.0)
            .item(item(1, 10))
            .item(item(2, 10))
            .item(item(3, 10))
            .item(item(4, 10))
            .words(ItemId(1), &[("a", 1)])
            .words(ItemId(2), &[("a", 3)])
            .words(ItemId(3), &[("a", 1), ("b", 1)])
            .words(ItemId(4), &[("a", 1), ("b", 1)]),
    );
    let catalog = PairCatalog::new(&store, 10).unwrap();
    catalog.generate(&[ItemId(1), ItemId(2)]).await.unwrap();
    catalog.generate(&[ItemId(3), ItemId(4)]).await.unwrap();
    let claimed = catalog.claim("w", 10).await.unwrap();
    assert_eq!(claimed.len(), 2);

    let scorer = SimilarityScorer::load(&store, JaccardRule::Legacy)
        .await
        .unwrap();
    let outcome = scorer
        .score_and_persist(&store, &claimed, &ScoringConfig::default())
        .await
        .unwrap();
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.scored, 1);
    assert_eq!(outcome.saved, 1);

    let edges = store.similarity_snapshot().await;
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].key(), (ItemId(3), ItemId(4)));
    assert!(store
        .pairs_snapshot()
        .await
        .iter()
        .all(|p| p.processed_at.is_some()));
}

#[tokio::test]
async fn shared_link_alone_passes_a_sentinel_epsilon() {
    let store = MemoryStore::from_fixture(
        MemoryFixture::new()
            .baseline("desk", 1.0)
            .item(item(1, 10))
            .item(item(2, 10))
            .link(ItemId(1), "https://example.org/story")
            .link(ItemId(2), "https://example.org/story"),
    );
    run_pair_generation(&store, selection(), 10, true)
        .await
        .unwrap();

    let config = ScoringConfig {
        epsilon: 999.0,
        ..ScoringConfig::default()
    };
    run_scoring(&store, "links", 1, &config, false).await.unwrap();

    let edges = store.similarity_snapshot().await;
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].jaccard, 0.0);
    assert_eq!(edges[0].links, 999.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_overlap() {
    let store = Arc::new(numbered_store(12));
    let ids: Vec<ItemId> = (1..=12).map(ItemId).collect();
    PairCatalog::new(store.as_ref(), 50)
        .unwrap()
        .generate(&ids)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for worker in 0..4 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let catalog = PairCatalog::new(store.as_ref(), 50).unwrap();
            let name = format!("claimer-{}", worker);
            let mut mine = Vec::new();
            loop {
                let batch = catalog.claim(&name, 5).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|p| p.key()));
                tokio::task::yield_now().await;
            }
            mine
        }));
    }

    let mut seen = BTreeSet::new();
    for handle in handles {
        for key in handle.await.unwrap() {
            assert!(seen.insert(key), "pair {:?} claimed twice", key);
        }
    }
    assert_eq!(seen.len(), 66);
}

#[tokio::test]
async fn concurrent_workers_split_the_catalog() {
    let store = numbered_store(8);
    run_pair_generation(&store, selection(), 7, true)
        .await
        .unwrap();

    let config = ScoringConfig {
        claim_limit: 4,
        ..ScoringConfig::default()
    };
    let workers = run_scoring(&store, "host", 3, &config, false).await.unwrap();
    let names: Vec<&str> = workers.iter().map(|w| w.worker_id.as_str()).collect();
    assert_eq!(names, vec!["host-1", "host-2", "host-3"]);

    let claimed: usize = workers.iter().map(|w| w.pairs_claimed).sum();
    assert_eq!(claimed, 28);
    let pairs = store.pairs_snapshot().await;
    assert!(pairs.iter().all(|p| p.processed_at.is_some()));
}

#[tokio::test]
async fn max_pairs_stops_the_worker_early() {
    let store = numbered_store(5);
    run_pair_generation(&store, selection(), 100, true)
        .await
        .unwrap();

    let config = ScoringConfig {
        claim_limit: 3,
        max_pairs: Some(4),
        ..ScoringConfig::default()
    };
    let workers = run_scoring(&store, "w", 1, &config, false).await.unwrap();
    assert_eq!(workers[0].pairs_claimed, 4);
    assert_eq!(workers[0].batches, 2);

    let open = PairCatalog::new(&store, 100)
        .unwrap()
        .unprocessed(None)
        .await
        .unwrap();
    assert_eq!(open.len(), 6);
}

#[tokio::test]
async fn abandoned_claims_are_picked_up_after_the_lease() {
    let store = numbered_store(4);
    run_pair_generation(&store, selection(), 100, true)
        .await
        .unwrap();

    // A worker that claimed half the catalog an hour ago and never came back.
    let stale = store
        .claim_pairs("crashed", 3, now() - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(stale.len(), 3);

    let without_lease = run_scoring(&store, "w1", 1, &ScoringConfig::default(), false)
        .await
        .unwrap();
    assert_eq!(without_lease[0].pairs_claimed, 3);

    let config = ScoringConfig {
        lease: Some(Duration::minutes(5)),
        ..ScoringConfig::default()
    };
    let with_lease = run_scoring(&store, "w2", 1, &config, false).await.unwrap();
    assert_eq!(with_lease[0].pairs_claimed, 3);
    assert!(store
        .pairs_snapshot()
        .await
        .iter()
        .all(|p| p.processed_at.is_some()));
}

#[tokio::test]
async fn clean_rescoring_replaces_previous_results() {
    let store = overlap_store();
    run_pair_generation(&store, selection(), 10, true)
        .await
        .unwrap();
    run_scoring(&store, "first", 1, &ScoringConfig::default(), false)
        .await
        .unwrap();

    // Everything is processed, so a plain rerun finds nothing to do.
    let idle = run_scoring(&store, "second", 1, &ScoringConfig::default(), false)
        .await
        .unwrap();
    assert_eq!(idle[0].pairs_claimed, 0);

    let again = run_scoring(&store, "third", 1, &ScoringConfig::default(), true)
        .await
        .unwrap();
    assert_eq!(again[0].pairs_claimed, 3);
    assert_eq!(store.similarity_snapshot().await.len(), 1);
}

#[tokio::test]
async fn clustering_with_no_recent_items_is_empty() {
    let store = MemoryStore::new();
    let report = run_clustering(&store, cluster_config(0.1), ReportOptions::default(), now())
        .await
        .unwrap();
    assert!(report.clustering.clusters.is_empty());
    assert!(report.members.is_empty());
    assert_eq!(report.stats.unwrap().top_cluster, None);
    assert!(report.best.is_none());
    assert_eq!(report.interesting.map(|i| i.len()), Some(0));
}

#[tokio::test]
async fn keywords_are_reported_when_requested() {
    let store = overlap_store();
    run_pair_generation(&store, selection(), 10, true)
        .await
        .unwrap();
    run_scoring(&store, "w", 1, &ScoringConfig::default(), false)
        .await
        .unwrap();

    let options = ReportOptions {
        keywords: Some(1),
        ..ReportOptions::default()
    };
    let report = run_clustering(&store, cluster_config(0.1), options, now())
        .await
        .unwrap();
    let keywords = report.keywords.unwrap();
    assert_eq!(keywords[&ItemId(1)], vec![("a".to_string(), 2)]);
}
