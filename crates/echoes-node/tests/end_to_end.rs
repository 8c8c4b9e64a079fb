//! End-to-end scenarios over the RocksDB store.

use chrono::{Duration, Utc};
use echoes_layers::{LayerIndex, RoomIndex};
use echoes_node::clock::{Clock, ManualClock};
use echoes_node::identity::{issue_session_token, CallerContext};
use echoes_node::models::EpochStatus;
use echoes_node::spam_guard::SpamGuardConfig;
use echoes_node::{Library, LibraryConfig, RocksStore, Store, SubmitError};
use ed25519_dalek::SigningKey;
use futures::future::join_all;
use std::sync::Arc;
use tempfile::TempDir;

struct Node {
    library: Arc<Library>,
    store: Arc<RocksStore>,
    clock: Arc<ManualClock>,
    _dir: TempDir,
}

fn node(config: LibraryConfig) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RocksStore::open(dir.path()).unwrap());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let library = Library::builder(store.clone())
        .config(config)
        .clock(clock.clone())
        .build()
        .unwrap();
    Node {
        library: Arc::new(library),
        store,
        clock,
        _dir: dir,
    }
}

fn threshold(n: u64) -> LibraryConfig {
    LibraryConfig {
        threshold: n,
        ..LibraryConfig::default()
    }
}

fn visitor(n: usize) -> CallerContext {
    CallerContext::anonymous(format!("198.51.100.{}", n))
}

#[tokio::test]
async fn fifth_message_closes_the_age_and_sixth_opens_the_next() {
    let node = node(threshold(5));

    for i in 0..5 {
        let receipt = node
            .library
            .submit_message(&format!("voice number {} in the first age", i), &visitor(i))
            .await
            .unwrap();
        assert_eq!(receipt.epoch_name, "Age 1");
        assert_eq!(receipt.layer_index, LayerIndex(1));
        assert_eq!(receipt.room_index, RoomIndex(0));
        assert_eq!(receipt.threshold_reached, i == 4);
    }

    let first = node.store.get_epoch(1).unwrap().unwrap();
    assert_eq!(first.status, EpochStatus::Closed);
    let stats = first.stats.unwrap();
    assert_eq!(stats.aggregate.total_messages, 5);
    assert_eq!(stats.aggregate.unique_messages, 5);
    assert_eq!(stats.aggregate.echo_count, 0);

    let sixth = node
        .library
        .submit_message("the first voice of the second age", &visitor(5))
        .await
        .unwrap();
    assert_eq!(sixth.epoch_name, "Age 2");
    assert_eq!(sixth.layer_index, LayerIndex(1));
    assert_eq!(sixth.room_index, RoomIndex(0));
    assert!(!sixth.threshold_reached);

    let epochs = node.library.epochs().unwrap();
    assert_eq!(epochs.len(), 2);
    assert_eq!(epochs.iter().filter(|e| e.is_active).count(), 1);
    assert_eq!(epochs[1].total_messages, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_admit_exactly_the_quota() {
    let node = node(LibraryConfig {
        spam: SpamGuardConfig {
            max_attempts: 1_000,
            ..SpamGuardConfig::default()
        },
        ..threshold(1_000)
    });
    let key = SigningKey::from_bytes(&[7u8; 32]);
    let caller = visitor(1).with_token(issue_session_token(&key, node.clock.now() + Duration::hours(1)));

    let attempts: Vec<_> = (0..20)
        .map(|i| {
            let library = Arc::clone(&node.library);
            let caller = caller.clone();
            tokio::spawn(async move {
                library
                    .submit_message(&format!("racing submission number {}", i), &caller)
                    .await
            })
        })
        .collect();

    let mut accepted = 0;
    let mut refused = 0;
    for attempt in join_all(attempts).await {
        match attempt.unwrap() {
            Ok(_) => accepted += 1,
            Err(SubmitError::QuotaExceeded { requires_auth, .. }) => {
                assert!(!requires_auth);
                refused += 1;
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(accepted, 5);
    assert_eq!(refused, 15);
    assert_eq!(node.store.counters(1).unwrap().total, 5);
}

#[tokio::test]
async fn anonymous_quota_resets_after_a_day() {
    let node = node(threshold(1_000));
    let me = visitor(42);

    node.library.submit_message("a single daily echo", &me).await.unwrap();
    assert!(matches!(
        node.library.submit_message("greedy second echo", &me).await,
        Err(SubmitError::QuotaExceeded { requires_auth: true, .. })
    ));

    node.clock.advance(Duration::hours(24) + Duration::seconds(1));
    let status = node.library.remaining_quota(&me).unwrap();
    assert_eq!(status.remaining, Some(1));

    let receipt = node.library.submit_message("a fresh day, a fresh echo", &me).await.unwrap();
    assert_eq!(receipt.remaining_quota, Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_past_the_threshold_closes_once() {
    let node = node(threshold(3));

    let attempts: Vec<_> = (0..12)
        .map(|i| {
            let library = Arc::clone(&node.library);
            tokio::spawn(async move {
                library
                    .submit_message(&format!("crowd member {} arrives", i), &visitor(100 + i))
                    .await
            })
        })
        .collect();
    for attempt in join_all(attempts).await {
        match attempt.unwrap() {
            Ok(_) | Err(SubmitError::EpochTransition { .. }) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    node.library.resume_pending_closure().await.unwrap();

    let epochs = node.store.list_epochs().unwrap();
    let current: Vec<_> = epochs.iter().filter(|e| e.status != EpochStatus::Closed).collect();
    assert_eq!(current.len(), 1);
    for (i, epoch) in epochs.iter().enumerate() {
        assert_eq!(epoch.id, i as u64 + 1);
        if epoch.status == EpochStatus::Closed {
            assert_eq!(epoch.stats.as_ref().unwrap().aggregate.total_messages, 3);
        }
    }
}

#[tokio::test]
async fn closed_stats_are_reproducible_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let archived = {
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let library = Library::builder(store.clone()).config(threshold(4)).build().unwrap();
        for (i, text) in ["we were here", "We were HERE", "the rain again", "we were here"]
            .iter()
            .enumerate()
        {
            library.submit_message(text, &visitor(i)).await.unwrap();
        }
        store.get_epoch(1).unwrap().unwrap().stats.unwrap().aggregate
    };
    assert_eq!(archived.echo_count, 2);

    let store = Arc::new(RocksStore::open(dir.path()).unwrap());
    let library = Library::builder(store).config(threshold(4)).build().unwrap();
    let recomputed = library.export_epoch(1).await.unwrap();
    assert_eq!(
        serde_json::to_vec(&recomputed).unwrap(),
        serde_json::to_vec(&archived).unwrap()
    );
    assert_eq!(library.system_state().unwrap().epoch_name, "Age 2");
}
