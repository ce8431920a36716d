//! Tests for the state module

use super::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

/// Store whose saves always fail
#[derive(Default)]
struct BrokenStore {
    attempts: AtomicUsize,
}

#[async_trait]
impl StateStore for BrokenStore {
    async fn load(&self) -> Result<BookmarkState> {
        Ok(BookmarkState::new())
    }

    async fn save(&self, _state: &BookmarkState) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::state("disk full"))
    }
}

fn ts(s: &str) -> HighWaterMark {
    HighWaterMark::parse(s)
}

// ============================================================================
// Tracker
// ============================================================================

#[tokio::test]
async fn test_checkpoint_advances_strictly() {
    let tracker = BookmarkTracker::new(Arc::new(MemoryStateStore::new()));

    assert!(tracker.load("integrations").await.is_none());
    assert!(tracker.checkpoint("integrations", ts("2024-01-02T00:00:00Z")).await);
    assert!(!tracker.checkpoint("integrations", ts("2024-01-02T00:00:00Z")).await);
    assert!(!tracker.checkpoint("integrations", ts("2024-01-01T00:00:00Z")).await);
    assert!(tracker.checkpoint("integrations", ts("2024-01-03T00:00:00Z")).await);

    let bookmark = tracker.load("integrations").await.unwrap();
    assert_eq!(bookmark.high_water_mark, ts("2024-01-03T00:00:00Z"));
    assert_eq!(bookmark.resource, "integrations");
}

#[tokio::test]
async fn test_checkpoint_rejects_other_shape() {
    let tracker = BookmarkTracker::new(Arc::new(MemoryStateStore::new()));

    assert!(tracker.checkpoint("lookups", HighWaterMark::Integer(5)).await);
    assert!(!tracker.checkpoint("lookups", ts("2030-01-01T00:00:00Z")).await);
    assert_eq!(
        tracker.load("lookups").await.unwrap().high_water_mark,
        HighWaterMark::Integer(5)
    );
}

#[tokio::test]
async fn test_checkpoint_persists_each_advance() {
    let store = Arc::new(MemoryStateStore::new());
    let tracker = BookmarkTracker::new(store.clone());

    tracker.checkpoint("packages", HighWaterMark::Integer(1)).await;
    assert_eq!(
        store.current().await.get("packages").map(|b| b.high_water_mark.clone()),
        Some(HighWaterMark::Integer(1))
    );
}

#[tokio::test]
async fn test_persist_each_disabled_defers_writes() {
    let store = Arc::new(MemoryStateStore::new());
    let tracker = BookmarkTracker::new(store.clone()).with_persist_each(false);

    tracker.checkpoint("packages", HighWaterMark::Integer(1)).await;
    assert!(store.current().await.is_empty());

    tracker.persist().await.unwrap();
    assert!(store.current().await.get("packages").is_some());
}

#[tokio::test]
async fn test_persist_failure_does_not_block_advance() {
    let store = Arc::new(BrokenStore::default());
    let tracker = BookmarkTracker::new(store.clone());

    assert!(tracker.checkpoint("certificates", HighWaterMark::Integer(1)).await);
    assert!(tracker.checkpoint("certificates", HighWaterMark::Integer(2)).await);

    assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(
        tracker.load("certificates").await.unwrap().high_water_mark,
        HighWaterMark::Integer(2)
    );
    assert!(tracker.persist().await.is_err());
}

#[tokio::test]
async fn test_commit_writes_only_delivered_state() {
    let store = Arc::new(MemoryStateStore::new());
    let tracker = BookmarkTracker::new(store.clone()).with_persist_each(false);

    tracker.checkpoint("integrations", ts("2024-01-02T00:00:00Z")).await;
    let delivered = tracker.snapshot().await;
    tracker.checkpoint("integrations", ts("2024-01-05T00:00:00Z")).await;
    assert!(store.current().await.is_empty());

    assert!(tracker.commit(&delivered).await.unwrap());
    assert_eq!(
        store.current().await.get("integrations").unwrap().high_water_mark,
        ts("2024-01-02T00:00:00Z")
    );
    // The in-memory bookmark stays ahead of what was written
    assert_eq!(
        tracker.load("integrations").await.unwrap().high_water_mark,
        ts("2024-01-05T00:00:00Z")
    );
}

#[tokio::test]
async fn test_commit_merges_out_of_order_states() {
    let store = Arc::new(MemoryStateStore::new());
    let tracker = BookmarkTracker::new(store.clone()).with_persist_each(false);

    let mut newer = BookmarkState::new();
    newer.insert(Bookmark::new("integrations", ts("2024-01-05T00:00:00Z")));
    newer.insert(Bookmark::new("connections", ts("2024-01-01T00:00:00Z")));
    let mut older = BookmarkState::new();
    older.insert(Bookmark::new("integrations", ts("2024-01-02T00:00:00Z")));
    older.insert(Bookmark::new("connections", ts("2024-01-03T00:00:00Z")));

    assert!(tracker.commit(&newer).await.unwrap());
    assert!(tracker.commit(&older).await.unwrap());
    assert!(!tracker.commit(&older).await.unwrap());

    let saved = store.current().await;
    assert_eq!(saved.get("integrations").unwrap().high_water_mark, ts("2024-01-05T00:00:00Z"));
    assert_eq!(saved.get("connections").unwrap().high_water_mark, ts("2024-01-03T00:00:00Z"));
}

#[tokio::test]
async fn test_failed_commit_is_retried_by_the_next_one() {
    let store = Arc::new(BrokenStore::default());
    let tracker = BookmarkTracker::new(store.clone()).with_persist_each(false);

    tracker.checkpoint("lookups", HighWaterMark::Integer(3)).await;
    let state = tracker.snapshot().await;
    assert!(tracker.commit(&state).await.is_err());
    assert!(tracker.commit(&state).await.is_err());
    assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_open_prefers_persisted_over_start_bookmarks() {
    let mut saved = BookmarkState::new();
    saved.insert(Bookmark::new("integrations", ts("2024-05-01T00:00:00Z")));
    let store = Arc::new(MemoryStateStore::with_state(saved));

    let mut start = HashMap::new();
    start.insert("integrations".to_string(), ts("2020-01-01T00:00:00Z"));
    start.insert("connections".to_string(), ts("2023-01-01T00:00:00Z"));

    let tracker = BookmarkTracker::open(store, &start).await.unwrap();

    assert_eq!(
        tracker.load("integrations").await.unwrap().high_water_mark,
        ts("2024-05-01T00:00:00Z")
    );
    assert_eq!(
        tracker.load("connections").await.unwrap().high_water_mark,
        ts("2023-01-01T00:00:00Z")
    );
}

#[tokio::test]
async fn test_bookmark_equals_running_maximum() {
    let mut rng = StdRng::seed_from_u64(42);

    for round in 0..50 {
        let tracker = BookmarkTracker::new(Arc::new(MemoryStateStore::new()))
            .with_persist_each(false);
        let values: Vec<i64> = (0..rng.gen_range(1..40))
            .map(|_| rng.gen_range(-1_000..1_000))
            .collect();

        let mut previous: Option<HighWaterMark> = None;
        for v in &values {
            tracker.checkpoint("adapters", HighWaterMark::Integer(*v)).await;
            let current = tracker.load("adapters").await.unwrap().high_water_mark;
            if let Some(prev) = &previous {
                assert!(current >= *prev, "round {round}: bookmark went backwards");
            }
            previous = Some(current);
        }

        let max = values.iter().copied().max().unwrap();
        assert_eq!(previous, Some(HighWaterMark::Integer(max)), "round {round}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checkpoints_keep_maximum() {
    let store = Arc::new(MemoryStateStore::new());
    let tracker = Arc::new(BookmarkTracker::new(store.clone()));

    let handles: Vec<_> = (0..8)
        .map(|task| {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                for i in 0..25 {
                    tracker
                        .checkpoint("libraries", HighWaterMark::Integer(task * 100 + i))
                        .await;
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let expected = HighWaterMark::Integer(724);
    assert_eq!(tracker.load("libraries").await.unwrap().high_water_mark, expected);
    assert_eq!(
        store.current().await.get("libraries").unwrap().high_water_mark,
        expected
    );
}

// ============================================================================
// File store
// ============================================================================

#[tokio::test]
async fn test_file_store_missing_file_is_empty() {
    let dir = tempdir().unwrap();
    let store = FileStateStore::new(dir.path().join("state.json"));
    assert!(store.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_file_store_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("state.json");
    let store = FileStateStore::new(&path);

    let mut state = BookmarkState::new();
    state.insert(Bookmark::new("integrations", ts("2024-01-15T10:30:00Z")));
    store.save(&state).await.unwrap();

    assert!(path.exists());
    assert!(!path.with_extension("tmp").exists());

    let loaded = store.load().await.unwrap();
    assert_eq!(loaded, state);

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains("\"bookmarks\""));
    assert!(raw.contains("2024-01-15T10:30:00Z"));
}

#[tokio::test]
async fn test_file_store_corrupt_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = FileStateStore::new(&path).load().await.unwrap_err();
    assert_eq!(err.code(), "state_error");
}

#[tokio::test]
async fn test_tracker_with_file_store() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");

    {
        let tracker = BookmarkTracker::new(Arc::new(FileStateStore::new(&path)));
        tracker.checkpoint("lookups", ts("2024-03-01T00:00:00Z")).await;
    }

    let reopened = BookmarkTracker::open(Arc::new(FileStateStore::new(&path)), &HashMap::new())
        .await
        .unwrap();
    assert_eq!(
        reopened.load("lookups").await.unwrap().high_water_mark,
        ts("2024-03-01T00:00:00Z")
    );
}
