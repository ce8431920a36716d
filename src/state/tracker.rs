//! Bookmark tracker
//!
//! Holds one bookmark per resource behind a single lock. Advancements reach
//! the [`StateStore`] either as they happen (`persist_each`) or when a
//! consumer commits a state it has finished delivering.

use super::store::StateStore;
use super::types::{Bookmark, BookmarkState, HighWaterMark};
use crate::error::Result;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Monotonic per-resource bookmarks
pub struct BookmarkTracker {
    bookmarks: RwLock<BTreeMap<String, Bookmark>>,
    store: Arc<dyn StateStore>,
    /// Last state written to the store; its lock serializes writes
    committed: Mutex<BookmarkState>,
    persist_each: bool,
}

impl BookmarkTracker {
    /// Create an empty tracker
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            bookmarks: RwLock::new(BTreeMap::new()),
            store,
            committed: Mutex::new(BookmarkState::new()),
            persist_each: true,
        }
    }

    /// Open a tracker seeded from the store, then from `start` for
    /// resources the store knows nothing about
    pub async fn open(
        store: Arc<dyn StateStore>,
        start: &HashMap<String, HighWaterMark>,
    ) -> Result<Self> {
        let persisted = store.load().await?;
        let mut state = persisted.clone();
        for (resource, mark) in start {
            if state.get(resource).is_none() {
                state.insert(Bookmark::new(resource.clone(), mark.clone()));
            }
        }
        debug!(resources = state.bookmarks.len(), "Loaded bookmarks");

        let tracker = Self::new(store);
        *tracker.bookmarks.write().await = state.bookmarks;
        *tracker.committed.lock().await = persisted;
        Ok(tracker)
    }

    /// Persist on every advancement (default) or only on [`Self::persist`]
    #[must_use]
    pub fn with_persist_each(mut self, persist_each: bool) -> Self {
        self.persist_each = persist_each;
        self
    }

    /// Current bookmark of a resource
    pub async fn load(&self, resource: &str) -> Option<Bookmark> {
        self.bookmarks.read().await.get(resource).cloned()
    }

    /// Advance a resource's bookmark to `candidate` if it is strictly
    /// greater than the stored value. Returns whether it advanced.
    pub async fn checkpoint(&self, resource: &str, candidate: HighWaterMark) -> bool {
        {
            let mut bookmarks = self.bookmarks.write().await;
            if let Some(current) = bookmarks.get(resource) {
                match candidate.partial_cmp(&current.high_water_mark) {
                    Some(Ordering::Greater) => {}
                    Some(_) => return false,
                    None => {
                        warn!(
                            resource,
                            stored = %current.high_water_mark,
                            candidate = %candidate,
                            "Ignoring bookmark of a different shape"
                        );
                        return false;
                    }
                }
            }
            debug!(resource, bookmark = %candidate, "Bookmark advanced");
            bookmarks.insert(resource.to_string(), Bookmark::new(resource, candidate));
        }

        if self.persist_each {
            if let Err(e) = self.persist().await {
                warn!(resource, error = %e, "Failed to persist bookmark, continuing");
            }
        }
        true
    }

    /// Copy of every bookmark
    pub async fn snapshot(&self) -> BookmarkState {
        BookmarkState {
            bookmarks: self.bookmarks.read().await.clone(),
        }
    }

    /// Write the current bookmarks to the store
    pub async fn persist(&self) -> Result<()> {
        // Serialized so a slow save never overwrites a newer snapshot
        let mut committed = self.committed.lock().await;
        let state = self.snapshot().await;
        self.store.save(&state).await?;
        *committed = state;
        Ok(())
    }

    /// Write `state` once every record it covers has been delivered
    ///
    /// Bookmarks merge into what was written before and only move forward,
    /// so states committed out of order never regress the store. Returns
    /// whether anything was written.
    pub async fn commit(&self, state: &BookmarkState) -> Result<bool> {
        let mut committed = self.committed.lock().await;

        let mut merged = committed.clone();
        let mut advanced = false;
        for bookmark in state.bookmarks.values() {
            let newer = match merged.get(&bookmark.resource) {
                Some(current) => {
                    bookmark.high_water_mark.partial_cmp(&current.high_water_mark)
                        == Some(Ordering::Greater)
                }
                None => true,
            };
            if newer {
                merged.insert(bookmark.clone());
                advanced = true;
            }
        }
        if !advanced {
            return Ok(false);
        }

        self.store.save(&merged).await?;
        debug!(resources = merged.bookmarks.len(), "Committed bookmarks");
        *committed = merged;
        Ok(true)
    }
}

impl std::fmt::Debug for BookmarkTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookmarkTracker")
            .field("persist_each", &self.persist_each)
            .finish_non_exhaustive()
    }
}
