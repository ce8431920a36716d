//! State management module
//!
//! Handles bookmark tracking and persistence between runs so extraction
//! can resume incrementally.
//!
//! # Overview
//!
//! The state module provides:
//! - `HighWaterMark` / `Bookmark` - per-resource position
//! - `BookmarkTracker` - monotonic checkpointing
//! - `StateStore` - persistence backends (`FileStateStore`, `MemoryStateStore`)

mod store;
mod tracker;
mod types;

pub use store::{FileStateStore, MemoryStateStore, StateStore};
pub use tracker::BookmarkTracker;
pub use types::{Bookmark, BookmarkState, HighWaterMark};

#[cfg(test)]
mod tests;
