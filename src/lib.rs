// Allow common clippy pedantic lints that aren't critical for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::ref_option)]
#![allow(clippy::unused_self)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::match_wildcard_for_single_variants)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::unused_async)]

//! # oic-extract
//!
//! Incremental, resumable extraction of Oracle Integration Cloud (OIC)
//! design-time and monitoring resources over its REST API.
//!
//! ## Features
//!
//! - **OAuth2 client credentials**: Cached tokens with single-flight refresh
//! - **Resilient requests**: Retry with jittered backoff, `Retry-After`, re-auth on 401
//! - **Pagination**: Offset and cursor-token walks as lazy record streams
//! - **Incremental sync**: Monotonic per-resource bookmarks, saved once their records are delivered
//! - **Parallel resources**: Bounded worker pool with per-resource failure isolation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use oic_extract::config::ExtractorConfig;
//! use oic_extract::engine::Extractor;
//! use oic_extract::state::FileStateStore;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> oic_extract::Result<()> {
//!     let config = ExtractorConfig::from_file("config.yaml")?;
//!     let store = Arc::new(FileStateStore::new("state.json"));
//!     let extractor = Extractor::new(config, store).await?;
//!
//!     let (messages, report) = extractor.run_to_vec(CancellationToken::new()).await?;
//!     println!("{} messages, {} failed", messages.len(), report.failed.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Extractor                             │
//! │   check() → ConnectionStatus     run() → Messages + RunReport   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//! ┌──────────┬─────────────┬─────┴───────┬───────────┬─────────────┐
//! │   Auth   │    HTTP     │  Paginate   │   State   │  Resources  │
//! ├──────────┼─────────────┼─────────────┼───────────┼─────────────┤
//! │ OAuth2   │ Retry       │ Offset      │ Bookmarks │ Design-time │
//! │ Cache    │ Rate Limit  │ Cursor      │ File      │ Monitoring  │
//! │ Refresh  │ Backoff     │ Page sizing │ Memory    │             │
//! └──────────┴─────────────┴─────────────┴───────────┴─────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

// ============================================================================
// Module declarations
// ============================================================================

/// Error types
pub mod error;

/// Common types and type aliases
pub mod types;

/// OAuth2 token management
pub mod auth;

/// Request execution with retry and rate limiting
pub mod http;

/// Page walking
pub mod pagination;

/// Built-in OIC resources
pub mod resources;

/// Bookmarks and their persistence
pub mod state;

/// Main execution engine
pub mod engine;

/// Extractor configuration
pub mod config;

/// Command-line interface
pub mod cli;

// ============================================================================
// Re-exports
// ============================================================================

pub use error::{Error, Result};
pub use types::*;

pub use config::ExtractorConfig;
pub use engine::{Extractor, Message, RunReport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
