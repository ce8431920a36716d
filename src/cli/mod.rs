//! CLI module
//!
//! Command-line interface for running extractions.
//!
//! # Commands
//!
//! - `check` - Verify credentials and API reachability
//! - `read` - Extract records as JSON lines on stdout
//! - `resources` - List built-in resources

mod commands;
mod runner;

pub use commands::{Cli, Commands, OutputFormat};
pub use runner::Runner;
