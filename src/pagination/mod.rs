//! Pagination module
//!
//! Supports: Offset (`limit`/`offset`) and continuation-token paging.
//!
//! # Overview
//!
//! The `Paginator` turns a resource into a lazy stream of records. It builds
//! one `PageRequest` at a time, hands it to the request executor, buffers the
//! parsed `PageResult` and checkpoints the bookmark tracker as pages are
//! consumed. Page size adapts to timeouts through `PageSizeController`.

mod paginator;
mod types;

pub use paginator::{Paginator, PaginatorConfig, RecordStream};
pub use types::{
    PageCursor, PageRequest, PageResult, PageSizeController, PaginationStyle,
    DEFAULT_MIN_PAGE_SIZE, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
