//! Paginator
//!
//! Walks one resource page by page and yields its records as a lazy stream.
//! Pages are fetched only as the consumer pulls; dropping the stream stops
//! the walk.

use super::types::{
    PageCursor, PageRequest, PageSizeController, DEFAULT_MIN_PAGE_SIZE, DEFAULT_PAGE_SIZE,
};
use crate::error::{Error, ErrorKind, Result};
use crate::http::RequestExecutor;
use crate::resources::ResourceDef;
use crate::state::{BookmarkTracker, HighWaterMark};
use crate::types::{Record, SyncMode};
use futures::Stream;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lazy, finite sequence of records
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<Record>> + Send>>;

/// Paginator settings
#[derive(Debug, Clone)]
pub struct PaginatorConfig {
    /// Records per page
    pub page_size: u32,
    /// Floor for adaptive shrinking
    pub min_page_size: u32,
    /// Checkpoint after every page rather than only at the end
    pub checkpoint_per_page: bool,
    /// Incremental or full refresh
    pub sync_mode: SyncMode,
    /// Extra `q` filter ANDed with the bookmark filter
    pub custom_filter: Option<String>,
    /// `orderBy` override (`field:asc|desc`)
    pub order_by: Option<String>,
    /// `expand` override
    pub expand: Option<String>,
    /// `integrationInstance` filter
    pub instance_id: Option<String>,
    /// Comma-joined `fields` projection
    pub select_fields: Option<String>,
}

impl Default for PaginatorConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            min_page_size: DEFAULT_MIN_PAGE_SIZE,
            checkpoint_per_page: true,
            sync_mode: SyncMode::Incremental,
            custom_filter: None,
            order_by: None,
            expand: None,
            instance_id: None,
            select_fields: None,
        }
    }
}

/// Resource paginator
#[derive(Debug, Clone)]
pub struct Paginator {
    executor: Arc<RequestExecutor>,
    tracker: Arc<BookmarkTracker>,
    config: PaginatorConfig,
}

impl Paginator {
    /// Create a paginator
    pub fn new(
        executor: Arc<RequestExecutor>,
        tracker: Arc<BookmarkTracker>,
        config: PaginatorConfig,
    ) -> Self {
        Self {
            executor,
            tracker,
            config,
        }
    }

    /// Settings in use
    pub fn config(&self) -> &PaginatorConfig {
        &self.config
    }

    /// Stream every record of `resource` at or after `start`
    ///
    /// Boundary records equal to `start` are delivered again. Walks ordered
    /// ascending on the replication key checkpoint the tracker at page
    /// boundaries and when the stream ends, normally or with an error. Any
    /// other ordering checkpoints only once the walk is exhausted.
    pub fn extract(
        &self,
        resource: &ResourceDef,
        start: Option<HighWaterMark>,
        cancel: CancellationToken,
    ) -> RecordStream {
        let start = match self.config.sync_mode {
            SyncMode::Incremental => start,
            SyncMode::FullRefresh => None,
        };

        let from = start
            .as_ref()
            .map_or_else(|| "beginning".to_string(), ToString::to_string);
        info!(
            resource = %resource.name,
            from = %from,
            page_size = self.config.page_size,
            "Starting extraction"
        );

        let ascending = ascends_on_key(resource, &self.config);
        if !ascending && resource.replication_key.is_some() {
            warn!(
                resource = %resource.name,
                order_by = ?self.config.order_by,
                "Ordering override is not ascending on the replication key, \
                 bookmark advances only when the walk completes"
            );
        }

        let walk = Walk {
            executor: Arc::clone(&self.executor),
            tracker: Arc::clone(&self.tracker),
            query: build_query(resource, start.as_ref(), &self.config),
            cursor: resource.pagination.initial_cursor(),
            resource: resource.clone(),
            sizer: PageSizeController::new(self.config.page_size, self.config.min_page_size),
            checkpoint_per_page: self.config.checkpoint_per_page && ascending,
            ascending,
            cancel,
            buffer: VecDeque::new(),
            observed: None,
            exhausted: false,
            finished: false,
            pages: 0,
        };

        Box::pin(futures::stream::try_unfold(walk, Walk::step))
    }
}

/// `orderBy` of one walk
///
/// Resources with a replication key are walked ascending on it so that the
/// highest value seen at a page boundary is a safe resume point. An explicit
/// override is honored as given.
fn effective_order(resource: &ResourceDef, config: &PaginatorConfig) -> Option<String> {
    config.order_by.clone().or_else(|| {
        resource
            .replication_key
            .as_ref()
            .map(|key| format!("{key}:asc"))
    })
}

/// Whether the walk visits records in ascending replication key order
fn ascends_on_key(resource: &ResourceDef, config: &PaginatorConfig) -> bool {
    match (&resource.replication_key, effective_order(resource, config)) {
        (Some(key), Some(order)) => order == format!("{key}:asc"),
        _ => false,
    }
}

/// Query parameters shared by every page of one extraction
fn build_query(
    resource: &ResourceDef,
    start: Option<&HighWaterMark>,
    config: &PaginatorConfig,
) -> Vec<(String, String)> {
    let order_by = effective_order(resource, config);
    let mut query: Vec<(String, String)> = resource
        .default_params
        .iter()
        .filter(|(k, _)| {
            let overridden = (k == "orderBy" && order_by.is_some())
                || (k == "expand" && config.expand.is_some());
            !overridden
        })
        .cloned()
        .collect();

    if let Some(order_by) = order_by {
        query.push(("orderBy".to_string(), order_by));
    }
    if let Some(expand) = &config.expand {
        query.push(("expand".to_string(), expand.clone()));
    }
    if let Some(instance) = &config.instance_id {
        query.push(("integrationInstance".to_string(), instance.clone()));
    }
    if let Some(fields) = &config.select_fields {
        query.push(("fields".to_string(), fields.clone()));
    }

    let bookmark_filter = resource
        .replication_key
        .as_ref()
        .zip(start)
        .map(|(key, mark)| format!("{key} >= '{}'", mark.to_filter_value()));

    let filter = match (&config.custom_filter, bookmark_filter) {
        (Some(custom), Some(bookmark)) => Some(format!("({custom}) AND {bookmark}")),
        (Some(custom), None) => Some(custom.clone()),
        (None, bookmark) => bookmark,
    };
    if let Some(filter) = filter {
        query.push(("q".to_string(), filter));
    }

    query
}

/// State of one in-progress extraction
struct Walk {
    executor: Arc<RequestExecutor>,
    tracker: Arc<BookmarkTracker>,
    resource: ResourceDef,
    query: Vec<(String, String)>,
    cursor: Option<PageCursor>,
    sizer: PageSizeController,
    checkpoint_per_page: bool,
    ascending: bool,
    cancel: CancellationToken,
    buffer: VecDeque<Record>,
    observed: Option<HighWaterMark>,
    exhausted: bool,
    finished: bool,
    pages: u64,
}

impl Walk {
    async fn step(mut self) -> Result<Option<(Record, Self)>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                self.observe(&record);
                return Ok(Some((record, self)));
            }

            if self.finished {
                return Ok(None);
            }

            // Page boundary: everything fetched so far has been yielded
            if self.pages > 0 && (self.checkpoint_per_page || self.exhausted) {
                self.checkpoint().await;
            }

            if self.exhausted {
                self.finished = true;
                info!(resource = %self.resource.name, pages = self.pages, "Extraction complete");
                return Ok(None);
            }

            if let Err(e) = self.fetch_page().await {
                // Unread pages of an unordered walk may hold lower values
                if self.ascending {
                    self.checkpoint().await;
                }
                self.finished = true;
                return Err(e);
            }
        }
    }

    async fn fetch_page(&mut self) -> Result<()> {
        loop {
            let request = PageRequest {
                resource: self.resource.name.clone(),
                path: self.resource.path.clone(),
                cursor: self.cursor.clone(),
                page_size: self.sizer.current(),
                query: self.query.clone(),
                style: self.resource.pagination.clone(),
            };

            match self.executor.execute(&request, &self.cancel).await {
                Ok(page) => {
                    self.pages += 1;
                    if let Some(size) = self.sizer.record_page(page.timeouts) {
                        info!(
                            resource = %self.resource.name,
                            page_size = size,
                            "Adjusted page size"
                        );
                    }

                    debug!(
                        resource = %self.resource.name,
                        page = self.pages,
                        records = page.records.len(),
                        has_more = page.has_more,
                        "Fetched page"
                    );
                    if page.skipped > 0 {
                        warn!(
                            resource = %self.resource.name,
                            skipped = page.skipped,
                            "Skipped non-object items"
                        );
                    }

                    for record in page.records {
                        if self.has_primary_keys(&record) {
                            self.buffer.push_back(record);
                        } else {
                            warn!(
                                resource = %self.resource.name,
                                keys = ?self.resource.primary_keys,
                                "Skipped record without primary key"
                            );
                        }
                    }

                    match page.next_cursor {
                        Some(next) if page.has_more => self.cursor = Some(next),
                        _ => self.exhausted = true,
                    }
                    return Ok(());
                }
                Err(e) if e.kind == ErrorKind::Timeout && self.sizer.shrink() => {
                    warn!(
                        resource = %self.resource.name,
                        page_size = self.sizer.current(),
                        "Page timed out, retrying with a smaller page"
                    );
                }
                Err(e) => return Err(Error::Fetch(e)),
            }
        }
    }

    fn has_primary_keys(&self, record: &Record) -> bool {
        self.resource
            .primary_keys
            .iter()
            .all(|key| record.get(key).is_some_and(|v| !v.is_null()))
    }

    fn observe(&mut self, record: &Record) {
        let Some(key) = &self.resource.replication_key else {
            return;
        };
        let Some(candidate) = record.get_path(key).and_then(HighWaterMark::from_json) else {
            return;
        };

        match &self.observed {
            None => self.observed = Some(candidate),
            Some(current) => match candidate.partial_cmp(current) {
                Some(Ordering::Greater) => self.observed = Some(candidate),
                Some(_) => {}
                None => warn!(
                    resource = %self.resource.name,
                    value = %candidate,
                    "Replication key changed shape, ignoring value"
                ),
            },
        }
    }

    async fn checkpoint(&self) {
        if let Some(mark) = &self.observed {
            self.tracker.checkpoint(&self.resource.name, mark.clone()).await;
        }
    }
}
