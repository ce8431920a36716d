//! Execution engine module
//!
//! Runs the selected resources through the paginator and streams the
//! results to a consumer.
//!
//! # Overview
//!
//! The engine module provides:
//! - `Extractor` - Orchestrates a run over every selected resource
//! - `Message` - Records, per-resource outcomes and the final state
//! - `RunReport` - What completed, what failed and where bookmarks ended
//!
//! Resources run concurrently up to `max_concurrent_resources`. A failing
//! resource never affects its siblings unless `fail_fast` is set or the
//! failure is run-fatal (rejected credentials), in which case the whole
//! run is cancelled.
//!
//! Bookmarks advance in memory while a run is in flight and travel to the
//! consumer as [`Message::State`], queued behind the records they cover.
//! Nothing reaches the [`StateStore`] until the consumer hands a state it
//! has delivered back to [`Extractor::commit`].

mod types;

pub use types::{ConnectionStatus, Message, ResourceFailure, ResourceSummary, RunReport, RunStats};

use crate::auth::TokenManager;
use crate::config::ExtractorConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::http::{build_client, RateLimiter, RequestExecutor};
use crate::pagination::{PageRequest, Paginator};
use crate::resources::{find_resource, select_resources, ResourceDef};
use crate::state::{BookmarkState, BookmarkTracker, HighWaterMark, StateStore};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Messages buffered between the engine and a slow consumer
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

enum Outcome {
    Completed(ResourceSummary),
    Failed(ResourceFailure),
}

/// OIC extraction engine
pub struct Extractor {
    config: ExtractorConfig,
    executor: Arc<RequestExecutor>,
    tracker: Arc<BookmarkTracker>,
    paginator: Paginator,
    resources: Vec<ResourceDef>,
}

impl Extractor {
    /// Build an extractor, loading bookmarks from `store`
    pub async fn new(config: ExtractorConfig, store: Arc<dyn StateStore>) -> Result<Self> {
        let resources = select_resources(config.resources.as_deref())?;

        let client = build_client(config.request_timeout)?;
        let tokens = Arc::new(
            TokenManager::with_client(config.credentials.clone(), client.clone())
                .with_refresh_margin(config.token_refresh_margin),
        );
        let mut executor = RequestExecutor::new(
            client,
            config.base_url.clone(),
            tokens,
            config.backoff_policy(),
        );
        if let Some(limits) = config.rate_limiter_config() {
            executor = executor.with_rate_limiter(RateLimiter::new(&limits));
        }
        let executor = Arc::new(executor);

        let tracker = Arc::new(
            BookmarkTracker::open(store, &config.start_bookmarks)
                .await?
                .with_persist_each(false),
        );
        let paginator = Paginator::new(
            Arc::clone(&executor),
            Arc::clone(&tracker),
            config.paginator_config(),
        );

        Ok(Self {
            config,
            executor,
            tracker,
            paginator,
            resources,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Resources this extractor runs, in catalog order
    pub fn resources(&self) -> &[ResourceDef] {
        &self.resources
    }

    /// Bookmark tracker
    pub fn tracker(&self) -> &Arc<BookmarkTracker> {
        &self.tracker
    }

    /// Request executor
    pub fn executor(&self) -> &Arc<RequestExecutor> {
        &self.executor
    }

    /// Verify credentials and reachability with a one-record page of
    /// `integrations`
    pub async fn check(&self, cancel: &CancellationToken) -> Result<ConnectionStatus> {
        let token = self.executor.tokens().get_valid_token().await?;

        let sample = find_resource("integrations")?;
        let request = PageRequest {
            resource: sample.name.clone(),
            path: sample.path.clone(),
            cursor: sample.pagination.initial_cursor(),
            page_size: 1,
            query: Vec::new(),
            style: sample.pagination.clone(),
        };
        let page = self.executor.execute(&request, cancel).await?;

        info!(resource = %sample.name, "Connection check succeeded");
        Ok(ConnectionStatus {
            token_expires_at: token.expires_at(),
            checked_resource: sample.name,
            total_results: page.total_results,
        })
    }

    /// Extract every selected resource, sending messages to `sender`
    ///
    /// Messages of one resource arrive in extraction order; messages of
    /// different resources interleave. A [`Message::State`] follows the
    /// records of every checkpointed page and a final one is sent after
    /// every resource has finished. Pass each state to [`Self::commit`] once
    /// the messages before it are delivered.
    pub async fn run(
        &self,
        sender: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let run_cancel = cancel.child_token();
        let budget = self
            .config
            .max_run
            .map(|limit| spawn_budget(limit, run_cancel.clone()));

        info!(
            resources = self.resources.len(),
            workers = self.config.max_concurrent_resources,
            "Starting run"
        );

        let mut outcomes: Vec<(usize, Outcome)> = futures::stream::iter(
            self.resources.iter().enumerate(),
        )
        .map(|(index, resource)| {
            let sender = &sender;
            let run_cancel = &run_cancel;
            async move { (index, self.extract_resource(resource, sender, run_cancel).await) }
        })
        .buffer_unordered(self.config.max_concurrent_resources.max(1))
        .collect()
        .await;
        outcomes.sort_by_key(|(index, _)| *index);

        let budget_expired = match budget {
            Some(handle) if handle.is_finished() => handle.await.unwrap_or(false),
            Some(handle) => {
                handle.abort();
                false
            }
            None => false,
        };

        let mut report = RunReport {
            cancelled: budget_expired || cancel.is_cancelled(),
            ..RunReport::default()
        };
        for (_, outcome) in outcomes {
            match outcome {
                Outcome::Completed(summary) => {
                    report.stats.add_records(summary.records);
                    report.stats.add_completed();
                    report.completed.push(summary);
                }
                Outcome::Failed(failure) => {
                    report.stats.add_records(failure.records_emitted);
                    report.stats.add_failed();
                    report.failed.push(failure);
                }
            }
        }

        report.bookmarks = self.tracker.snapshot().await;
        if sender
            .send(Message::State(report.bookmarks.clone()))
            .await
            .is_err()
        {
            debug!("Output closed before the final state");
        }

        report.stats.add_executor(self.executor.stats());
        report.stats.token_exchanges = self.executor.tokens().exchange_count();
        report
            .stats
            .set_duration(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));

        info!(
            completed = report.stats.resources_completed,
            failed = report.stats.resources_failed,
            records = report.stats.records_emitted,
            cancelled = report.cancelled,
            duration_ms = report.stats.duration_ms,
            "Run finished"
        );
        Ok(report)
    }

    /// Persist a state the consumer has delivered everything before
    pub async fn commit(&self, state: &BookmarkState) -> Result<bool> {
        self.tracker.commit(state).await
    }

    /// Run and collect every message, committing the final state once all
    /// of them are held; convenient for small extractions
    pub async fn run_to_vec(&self, cancel: CancellationToken) -> Result<(Vec<Message>, RunReport)> {
        let (sender, mut receiver) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let collect = async {
            let mut messages = Vec::new();
            while let Some(message) = receiver.recv().await {
                messages.push(message);
            }
            messages
        };
        let (report, messages) = tokio::join!(self.run(sender, cancel), collect);
        let report = report?;
        self.commit(&report.bookmarks).await?;
        Ok((messages, report))
    }

    async fn extract_resource(
        &self,
        resource: &ResourceDef,
        sender: &mpsc::Sender<Message>,
        cancel: &CancellationToken,
    ) -> Outcome {
        let started = Instant::now();
        let name = resource.name.as_str();

        if cancel.is_cancelled() {
            return self
                .fail(resource, ErrorKind::Cancelled, "run cancelled before start", 0, sender)
                .await;
        }

        let start = self.tracker.load(name).await.map(|b| b.high_water_mark);
        let mut sent_mark = start.clone();
        let mut records = self.paginator.extract(resource, start, cancel.clone());
        let mut emitted: u64 = 0;

        while let Some(item) = records.next().await {
            // Checkpoints happen inside `next`, after the page's records were sent
            if !self.send_progress(name, &mut sent_mark, sender).await {
                return self.output_closed(resource, emitted, sender, cancel).await;
            }
            match item {
                Ok(record) => {
                    let message = Message::record(name, record.into_fields());
                    if sender.send(message).await.is_err() {
                        return self.output_closed(resource, emitted, sender, cancel).await;
                    }
                    emitted += 1;
                }
                Err(e) => {
                    let kind = failure_kind(&e);
                    if kind.is_run_fatal() {
                        error!(resource = name, error = %e, "Credentials rejected, cancelling run");
                        cancel.cancel();
                    } else if self.config.fail_fast && kind != ErrorKind::Cancelled {
                        warn!(resource = name, error = %e, "Cancelling remaining resources");
                        cancel.cancel();
                    }
                    return self.fail(resource, kind, &e.to_string(), emitted, sender).await;
                }
            }
        }

        if !self.send_progress(name, &mut sent_mark, sender).await {
            return self.output_closed(resource, emitted, sender, cancel).await;
        }

        let summary = ResourceSummary {
            resource: resource.name.clone(),
            records: emitted,
            bookmark: self.tracker.load(name).await,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        info!(resource = name, records = emitted, "Resource complete");

        if sender
            .send(Message::ResourceCompleted(summary.clone()))
            .await
            .is_err()
        {
            debug!(resource = name, "Output closed before the resource summary");
        }
        Outcome::Completed(summary)
    }

    /// Send a state message if `resource`'s bookmark moved since `sent`.
    /// Returns false once the output is closed.
    async fn send_progress(
        &self,
        resource: &str,
        sent: &mut Option<HighWaterMark>,
        sender: &mpsc::Sender<Message>,
    ) -> bool {
        let current = self.tracker.load(resource).await.map(|b| b.high_water_mark);
        if current == *sent {
            return true;
        }
        *sent = current;
        let state = self.tracker.snapshot().await;
        sender.send(Message::State(state)).await.is_ok()
    }

    async fn output_closed(
        &self,
        resource: &ResourceDef,
        emitted: u64,
        sender: &mpsc::Sender<Message>,
        cancel: &CancellationToken,
    ) -> Outcome {
        warn!(resource = %resource.name, "Output closed, cancelling run");
        cancel.cancel();
        self.fail(resource, ErrorKind::Cancelled, "output closed", emitted, sender).await
    }

    async fn fail(
        &self,
        resource: &ResourceDef,
        kind: ErrorKind,
        reason: &str,
        records_emitted: u64,
        sender: &mpsc::Sender<Message>,
    ) -> Outcome {
        let failure = ResourceFailure {
            resource: resource.name.clone(),
            kind,
            reason: reason.to_string(),
            last_bookmark: self.tracker.load(&resource.name).await,
            records_emitted,
        };
        warn!(
            resource = %failure.resource,
            kind = kind.as_str(),
            records = records_emitted,
            reason,
            "Resource failed"
        );

        if sender
            .send(Message::ResourceFailed(failure.clone()))
            .await
            .is_err()
        {
            debug!(resource = %failure.resource, "Output closed before the failure report");
        }
        Outcome::Failed(failure)
    }
}

fn failure_kind(error: &Error) -> ErrorKind {
    match error {
        Error::Fetch(e) => e.kind,
        Error::Auth(e) => ErrorKind::from(e.kind),
        Error::Cancelled => ErrorKind::Cancelled,
        _ => ErrorKind::MalformedResponse,
    }
}

/// Cancel `token` once `limit` has elapsed. Resolves to whether the budget
/// was the cause.
fn spawn_budget(limit: Duration, token: CancellationToken) -> JoinHandle<bool> {
    tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(limit) => {
                warn!(limit_secs = limit.as_secs(), "Run budget exhausted, cancelling");
                token.cancel();
                true
            }
            () = token.cancelled() => false,
        }
    })
}

#[cfg(test)]
mod tests;
