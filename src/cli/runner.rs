//! CLI runner - executes commands

use crate::cli::commands::{Cli, Commands, OutputFormat};
use crate::config::ExtractorConfig;
use crate::engine::{Extractor, Message, RunReport, DEFAULT_CHANNEL_CAPACITY};
use crate::error::{Error, Result};
use crate::resources::{find_resource, BUILTIN_RESOURCES};
use crate::state::{FileStateStore, MemoryStateStore, StateStore};
use crate::types::SyncMode;
use serde::Serialize;
use serde_json::json;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// CLI runner
pub struct Runner {
    cli: Cli,
}

impl Runner {
    /// Create a new runner
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Run the CLI command
    pub async fn run(&self) -> Result<()> {
        match &self.cli.command {
            Commands::Check => self.check().await,
            Commands::Read {
                resources,
                full_refresh,
            } => self.read(resources.as_deref(), *full_refresh).await,
            Commands::Resources => self.resources(),
        }
    }

    /// Load configuration, inline JSON first
    fn load_config(&self) -> Result<ExtractorConfig> {
        if let Some(json) = &self.cli.config_json {
            return ExtractorConfig::from_json_str(json);
        }
        match &self.cli.config {
            Some(path) => ExtractorConfig::from_file(path),
            None => Err(Error::config(
                "Config not specified (use -C/--config or --config-json)",
            )),
        }
    }

    /// Bookmark store: the state file if given, otherwise memory only
    fn state_store(&self) -> Arc<dyn StateStore> {
        match &self.cli.state {
            Some(path) => Arc::new(FileStateStore::new(path)),
            None => Arc::new(MemoryStateStore::new()),
        }
    }

    /// Check connection
    async fn check(&self) -> Result<()> {
        let config = self.load_config()?;
        let extractor = Extractor::new(config, Arc::new(MemoryStateStore::new())).await?;

        match extractor.check(&CancellationToken::new()).await {
            Ok(status) => {
                self.output_message(&json!({
                    "type": "CONNECTION_STATUS",
                    "connectionStatus": {
                        "status": "SUCCEEDED",
                        "message": "Connection successful",
                        "checkedResource": status.checked_resource,
                        "totalResults": status.total_results,
                        "tokenExpiresAt": status.token_expires_at
                    }
                }))
            }
            Err(e) => {
                self.output_message(&json!({
                    "type": "CONNECTION_STATUS",
                    "connectionStatus": {
                        "status": "FAILED",
                        "message": format!("Connection failed: {e}")
                    }
                }))?;
                Err(e)
            }
        }
    }

    /// Extract records
    async fn read(&self, resources: Option<&str>, full_refresh: bool) -> Result<()> {
        let mut config = self.load_config()?;
        apply_read_overrides(&mut config, resources, full_refresh)?;

        let extractor = Extractor::new(config, self.state_store()).await?;

        let cancel = CancellationToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling run");
                    cancel.cancel();
                }
            })
        };

        let (sender, receiver) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let mut out = io::stdout();
        let (report, delivered) = tokio::join!(
            extractor.run(sender, cancel.clone()),
            self.deliver(&extractor, receiver, &mut out, &cancel),
        );
        interrupt.abort();

        let report = report?;
        delivered?;
        self.output_message(&run_summary(&report))?;

        if report.is_success() {
            Ok(())
        } else if report.cancelled {
            Err(Error::Cancelled)
        } else {
            Err(Error::Other(format!(
                "{} of {} resources failed",
                report.failed.len(),
                report.failed.len() + report.completed.len()
            )))
        }
    }

    /// List built-in resources
    fn resources(&self) -> Result<()> {
        let resources: Vec<_> = BUILTIN_RESOURCES
            .iter()
            .map(|r| {
                json!({
                    "name": r.name,
                    "path": r.path,
                    "primaryKeys": r.primary_keys,
                    "replicationKey": r.replication_key,
                })
            })
            .collect();

        self.output_message(&json!({
            "type": "RESOURCES",
            "resources": resources
        }))
    }

    /// Write run messages as they arrive
    ///
    /// A state message is committed only after it and everything before it
    /// has been written. If the output goes away the run is cancelled and
    /// the write error returned; a failed commit is retried by the next
    /// state and reported only if the last one fails too.
    async fn deliver<W: Write>(
        &self,
        extractor: &Extractor,
        mut receiver: mpsc::Receiver<Message>,
        out: &mut W,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut commit_error = None;
        while let Some(message) = receiver.recv().await {
            if let Err(e) = self.write_message(out, &message) {
                if e.kind() == io::ErrorKind::BrokenPipe {
                    info!("Output closed by reader, cancelling run");
                } else {
                    warn!(error = %e, "Failed to write output, cancelling run");
                }
                cancel.cancel();
                return Err(Error::Io(e));
            }

            if let Message::State(state) = &message {
                commit_error = match extractor.commit(state).await {
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "Failed to save bookmarks, continuing");
                        Some(e)
                    }
                };
            }
        }
        commit_error.map_or(Ok(()), Err)
    }

    /// Output a message on stdout
    fn output_message(&self, msg: &impl Serialize) -> Result<()> {
        self.write_message(&mut io::stdout().lock(), msg)?;
        Ok(())
    }

    /// Write one message followed by a newline, flushed
    fn write_message(&self, out: &mut impl Write, msg: &impl Serialize) -> io::Result<()> {
        match self.cli.format {
            OutputFormat::Json => serde_json::to_writer(&mut *out, msg)?,
            OutputFormat::Pretty => serde_json::to_writer_pretty(&mut *out, msg)?,
        }
        writeln!(out)?;
        out.flush()
    }
}

/// Apply `read` flags on top of the loaded config
fn apply_read_overrides(
    config: &mut ExtractorConfig,
    resources: Option<&str>,
    full_refresh: bool,
) -> Result<()> {
    if let Some(list) = resources {
        let names: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .collect();
        if names.is_empty() {
            return Err(Error::invalid_value("resources", "must not be empty"));
        }
        for name in &names {
            find_resource(name)?;
        }
        config.resources = Some(names);
    }
    if full_refresh {
        config.sync_mode = SyncMode::FullRefresh;
    }
    Ok(())
}

fn run_summary(report: &RunReport) -> serde_json::Value {
    json!({
        "type": "RUN_SUMMARY",
        "summary": {
            "completed": report.completed.iter().map(|s| &s.resource).collect::<Vec<_>>(),
            "failed": report.failed,
            "cancelled": report.cancelled,
            "stats": report.stats
        }
    })
}
