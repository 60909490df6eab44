//! Sync orchestration: configuration, classification, per-source ingestion
//! pipelines and the single-flight coordinator that drives them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use drev_adapters::{grammar_for, ContentLayout, GrammarKind, KeyStrategy};
use drev_storage::{
    BackoffPolicy, FtpConfig, FtpConnector, RecordStore, RemoteConnector, SqliteRecordStore,
    StoreError, SyncRunRow, TransportError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub mod classify;
pub mod coordinator;
pub mod pipeline;

pub use classify::{
    Classification, ClassificationPolicy, Classifier, DEFAULT_CLEAN_STATUS, DEFAULT_FLAGGED_STATUS,
};
pub use coordinator::{StartOutcome, SyncCoordinator};
pub use pipeline::{IngestionWriter, RecordKeyResolver, RunContext, SyncPipeline, WriteOutcome};

pub const CRATE_NAME: &str = "drev-sync";

pub const DEFAULT_SYNC_CRON: &str = "0 0 9 * * *";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub grammar: GrammarKind,
    pub root: String,
    /// Environment variable that overrides `root` when set.
    #[serde(default)]
    pub root_env: Option<String>,
    /// Falls back to the grammar's own default when omitted.
    #[serde(default)]
    pub key_strategy: Option<KeyStrategy>,
    #[serde(flatten)]
    pub content: ContentLayout,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceConfig {
    pub fn resolved_root(&self, lookup: impl Fn(&str) -> Option<String>) -> String {
        self.root_env
            .as_deref()
            .and_then(|name| lookup(name))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.root.clone())
    }

    pub fn effective_key_strategy(&self) -> KeyStrategy {
        self.key_strategy
            .unwrap_or_else(|| grammar_for(self.grammar).default_key_strategy())
    }
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: SourceRegistry =
            serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.source_id.trim().is_empty() {
                bail!("source with empty source_id");
            }
            if !seen.insert(source.source_id.as_str()) {
                bail!("duplicate source_id `{}`", source.source_id);
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub ftp: FtpConfig,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub deadline: Duration,
    pub workspace_root: PathBuf,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/drev.sqlite".to_string()),
            ftp: FtpConfig {
                host: lookup("FTP_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: lookup("FTP_PORT")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(21),
                user: lookup("FTP_USER").unwrap_or_else(|| "anonymous".to_string()),
                password: lookup("FTP_PASS").unwrap_or_default(),
                timeout: Duration::from_secs(parsed("FTP_TIMEOUT_SECS").unwrap_or(120)),
                backoff: BackoffPolicy::default(),
            },
            scheduler_enabled: lookup("DREV_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: lookup("SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            deadline: Duration::from_secs(parsed("SYNC_DEADLINE_SECS").unwrap_or(3600)),
            workspace_root: lookup("DREV_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            web_port: lookup("DREV_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    Busy,
    #[error("remote transport failed: {0}")]
    Transport(#[from] TransportError),
    #[error("sync run cancelled")]
    Cancelled,
    #[error("sync run exceeded its deadline")]
    DeadlineExceeded,
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Running,
    Completed,
    Aborted,
    Cancelled,
    DeadlineExceeded,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Running => "running",
            RunOutcome::Completed => SyncRunRow::COMPLETED,
            RunOutcome::Aborted => "aborted",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::DeadlineExceeded => "deadline_exceeded",
        }
    }

    pub fn for_error(err: &SyncError) -> Self {
        match err {
            SyncError::Cancelled => RunOutcome::Cancelled,
            SyncError::DeadlineExceeded => RunOutcome::DeadlineExceeded,
            _ => RunOutcome::Aborted,
        }
    }
}

/// Counters for one source within one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub candidates_seen: u64,
    pub skipped_known: u64,
    pub written: u64,
    pub already_ingested: u64,
    pub rejected: u64,
    pub transcripts_missing: u64,
    pub transcripts_unreadable: u64,
    pub metrics_missing: u64,
    pub metrics_malformed: u64,
    pub write_failures: u64,
    pub outcome: RunOutcome,
    pub error: Option<String>,
}

impl RunReport {
    pub fn new(run_id: Uuid, source_id: impl Into<String>) -> Self {
        Self {
            run_id,
            source_id: source_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            candidates_seen: 0,
            skipped_known: 0,
            written: 0,
            already_ingested: 0,
            rejected: 0,
            transcripts_missing: 0,
            transcripts_unreadable: 0,
            metrics_missing: 0,
            metrics_malformed: 0,
            write_failures: 0,
            outcome: RunOutcome::Running,
            error: None,
        }
    }

    pub fn finish(&mut self, result: &Result<(), SyncError>) {
        self.finished_at = Some(Utc::now());
        match result {
            Ok(()) => self.outcome = RunOutcome::Completed,
            Err(err) => {
                self.outcome = RunOutcome::for_error(err);
                self.error = Some(err.to_string());
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    pub fn to_run_row(&self) -> SyncRunRow {
        SyncRunRow {
            run_id: self.run_id,
            source_id: self.source_id.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at.unwrap_or_else(Utc::now),
            outcome: self.outcome.as_str().to_string(),
            candidates_seen: self.candidates_seen,
            written: self.written,
            skipped: self.skipped_known + self.already_ingested,
            rejected: self.rejected,
            failed: self.write_failures,
        }
    }
}

/// Builds one pipeline per enabled source and wraps them in a coordinator.
pub fn build_coordinator(
    config: &SyncConfig,
    registry: &SourceRegistry,
    policy: ClassificationPolicy,
    store: Arc<dyn RecordStore>,
    connector: Arc<dyn RemoteConnector>,
) -> Arc<SyncCoordinator> {
    let classifier = Arc::new(Classifier::new(policy));
    let pipelines = registry
        .enabled()
        .map(|source| {
            let root = source.resolved_root(|name| std::env::var(name).ok());
            SyncPipeline::new(source.clone(), root, Arc::clone(&classifier), Arc::clone(&store))
        })
        .collect();
    Arc::new(SyncCoordinator::new(connector, store, pipelines, config.deadline))
}

/// Loads `sources.yaml` and the classification rules from the workspace root.
pub async fn build_coordinator_from_workspace(
    config: &SyncConfig,
    store: Arc<dyn RecordStore>,
    connector: Arc<dyn RemoteConnector>,
) -> Result<Arc<SyncCoordinator>> {
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let policy = ClassificationPolicy::load(&config.workspace_root)?;
    Ok(build_coordinator(config, &registry, policy, store, connector))
}

pub async fn build_scheduler(
    coordinator: Arc<SyncCoordinator>,
    cron: &str,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let coordinator = Arc::clone(&coordinator);
        Box::pin(async move {
            match coordinator.try_start() {
                StartOutcome::Accepted { run_id } => info!(%run_id, "scheduled sync started"),
                StartOutcome::Busy => warn!("scheduled sync skipped; a run is already in progress"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    coordinator: Arc<SyncCoordinator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(coordinator, &config.sync_cron).await.map(Some)
}

pub async fn open_store(config: &SyncConfig) -> Result<SqliteRecordStore> {
    let store = SqliteRecordStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    store.migrate().await.context("migrating record store")?;
    Ok(store)
}

pub async fn run_sync_once_from_env() -> Result<Vec<RunReport>> {
    let config = SyncConfig::from_env();
    let store = Arc::new(open_store(&config).await?);
    let connector = Arc::new(FtpConnector::new(config.ftp.clone()));
    let coordinator = build_coordinator_from_workspace(&config, store, connector).await?;
    let result = coordinator.run_blocking_once().await;
    match result {
        Ok(reports) => Ok(reports),
        Err(err) => {
            for report in coordinator.last_reports() {
                warn!(
                    source_id = %report.source_id,
                    outcome = report.outcome.as_str(),
                    "partial run report"
                );
            }
            Err(err.into())
        }
    }
}
