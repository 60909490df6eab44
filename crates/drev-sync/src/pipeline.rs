//! Per-source ingestion: walk, resolve, decode, fetch, classify, write.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use drev_adapters::{
    derive_key, grammar_for, ContentFetcher, ContentOutcome, KeyStrategy, NameGrammar,
    RemoteTreeWalker,
};
use drev_core::{CandidateFolder, IngestedRecord};
use drev_storage::{RecordStore, RemoteSession, StoreError, TransportError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{Classifier, RunReport, SourceConfig, SyncError};

/// Known-key set for one source, loaded once per run.
pub struct RecordKeyResolver {
    strategy: KeyStrategy,
    known: HashSet<String>,
}

impl RecordKeyResolver {
    pub async fn load(
        store: &dyn RecordStore,
        source_id: &str,
        strategy: KeyStrategy,
    ) -> Result<Self, StoreError> {
        let known = store.load_keys(source_id).await?;
        Ok(Self { strategy, known })
    }

    pub fn resolve(&self, candidate: &CandidateFolder) -> String {
        derive_key(self.strategy, candidate)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.known.contains(key)
    }

    pub fn remember(&mut self, key: String) {
        self.known.insert(key);
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    AlreadyIngested,
}

pub struct IngestionWriter {
    store: Arc<dyn RecordStore>,
}

impl IngestionWriter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn write(&self, record: &IngestedRecord) -> Result<WriteOutcome, StoreError> {
        match self.store.create_record(record).await {
            Ok(()) => Ok(WriteOutcome::Inserted),
            Err(err) if err.is_duplicate() => Ok(WriteOutcome::AlreadyIngested),
            Err(err) => Err(err),
        }
    }
}

/// Cancellation and deadline shared by every remote call of one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl RunContext {
    pub fn new(run_id: Uuid, cancel: CancellationToken, deadline: Instant) -> Self {
        Self {
            run_id,
            cancel,
            deadline,
        }
    }

    pub async fn guard<T, F>(&self, call: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(SyncError::DeadlineExceeded);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = tokio::time::timeout_at(self.deadline, call) => match result {
                Ok(inner) => inner.map_err(SyncError::from),
                Err(_) => Err(SyncError::DeadlineExceeded),
            },
        }
    }
}

pub struct SyncPipeline {
    source: SourceConfig,
    root: String,
    grammar: Box<dyn NameGrammar>,
    key_strategy: KeyStrategy,
    fetcher: ContentFetcher,
    classifier: Arc<Classifier>,
    store: Arc<dyn RecordStore>,
    writer: IngestionWriter,
}

impl SyncPipeline {
    pub fn new(
        source: SourceConfig,
        root: String,
        classifier: Arc<Classifier>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let grammar = grammar_for(source.grammar);
        let key_strategy = source.effective_key_strategy();
        let fetcher = ContentFetcher::new(source.content.clone());
        let writer = IngestionWriter::new(Arc::clone(&store));
        Self {
            source,
            root,
            grammar,
            key_strategy,
            fetcher,
            classifier,
            store,
            writer,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source.source_id
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Ingests every new record folder of this source.
    ///
    /// Per-record problems are counted in `report` and skipped. Transport
    /// failures, cancellation, the deadline and a failed key load are returned.
    pub async fn run_once(
        &self,
        session: &mut dyn RemoteSession,
        ctx: &RunContext,
        report: &mut RunReport,
    ) -> Result<(), SyncError> {
        let source_id = self.source_id();
        let mut resolver =
            RecordKeyResolver::load(self.store.as_ref(), source_id, self.key_strategy).await?;
        let mut walker = RemoteTreeWalker::new(self.root.clone(), self.grammar.group_depth());
        info!(
            source_id,
            root = %self.root,
            grammar = %self.grammar.kind(),
            known = resolver.known_count(),
            "walking source"
        );

        while let Some(candidate) = ctx.guard(walker.next(session)).await? {
            report.candidates_seen += 1;
            let key = resolver.resolve(&candidate);
            if resolver.exists(&key) {
                report.skipped_known += 1;
                debug!(source_id, key = %key, "already ingested; skipping");
                continue;
            }

            let decoded = match self.grammar.decode(&candidate) {
                Ok(decoded) => decoded,
                Err(err) => {
                    report.rejected += 1;
                    warn!(source_id, key = %key, error = %err, "rejecting record folder");
                    continue;
                }
            };

            let content = ctx.guard(self.fetcher.fetch(session, &candidate)).await?;
            let path = candidate.remote_path();
            match &content.transcript {
                ContentOutcome::Present(_) => {}
                ContentOutcome::Missing => {
                    report.transcripts_missing += 1;
                    debug!(source_id, path = %path, "transcript missing");
                }
                ContentOutcome::Unreadable(msg) | ContentOutcome::Malformed(msg) => {
                    report.transcripts_unreadable += 1;
                    warn!(source_id, path = %path, error = %msg, "transcript unreadable");
                }
            }
            let classification = match &content.metrics {
                ContentOutcome::Present(parsed) => {
                    self.classifier.classify_partial(&parsed.metrics, parsed.present)
                }
                ContentOutcome::Missing => {
                    report.metrics_missing += 1;
                    debug!(source_id, path = %path, "metrics missing; using defaults");
                    self.classifier.classify_missing()
                }
                ContentOutcome::Unreadable(msg) | ContentOutcome::Malformed(msg) => {
                    report.metrics_malformed += 1;
                    warn!(
                        source_id,
                        path = %path,
                        error = %msg,
                        "metrics malformed; using defaults"
                    );
                    self.classifier.classify_missing()
                }
            };

            let record = IngestedRecord {
                id: IngestedRecord::id_for(source_id, &key),
                source_id: source_id.to_string(),
                key: key.clone(),
                date: decoded.date,
                time: decoded.time,
                phone_number: decoded.phone_number,
                direction: decoded.direction,
                channel: decoded.channel,
                transcript_text: content.transcript_text(),
                summary: content.summary(),
                metrics: content.metrics_or_default(),
                status: classification.status,
                violations: classification.violations,
                audio_reference: content.audio_reference,
                source_path: path,
                ingested_at: Utc::now(),
            };

            match self.writer.write(&record).await {
                Ok(WriteOutcome::Inserted) => {
                    report.written += 1;
                    info!(source_id, key = %key, status = %record.status, "ingested record");
                    resolver.remember(key);
                }
                Ok(WriteOutcome::AlreadyIngested) => {
                    report.already_ingested += 1;
                    debug!(source_id, key = %key, "record appeared concurrently; skipping");
                    resolver.remember(key);
                }
                Err(err) => {
                    report.write_failures += 1;
                    error!(source_id, key = %key, error = %err, "failed to write record");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClassificationPolicy;
    use drev_adapters::GrammarKind;
    use drev_core::{Direction, Violation};
    use drev_storage::{MemoryRecordStore, MemoryRemote, RecordQuery, RemoteConnector};
    use std::time::Duration;

    fn source(grammar: GrammarKind, root: &str) -> SourceConfig {
        SourceConfig {
            source_id: "calls".into(),
            display_name: "Calls".into(),
            enabled: true,
            grammar,
            root: root.into(),
            root_env: None,
            key_strategy: None,
            content: Default::default(),
        }
    }

    fn pipeline(store: Arc<MemoryRecordStore>) -> SyncPipeline {
        SyncPipeline::new(
            source(GrammarKind::CallFolder, "/calls"),
            "/calls".into(),
            Arc::new(Classifier::new(ClassificationPolicy::default())),
            store,
        )
    }

    fn ctx() -> RunContext {
        RunContext::new(
            Uuid::new_v4(),
            CancellationToken::new(),
            Instant::now() + Duration::from_secs(30),
        )
    }

    fn seeded_remote() -> MemoryRemote {
        let remote = MemoryRemote::new();
        let a = "/calls/2025-01-14/in-79180000000-250114-153045";
        remote.add_file(&format!("{a}/dialog.txt"), "[0.0-1.0] SPEAKER_00: hello");
        remote.add_file(
            &format!("{a}/metadata.json"),
            r#"{"metrics": {
                "rudeness": 0.6, "politeness": 0.9, "friendliness": 0.9,
                "manipulativeness": 0.1, "said_hello": true, "summary": "rude"
            }}"#,
        );
        let b = "/calls/2025-01-14/out-79181112233-250114-160000";
        remote.add_file(&format!("{b}/dialog.txt"), "hi");
        remote
    }

    async fn run(p: &SyncPipeline, remote: &MemoryRemote) -> (RunReport, Result<(), SyncError>) {
        let mut session = remote.connect().await.unwrap();
        let mut report = RunReport::new(Uuid::new_v4(), p.source_id());
        let result = p.run_once(session.as_mut(), &ctx(), &mut report).await;
        (report, result)
    }

    #[tokio::test]
    async fn ingests_new_folders_with_classification() {
        let store = Arc::new(MemoryRecordStore::new());
        let remote = seeded_remote();
        let (report, result) = run(&pipeline(store.clone()), &remote).await;
        result.unwrap();
        assert_eq!(report.candidates_seen, 2);
        assert_eq!(report.written, 2);
        assert_eq!(report.metrics_missing, 1);

        let rude = store
            .find_by_key("calls", "in-79180000000-250114-153045")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rude.status, "needs review");
        assert_eq!(rude.violations, vec![Violation::Rudeness]);
        assert_eq!(rude.direction, Direction::Incoming);
        assert_eq!(rude.summary, "rude");
        assert_eq!(rude.phone_number.as_deref(), Some("79180000000"));
        assert_eq!(
            rude.source_path,
            "/calls/2025-01-14/in-79180000000-250114-153045"
        );

        // partial tolerance: metrics file absent
        let partial = store
            .find_by_key("calls", "out-79181112233-250114-160000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(partial.status, "no status");
        assert_eq!(partial.metrics.rudeness, 0.0);
        assert!(partial.metrics.said_hello);
        assert_eq!(partial.transcript_text, "hi");
    }

    #[tokio::test]
    async fn empty_and_broken_metrics_classify_alike() {
        let store = Arc::new(MemoryRecordStore::new());
        let remote = MemoryRemote::new();
        let empty = "/calls/2025-01-14/in-79180000001-250114-090000";
        remote.add_file(&format!("{empty}/dialog.txt"), "a");
        remote.add_file(&format!("{empty}/metadata.json"), "{}");
        let broken = "/calls/2025-01-14/in-79180000002-250114-091000";
        remote.add_file(&format!("{broken}/dialog.txt"), "b");
        remote.add_file(&format!("{broken}/metadata.json"), "{broken");
        let rude_only = "/calls/2025-01-14/in-79180000003-250114-092000";
        remote.add_file(&format!("{rude_only}/dialog.txt"), "c");
        remote.add_file(&format!("{rude_only}/metadata.json"), r#"{"rudeness": 0.2}"#);

        let (report, result) = run(&pipeline(store.clone()), &remote).await;
        result.unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(report.metrics_malformed, 1);

        for key in [
            "in-79180000001-250114-090000",
            "in-79180000002-250114-091000",
            "in-79180000003-250114-092000",
        ] {
            let record = store.find_by_key("calls", key).await.unwrap().unwrap();
            assert_eq!(record.status, "no status", "{key}");
            assert!(record.violations.is_empty(), "{key}");
        }
    }

    #[tokio::test]
    async fn second_run_is_idempotent_and_downloads_nothing() {
        let store = Arc::new(MemoryRecordStore::new());
        let remote = seeded_remote();
        let p = pipeline(store.clone());
        run(&p, &remote).await.1.unwrap();
        let downloads = remote.download_count();
        let before = store.snapshot();

        let (report, result) = run(&p, &remote).await;
        result.unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(report.skipped_known, 2);
        assert_eq!(remote.download_count(), downloads);
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn undecodable_dates_are_rejected_before_download() {
        let store = Arc::new(MemoryRecordStore::new());
        let remote = MemoryRemote::new();
        remote.add_file("/calls/misc/in-79180000000/dialog.txt", "x");
        let (report, result) = run(&pipeline(store.clone()), &remote).await;
        result.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(remote.download_count(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn write_failures_are_counted_and_the_walk_continues() {
        let store = Arc::new(MemoryRecordStore::new());
        store.reject_key("in-79180000000-250114-153045");
        let remote = seeded_remote();
        let (report, result) = run(&pipeline(store.clone()), &remote).await;
        result.unwrap();
        assert_eq!(report.write_failures, 1);
        assert_eq!(report.written, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn root_listing_failure_is_fatal() {
        let store = Arc::new(MemoryRecordStore::new());
        let remote = seeded_remote();
        remote.fail_listing("/calls");
        let (report, result) = run(&pipeline(store.clone()), &remote).await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
        assert_eq!(report.candidates_seen, 0);
        assert!(store.query(&RecordQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_remote_call() {
        let store = Arc::new(MemoryRecordStore::new());
        let remote = seeded_remote();
        let p = pipeline(store.clone());
        let ctx = ctx();
        ctx.cancel.cancel();

        let mut session = remote.connect().await.unwrap();
        let mut report = RunReport::new(ctx.run_id, "calls");
        let result = p.run_once(session.as_mut(), &ctx, &mut report).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert_eq!(remote.list_count(), 0);
    }

    #[tokio::test]
    async fn expired_deadline_aborts_the_run() {
        let store = Arc::new(MemoryRecordStore::new());
        let remote = seeded_remote();
        let p = pipeline(store.clone());
        let ctx = RunContext::new(Uuid::new_v4(), CancellationToken::new(), Instant::now());

        let mut session = remote.connect().await.unwrap();
        let mut report = RunReport::new(ctx.run_id, "calls");
        let result = p.run_once(session.as_mut(), &ctx, &mut report).await;
        assert!(matches!(result, Err(SyncError::DeadlineExceeded)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn writer_maps_conflicts_to_already_ingested() {
        let store = Arc::new(MemoryRecordStore::new());
        let writer = IngestionWriter::new(store.clone());
        let record = IngestedRecord {
            id: IngestedRecord::id_for("calls", "k"),
            source_id: "calls".into(),
            key: "k".into(),
            date: chrono::NaiveDate::from_ymd_opt(2025, 1, 14).unwrap(),
            time: chrono::NaiveTime::MIN,
            phone_number: None,
            direction: Direction::Unknown,
            channel: None,
            transcript_text: String::new(),
            summary: String::new(),
            metrics: Default::default(),
            status: "no status".into(),
            violations: vec![],
            audio_reference: None,
            source_path: "/calls/2025-01-14/k".into(),
            ingested_at: Utc::now(),
        };
        assert_eq!(writer.write(&record).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(
            writer.write(&record).await.unwrap(),
            WriteOutcome::AlreadyIngested
        );
    }
}
