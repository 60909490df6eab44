//! At-most-one sync run per process.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use drev_core::SyncRunState;
use drev_storage::{RecordStore, RemoteConnector};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{RunContext, RunReport, SyncError, SyncPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Accepted { run_id: Uuid },
    Busy,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    run: SyncRunState,
    cancel: Option<CancellationToken>,
    last_reports: Vec<RunReport>,
}

/// Stand-in for deadlines too far out to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn run_deadline(now: Instant, limit: Duration) -> Instant {
    now.checked_add(limit).unwrap_or_else(|| now + FAR_FUTURE)
}

fn lock(state: &Mutex<CoordinatorState>) -> MutexGuard<'_, CoordinatorState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the running flag when the run ends, however it ends.
struct RunGuard {
    state: Arc<Mutex<CoordinatorState>>,
    run_id: Uuid,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if state.run.current_run_id == Some(self.run_id) {
            state.run.running = false;
            state.run.current_run_id = None;
            state.run.last_finished_at = Some(Utc::now());
            state.cancel = None;
        }
    }
}

pub struct SyncCoordinator {
    connector: Arc<dyn RemoteConnector>,
    store: Arc<dyn RecordStore>,
    pipelines: Vec<SyncPipeline>,
    deadline: Duration,
    state: Arc<Mutex<CoordinatorState>>,
}

impl SyncCoordinator {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        store: Arc<dyn RecordStore>,
        pipelines: Vec<SyncPipeline>,
        deadline: Duration,
    ) -> Self {
        Self {
            connector,
            store,
            pipelines,
            deadline,
            state: Arc::new(Mutex::new(CoordinatorState::default())),
        }
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.pipelines
            .iter()
            .map(|p| p.source_id().to_string())
            .collect()
    }

    pub fn state(&self) -> SyncRunState {
        lock(&self.state).run.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).run.running
    }

    /// Reports of the most recent run that reached the sources, possibly partial.
    pub fn last_reports(&self) -> Vec<RunReport> {
        lock(&self.state).last_reports.clone()
    }

    /// Requests cancellation of the active run. Returns false when idle.
    pub fn cancel(&self) -> bool {
        match &lock(&self.state).cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn begin(&self) -> Option<(RunGuard, CancellationToken)> {
        let mut state = lock(&self.state);
        if state.run.running {
            return None;
        }
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        state.run.running = true;
        state.run.current_run_id = Some(run_id);
        state.run.last_started_at = Some(Utc::now());
        state.cancel = Some(cancel.clone());
        let guard = RunGuard {
            state: Arc::clone(&self.state),
            run_id,
        };
        Some((guard, cancel))
    }

    /// Starts a run in the background unless one is already active.
    pub fn try_start(self: &Arc<Self>) -> StartOutcome {
        let Some((guard, cancel)) = self.begin() else {
            info!("sync start refused; a run is already in progress");
            return StartOutcome::Busy;
        };
        let run_id = guard.run_id;
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = coordinator.execute(guard, cancel).await {
                error!(%run_id, error = %err, "sync run ended early");
            }
        });
        StartOutcome::Accepted { run_id }
    }

    /// Runs to completion on the caller's task.
    pub async fn run_blocking_once(&self) -> Result<Vec<RunReport>, SyncError> {
        let (guard, cancel) = self.begin().ok_or(SyncError::Busy)?;
        self.execute(guard, cancel).await
    }

    async fn execute(
        &self,
        guard: RunGuard,
        cancel: CancellationToken,
    ) -> Result<Vec<RunReport>, SyncError> {
        let run_id = guard.run_id;
        let span = info_span!("sync_run", %run_id);
        async move {
            let ctx = RunContext::new(run_id, cancel, run_deadline(Instant::now(), self.deadline));
            info!(
                remote = %self.connector.describe(),
                sources = self.pipelines.len(),
                "sync run started"
            );

            let mut session = match ctx.guard(self.connector.connect()).await {
                Ok(session) => session,
                Err(err) => {
                    lock(&self.state).last_reports.clear();
                    return Err(err);
                }
            };
            let mut reports = Vec::with_capacity(self.pipelines.len());
            let mut fatal = None;
            for pipeline in &self.pipelines {
                let mut report = RunReport::new(run_id, pipeline.source_id());
                let result = pipeline.run_once(session.as_mut(), &ctx, &mut report).await;
                report.finish(&result);
                info!(
                    source_id = %report.source_id,
                    outcome = report.outcome.as_str(),
                    seen = report.candidates_seen,
                    written = report.written,
                    skipped = report.skipped_known,
                    rejected = report.rejected,
                    write_failures = report.write_failures,
                    "source finished"
                );
                if let Err(err) = self.store.record_run(&report.to_run_row()).await {
                    warn!(
                        source_id = %report.source_id,
                        error = %err,
                        "failed to persist run report"
                    );
                }
                reports.push(report);
                if let Err(err) = result {
                    fatal = Some(err);
                    break;
                }
            }
            session.close().await;

            lock(&self.state).last_reports = reports.clone();
            drop(guard);
            match fatal {
                Some(err) => Err(err),
                None => {
                    info!("sync run completed");
                    Ok(reports)
                }
            }
        }
        .instrument(span)
        .await
    }
}
