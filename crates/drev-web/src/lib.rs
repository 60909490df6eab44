//! HTTP trigger surface and read API for review dashboards.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use drev_core::{IngestedRecord, Violation};
use drev_storage::{FtpConnector, RecordQuery, RecordStore};
use drev_sync::{
    build_coordinator_from_workspace, maybe_build_scheduler, open_store, ClassificationPolicy,
    StartOutcome, SyncConfig, SyncCoordinator, DEFAULT_FLAGGED_STATUS,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "drev-web";

const DEFAULT_PAGE_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SyncCoordinator>,
    pub store: Arc<dyn RecordStore>,
    /// Status label counted as awaiting review in the summary.
    pub flagged_status: String,
}

impl AppState {
    pub fn new(coordinator: Arc<SyncCoordinator>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            coordinator,
            store,
            flagged_status: DEFAULT_FLAGGED_STATUS.to_string(),
        }
    }

    pub fn with_flagged_status(mut self, status: impl Into<String>) -> Self {
        self.flagged_status = status.into();
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct RecordsQuery {
    source: Option<String>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    status: Option<String>,
    violation: Option<String>,
    #[serde(default)]
    violations_only: bool,
    limit: Option<u32>,
}

impl RecordsQuery {
    fn into_record_query(self) -> Result<RecordQuery, String> {
        let violation = self
            .violation
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.parse::<Violation>())
            .transpose()?;
        Ok(RecordQuery {
            source_id: self.source.filter(|s| !s.is_empty()),
            from: self.from,
            to: self.to,
            status: self.status.filter(|s| !s.is_empty()),
            violation,
            violations_only: self.violations_only,
            limit: Some(self.limit.unwrap_or(DEFAULT_PAGE_LIMIT)),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: String,
}

#[derive(Debug, Serialize)]
struct SummaryView {
    total: usize,
    needs_review: usize,
    with_violations: usize,
    by_violation: BTreeMap<&'static str, usize>,
    new_since_last_sync: u64,
    last_sync_finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/sync/start", post(sync_start_handler))
        .route("/api/sync/cancel", post(sync_cancel_handler))
        .route("/api/sync/status", get(sync_status_handler))
        .route("/api/records", get(records_handler))
        .route("/api/records/{id}", get(record_detail_handler))
        .route("/api/records/{id}/status", post(record_status_handler))
        .route("/api/summary", get(summary_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let store: Arc<dyn RecordStore> = Arc::new(open_store(&config).await?);
    let policy = ClassificationPolicy::load(&config.workspace_root)?;
    let connector = Arc::new(FtpConnector::new(config.ftp.clone()));
    let coordinator =
        build_coordinator_from_workspace(&config, Arc::clone(&store), connector).await?;

    let scheduler = maybe_build_scheduler(&config, Arc::clone(&coordinator)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %config.sync_cron, "sync scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving dialog review API");
    let state = AppState::new(coordinator, store).with_flagged_status(policy.flagged_status);
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(SyncConfig::from_env()).await
}

async fn sync_start_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.try_start() {
        StartOutcome::Accepted { run_id } => {
            Json(json!({ "success": true, "run_id": run_id })).into_response()
        }
        StartOutcome::Busy => {
            Json(json!({ "success": false, "reason": "already running" })).into_response()
        }
    }
}

async fn sync_cancel_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "success": state.coordinator.cancel() })).into_response()
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    let run = state.coordinator.state();
    let last_completed = match state.store.last_completed_run(None).await {
        Ok(row) => row,
        Err(err) => return server_error(err),
    };
    Json(json!({
        "running": run.running,
        "current_run_id": run.current_run_id,
        "last_started_at": run.last_started_at,
        "last_finished_at": run.last_finished_at,
        "last_completed_run": last_completed,
        "reports": state.coordinator.last_reports(),
    }))
    .into_response()
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let query = match query.into_record_query() {
        Ok(query) => query,
        Err(msg) => return bad_request(msg),
    };
    match state.store.query(&query).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => server_error(err),
    }
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| bad_request(format!("invalid record id `{raw}`")))
}

async fn record_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.store.get(id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => not_found(id),
        Err(err) => server_error(err),
    }
}

async fn record_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(update): Json<StatusUpdate>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let status = update.status.trim();
    if status.is_empty() {
        return bad_request("status must not be empty");
    }
    match state.store.update_status(id, status).await {
        Ok(true) => Json(json!({ "success": true })).into_response(),
        Ok(false) => not_found(id),
        Err(err) => server_error(err),
    }
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let mut query = match query.into_record_query() {
        Ok(query) => query,
        Err(msg) => return bad_request(msg),
    };
    query.limit = None;
    let records = match state.store.query(&query).await {
        Ok(records) => records,
        Err(err) => return server_error(err),
    };

    let source = query.source_id.as_deref();
    let last_run = match state.store.last_completed_run(source).await {
        Ok(row) => row,
        Err(err) => return server_error(err),
    };
    let new_since_last_sync = match &last_run {
        Some(run) => match state.store.count_ingested_since(source, run.finished_at).await {
            Ok(count) => count,
            Err(err) => return server_error(err),
        },
        None => 0,
    };

    let summary = summarize(
        &records,
        &state.flagged_status,
        new_since_last_sync,
        last_run.map(|r| r.finished_at),
    );
    Json(summary).into_response()
}

fn summarize(
    records: &[IngestedRecord],
    flagged_status: &str,
    new_since_last_sync: u64,
    last_sync_finished_at: Option<chrono::DateTime<chrono::Utc>>,
) -> SummaryView {
    let mut by_violation = Violation::ALL
        .iter()
        .map(|v| (v.as_str(), 0usize))
        .collect::<BTreeMap<_, _>>();
    for violation in records.iter().flat_map(|r| r.violations.iter()) {
        *by_violation.entry(violation.as_str()).or_default() += 1;
    }
    SummaryView {
        total: records.len(),
        needs_review: records.iter().filter(|r| r.status == flagged_status).count(),
        with_violations: records.iter().filter(|r| !r.violations.is_empty()).count(),
        by_violation,
        new_since_last_sync,
        last_sync_finished_at,
    }
}

fn bad_request(msg: impl Display) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": msg.to_string() })),
    )
        .into_response()
}

fn not_found(id: Uuid) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("record {id} not found") })),
    )
        .into_response()
}

fn server_error(err: impl Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("Server error: {err}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use drev_storage::{MemoryRecordStore, MemoryRemote};
    use drev_sync::{ClassificationPolicy, Classifier, SourceConfig, SyncPipeline};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        store: Arc<MemoryRecordStore>,
        coordinator: Arc<SyncCoordinator>,
    }

    fn harness(remote: MemoryRemote) -> Harness {
        let store = Arc::new(MemoryRecordStore::new());
        let source: SourceConfig = serde_json::from_value(json!({
            "source_id": "calls",
            "display_name": "Calls",
            "grammar": "call_folder",
            "root": "/calls"
        }))
        .unwrap();
        let pipeline = SyncPipeline::new(
            source,
            "/calls".into(),
            Arc::new(Classifier::new(ClassificationPolicy::default())),
            store.clone(),
        );
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::new(remote),
            store.clone(),
            vec![pipeline],
            Duration::from_secs(30),
        ));
        let app = app(AppState::new(coordinator.clone(), store.clone()));
        Harness {
            app,
            store,
            coordinator,
        }
    }

    fn seeded_remote() -> MemoryRemote {
        let remote = MemoryRemote::new();
        let a = "/calls/2025-01-14/in-79180000000-250114-153045";
        remote.add_file(&format!("{a}/dialog.txt"), "hello");
        remote.add_file(
            &format!("{a}/metadata.json"),
            r#"{"metrics": {"rudeness": 0.6, "politeness": 0.9, "friendliness": 0.9}}"#,
        );
        let b = "/calls/2025-01-15/out-79181112233-250115-100000";
        remote.add_file(&format!("{b}/dialog.txt"), "hi");
        remote
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn wait_idle(coordinator: &SyncCoordinator) {
        for _ in 0..200 {
            if !coordinator.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sync run did not finish");
    }

    #[tokio::test]
    async fn start_reports_busy_while_running() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness(seeded_remote().gated(gate.clone()));

        let (status, first) = send(&h.app, post_json("/api/sync/start", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["success"], true);
        assert!(first["run_id"].is_string());

        let (_, second) = send(&h.app, post_json("/api/sync/start", json!({}))).await;
        assert_eq!(second["success"], false);
        assert_eq!(second["reason"], "already running");

        let (_, status_body) = send(&h.app, get("/api/sync/status")).await;
        assert_eq!(status_body["running"], true);
        assert_eq!(status_body["current_run_id"], first["run_id"]);

        gate.add_permits(1_000);
        wait_idle(&h.coordinator).await;
        let (_, status_body) = send(&h.app, get("/api/sync/status")).await;
        assert_eq!(status_body["running"], false);
        assert_eq!(status_body["reports"][0]["written"], 2);
        assert_eq!(status_body["last_completed_run"]["source_id"], "calls");
    }

    #[tokio::test]
    async fn records_can_be_filtered_and_reviewed() {
        let h = harness(seeded_remote());
        h.coordinator.run_blocking_once().await.unwrap();
        assert_eq!(h.store.len(), 2);

        let (status, flagged) = send(&h.app, get("/api/records?violation=rudeness")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(flagged.as_array().unwrap().len(), 1);
        assert_eq!(flagged[0]["status"], "needs review");
        let id = flagged[0]["id"].as_str().unwrap().to_string();

        let (_, ranged) = send(&h.app, get("/api/records?from=2025-01-15&to=2025-01-31")).await;
        assert_eq!(ranged.as_array().unwrap().len(), 1);
        assert_eq!(ranged[0]["direction"], "outgoing");

        let (status, _) = send(&h.app, get("/api/records?violation=bogus")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &h.app,
            post_json(&format!("/api/records/{id}/status"), json!({"status": "reviewed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, detail) = send(&h.app, get(&format!("/api/records/{id}"))).await;
        assert_eq!(detail["status"], "reviewed");

        let (status, _) = send(&h.app, get(&format!("/api/records/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&h.app, get("/api/records/not-a-uuid")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn summary_counts_violations_and_new_records() {
        let h = harness(seeded_remote());
        h.coordinator.run_blocking_once().await.unwrap();

        let (status, summary) = send(&h.app, get("/api/summary")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["total"], 2);
        assert_eq!(summary["needs_review"], 1);
        assert_eq!(summary["by_violation"]["rudeness"], 1);
        assert_eq!(summary["by_violation"]["manipulation"], 0);
        assert_eq!(summary["new_since_last_sync"], 0);
        assert!(summary["last_sync_finished_at"].is_string());

        // a record arriving after the sync finished counts as new
        let mut late = h
            .store
            .find_by_key("calls", "out-79181112233-250115-100000")
            .await
            .unwrap()
            .unwrap();
        late.key = "late".into();
        late.id = IngestedRecord::id_for("calls", "late");
        late.ingested_at = chrono::Utc::now();
        h.store.create_record(&late).await.unwrap();

        let (_, summary) = send(&h.app, get("/api/summary")).await;
        assert_eq!(summary["total"], 3);
        assert_eq!(summary["new_since_last_sync"], 1);
    }

    #[tokio::test]
    async fn reviewed_records_leave_the_review_count() {
        let h = harness(seeded_remote());
        h.coordinator.run_blocking_once().await.unwrap();
        let rude = h
            .store
            .find_by_key("calls", "in-79180000000-250114-153045")
            .await
            .unwrap()
            .unwrap();

        let (status, _) = send(
            &h.app,
            post_json(
                &format!("/api/records/{}/status", rude.id),
                json!({"status": "reviewed"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, summary) = send(&h.app, get("/api/summary")).await;
        assert_eq!(summary["needs_review"], 0);
        assert_eq!(summary["with_violations"], 1);
    }

    #[tokio::test]
    async fn cancel_is_a_no_op_when_idle() {
        let h = harness(MemoryRemote::new());
        let (status, body) = send(&h.app, post_json("/api/sync/cancel", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
    }
}
