//! HTTP route handlers and server wiring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;

use axum::{
    extract::{DefaultBodyLimit, Extension, Path, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use regex::Regex;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::review::{apply_review, ReviewAction, ReviewError, ReviewRequest};
use crate::store::StateStore;
use crate::tracker::ProgressTracker;

use super::guard::{self, RateLimiter, ReviewerIdentity};
use super::metrics;
use super::upload;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: StateStore,
    pub rate_limiter: RateLimiter,
    /// Disabled in tests so uploads do not fork the test binary.
    pub spawn_engine: bool,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let store = StateStore::new(&config.runs_dir, &config.state_file_path);
        Self {
            config,
            store,
            rate_limiter: RateLimiter::new(),
            spawn_engine: true,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs", get(list_runs).post(upload::upload_run))
        .route("/runs/:id", get(get_run))
        .route("/sessions/:id/review", post(review_session))
        .route("/eval", get(eval_metrics))
        .route("/ops", get(ops_metrics))
        .route("/status", get(legacy_status))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), guard::guardrails))
        .layer(DefaultBodyLimit::max(upload::MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP surface.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config));
    let app = router(state);

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn run_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9-]+$").expect("static regex"))
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// `GET /runs` — the index, newest last; empty when absent.
async fn list_runs(State(state): State<Arc<AppState>>) -> Response {
    Json(state.store.load_index()).into_response()
}

/// `GET /runs/:id` — the full persisted BatchRun.
async fn get_run(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if !run_id_pattern().is_match(&id) {
        return error_json(StatusCode::BAD_REQUEST, "Invalid run id");
    }
    match state.store.load_run_state(&id) {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, format!("Run {id} not found")),
        Err(e) => {
            tracing::error!("Could not load run {}: {:#}", id, e);
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Could not load run state")
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReviewBody {
    action: String,
    #[serde(default)]
    reason: Option<String>,
    run_id: String,
}

/// `POST /sessions/:id/review` — approve or reject one session. The
/// reviewer identity comes from the request's auth context, never the body.
async fn review_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Extension(reviewer): Extension<ReviewerIdentity>,
    Json(body): Json<ReviewBody>,
) -> Response {
    let Some(action) = ReviewAction::parse(&body.action) else {
        return error_json(
            StatusCode::BAD_REQUEST,
            "action must be 'approved' or 'rejected'",
        );
    };

    let request = ReviewRequest {
        run_id: body.run_id,
        session_id,
        action,
        reason: body.reason,
        reviewer: reviewer.0,
    };
    let runs_dir = state.store.runs_dir().to_path_buf();

    // The review path takes the cross-process file lock; keep that off the
    // async workers.
    let result = tokio::task::spawn_blocking(move || apply_review(&runs_dir, &request)).await;

    match result {
        Ok(Ok(session)) => Json(session).into_response(),
        Ok(Err(ReviewError::InvalidRunId)) => error_json(StatusCode::BAD_REQUEST, "Invalid run id"),
        Ok(Err(ReviewError::RunNotFound(id))) => {
            error_json(StatusCode::NOT_FOUND, format!("Run {id} not found"))
        }
        Ok(Err(ReviewError::SessionNotFound(id))) => {
            error_json(StatusCode::NOT_FOUND, format!("Session {id} not found"))
        }
        Ok(Err(ReviewError::Storage(e))) => {
            tracing::error!("Review write failed: {e:#}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Could not apply review")
        }
        Err(e) => {
            tracing::error!("Review task failed: {e}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Could not apply review")
        }
    }
}

/// `GET /eval` — per-category metrics over the latest run.
async fn eval_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest_run() {
        Ok(Some(run)) => Json(metrics::evaluate_run(&run)).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, "No runs found"),
        Err(e) => {
            tracing::error!("Could not load latest run: {e:#}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Could not load run state")
        }
    }
}

/// `GET /ops` — timing/throughput/budget metrics over the latest run.
async fn ops_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest_run() {
        Ok(Some(run)) => Json(metrics::operational_metrics(&run, &state.config)).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, "No runs found"),
        Err(e) => {
            tracing::error!("Could not load latest run: {e:#}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Could not load run state")
        }
    }
}

/// `GET /status` — deprecated aggregate view kept for old dashboards.
async fn legacy_status(State(state): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Deprecation", header::HeaderValue::from_static("true"));
    headers.insert(
        header::LINK,
        header::HeaderValue::from_static("</runs>; rel=\"successor-version\""),
    );

    match state.store.latest_run() {
        Ok(Some(run)) => {
            let snapshot = ProgressTracker::new(run, state.store.clone(), None).snapshot();
            (headers, Json(snapshot)).into_response()
        }
        Ok(None) => (
            headers,
            error_json(StatusCode::NOT_FOUND, "No active run found"),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Could not load latest run: {e:#}");
            (
                headers,
                error_json(StatusCode::INTERNAL_SERVER_ERROR, "Could not load run state"),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        BatchRun, DataSource, Finding, FindingCategory, RemediationSession, RunMode, RunStatus,
        RunSummary, SessionState, Severity, Wave, WaveStatus,
    };
    use chrono::Utc;

    async fn spawn_app(config: Config) -> (String, Arc<AppState>) {
        let mut state = AppState::new(config);
        state.spawn_engine = false;
        let state = Arc::new(state);
        let app = router(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (format!("http://{addr}"), state)
    }

    fn seeded_run(store: &StateStore, run_id: &str) {
        let finding = Finding {
            finding_id: "FIND-0001".into(),
            scanner: "sast".into(),
            category: FindingCategory::Xss,
            severity: Severity::High,
            title: "t".into(),
            description: "d".into(),
            service_name: "web".into(),
            repo_url: "r".into(),
            file_path: "f.ts".into(),
            line_number: None,
            cwe_id: None,
            dependency_name: None,
            current_version: None,
            fixed_version: None,
            language: None,
            priority_score: 0.0,
        };
        let mut session = RemediationSession::new(finding, "pb".into(), 1);
        session.session_id = Some("sess-1".into());
        session.status = SessionState::Success;
        session.data_source = DataSource::Mock;
        let run = BatchRun::new(
            run_id.into(),
            vec![Wave {
                wave_number: 1,
                sessions: vec![session],
                status: WaveStatus::Completed,
                success_count: 1,
                failure_count: 0,
            }],
            RunMode::Mock,
        );
        store.save_run_state(&run).unwrap();
        store
            .upsert_index(&RunSummary {
                run_id: run_id.into(),
                started_at: Utc::now(),
                status: RunStatus::Completed,
                total_findings: 1,
                csv_filename: None,
                data_source: RunMode::Mock,
            })
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn list_runs_empty_then_populated() {
        let dir = tempfile::tempdir().unwrap();
        let (base, state) = spawn_app(Config::for_tests(dir.path())).await;
        let client = reqwest::Client::new();

        let body: Vec<serde_json::Value> =
            client.get(format!("{base}/runs")).send().await.unwrap().json().await.unwrap();
        assert!(body.is_empty());

        seeded_run(&state.store, "runone01");
        let body: Vec<serde_json::Value> =
            client.get(format!("{base}/runs")).send().await.unwrap().json().await.unwrap();
        assert_eq!(body.len(), 1);
        assert_eq!(body[0]["run_id"], "runone01");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_run_validates_id_and_404s() {
        let dir = tempfile::tempdir().unwrap();
        let (base, state) = spawn_app(Config::for_tests(dir.path())).await;
        seeded_run(&state.store, "runone01");
        let client = reqwest::Client::new();

        let ok = client.get(format!("{base}/runs/runone01")).send().await.unwrap();
        assert_eq!(ok.status(), 200);
        let run: serde_json::Value = ok.json().await.unwrap();
        assert_eq!(run["waves"][0]["sessions"][0]["status"], "success");

        let bad = client.get(format!("{base}/runs/run_one")).send().await.unwrap();
        assert_eq!(bad.status(), 400);

        let missing = client.get(format!("{base}/runs/zzzzzzzz")).send().await.unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn review_endpoint_applies_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let (base, state) = spawn_app(Config::for_tests(dir.path())).await;
        seeded_run(&state.store, "runone01");
        let client = reqwest::Client::new();

        // Bad action → 400 before any disk mutation.
        let bad = client
            .post(format!("{base}/sessions/sess-1/review"))
            .json(&serde_json::json!({"action": "maybe", "run_id": "runone01"}))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), 400);

        // Wrong content type → 415 from the guard.
        let wrong_type = client
            .post(format!("{base}/sessions/sess-1/review"))
            .header("content-type", "text/plain")
            .body("action=approved")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong_type.status(), 415);

        // Approve succeeds; the reviewer comes from the request context.
        let ok = client
            .post(format!("{base}/sessions/sess-1/review"))
            .json(&serde_json::json!({
                "action": "approved",
                "reason": "LGTM",
                "run_id": "runone01",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 200);
        let session: serde_json::Value = ok.json().await.unwrap();
        assert_eq!(session["review_status"], "approved");
        assert_eq!(session["version"], 1);
        assert!(session["reviewed_by"].as_str().unwrap().starts_with("ip:"));

        // Unknown session → 404.
        let missing = client
            .post(format!("{base}/sessions/sess-nope/review"))
            .json(&serde_json::json!({"action": "rejected", "run_id": "runone01"}))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bearer_token_gates_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_tests(dir.path());
        config.api_bearer_token = Some("sekrit".into());
        let (base, _state) = spawn_app(config).await;
        let client = reqwest::Client::new();

        let denied = client.get(format!("{base}/runs")).send().await.unwrap();
        assert_eq!(denied.status(), 401);

        let allowed = client
            .get(format!("{base}/runs"))
            .bearer_auth("sekrit")
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status(), 200);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_endpoint_is_deprecated() {
        let dir = tempfile::tempdir().unwrap();
        let (base, state) = spawn_app(Config::for_tests(dir.path())).await;
        seeded_run(&state.store, "runone01");
        let client = reqwest::Client::new();

        let resp = client.get(format!("{base}/status")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("Deprecation").unwrap(), "true");
        assert!(resp.headers().get("link").is_some());
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["run_id"], "runone01");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metrics_endpoints_serve_latest_run() {
        let dir = tempfile::tempdir().unwrap();
        let (base, state) = spawn_app(Config::for_tests(dir.path())).await;
        let client = reqwest::Client::new();

        // No runs yet → 404s.
        assert_eq!(client.get(format!("{base}/eval")).send().await.unwrap().status(), 404);
        assert_eq!(client.get(format!("{base}/ops")).send().await.unwrap().status(), 404);

        seeded_run(&state.store, "runone01");
        let eval: Vec<serde_json::Value> =
            client.get(format!("{base}/eval")).send().await.unwrap().json().await.unwrap();
        assert_eq!(eval.len(), 1);
        assert_eq!(eval[0]["category"], "xss");

        let ops: serde_json::Value =
            client.get(format!("{base}/ops")).send().await.unwrap().json().await.unwrap();
        assert!(ops["estimated_units_budget"].is_number());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_validations() {
        let dir = tempfile::tempdir().unwrap();
        let (base, state) = spawn_app(Config::for_tests(dir.path())).await;
        let client = reqwest::Client::new();

        let form = |csv: &str| {
            reqwest::multipart::Form::new().part(
                "file",
                reqwest::multipart::Part::bytes(csv.as_bytes().to_vec())
                    .file_name("findings.csv")
                    .mime_str("text/csv")
                    .unwrap(),
            )
        };

        const HEADER: &str = "finding_id,scanner,category,severity,title,description,service_name,repo_url,file_path";

        // Header only → no data rows.
        let empty = client
            .post(format!("{base}/runs"))
            .multipart(form(HEADER))
            .send()
            .await
            .unwrap();
        assert_eq!(empty.status(), 400);
        let body: serde_json::Value = empty.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("no data rows"));

        // Missing required column → named in the error.
        let missing_column = client
            .post(format!("{base}/runs"))
            .multipart(form(
                "finding_id,scanner,category,severity,title,description,service_name,repo_url\nF1,s,xss,low,t,d,svc,r",
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(missing_column.status(), 400);
        let body: serde_json::Value = missing_column.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("file_path"));

        // Valid upload → 201 with run id, CSV and bootstrap persisted.
        let csv = format!("{HEADER}\nF1,sast,xss,high,t,d,web-service,https://g/w,f.ts");
        let created = client
            .post(format!("{base}/runs"))
            .multipart(
                form(&csv)
                    .text("wave_size", "5")
                    .text("mode", "mock"),
            )
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), 201);
        let body: serde_json::Value = created.json().await.unwrap();
        assert_eq!(body["status"], "started");
        let run_id = body["run_id"].as_str().unwrap().to_string();
        assert_eq!(run_id.len(), 8);

        let run_dir = state.store.run_dir(&run_id);
        assert!(run_dir.join("findings.csv").exists());
        assert!(run_dir.join("bootstrap.json").exists());

        // Bad wave size → 400.
        let bad_wave = client
            .post(format!("{base}/runs"))
            .multipart(form(&csv).text("wave_size", "500"))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_wave.status(), 400);

        // Bad mode → 400.
        let bad_mode = client
            .post(format!("{base}/runs"))
            .multipart(form(&csv).text("mode", "chaos"))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_mode.status(), 400);
    }
}
