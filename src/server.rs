//! HTTP surface
//!
//! Thin wrapper over the core: submit a run, poll its status, health
//! check. Each run lives on its own tokio task and reports through a
//! three-state handle (running / done / error) behind one mutex; the
//! worker writes it exactly once on completion.

use crate::config::Config;
use crate::error::AgentError;
use crate::heal;
use crate::providers::{self, LlmClient};
use crate::report::{RunReport, RunRequest};
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use uuid::Uuid;

enum TaskStatus {
    Running,
    Done(Box<RunReport>),
    Error(String),
}

pub struct AppState {
    cfg: Config,
    providers: Vec<Arc<dyn LlmClient>>,
    tasks: Mutex<HashMap<String, TaskStatus>>,
}

impl AppState {
    pub fn new(cfg: Config, providers: Vec<Arc<dyn LlmClient>>) -> Self {
        Self {
            cfg,
            providers,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Lock the task map, recovering from a poisoned mutex. The map
    /// holds plain status values, so the state is usable even when a
    /// worker panicked mid-insert.
    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskStatus>> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[derive(Deserialize)]
struct RunBody {
    repo_url: String,
    team_name: String,
    team_leader: String,
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RunBody>,
) -> Response {
    if body.repo_url.trim().is_empty()
        || body.team_name.trim().is_empty()
        || body.team_leader.trim().is_empty()
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "error": "repo_url, team_name and team_leader are required"})),
        )
            .into_response();
    }

    let task_id = Uuid::new_v4().to_string();
    state.tasks().insert(task_id.clone(), TaskStatus::Running);

    let request = RunRequest {
        repo_url: body.repo_url,
        team_name: body.team_name,
        team_leader: body.team_leader,
        auth_token: None,
    };
    info!(task_id = %task_id, repo = %request.repo_url, "run submitted");

    let worker_state = Arc::clone(&state);
    let worker_task_id = task_id.clone();
    tokio::spawn(async move {
        let outcome =
            heal::run_healing(request, &worker_state.cfg, worker_state.providers.clone()).await;
        let status = match outcome {
            Ok(report) => TaskStatus::Done(Box::new(report)),
            Err(e) => {
                error!(task_id = %worker_task_id, "run failed: {}", e);
                TaskStatus::Error(e.to_string())
            }
        };
        worker_state.tasks().insert(worker_task_id, status);
    });

    Json(json!({"task_id": task_id})).into_response()
}

async fn result_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(task_id): AxumPath<String>,
) -> Response {
    let tasks = state.tasks();
    match tasks.get(&task_id) {
        Some(TaskStatus::Running) => Json(json!({"status": "running"})).into_response(),
        Some(TaskStatus::Done(report)) => Json(report.as_ref().clone()).into_response(),
        Some(TaskStatus::Error(message)) => {
            Json(json!({"status": "error", "error": message})).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "error", "error": "unknown task"})),
        )
            .into_response(),
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/run", post(run_handler))
        .route("/api/result/:task_id", get(result_handler))
        .route("/api/health", get(health_handler))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(port: u16, cfg: Config) -> Result<(), AgentError> {
    let registry = providers::build_registry(&cfg)?;
    let state = Arc::new(AppState::new(cfg, registry));
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AgentError::Config(format!("failed to bind {}: {}", addr, e)))?;
    info!(%addr, "healing agent API listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| AgentError::Config(format!("server error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::CiStatus;

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(Config::default(), Vec::new()))
    }

    #[tokio::test]
    async fn test_result_transitions() {
        let state = state();
        state.tasks().insert("t1".to_string(), TaskStatus::Running);

        let response = result_handler(State(Arc::clone(&state)), AxumPath("t1".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let request = RunRequest {
            repo_url: "https://github.com/octo/widget".to_string(),
            team_name: "rocket".to_string(),
            team_leader: "ada".to_string(),
            auth_token: None,
        };
        let report = RunReport::new(&request, "ROCKET_ADA_AI_Fix", 5);
        state
            .tasks()
            .insert("t1".to_string(), TaskStatus::Done(Box::new(report)));

        let response = result_handler(State(Arc::clone(&state)), AxumPath("t1".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_task_is_404() {
        let response = result_handler(State(state()), AxumPath("nope".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let Json(body) = health_handler().await;
        assert_eq!(body["status"], "ok");
    }

    #[test]
    fn test_done_status_serializes_report() {
        let request = RunRequest {
            repo_url: "u".to_string(),
            team_name: "t".to_string(),
            team_leader: "l".to_string(),
            auth_token: None,
        };
        let mut report = RunReport::new(&request, "T_L_AI_Fix", 5);
        report.ci_status = CiStatus::Passed;
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["ci_status"], "PASSED");
        // A finished report carries no transient status marker.
        assert!(value.get("status").is_none());
    }
}
