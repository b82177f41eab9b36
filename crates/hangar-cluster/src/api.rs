//! Read-only HTTP API over the coordinator's store.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/agents` | All agents with load |
//! | GET | `/api/v1/agents/{id}` | One agent |
//! | GET | `/api/v1/agents/{id}/runners` | Runners hosted by an agent |
//! | GET | `/api/v1/runners` | All runners |
//! | GET | `/api/v1/runners/{id}` | One runner |
//! | GET | `/metrics` | Prometheus text exposition |
//! | GET | `/healthz` | Liveness |

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use hangar_core::{Agent, Runner};
use hangar_metrics::MetricsCollector;
use hangar_state::Store;
use serde::Serialize;

use crate::server::StreamRegistry;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub streams: StreamRegistry,
    pub metrics: MetricsCollector,
}

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Agent plus what the coordinator knows about its load.
#[derive(Debug, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub agent: Agent,
    pub active_runners: usize,
    pub stream_connected: bool,
}

fn agent_view(state: &ApiState, agent: Agent) -> AgentView {
    AgentView {
        active_runners: state.store.get_runner_count(&agent.id),
        stream_connected: state.streams.is_connected(&agent.id),
        agent,
    }
}

pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/{id}", get(get_agent))
        .route("/agents/{id}/runners", get(list_agent_runners))
        .route("/runners", get(list_runners))
        .route("/runners/{id}", get(get_runner));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// GET /api/v1/agents
async fn list_agents(State(state): State<ApiState>) -> impl IntoResponse {
    let agents: Vec<AgentView> = state
        .store
        .list_agents()
        .into_iter()
        .map(|a| agent_view(&state, a))
        .collect();
    ApiResponse::ok(agents)
}

/// GET /api/v1/agents/{id}
async fn get_agent(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.get_agent(&id) {
        Ok(agent) => ApiResponse::ok(agent_view(&state, agent)).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::NOT_FOUND).into_response(),
    }
}

/// GET /api/v1/agents/{id}/runners
async fn list_agent_runners(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = state.store.get_agent(&id) {
        return error_response(&e.to_string(), StatusCode::NOT_FOUND).into_response();
    }
    ApiResponse::ok(state.store.list_runners_by_agent(&id)).into_response()
}

/// GET /api/v1/runners
async fn list_runners(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::<Vec<Runner>>::ok(state.store.list_runners())
}

/// GET /api/v1/runners/{id}
async fn get_runner(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.get_runner(&id) {
        Ok(runner) => ApiResponse::ok(runner).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::NOT_FOUND).into_response(),
    }
}

/// GET /metrics
async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render().await,
    )
}

async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}
