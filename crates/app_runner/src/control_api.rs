use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use core_types::SpaceSnapshot;
use serde::{Deserialize, Serialize};

use crate::optimize::{
    feedback, optimize, space_snapshot, FeedbackRequest, FeedbackResponse, OptimizeRequest,
    OptimizeResponse,
};
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub(crate) struct HealthResp {
    pub(crate) status: String,
    pub(crate) spaces: usize,
    pub(crate) pending: usize,
    pub(crate) started_at: DateTime<Utc>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SpaceQuery {
    #[serde(default)]
    pub(crate) ctx: String,
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/optimize", post(optimize_handler))
        .route("/feedback", post(feedback_handler))
        .route("/space", get(space_handler))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub(crate) async fn optimize_handler(
    State(state): State<AppState>,
    Json(req): Json<OptimizeRequest>,
) -> Json<OptimizeResponse> {
    Json(optimize(&state.ctx, &req))
}

pub(crate) async fn feedback_handler(
    State(state): State<AppState>,
    Json(req): Json<FeedbackRequest>,
) -> Json<FeedbackResponse> {
    Json(feedback(&state.ctx, &req))
}

pub(crate) async fn space_handler(
    State(state): State<AppState>,
    Query(query): Query<SpaceQuery>,
) -> Json<SpaceSnapshot> {
    Json(space_snapshot(&state.ctx, &query.ctx))
}

pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthResp> {
    Json(HealthResp {
        status: "ok".to_string(),
        spaces: state.ctx.spaces.len(),
        pending: state.ctx.pending.len(),
        started_at: state.started_at,
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
