use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Deserialize;
use sharder::TargetSharder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::error;

#[derive(Clone)]
pub struct RouteState {
    pub sharder: Arc<TargetSharder>,
    pub registry: Arc<Registry>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);
    Router::new()
        .route("/jobs", get(jobs))
        .route("/jobs/:job_id/targets", get(job_targets))
        .route("/metrics", get(metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(route_state)
}

#[derive(Debug, Deserialize)]
struct TargetsParams {
    collector_id: Option<String>,
}

async fn jobs(State(state): State<RouteState>) -> impl IntoResponse {
    Json(state.sharder.job_index().await)
}

async fn job_targets(
    Path(job_id): Path<String>,
    Query(params): Query<TargetsParams>,
    State(state): State<RouteState>,
) -> Response {
    match params.collector_id {
        Some(collector_id) => {
            Json(state.sharder.collector_groups(&job_id, &collector_id).await).into_response()
        }
        None => Json(state.sharder.job_collector_index(&job_id).await).into_response(),
    }
}

async fn metrics(State(state): State<RouteState>) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&state.registry.gather(), &mut buffer) {
        error!("failed to encode metrics: {:?}", err);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([("content-type", encoder.format_type().to_string())], buffer).into_response()
}
