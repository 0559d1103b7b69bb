use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::warn;

use echelon_core::hierarchy::HierarchySpec;
use echelon_core::ids::{HierarchyId, RunId};
use echelon_core::run::{RunOptions, RunStatus};
use echelon_engine::EngineError;
use echelon_store::hierarchies::HierarchyRow;
use echelon_store::runs::RunRow;
use echelon_store::StoreError;

use crate::server::AppState;

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 500;

/// Engine failures rendered as HTTP responses.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::RunNotFound(_) | EngineError::HierarchyNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::InvalidHierarchy(_) => StatusCode::BAD_REQUEST,
            EngineError::InvalidState { .. } => StatusCode::CONFLICT,
            EngineError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            EngineError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        let body = json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub status: Option<RunStatus>,
}

impl PageQuery {
    fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE)
    }

    fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }
}

#[derive(Deserialize)]
pub struct StartRunRequest {
    pub hierarchy_id: HierarchyId,
    pub task: String,
    #[serde(default)]
    pub options: RunOptions,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub from: u64,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

pub async fn create_hierarchy(
    State(state): State<AppState>,
    Json(spec): Json<HierarchySpec>,
) -> Result<(StatusCode, Json<HierarchyRow>), ApiError> {
    let row = state.controller.create_hierarchy(spec)?;
    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn get_hierarchy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HierarchyRow>, ApiError> {
    let row = state.controller.get_hierarchy(&HierarchyId::from_raw(id))?;
    Ok(Json(row))
}

pub async fn list_hierarchies(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<HierarchyRow>>, ApiError> {
    let rows = state.controller.list_hierarchies(page.limit(), page.offset())?;
    Ok(Json(rows))
}

pub async fn start_run(
    State(state): State<AppState>,
    Json(request): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<RunRow>), ApiError> {
    let row = state
        .controller
        .start_run(&request.hierarchy_id, &request.task, request.options)?;
    Ok((StatusCode::ACCEPTED, Json(row)))
}

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunRow>, ApiError> {
    let row = state.controller.get_run(&RunId::from_raw(id))?;
    Ok(Json(row))
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<RunRow>>, ApiError> {
    let rows = state
        .controller
        .list_runs(page.limit(), page.offset(), page.status)?;
    Ok(Json(rows))
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunRow>, ApiError> {
    let row = state.controller.cancel_run(&RunId::from_raw(id))?;
    Ok(Json(row))
}

/// Resumable event stream. Replays persisted events from `from`, then
/// follows live publishes; the connection closes after the run's
/// terminal event.
pub async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let stream = state
        .controller
        .subscribe_events(&RunId::from_raw(id), query.from)?;

    let stream = stream.map(|event| {
        let sse = Event::default()
            .id(event.sequence.to_string())
            .event(event.kind());
        Ok(match sse.json_data(&event) {
            Ok(sse) => sse,
            Err(e) => {
                warn!(error = %e, "failed to serialize event");
                Event::default().event("error").data("serialization failed")
            }
        })
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
