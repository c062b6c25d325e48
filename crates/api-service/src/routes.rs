use axum::{
    extract::{Path, State},
    response::sse::{KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use common::models::{Camera, CameraSearchRequest, CameraSearchResponse, DiscoveryRequest};
use common::validation::validate_non_empty;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use stream_discovery::StreamTester;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::ApiError;
use crate::sse::{to_sse_event, SseSink};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/brands", get(list_brands))
        .route("/api/brands/:brand_id", get(get_brand))
        .route("/api/cameras/search", post(search_cameras))
        .route("/api/discover", post(discover))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<JsonValue> {
    Json(json!({
        "status": "ok",
        "version": common::VERSION,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "ffprobe_available": state.probe.media_tool_available().await,
    }))
}

async fn list_brands(State(state): State<AppState>) -> Result<Json<JsonValue>, ApiError> {
    let brands = state.loader.list_brands().await?;
    Ok(Json(json!({ "total": brands.len(), "brands": brands })))
}

/// Full pattern record for one brand; a missing brand is a 404, not a 500.
async fn get_brand(
    State(state): State<AppState>,
    Path(brand_id): Path<String>,
) -> Result<Json<Camera>, ApiError> {
    let camera = state.loader.load_brand(&brand_id).await?;
    Ok(Json((*camera).clone()))
}

async fn search_cameras(
    State(state): State<AppState>,
    Json(request): Json<CameraSearchRequest>,
) -> Result<Json<CameraSearchResponse>, ApiError> {
    validate_non_empty(&request.query, "query").map_err(|e| ApiError::bad_request(e.to_string()))?;
    let response = state.search.search(&request.query, request.limit).await?;
    Ok(Json(response))
}

/// Run a discovery scan, streaming its events to the client as SSE. The
/// scan is aborted when the client disconnects.
async fn discover(
    State(state): State<AppState>,
    Json(request): Json<DiscoveryRequest>,
) -> Sse<impl tokio_stream::Stream<Item = Result<axum::response::sse::Event, std::convert::Infallible>>>
{
    let scan_id = Uuid::new_v4();
    info!(scan_id = %scan_id, target = %request.target, "discovery request accepted");

    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let sink = Arc::new(SseSink::new(tx, cancel.clone()));

    let scanner = state.scanner.clone();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = scanner.scan(request, sink, &cancel).await {
                error!(scan_id = %scan_id, error = %e, "scan failed");
            }
        });
    }

    // Dropping the response stream trips the guard and cancels the scan.
    let guard = cancel.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |event| {
        let _ = &guard;
        to_sse_event(&event)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
