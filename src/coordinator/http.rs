//! HTTP API for the coordinator
//!
//! Admin endpoints mirror [`Admin`](crate::coordinator::admin::Admin); shard
//! key boundaries are JSON objects such as `{"tenant": "acme"}` (see
//! `ShardKeySpec::key_from_json`). A small document API routes inserts and
//! equality finds through the router.

use crate::common::keys::{KeyField, KeyRange, ShardKey, ShardKeySpec};
use crate::common::{Error, Operation, Predicate};
use crate::coordinator::admin::RemovalProgress;
use crate::coordinator::chunk_map::{ChunkId, InitialChunks};
use crate::coordinator::cluster::Cluster;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::NaiveTime;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct CoordState {
    pub cluster: Arc<Cluster>,
}

/// Error body `{"error": ...}` with the status from `Error::to_http_status`
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        if status.is_server_error() {
            tracing::error!("Admin request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn create_router(state: CoordState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        // Namespaces and chunks
        .route("/admin/collections", post(shard_collection))
        .route("/admin/collections/:ns/distribution", get(distribution))
        .route("/admin/collections/:ns/split", post(split_chunk))
        .route("/admin/collections/:ns/merge", post(merge_chunks))
        .route("/admin/collections/:ns/move", post(move_chunk))
        .route("/admin/collections/:ns/clear-attention", post(clear_attention))
        // Shards
        .route("/admin/shards", post(add_shard).get(list_shards))
        .route("/admin/shards/:id", delete(remove_shard))
        .route("/admin/shards/:id/zones", put(set_shard_zones))
        // Zones
        .route("/admin/zones", post(assign_zone).delete(remove_zone))
        // Balancer
        .route("/admin/balancer", get(balancer_status))
        .route("/admin/balancer/window", put(set_window).delete(clear_window))
        .route("/admin/balancer/pause", post(pause_balancer))
        .route("/admin/balancer/resume", post(resume_balancer))
        // Documents
        .route("/collections/:ns/insert", post(insert_document))
        .route("/collections/:ns/find", post(find_documents))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<CoordState>) -> impl IntoResponse {
    let shards = state.cluster.pool.ids().len();
    Json(json!({
        "status": "healthy",
        "node_id": state.cluster.config.coordinator.node_id,
        "shards": shards,
        "active_migrations": state.cluster.migrations.active_count(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics(State(state): State<CoordState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.cluster.metrics.to_prometheus(),
    )
}

// ============================================================================
// Namespaces and chunks
// ============================================================================

#[derive(Debug, Deserialize)]
struct ShardCollectionRequest {
    namespace: String,
    key: Vec<KeyField>,
    /// Pre-split into this many chunks (hashed leading field)
    chunks: Option<u32>,
    /// Or at these boundaries
    split_points: Option<Vec<Value>>,
}

async fn shard_collection(
    State(state): State<CoordState>,
    Json(req): Json<ShardCollectionRequest>,
) -> ApiResult<impl IntoResponse> {
    let spec = ShardKeySpec::new(req.key)?;
    let initial = match (req.chunks, req.split_points) {
        (Some(_), Some(_)) => {
            return Err(Error::InvalidConfig(
                "give either chunks or split_points, not both".into(),
            )
            .into())
        }
        (_, Some(points)) => InitialChunks::SplitPoints(parse_keys(&spec, &points)?),
        (chunks, None) => InitialChunks::Count(chunks.unwrap_or(1)),
    };
    let snapshot = state
        .cluster
        .admin
        .shard_collection(&req.namespace, spec, initial)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "namespace": snapshot.namespace,
            "chunks": snapshot.chunks.len(),
            "version": snapshot.version.to_string(),
        })),
    ))
}

async fn distribution(
    State(state): State<CoordState>,
    Path(ns): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.cluster.admin.get_chunk_distribution(&ns)?))
}

#[derive(Debug, Deserialize)]
struct SplitRequest {
    chunk_id: ChunkId,
    /// Split at the owner's median key when absent
    points: Option<Vec<Value>>,
}

async fn split_chunk(
    State(state): State<CoordState>,
    Path(ns): Path<String>,
    Json(req): Json<SplitRequest>,
) -> ApiResult<impl IntoResponse> {
    let spec = state.cluster.chunk_map.snapshot(&ns)?.key_spec.clone();
    let points = req
        .points
        .map(|points| parse_keys(&spec, &points))
        .transpose()?;
    let snapshot = state.cluster.admin.split_chunk(&ns, req.chunk_id, points)?;
    Ok(Json(json!({
        "chunks": snapshot.chunks.len(),
        "version": snapshot.version.to_string(),
    })))
}

#[derive(Debug, Deserialize)]
struct RangeRequest {
    min: Value,
    max: Value,
}

async fn merge_chunks(
    State(state): State<CoordState>,
    Path(ns): Path<String>,
    Json(req): Json<RangeRequest>,
) -> ApiResult<impl IntoResponse> {
    let spec = state.cluster.chunk_map.snapshot(&ns)?.key_spec.clone();
    let range = parse_range(&spec, &req.min, &req.max)?;
    let snapshot = state.cluster.admin.merge_chunks(&ns, &range)?;
    Ok(Json(json!({
        "chunks": snapshot.chunks.len(),
        "version": snapshot.version.to_string(),
    })))
}

#[derive(Debug, Deserialize)]
struct MoveRequest {
    chunk_id: ChunkId,
    to: String,
}

async fn move_chunk(
    State(state): State<CoordState>,
    Path(ns): Path<String>,
    Json(req): Json<MoveRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .cluster
        .admin
        .move_chunk(&ns, req.chunk_id, &req.to)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
struct ChunkRequest {
    chunk_id: ChunkId,
}

async fn clear_attention(
    State(state): State<CoordState>,
    Path(ns): Path<String>,
    Json(req): Json<ChunkRequest>,
) -> ApiResult<impl IntoResponse> {
    let was_flagged = state.cluster.admin.clear_needs_attention(&ns, req.chunk_id)?;
    Ok(Json(json!({ "cleared": was_flagged })))
}

// ============================================================================
// Shards
// ============================================================================

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct AddShardRequest {
    endpoint: String,
    #[serde(default)]
    zones: BTreeSet<String>,
    #[serde(default = "default_weight")]
    weight: f64,
}

async fn add_shard(
    State(state): State<CoordState>,
    Json(req): Json<AddShardRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .cluster
        .admin
        .add_shard(&req.endpoint, req.zones, req.weight)?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_shards(State(state): State<CoordState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.cluster.admin.list_shards()?))
}

/// Starts (or checks) draining; 202 while chunks remain, 200 once removed
async fn remove_shard(
    State(state): State<CoordState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let progress = state.cluster.admin.remove_shard_step(&id)?;
    let status = match progress {
        RemovalProgress::Removed => StatusCode::OK,
        RemovalProgress::Draining { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(progress)))
}

#[derive(Debug, Deserialize)]
struct ZonesRequest {
    zones: BTreeSet<String>,
}

async fn set_shard_zones(
    State(state): State<CoordState>,
    Path(id): Path<String>,
    Json(req): Json<ZonesRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.cluster.admin.set_shard_zones(&id, req.zones)?))
}

// ============================================================================
// Zones
// ============================================================================

#[derive(Debug, Deserialize)]
struct ZoneRangeRequest {
    namespace: String,
    min: Value,
    max: Value,
    /// Required when assigning
    zone: Option<String>,
}

async fn assign_zone(
    State(state): State<CoordState>,
    Json(req): Json<ZoneRangeRequest>,
) -> ApiResult<impl IntoResponse> {
    let zone = req
        .zone
        .ok_or_else(|| Error::InvalidConfig("zone name is required".into()))?;
    let spec = state.cluster.chunk_map.snapshot(&req.namespace)?.key_spec.clone();
    let range = parse_range(&spec, &req.min, &req.max)?;
    state
        .cluster
        .admin
        .assign_zone_range(&req.namespace, range, &zone)?;
    Ok((StatusCode::CREATED, Json(json!({ "zone": zone }))))
}

async fn remove_zone(
    State(state): State<CoordState>,
    Json(req): Json<ZoneRangeRequest>,
) -> ApiResult<impl IntoResponse> {
    let spec = state.cluster.chunk_map.snapshot(&req.namespace)?.key_spec.clone();
    let range = parse_range(&spec, &req.min, &req.max)?;
    let zone = state.cluster.admin.remove_zone_range(&req.namespace, &range)?;
    Ok(Json(json!({ "removed": zone })))
}

// ============================================================================
// Balancer
// ============================================================================

async fn balancer_status(State(state): State<CoordState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.cluster.admin.balancer_status()?))
}

#[derive(Debug, Deserialize)]
struct WindowRequest {
    /// UTC, `HH:MM:SS`
    start: NaiveTime,
    stop: NaiveTime,
}

async fn set_window(
    State(state): State<CoordState>,
    Json(req): Json<WindowRequest>,
) -> ApiResult<impl IntoResponse> {
    state.cluster.admin.set_balancer_window(req.start, req.stop)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_window(State(state): State<CoordState>) -> ApiResult<impl IntoResponse> {
    state.cluster.admin.clear_balancer_window()?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pause_balancer(State(state): State<CoordState>) -> ApiResult<impl IntoResponse> {
    state.cluster.admin.pause_balancer()?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_balancer(State(state): State<CoordState>) -> ApiResult<impl IntoResponse> {
    state.cluster.admin.resume_balancer()?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Documents
// ============================================================================

#[derive(Debug, Deserialize)]
struct InsertRequest {
    doc: Value,
}

async fn insert_document(
    State(state): State<CoordState>,
    Path(ns): Path<String>,
    Json(req): Json<InsertRequest>,
) -> ApiResult<impl IntoResponse> {
    let dispatched = state.cluster.router.dispatch(&Operation::insert(&ns, req.doc))?;
    Ok(Json(json!({
        "mode": dispatched.mode,
        "shards": dispatched.shards,
        "affected": dispatched.result.affected,
    })))
}

#[derive(Debug, Deserialize)]
struct FindRequest {
    /// Field equalities; empty matches everything
    #[serde(default)]
    filter: Map<String, Value>,
}

async fn find_documents(
    State(state): State<CoordState>,
    Path(ns): Path<String>,
    Json(req): Json<FindRequest>,
) -> ApiResult<impl IntoResponse> {
    let filter = req
        .filter
        .into_iter()
        .fold(Predicate::all(), |p, (path, value)| p.eq(&path, value));
    let dispatched = state.cluster.router.dispatch(&Operation::find(&ns, filter))?;
    Ok(Json(json!({
        "mode": dispatched.mode,
        "shards": dispatched.shards,
        "documents": dispatched.result.documents,
    })))
}

fn parse_keys(spec: &ShardKeySpec, values: &[Value]) -> Result<Vec<ShardKey>, Error> {
    values.iter().map(|v| spec.key_from_json(v)).collect()
}

fn parse_range(spec: &ShardKeySpec, min: &Value, max: &Value) -> Result<KeyRange, Error> {
    KeyRange::new(spec.key_from_json(min)?, spec.key_from_json(max)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let (cluster, _) = Cluster::in_memory();
        create_router(CoordState {
            cluster: Arc::new(cluster),
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = call(&app, "GET", "/health", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_shard_collection_flow() {
        let app = app();
        let (status, shard) = call(
            &app,
            "POST",
            "/admin/shards",
            json!({ "endpoint": "mem://a", "zones": ["eu"] }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(shard["id"], "shard-0");

        let request = json!({
            "namespace": "db.users",
            "key": [{ "path": "tenant", "mode": "ranged" }],
            "split_points": [{ "tenant": "m" }],
        });
        let (status, body) = call(&app, "POST", "/admin/collections", request.clone()).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["chunks"], 2);

        let (status, body) = call(&app, "POST", "/admin/collections", request).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already sharded"));

        let (status, body) = call(
            &app,
            "POST",
            "/collections/db.users/insert",
            json!({ "doc": { "_id": "1", "tenant": "acme" } }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "targeted_single");

        let (status, body) = call(
            &app,
            "POST",
            "/collections/db.users/find",
            json!({ "filter": { "tenant": "acme" } }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["documents"].as_array().unwrap().len(), 1);

        let (status, body) = call(&app, "GET", "/admin/collections/db.users/distribution", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_chunks"], 2);
        assert_eq!(body["shards"]["shard-0"], 2);
    }

    #[tokio::test]
    async fn test_errors_map_to_status() {
        let app = app();
        let (status, _) = call(
            &app,
            "GET",
            "/admin/collections/db.missing/distribution",
            Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        call(&app, "POST", "/admin/shards", json!({ "endpoint": "mem://a" })).await;
        let (status, _) = call(
            &app,
            "POST",
            "/admin/collections",
            json!({ "namespace": "db.users", "key": [] }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_zone_conflict() {
        let app = app();
        call(&app, "POST", "/admin/shards", json!({ "endpoint": "mem://a" })).await;
        call(
            &app,
            "POST",
            "/admin/collections",
            json!({ "namespace": "db.users", "key": [{ "path": "tenant", "mode": "ranged" }] }),
        )
        .await;

        let zone = |min: &str, max: &str, name: &str| {
            json!({ "namespace": "db.users", "min": { "tenant": min }, "max": { "tenant": max }, "zone": name })
        };
        let (status, _) = call(&app, "POST", "/admin/zones", zone("a", "m", "eu")).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(&app, "POST", "/admin/zones", zone("k", "z", "us")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(&app, "DELETE", "/admin/zones", zone("a", "m", "eu")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], "eu");
    }

    #[tokio::test]
    async fn test_balancer_controls() {
        let app = app();
        let (status, _) = call(
            &app,
            "PUT",
            "/admin/balancer/window",
            json!({ "start": "22:00:00", "stop": "04:00:00" }),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "POST", "/admin/balancer/pause", Value::Null).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&app, "GET", "/admin/balancer", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settings"]["paused"], true);
        assert_eq!(body["settings"]["window"]["start"], "22:00:00");

        call(&app, "POST", "/admin/balancer/resume", Value::Null).await;
        call(&app, "DELETE", "/admin/balancer/window", Value::Null).await;
        let (_, body) = call(&app, "GET", "/admin/balancer", Value::Null).await;
        assert_eq!(body["settings"]["paused"], false);
        assert!(body["settings"]["window"].is_null());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let app = app();
        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
