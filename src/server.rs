//! The HTTP server of the chunk master.
//!
//! Serves Prometheus metrics & read-only introspection of master state, along with the small
//! JSON surface used by storage nodes to register, heartbeat, collect jobs & report job results.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Extension, Path};
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, post};
use axum::{AddExtensionLayer, Json, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{Config, DynamicConfig};
use crate::controller::{CreateChunkRequest, CreatedChunk, Inspect, MasterHandle};
use crate::error::AppError;
use crate::get_metrics_recorder;
use crate::mailbox::JobMailbox;
use crate::models::{ChunkId, JobId, NodeHeartbeat, NodeId};
use crate::replicator::{Job, JobState};

type ApiResult<T> = std::result::Result<Json<T>, (StatusCode, String)>;

/// State shared by all request handlers.
struct ServerState {
    prom: PrometheusHandle,
    master: MasterHandle,
    mailbox: JobMailbox,
}

/// A request to register a storage node.
#[derive(Debug, Deserialize)]
struct RegisterNodeRequest {
    address: String,
    capacity: u64,
}

/// A report of the terminal state of a job.
#[derive(Debug, Deserialize)]
struct JobReport {
    state: JobState,
}

/// Spawns the HTTP server of the chunk master.
pub fn spawn_server(config: &Config, master: MasterHandle, mailbox: JobMailbox, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
    let state = Arc::new(ServerState {
        prom: get_metrics_recorder(config).handle(),
        master,
        mailbox,
    });
    let app = Router::new()
        .route("/metrics", get(prometheus_scrape))
        .route("/status", get(status))
        .route("/config", post(update_config))
        .route("/chunks", post(create_chunk))
        .route("/chunks/:id", get(chunk).delete(remove_chunk))
        .route("/nodes", get(nodes).post(register_node))
        .route("/nodes/:id", get(node))
        .route("/nodes/:id/heartbeat", post(heartbeat))
        .route("/nodes/:id/jobs", post(collect_jobs))
        .route("/jobs/:id", post(report_job))
        .route("/requisitions", get(requisitions))
        .route("/histograms", get(histograms))
        .route("/lost_chunks", get(lost_chunks))
        .layer(AddExtensionLayer::new(state));
    let server = axum::Server::bind(&([0, 0, 0, 0], config.http_port).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!("http server is listening at 0.0.0.0:{}", config.http_port);
    tokio::spawn(server.map_err(anyhow::Error::from))
}

/// Handle Prometheus metrics scraping.
async fn prometheus_scrape(Extension(state): Extension<Arc<ServerState>>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.prom.render())
}

/// Map an app error onto an HTTP response.
fn error_response(err: AppError) -> (StatusCode, String) {
    let status = match &err {
        AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        AppError::NotLeader(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::ChunkNotFound(_) | AppError::NodeNotFound(_) => StatusCode::NOT_FOUND,
        AppError::Ise(cause) => {
            tracing::error!(error = ?cause, "internal error handling request");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

fn parse_chunk_id(id: &str) -> std::result::Result<ChunkId, (StatusCode, String)> {
    id.parse()
        .map_err(|err| error_response(AppError::InvalidInput(format!("invalid chunk ID {}: {}", id, err))))
}

async fn inspect(state: &ServerState, query: Inspect) -> ApiResult<Value> {
    state.master.inspect(query).await.map(Json).map_err(error_response)
}

async fn status(Extension(state): Extension<Arc<ServerState>>) -> ApiResult<Value> {
    inspect(&state, Inspect::Status).await
}

async fn chunk(Extension(state): Extension<Arc<ServerState>>, Path(id): Path<String>) -> ApiResult<Value> {
    let id = parse_chunk_id(&id)?;
    inspect(&state, Inspect::Chunk(id)).await
}

async fn nodes(Extension(state): Extension<Arc<ServerState>>) -> ApiResult<Value> {
    inspect(&state, Inspect::Nodes).await
}

async fn node(Extension(state): Extension<Arc<ServerState>>, Path(id): Path<u32>) -> ApiResult<Value> {
    inspect(&state, Inspect::Node(NodeId(id))).await
}

async fn requisitions(Extension(state): Extension<Arc<ServerState>>) -> ApiResult<Value> {
    inspect(&state, Inspect::Requisitions).await
}

async fn histograms(Extension(state): Extension<Arc<ServerState>>) -> ApiResult<Value> {
    inspect(&state, Inspect::Histograms).await
}

async fn lost_chunks(Extension(state): Extension<Arc<ServerState>>) -> ApiResult<Value> {
    inspect(&state, Inspect::LostChunks).await
}

async fn update_config(Extension(state): Extension<Arc<ServerState>>, Json(config): Json<DynamicConfig>) -> ApiResult<()> {
    state.master.update_dynamic_config(config).await.map(Json).map_err(error_response)
}

async fn create_chunk(Extension(state): Extension<Arc<ServerState>>, Json(request): Json<CreateChunkRequest>) -> ApiResult<CreatedChunk> {
    state
        .master
        .throttle_request(&request.account, request.statistics.compressed_data_size)
        .await;
    state.master.create_chunk(request).await.map(Json).map_err(error_response)
}

async fn remove_chunk(Extension(state): Extension<Arc<ServerState>>, Path(id): Path<String>) -> ApiResult<()> {
    let id = parse_chunk_id(&id)?;
    state.master.remove_chunk(id).await.map(Json).map_err(error_response)
}

async fn register_node(Extension(state): Extension<Arc<ServerState>>, Json(request): Json<RegisterNodeRequest>) -> ApiResult<NodeId> {
    state
        .master
        .register_node(request.address, request.capacity)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn heartbeat(Extension(state): Extension<Arc<ServerState>>, Path(id): Path<u32>, Json(heartbeat): Json<NodeHeartbeat>) -> ApiResult<()> {
    if heartbeat.node != NodeId(id) {
        return Err(error_response(AppError::InvalidInput(format!(
            "heartbeat of {} posted for {}",
            heartbeat.node,
            NodeId(id)
        ))));
    }
    state.master.heartbeat(heartbeat).await.map(Json).map_err(error_response)
}

/// Hand all pending jobs over to the node which executes them.
async fn collect_jobs(Extension(state): Extension<Arc<ServerState>>, Path(id): Path<u32>) -> Json<Vec<Job>> {
    Json(state.mailbox.take(NodeId(id)))
}

async fn report_job(Extension(state): Extension<Arc<ServerState>>, Path(id): Path<String>, Json(report): Json<JobReport>) -> ApiResult<()> {
    let id = id
        .parse()
        .map(JobId)
        .map_err(|err| error_response(AppError::InvalidInput(format!("invalid job ID {}: {}", id, err))))?;
    state.master.job_finished(id, report.state).await.map(Json).map_err(error_response)
}
