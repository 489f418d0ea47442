//! REST API Handlers
//!
//! Implements the REST API endpoints for volume lifecycle, node membership
//! and task tracking. Mutating endpoints submit a task and answer
//! `202 Accepted` with the task record.

use crate::controlplane::{Operation, Orchestrator, Target, Task};
use crate::domain::{
    Brick, BrickStatus, Node, OptionSource, TaskId, Volume, VolumeId, VolumeSpec, VolumeState,
    VolumeType,
};
use crate::error::{Error, ErrorKind, Result};
use crate::registry::{MemoryOptions, RegistryStats};
use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Create volume request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    pub name: String,
    /// distribute, replicate, distribute-replicate or disperse
    pub volume_type: VolumeType,
    #[serde(default)]
    pub replica_count: Option<u32>,
    #[serde(default)]
    pub distribute_count: Option<u32>,
    #[serde(default)]
    pub redundancy_count: Option<u32>,
    /// Capacity (e.g., "100Gi", "1Ti")
    pub capacity: String,
}

impl CreateVolumeRequest {
    pub fn into_spec(self) -> Result<VolumeSpec> {
        let spec = VolumeSpec {
            name: self.name,
            volume_type: self.volume_type,
            replica_count: self.replica_count.unwrap_or(1),
            distribute_count: self.distribute_count.unwrap_or(1),
            redundancy_count: self.redundancy_count.unwrap_or(0),
            capacity_bytes: parse_capacity(&self.capacity)?,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Expand volume request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandVolumeRequest {
    /// Replica (or disperse) sets to add
    pub add_subvolumes: u32,
}

/// Set volume option request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetOptionRequest {
    pub value: String,
}

/// Add node request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddNodeRequest {
    pub hostname: String,
    /// Capacity offered for bricks (e.g., "4Ti")
    pub capacity: String,
    #[serde(default)]
    pub fault_domain: Option<String>,
}

/// Brick info response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrickResponse {
    pub brick_id: String,
    pub index: u32,
    pub replica_set: u32,
    pub node_id: String,
    pub path: String,
    pub port: u16,
    pub size_bytes: u64,
    pub status: BrickStatus,
}

/// Volume info response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeResponse {
    pub volume_id: String,
    pub name: String,
    pub volume_type: VolumeType,
    pub replica_count: u32,
    pub distribute_count: u32,
    pub redundancy_count: u32,
    pub capacity_bytes: u64,
    pub state: VolumeState,
    pub bricks: Vec<BrickResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_task: Option<String>,
}

impl VolumeResponse {
    fn new(volume: Volume, bricks: Vec<Brick>, active_task: Option<TaskId>) -> Self {
        let group_size = volume.group_size();
        Self {
            volume_id: volume.id.to_string(),
            name: volume.name,
            volume_type: volume.volume_type,
            replica_count: volume.replica_count,
            distribute_count: volume.distribute_count,
            redundancy_count: volume.redundancy_count,
            capacity_bytes: volume.capacity_bytes,
            state: volume.state,
            bricks: bricks
                .into_iter()
                .map(|b| BrickResponse {
                    brick_id: b.id.to_string(),
                    index: b.index,
                    replica_set: b.replica_set(group_size),
                    node_id: b.node_id.to_string(),
                    path: b.path,
                    port: b.port,
                    size_bytes: b.size_bytes,
                    status: b.status,
                })
                .collect(),
            active_task: active_task.map(|t| t.to_string()),
        }
    }
}

/// Node info response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoResponse {
    pub node_id: String,
    pub hostname: String,
    pub online: bool,
    pub brick_count: u32,
    pub total_capacity_bytes: u64,
    pub available_capacity_bytes: u64,
    pub fault_domain: Option<String>,
}

/// Cluster overview response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResponse {
    pub cluster_id: String,
    pub name: String,
    pub stats: RegistryStats,
    pub active_tasks: i64,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Status code for an error surfaced through the API
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Planning => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ExternalTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Launcher => StatusCode::BAD_GATEWAY,
        ErrorKind::Cancelled | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: Error) -> Response {
    let kind = e.kind();
    let status = status_for(kind);
    if status.is_server_error() {
        error!(error = %e, "Request failed");
    }
    (
        status,
        Json(ApiErrorResponse {
            error: kind.to_string(),
            message: e.to_string(),
            details: None,
        }),
    )
        .into_response()
}

fn accepted(result: Result<Task>) -> Response {
    match result {
        Ok(task) => (StatusCode::ACCEPTED, Json(task)).into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<Orchestrator>,
    options: Arc<MemoryOptions>,
}

impl RestRouter {
    /// Create a new REST router; `options` must be the store the
    /// orchestrator compiles from
    pub fn new(orchestrator: Arc<Orchestrator>, options: Arc<MemoryOptions>) -> Self {
        Self {
            orchestrator,
            options,
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
            options: self.options,
        };

        Router::new()
            // Volume endpoints
            .route("/v1/volumes", post(create_volume).get(list_volumes))
            .route("/v1/volumes/:name", get(get_volume).delete(delete_volume))
            .route("/v1/volumes/:name/start", post(start_volume))
            .route("/v1/volumes/:name/stop", post(stop_volume))
            .route("/v1/volumes/:name/expand", post(expand_volume))
            .route("/v1/volumes/:name/rebalance", post(rebalance_volume))
            .route("/v1/volumes/:name/volfiles", get(get_volfiles))
            .route("/v1/volumes/:name/options", get(list_options))
            .route(
                "/v1/volumes/:name/options/:key",
                axum::routing::put(set_option).delete(unset_option),
            )
            // Node endpoints
            .route("/v1/nodes", post(add_node).get(list_nodes))
            .route("/v1/nodes/:id", axum::routing::delete(remove_node))
            .route("/v1/nodes/:id/heartbeat", post(node_heartbeat))
            // Task endpoints
            .route("/v1/tasks", get(list_tasks))
            .route("/v1/tasks/:id", get(get_task))
            .route("/v1/tasks/:id/cancel", post(cancel_task))
            // Cluster endpoints
            .route("/v1/cluster", get(get_cluster))
            .route("/health", get(health_check))
            .route("/metrics", get(metrics))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    options: Arc<MemoryOptions>,
}

// =============================================================================
// Volume Handlers
// =============================================================================

async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeRequest>,
) -> Response {
    info!(volume = %request.name, "Create volume requested");
    let spec = match request.into_spec() {
        Ok(spec) => spec,
        Err(e) => return error_response(e),
    };
    accepted(state.orchestrator.submit(Operation::CreateVolume { spec }))
}

fn volume_response(orchestrator: &Orchestrator, volume_id: &VolumeId) -> Result<VolumeResponse> {
    let (volume, bricks) = orchestrator.registry().volume_with_bricks(volume_id)?;
    let active = orchestrator
        .active_task(&Target::Volume(volume.id.clone()))
        .map(|t| t.id);
    Ok(VolumeResponse::new(volume, bricks, active))
}

async fn list_volumes(State(state): State<AppState>) -> Response {
    let volumes: Result<Vec<VolumeResponse>> = state
        .orchestrator
        .registry()
        .list_volumes()
        .iter()
        .map(|v| volume_response(&state.orchestrator, &v.id))
        .collect();
    match volumes {
        Ok(volumes) => (StatusCode::OK, Json(volumes)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_volume(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let result = state
        .orchestrator
        .registry()
        .find_volume(&name)
        .and_then(|v| volume_response(&state.orchestrator, &v.id));
    match result {
        Ok(volume) => (StatusCode::OK, Json(volume)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn start_volume(State(state): State<AppState>, Path(volume): Path<String>) -> Response {
    accepted(state.orchestrator.submit(Operation::StartVolume { volume }))
}

async fn stop_volume(State(state): State<AppState>, Path(volume): Path<String>) -> Response {
    accepted(state.orchestrator.submit(Operation::StopVolume { volume }))
}

async fn delete_volume(State(state): State<AppState>, Path(volume): Path<String>) -> Response {
    accepted(state.orchestrator.submit(Operation::DeleteVolume { volume }))
}

async fn rebalance_volume(State(state): State<AppState>, Path(volume): Path<String>) -> Response {
    accepted(state.orchestrator.submit(Operation::RebalanceVolume { volume }))
}

async fn expand_volume(
    State(state): State<AppState>,
    Path(volume): Path<String>,
    Json(request): Json<ExpandVolumeRequest>,
) -> Response {
    accepted(state.orchestrator.submit(Operation::ExpandVolume {
        volume,
        add_subvolumes: request.add_subvolumes,
    }))
}

/// Compile the volume's current volfiles without publishing them
async fn get_volfiles(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let orchestrator = &state.orchestrator;
    let result = orchestrator.registry().find_volume(&name).and_then(|volume| {
        let bricks = orchestrator.registry().volume_bricks(&volume.id)?;
        let nodes = orchestrator
            .registry()
            .list_nodes()
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        let options = orchestrator.options().options(&volume.id);
        orchestrator
            .compiler()
            .compile(&volume, &bricks, &nodes, &options)
    });
    match result {
        Ok(compiled) => (StatusCode::OK, Json(compiled)).into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Option Handlers
// =============================================================================

/// Options take effect the next time the volume's volfiles are published
async fn list_options(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.orchestrator.registry().find_volume(&name) {
        Ok(volume) => (StatusCode::OK, Json(state.options.options(&volume.id))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn set_option(
    State(state): State<AppState>,
    Path((name, key)): Path<(String, String)>,
    Json(request): Json<SetOptionRequest>,
) -> Response {
    let result = state
        .orchestrator
        .registry()
        .find_volume(&name)
        .and_then(|volume| state.options.set(&volume.id, &key, &request.value));
    match result {
        Ok(()) => {
            info!(volume = %name, key = %key, "Volume option set");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn unset_option(
    State(state): State<AppState>,
    Path((name, key)): Path<(String, String)>,
) -> Response {
    let volume = match state.orchestrator.registry().find_volume(&name) {
        Ok(volume) => volume,
        Err(e) => return error_response(e),
    };
    match state.options.unset(&volume.id, &key) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => error_response(Error::not_found("option", key)),
    }
}

// =============================================================================
// Node Handlers
// =============================================================================

async fn add_node(
    State(state): State<AppState>,
    Json(request): Json<AddNodeRequest>,
) -> Response {
    let capacity_bytes = match parse_capacity(&request.capacity) {
        Ok(bytes) => bytes,
        Err(e) => return error_response(e),
    };
    accepted(state.orchestrator.submit(Operation::AddNode {
        hostname: request.hostname,
        capacity_bytes,
        fault_domain: request.fault_domain,
    }))
}

fn node_response(node: Node, bricks: &[Brick]) -> NodeInfoResponse {
    let on_node: Vec<&Brick> = bricks.iter().filter(|b| b.node_id == node.id).collect();
    let used: u64 = on_node.iter().map(|b| b.size_bytes).sum();
    NodeInfoResponse {
        node_id: node.id.to_string(),
        hostname: node.hostname.clone(),
        online: node.is_online(),
        brick_count: on_node.len() as u32,
        total_capacity_bytes: node.capacity_bytes,
        available_capacity_bytes: node.capacity_bytes.saturating_sub(used),
        fault_domain: node.fault_domain,
    }
}

async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.orchestrator.registry().snapshot();
    let nodes: Vec<NodeInfoResponse> = snapshot
        .nodes
        .iter()
        .cloned()
        .map(|n| node_response(n, &snapshot.bricks))
        .collect();
    (StatusCode::OK, Json(nodes))
}

async fn remove_node(State(state): State<AppState>, Path(node): Path<String>) -> Response {
    accepted(state.orchestrator.submit(Operation::RemoveNode { node }))
}

/// Heartbeat from a node's agent; revives a node that missed heartbeats
async fn node_heartbeat(State(state): State<AppState>, Path(node): Path<String>) -> Response {
    let registry = state.orchestrator.registry();
    let result = state
        .orchestrator
        .resolve_node(&node)
        .and_then(|n| registry.heartbeat(&n.id));
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Task Handlers
// =============================================================================

async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.orchestrator.list_tasks()))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.get_task(&TaskId::new(id)) {
        Ok(task) => (StatusCode::OK, Json(task)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.cancel(&TaskId::new(id)) {
        Ok(task) => (StatusCode::ACCEPTED, Json(task)).into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Cluster Handlers
// =============================================================================

async fn get_cluster(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.orchestrator.registry();
    let cluster = registry.cluster();
    (
        StatusCode::OK,
        Json(ClusterResponse {
            cluster_id: cluster.id.to_string(),
            name: cluster.name.clone(),
            stats: registry.stats(),
            active_tasks: state.orchestrator.metrics().active(),
        }),
    )
}

/// Health check; unhealthy while the node agent channel is down
async fn health_check(State(state): State<AppState>) -> Response {
    match state.orchestrator.agent().health_check().await {
        Ok(true) => (StatusCode::OK, "ok").into_response(),
        Ok(false) => (StatusCode::SERVICE_UNAVAILABLE, "node agent unhealthy").into_response(),
        Err(e) => error_response(e),
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.orchestrator.metrics().encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Parse capacity string (e.g., "100Gi", "1Ti") to bytes
pub fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Validation("empty capacity string".into()));
    }

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::Validation(format!("invalid capacity number: {}", num_str)))?;

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1 << 10,
        "M" | "MB" | "MI" | "MIB" => 1 << 20,
        "G" | "GB" | "GI" | "GIB" => 1 << 30,
        "T" | "TB" | "TI" | "TIB" => 1 << 40,
        "P" | "PB" | "PI" | "PIB" => 1 << 50,
        _ => {
            return Err(Error::Validation(format!(
                "unknown capacity unit: {}",
                unit_str
            )))
        }
    };

    let bytes = (num * multiplier as f64) as u64;
    if bytes == 0 {
        return Err(Error::Validation("capacity must be positive".into()));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MemoryNodeAgent;
    use crate::controlplane::OrchestratorConfig;
    use crate::registry::Registry;
    use crate::topology::TopologyPlanner;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> (Router, Arc<Orchestrator>) {
        let registry = Registry::new("test");
        let options = Arc::new(MemoryOptions::new());
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            registry,
            TopologyPlanner::default(),
            Arc::new(MemoryNodeAgent::new()),
            options.clone(),
        )
        .unwrap();
        (RestRouter::new(orchestrator.clone(), options).build(), orchestrator)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_parse_capacity() {
        assert_eq!(parse_capacity("100").unwrap(), 100);
        assert_eq!(parse_capacity("1Ki").unwrap(), 1024);
        assert_eq!(parse_capacity("1.5G").unwrap(), 3 * (1 << 29));
        assert_eq!(parse_capacity("100Gi").unwrap(), 100 * (1 << 30));

        assert!(parse_capacity("").is_err());
        assert!(parse_capacity("abc").is_err());
        assert!(parse_capacity("100X").is_err());
        assert!(parse_capacity("0").is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::Planning), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_volume_without_nodes_is_unprocessable() {
        let (app, orchestrator) = router();
        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/volumes",
                serde_json::json!({
                    "name": "gv0",
                    "volumeType": "replicate",
                    "replicaCount": 2,
                    "capacity": "10Gi"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["error"], "planning");
        assert!(orchestrator.registry().list_volumes().is_empty());
    }

    #[tokio::test]
    async fn test_add_node_then_list() {
        let (app, orchestrator) = router();
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/nodes",
                serde_json::json!({"hostname": "n1.local", "capacity": "1Ti"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let task = body_json(response).await;
        let task_id = TaskId::new(task["id"].as_str().unwrap());
        let done = orchestrator.wait(&task_id).await.unwrap();
        assert_eq!(done.state, crate::controlplane::TaskState::Succeeded);

        let response = app
            .oneshot(Request::get("/v1/nodes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let nodes = body_json(response).await;
        assert_eq!(nodes[0]["hostname"], "n1.local");
        assert_eq!(nodes[0]["online"], true);
    }

    #[tokio::test]
    async fn test_unknown_volume_and_task() {
        let (app, _) = router();
        let response = app
            .clone()
            .oneshot(Request::get("/v1/volumes/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::post("/v1/tasks/task-404/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_volume_options_and_volfiles() {
        let (app, orchestrator) = router();
        for host in ["n1", "n2"] {
            let task = orchestrator
                .submit(Operation::AddNode {
                    hostname: host.into(),
                    capacity_bytes: 1 << 40,
                    fault_domain: None,
                })
                .unwrap();
            orchestrator.wait(&task.id).await.unwrap();
        }

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/volumes",
                serde_json::json!({
                    "name": "gv0",
                    "volumeType": "replicate",
                    "replicaCount": 2,
                    "capacity": "10Gi"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let task = body_json(response).await;
        orchestrator
            .wait(&TaskId::new(task["id"].as_str().unwrap()))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/v1/volumes/gv0/options/io-threads.thread-count",
                serde_json::json!({"value": "8"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(Request::get("/v1/volumes/gv0/options").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["io-threads.thread-count"], "8");

        let response = app
            .clone()
            .oneshot(Request::get("/v1/volumes/gv0/volfiles").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let compiled = body_json(response).await;
        assert!(compiled["client"]
            .as_str()
            .unwrap()
            .contains("type cluster/replicate"));
        assert_eq!(compiled["server"].as_object().unwrap().len(), 2);

        let response = app
            .oneshot(Request::get("/v1/volumes/gv0").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let volume = body_json(response).await;
        assert_eq!(volume["state"], "created");
        assert_eq!(volume["bricks"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = router();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (app, _) = router();
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
