//! REST API route handlers for the daemon HTTP server
//!
//! Thin mapping from validated request bodies onto the provisioning
//! service. Every response uses the `{ok:true,data}` /
//! `{ok:false,error}` envelope.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{MeshError, ServiceError, WgMeshError};
use crate::keys::DeterministicPsk;
use crate::mesh::{self, MeshSpec};
use crate::runtime::WgRuntime;
use crate::service::{
    ApplyRequest, DeployRequest, ProvisioningService, ReconcileRequest, ToggleRequest,
};

/// Filename of the generated bundle attachment.
const BUNDLE_FILENAME: &str = "wg-mesh-config.zip";

const DEFAULT_AUDIT_LIMIT: usize = 50;

/// Shared application state for route handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ProvisioningService>,
}

/// API error payload inside the failure envelope.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.code.as_str() {
            "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            "REVISION_CONFLICT" => StatusCode::CONFLICT,
            "INTERFACE_NOT_FOUND" => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<WgMeshError> for ApiError {
    fn from(err: WgMeshError) -> Self {
        let details = match &err {
            WgMeshError::Service(ServiceError::RevisionConflict { expected, received }) => {
                Some(json!({ "expected": expected, "received": received }))
            }
            WgMeshError::Mesh(MeshError::Validation { field, .. }) => {
                Some(json!({ "field": field }))
            }
            _ => None,
        };
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({ "ok": false, "error": self });
        (status, Json(body)).into_response()
    }
}

fn ok_envelope<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "data": data }))
}

/// Build the API router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/interfaces", get(handle_list_interfaces))
        .route("/api/interface/:name", get(handle_interface_details))
        .route("/api/interface/:name/peers/apply", post(handle_apply))
        .route("/api/interface/:name/toggle", post(handle_toggle))
        .route("/api/interface/:name/reconcile", post(handle_reconcile))
        .route("/api/interface/:name/audit", get(handle_audit))
        .route("/api/generate", post(handle_generate))
        .route("/api/deploy", post(handle_deploy))
        .with_state(state)
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
    pub cursor: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployBody {
    pub payload: MeshSpec,
    pub node_name: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/health - liveness plus best-effort host info
async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let info = state.service.runtime().get_system_info().await;
    ok_envelope(json!({
        "status": "ok",
        "hostname": info.hostname,
        "version": info.version,
    }))
}

/// GET /api/interfaces - union of persisted and live interfaces
async fn handle_list_interfaces(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let interfaces = state.service.list_interfaces().await?;
    Ok(ok_envelope(json!({ "interfaces": interfaces })))
}

/// GET /api/interface/:name - merged persisted + runtime view
async fn handle_interface_details(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let details = state.service.interface_details(&name).await?;
    Ok(ok_envelope(details))
}

/// POST /api/interface/:name/peers/apply - dry-run or transactional apply
async fn handle_apply(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ApplyRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state.service.apply_peer_operations(&name, request).await?;
    Ok(ok_envelope(result))
}

/// POST /api/interface/:name/toggle - bring the interface up or down
async fn handle_toggle(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ToggleRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let details = state.service.toggle_interface_state(&name, request).await?;
    Ok(ok_envelope(details))
}

/// POST /api/interface/:name/reconcile - drift detection and repair
async fn handle_reconcile(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ReconcileRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state.service.reconcile_interface(&name, request).await?;
    Ok(ok_envelope(result))
}

/// GET /api/interface/:name/audit?limit=&cursor= - newest-first audit page
async fn handle_audit(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let page = state.service.audit_page(
        &name,
        query.limit.unwrap_or(DEFAULT_AUDIT_LIMIT),
        query.cursor,
    );
    Ok(ok_envelope(page))
}

/// POST /api/generate - synthesize a mesh and stream the bundle
async fn handle_generate(Json(spec): Json<MeshSpec>) -> Result<Response, ApiError> {
    let mesh = mesh::resolve(&spec).map_err(WgMeshError::from)?;
    let bundle =
        mesh::render_bundle(&spec, &mesh, &DeterministicPsk).map_err(WgMeshError::from)?;
    let bytes = mesh::build_zip(&bundle).map_err(WgMeshError::from)?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{BUNDLE_FILENAME}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// POST /api/deploy - resolve the mesh and push one node's config
async fn handle_deploy(
    State(state): State<AppState>,
    Json(body): Json<DeployBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mesh = mesh::resolve(&body.payload).map_err(WgMeshError::from)?;
    let request = DeployRequest::for_node(&body.payload, &mesh, &body.node_name)?;
    let result = state.service.deploy_mesh_config(request).await?;
    Ok(ok_envelope(result))
}
