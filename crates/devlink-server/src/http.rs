//! HTTP request handlers
//!
//! JSON API over linking sessions plus the QR image and stream endpoints.

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use devlink_auth::{DeviceSummary, Finalized, Session, SessionId, Transition};
use devlink_core::{Error, ProviderKind, SessionStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;
use uuid::Uuid;

use crate::qr;
use crate::service::CreateSession;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Session API
        .route("/api/sessions", post(create_session_handler))
        .route("/api/sessions/:id", get(session_status_handler))
        .route("/api/sessions/:id/scan", post(scan_handler))
        .route("/api/sessions/:id/link", post(link_handler))
        .route("/api/sessions/:id/cancel", post(cancel_handler))
        .route("/api/sessions/:id/qr", get(session_qr_handler))
        .route("/api/sessions/:id/stream", get(crate::websocket::stream_ws_handler))
        .route(
            "/api/sessions/:id/credentials",
            delete(forget_credentials_handler),
        )
        // Device API
        .route("/api/devices", get(list_devices_handler))
        .route("/api/devices/current", get(current_device_handler))
        // Server info
        .route("/api/info", get(server_info_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

/// Error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// Current session status for rejected transitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
}

/// Maps [`Error`] onto HTTP status codes
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Expired(_) => StatusCode::GONE,
            Error::InvalidTransition { .. } | Error::Conflict(_) => StatusCode::CONFLICT,
            Error::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::Storage(_) | Error::Io(_) | Error::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            status: self.0.current_status(),
        };
        (status, Json(body)).into_response()
    }
}

/// Unparseable ids are reported as unknown sessions
pub(crate) fn parse_session_id(id: &str) -> Result<SessionId, ApiError> {
    SessionId::parse(id).map_err(|_| ApiError(Error::NotFound(id.to_string())))
}

// ============================================================================
// Session API Handlers
// ============================================================================

/// Request body for `POST /api/sessions`
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub tenant_id: Uuid,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub device_info: Option<String>,
}

/// Session as seen by API clients
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub tenant_id: Uuid,
    pub status: SessionStatus,
    pub provider: ProviderKind,
    pub qr_payload: String,
    pub device_info: Option<String>,
    /// Present only once completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_credential: Option<String>,
    pub expires_at: DateTime<Utc>,
    /// Seconds remaining until expiration
    pub expires_in: i64,
}

impl From<&Session> for SessionResponse {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.to_string(),
            tenant_id: session.tenant_id,
            status: session.status,
            provider: session.provider,
            qr_payload: session.qr_payload.clone(),
            device_info: session.device_info.clone(),
            linked_credential: session.linked_credential.clone(),
            expires_at: session.expires_at,
            expires_in: session.expires_in(Utc::now()),
        }
    }
}

/// Result of scan and cancel
#[derive(Debug, Serialize, Deserialize)]
pub struct TransitionResponse {
    #[serde(flatten)]
    pub session: SessionResponse,
    /// Whether this request changed the session
    pub applied: bool,
}

impl From<Transition> for TransitionResponse {
    fn from(transition: Transition) -> Self {
        Self {
            session: SessionResponse::from(&transition.session),
            applied: transition.applied,
        }
    }
}

/// Optional body for `POST /api/sessions/:id/link`
#[derive(Debug, Default, Deserialize)]
pub struct LinkRequest {
    #[serde(default)]
    pub device_info: Option<String>,
}

/// Result of finalization
#[derive(Debug, Serialize, Deserialize)]
pub struct LinkResponse {
    pub session_id: String,
    pub status: SessionStatus,
    /// Bearer credential for the linked device
    pub credential: String,
    pub device_id: Option<String>,
    pub device_info: Option<String>,
    /// False when the session had already been linked
    pub newly_linked: bool,
}

impl From<Finalized> for LinkResponse {
    fn from(finalized: Finalized) -> Self {
        Self {
            session_id: finalized.session.id.to_string(),
            status: finalized.session.status,
            credential: finalized.credential,
            device_id: finalized.device_id.map(|id| id.to_string()),
            device_info: finalized.session.device_info,
            newly_linked: finalized.newly_linked,
        }
    }
}

/// Create a linking session
async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let session = state
        .service
        .create_session(CreateSession {
            tenant_id: request.tenant_id,
            provider: request.provider,
            device_info: request.device_info,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(SessionResponse::from(&session))))
}

/// Current session state, expired lazily
async fn session_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let id = parse_session_id(&id)?;
    let session = state.controller().status(&id).await?;
    Ok(Json(SessionResponse::from(&session)))
}

/// Report that the QR code was scanned
async fn scan_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let id = parse_session_id(&id)?;
    let transition = state.controller().mark_scanned(&id).await?;
    Ok(Json(transition.into()))
}

/// Finalize a scanned session
async fn link_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    body: Option<Json<LinkRequest>>,
) -> Result<Json<LinkResponse>, ApiError> {
    let id = parse_session_id(&id)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let finalized = state.controller().finalize(&id, request.device_info).await?;
    Ok(Json(finalized.into()))
}

/// Cancel a scanned session
async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<TransitionResponse>, ApiError> {
    let id = parse_session_id(&id)?;
    let transition = state.controller().cancel(&id).await?;
    Ok(Json(transition.into()))
}

/// Query parameters for QR code generation
#[derive(Debug, Deserialize)]
pub struct QrQuery {
    /// QR code size in pixels (default 200)
    #[serde(default = "default_qr_size")]
    size: u32,
}

fn default_qr_size() -> u32 {
    200
}

/// Render the current QR payload as PNG
async fn session_qr_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<QrQuery>,
) -> Result<Response, ApiError> {
    let id = parse_session_id(&id)?;
    let session = state.controller().status(&id).await?;
    if session.status == SessionStatus::Expired {
        return Err(ApiError(Error::Expired(id.to_string())));
    }

    let png = qr::render_png(&session.qr_payload, query.size)
        .map_err(|e| ApiError(Error::Storage(e.to_string())))?;
    debug!("Rendered {} byte QR for session {}", png.len(), id);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        png,
    )
        .into_response())
}

/// Response for explicit logout
#[derive(Debug, Serialize, Deserialize)]
pub struct ForgetResponse {
    pub removed: usize,
}

/// Drop the live provider's stored handshake material
async fn forget_credentials_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<ForgetResponse>, ApiError> {
    let id = parse_session_id(&id)?;
    let removed = state.controller().forget_credentials(&id).await?;
    Ok(Json(ForgetResponse { removed }))
}

// ============================================================================
// Device Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DevicesQuery {
    tenant_id: Uuid,
}

/// List devices linked for a tenant
async fn list_devices_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DevicesQuery>,
) -> Result<Json<Vec<DeviceSummary>>, ApiError> {
    let devices = state.controller().list_devices(query.tenant_id).await?;
    Ok(Json(devices.iter().map(DeviceSummary::from).collect()))
}

/// Extract a bearer credential from the Authorization header
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Identify the device a bearer credential belongs to
async fn current_device_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<DeviceSummary>, Response> {
    let token = extract_bearer(&headers)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "Authentication required").into_response())?;

    match state.controller().validate_credential(token).await {
        Ok(Some(device)) => Ok(Json(DeviceSummary::from(&device))),
        Ok(None) => Err((StatusCode::UNAUTHORIZED, "Invalid credential").into_response()),
        Err(e) => Err(ApiError(e).into_response()),
    }
}

// ============================================================================
// Server Info
// ============================================================================

/// Server information response
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server version
    pub version: String,
    /// Provider kinds sessions can be created with
    pub providers: Vec<ProviderKind>,
    pub default_provider: ProviderKind,
    /// Session lifetime in seconds
    pub session_ttl_secs: i64,
    /// Base URL embedded in static QR payloads
    pub public_url: String,
    /// Sessions with an open live connection
    pub live_connections: usize,
}

/// Get server information
async fn server_info_handler(State(state): State<Arc<AppState>>) -> Json<ServerInfo> {
    Json(ServerInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        providers: state.service.available_providers(),
        default_provider: state.config.default_provider,
        session_ttl_secs: state.config.session_ttl_secs,
        public_url: state.config.base_url(),
        live_connections: state.service.live_connections(),
    })
}
