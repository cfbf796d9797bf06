//! HTTP API layer.
//!
//! Thin request/response translation into blocking-engine calls.
//! Validation and not-found conditions map to client errors, storage
//! failures to server errors; external-delivery failures never surface
//! here.

use crate::blocker::{Blocker, Policy};
use crate::storage::{AuthenticationEntry, BlockEntry, ExternalModule, Storage, StorageError};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub blocker: Arc<Blocker>,
    pub store: Arc<dyn Storage>,
    /// `Some` when API-key enforcement is enabled.
    pub api_key: Option<String>,
}

enum ApiError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e)
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        Self::Internal(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            Self::Internal(e) => {
                error!(error = ?e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct Success {
    success: bool,
}

fn success() -> Json<Success> {
    Json(Success { success: true })
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/blocked/:ip", get(blocked_query))
        .route("/block/:ip", post(block))
        .route("/unblock/:ip", post(unblock))
        .route("/blocks", get(list_blocks))
        .route("/policy", get(get_policy).patch(update_policy))
        .route("/modules", get(list_modules))
        .route("/module", put(register_module))
        .route("/module/:id", delete(remove_module))
        .route("/entries", get(list_sources))
        .route("/entries/list/:ip", get(list_entries))
        .route("/entries/add/:ip", put(add_entry));

    // Browser dashboards call the API cross-origin; the CORS layer is
    // outermost so preflights never reach the key gate.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(cors)
        .with_state(state)
}

/// API-key gate on the `key` query parameter: 401 when missing, 403 on
/// mismatch. Disabled when no key is configured.
async fn require_api_key(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.api_key {
        match params.get("key") {
            None => return StatusCode::UNAUTHORIZED.into_response(),
            Some(key) if key != expected => return StatusCode::FORBIDDEN.into_response(),
            Some(_) => {}
        }
    }

    next.run(req).await
}

#[derive(Serialize)]
struct BlockedResponse {
    blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    entry: Option<BlockEntry>,
}

async fn blocked_query(
    State(state): State<AppState>,
    Path(ip): Path<IpAddr>,
) -> ApiResult<Json<BlockedResponse>> {
    let (blocked, entry) = state.blocker.is_blocked(ip).await?;
    Ok(Json(BlockedResponse { blocked, entry }))
}

async fn block(
    State(state): State<AppState>,
    Path(ip): Path<IpAddr>,
) -> ApiResult<Json<BlockEntry>> {
    Ok(Json(state.blocker.block_ip(ip).await?))
}

async fn unblock(
    State(state): State<AppState>,
    Path(ip): Path<IpAddr>,
) -> ApiResult<Json<Success>> {
    let blocked = matches!(state.blocker.is_blocked(ip).await, Ok((true, _)));
    if !blocked {
        return Err(ApiError::BadRequest(format!("{ip} is not blocked")));
    }

    state.blocker.unblock_ip(ip).await?;
    Ok(success())
}

async fn list_blocks(State(state): State<AppState>) -> ApiResult<Json<Vec<BlockEntry>>> {
    Ok(Json(state.store.all_block_entries(true).await?))
}

async fn get_policy(State(state): State<AppState>) -> Json<Policy> {
    Json(state.blocker.policy())
}

async fn update_policy(
    State(state): State<AppState>,
    Json(policy): Json<Policy>,
) -> ApiResult<Json<Policy>> {
    if !policy.is_valid() {
        return Err(ApiError::BadRequest(
            "attempts, period and blocktime must all be at least 1".to_string(),
        ));
    }

    state.blocker.update_policy(policy);
    Ok(Json(state.blocker.policy()))
}

async fn list_modules(State(state): State<AppState>) -> ApiResult<Json<Vec<ExternalModule>>> {
    Ok(Json(state.store.external_modules().await?))
}

/// Registration payload; the id is assigned by the service.
#[derive(Deserialize)]
struct ModuleSpec {
    address: String,
    method: String,
}

async fn register_module(
    State(state): State<AppState>,
    Json(spec): Json<ModuleSpec>,
) -> ApiResult<Json<ExternalModule>> {
    if reqwest::Method::from_bytes(spec.method.as_bytes()).is_err() {
        return Err(ApiError::BadRequest(format!("invalid method {:?}", spec.method)));
    }
    if reqwest::Url::parse(&spec.address).is_err() {
        return Err(ApiError::BadRequest(format!("invalid address {:?}", spec.address)));
    }

    // Re-registering an address updates in place under the old id.
    let id = match state.store.find_module_by_address(&spec.address).await {
        Ok(existing) => existing.id,
        Err(StorageError::NotFound) => rand::random(),
        Err(e) => return Err(e.into()),
    };

    let module = ExternalModule { id, address: spec.address, method: spec.method };
    state.store.add_external_module(module.clone()).await?;
    Ok(Json(module))
}

async fn remove_module(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> ApiResult<Json<Success>> {
    state.store.remove_external_module(id).await?;
    Ok(success())
}

async fn list_sources(State(state): State<AppState>) -> ApiResult<Json<HashMap<IpAddr, usize>>> {
    Ok(Json(state.store.find_sources().await?))
}

async fn list_entries(
    State(state): State<AppState>,
    Path(ip): Path<IpAddr>,
) -> ApiResult<Json<Vec<AuthenticationEntry>>> {
    let entries = match state.store.find_auth_entries(ip).await {
        Ok(entries) => entries.into_iter().collect(),
        Err(StorageError::NotFound) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(Json(entries))
}

async fn add_entry(
    State(state): State<AppState>,
    Path(ip): Path<IpAddr>,
    Json(entry): Json<AuthenticationEntry>,
) -> ApiResult<Json<Success>> {
    if !entry.is_valid() || entry.source != ip {
        return Err(ApiError::BadRequest("invalid entry data".to_string()));
    }

    state.blocker.add_entry(entry).await?;
    Ok(success())
}
