//! HTTP route handlers for the API.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, Request, State,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use mnemos_common::{ConversationTurn, MnemosError};
use mnemos_memory::{
    CandidateMemory, DetectionRequest, Memory, MemoryCategory, Relationship, RetrievedMemory, ServiceStats,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::AppState;

pub const OWNER_HEADER: &str = "x-owner-id";

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

/// Error returned by handlers, rendered as [`ErrorResponse`].
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorResponse {
                error: message.into(),
                code: "VALIDATION_ERROR",
            },
        }
    }
}

impl From<MnemosError> for ApiError {
    fn from(err: MnemosError) -> Self {
        let (status, code) = match &err {
            MnemosError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            MnemosError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            MnemosError::BackendUnavailable(_)
            | MnemosError::EmbeddingUnavailable(_)
            | MnemosError::CircuitOpen { .. }
            | MnemosError::Timeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "BACKEND_UNAVAILABLE"),
            _ => {
                error!(error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };
        Self {
            status,
            body: ErrorResponse {
                error: err.to_string(),
                code,
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Tenant named by the `x-owner-id` header.
#[derive(Debug, Clone)]
pub struct Owner(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::bad_request(format!("missing {OWNER_HEADER} header")))?;
        Ok(Owner(value.to_string()))
    }
}

/// JSON request body whose rejections render as [`ErrorResponse`].
#[derive(Debug)]
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// A memory as returned over HTTP; the embedding stays server-side.
#[derive(Debug, Serialize)]
pub struct MemoryResponse {
    pub id: String,
    pub content: String,
    pub category: MemoryCategory,
    pub importance: f32,
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<Memory> for MemoryResponse {
    fn from(m: Memory) -> Self {
        Self {
            id: m.id,
            content: m.content,
            category: m.category,
            importance: m.importance,
            keywords: m.keywords,
            source_conversation_id: m.source_conversation_id,
            source_message_id: m.source_message_id,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub memories: usize,
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        memories: state.memory.store().len(),
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateMemoryRequest {
    pub content: String,
    pub category: String,
    #[serde(default = "default_importance")]
    pub importance: f32,
    #[serde(default)]
    pub keywords: Vec<String>,
}

fn default_importance() -> f32 {
    0.5
}

/// Store a memory directly. Duplicates return the existing memory.
pub async fn create_memory(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    ApiJson(request): ApiJson<CreateMemoryRequest>,
) -> Result<(StatusCode, Json<MemoryResponse>), ApiError> {
    let category: MemoryCategory = request.category.parse()?;
    let candidate =
        CandidateMemory::new(request.content, category, request.importance).with_keywords(request.keywords);
    let memory = state.memory.insert_manual(&owner, candidate).await?;
    info!(owner_id = %owner, memory_id = %memory.id, "Memory stored via API");
    Ok((StatusCode::CREATED, Json(memory.into())))
}

pub async fn list_memories(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
) -> Json<Vec<MemoryResponse>> {
    Json(state.memory.list(&owner).into_iter().map(Into::into).collect())
}

pub async fn get_memory(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<Json<MemoryResponse>, ApiError> {
    Ok(Json(state.memory.get(&owner, &id)?.into()))
}

pub async fn delete_memory(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.memory.delete(&owner, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn memory_relationships(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<Json<Vec<Relationship>>, ApiError> {
    Ok(Json(state.memory.relationships(&owner, &id)?))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Comma-separated
    #[serde(default)]
    pub hints: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchHit {
    pub memory: MemoryResponse,
    pub similarity: f32,
    pub score: f32,
}

impl From<RetrievedMemory> for SearchHit {
    fn from(r: RetrievedMemory) -> Self {
        Self {
            memory: r.memory.into(),
            similarity: r.similarity,
            score: r.score,
        }
    }
}

fn split_hints(raw: Option<&str>) -> Vec<String> {
    raw.map(|h| {
        h.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Ranked memories for a query. Limit 0 or absent uses the configured default.
pub async fn search_memories(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<Vec<SearchHit>>, ApiError> {
    let Query(params) = params?;
    let hints = split_hints(params.hints.as_deref());
    debug!(owner_id = %owner, query = %params.q, hints = ?hints, "Searching memories");
    let results = state
        .memory
        .search(&owner, &params.q, &hints, params.limit.unwrap_or(0))
        .await?;
    Ok(Json(results.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Deserialize)]
pub struct ContextRequest {
    pub query: String,
    #[serde(default)]
    pub hints: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ContextResponse {
    pub context: String,
}

/// Prompt-ready memory block for a query. Empty when nothing qualifies.
pub async fn build_context(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    ApiJson(request): ApiJson<ContextRequest>,
) -> Json<ContextResponse> {
    let context = state.memory.build_context(&owner, &request.query, &request.hints).await;
    Json(ContextResponse { context })
}

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TurnAccepted {
    pub task_id: String,
}

/// Queue memory detection for a chat turn. Returns before detection runs.
pub async fn observe_turn(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    ApiJson(request): ApiJson<TurnRequest>,
) -> Result<(StatusCode, Json<TurnAccepted>), ApiError> {
    let detection = DetectionRequest::new(owner, request.message)
        .with_history(request.history)
        .with_source(request.conversation_id, request.message_id);
    let handle = state.memory.observe_turn(detection)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TurnAccepted {
            task_id: handle.id().to_string(),
        }),
    ))
}

/// Drop a queued task of the caller that has not started.
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.memory.cancel_task(&owner, &id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(MnemosError::not_found(id).into())
    }
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<ServiceStats> {
    Json(state.memory.stats())
}
