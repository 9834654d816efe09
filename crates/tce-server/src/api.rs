//! HTTP/JSON API
//!
//! Exposes the coordination engine over REST:
//! - Versioned records and optimistic updates
//! - Saga start, status and cancellation
//! - Two-phase commit start and status
//! - Advisory lock acquire and release
//! - Policy-routed submit, health and statistics

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use tce_common::prelude::*;
use tce_txn::{
    CoordinationEngine, EngineStats, LockOutcome, Mutation, OccOutcome, SagaInstance,
    SubmitOutcome, TransactionRequest, VersionedRecord,
};

// ============================================================================
// State and errors
// ============================================================================

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CoordinationEngine>,
}

impl AppState {
    pub fn new(engine: Arc<CoordinationEngine>) -> Self {
        Self { engine }
    }
}

/// Error body returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Payload>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Payload) -> Self {
        self.details = Some(details);
        self
    }
}

type ApiFailure = (StatusCode, Json<ApiError>);
type ApiResult<T> = std::result::Result<Json<T>, ApiFailure>;

/// HTTP status for an engine error, by failure class.
pub fn status_for(err: &Error) -> StatusCode {
    match err.class() {
        ErrorClass::Contention => StatusCode::CONFLICT,
        ErrorClass::Client => match err {
            Error::NotFound(_, _) => StatusCode::NOT_FOUND,
            Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::BAD_REQUEST,
        },
        ErrorClass::Transient | ErrorClass::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorClass::Protocol => StatusCode::BAD_GATEWAY,
        ErrorClass::Fatal | ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn engine_error(err: Error) -> ApiFailure {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(code = err.code(), error = %err, "request failed");
    }
    (status, Json(ApiError::new(err.code(), err.to_string())))
}

fn bad_request(message: impl Into<String>) -> ApiFailure {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new("INVALID_ARGUMENT", message)),
    )
}

fn parse_saga_id(raw: &str) -> std::result::Result<SagaId, ApiFailure> {
    raw.parse()
        .map_err(|_| bad_request(format!("invalid saga id: {raw}")))
}

fn to_payload<T: Serialize>(value: &T) -> std::result::Result<Payload, ApiFailure> {
    serde_json::to_value(value).map_err(|e| engine_error(e.into()))
}

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecordRequest {
    pub expected_version: u64,
    pub mutation: Mutation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSagaRequest {
    pub saga_type: String,
    #[serde(default)]
    pub context_data: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStarted {
    pub saga_id: SagaId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTransactionRequest {
    pub participants: Vec<ParticipantId>,
    #[serde(default)]
    pub payload: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionStarted {
    pub transaction_id: TxnId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireLockRequest {
    pub resource_key: ResourceKey,
    pub lock_type: LockType,
    pub owner_id: OwnerId,
    /// Lease in seconds; 0 or absent takes the configured default
    #[serde(default)]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseLockResponse {
    pub released: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub coordinator_id: String,
    pub uptime_seconds: u64,
}

// ============================================================================
// Router
// ============================================================================

/// Build the API router with tracing and CORS layers.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        // Records
        .route("/records/:key", get(read_record))
        .route("/records/:key/update", post(update_record))
        // Sagas
        .route("/sagas", post(start_saga))
        .route("/sagas/:id", get(get_saga))
        .route("/sagas/:id/cancel", post(cancel_saga))
        // Two-phase commit
        .route("/transactions", post(start_transaction))
        .route("/transactions/:id", get(get_transaction))
        .route("/transactions/:id/cancel", post(cancel_transaction))
        // Locks
        .route("/locks", post(acquire_lock))
        .route("/locks/:key/:owner", delete(release_lock))
        // Routing
        .route("/submit", post(submit))
        // Admin
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

async fn read_record(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<VersionedRecord> {
    let record = state
        .engine
        .read_record(&ResourceKey::new(key))
        .await
        .map_err(engine_error)?;
    Ok(Json(record))
}

/// Contention outcomes are reported as 409 with the outcome in `details`.
async fn update_record(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<UpdateRecordRequest>,
) -> ApiResult<OccOutcome> {
    let key = ResourceKey::new(key);
    let outcome = state
        .engine
        .execute_optimistic_update(&key, request.expected_version, &request.mutation)
        .await
        .map_err(engine_error)?;

    if outcome.is_success() {
        return Ok(Json(outcome));
    }
    let details = to_payload(&outcome)?;
    let err = ApiError::new(outcome.code(), format!("update of {key} rejected")).with_details(details);
    Err((StatusCode::CONFLICT, Json(err)))
}

async fn start_saga(
    State(state): State<AppState>,
    Json(request): Json<StartSagaRequest>,
) -> std::result::Result<(StatusCode, Json<SagaStarted>), ApiFailure> {
    let saga_id = state
        .engine
        .start_saga(&request.saga_type, request.context_data)
        .map_err(engine_error)?;
    Ok((StatusCode::ACCEPTED, Json(SagaStarted { saga_id })))
}

async fn get_saga(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SagaInstance> {
    let saga_id = parse_saga_id(&id)?;
    let saga = state.engine.get_saga_status(saga_id).map_err(engine_error)?;
    Ok(Json(saga))
}

async fn cancel_saga(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<SagaInstance> {
    let saga_id = parse_saga_id(&id)?;
    let saga = state.engine.cancel_saga(saga_id).map_err(engine_error)?;
    Ok(Json(saga))
}

async fn start_transaction(
    State(state): State<AppState>,
    Json(request): Json<StartTransactionRequest>,
) -> std::result::Result<(StatusCode, Json<TransactionStarted>), ApiFailure> {
    let transaction_id = state
        .engine
        .start_two_phase_commit(request.participants, request.payload)
        .map_err(engine_error)?;
    Ok((StatusCode::ACCEPTED, Json(TransactionStarted { transaction_id })))
}

/// Retained transactions return the full record. Collected or unknown ones
/// return only the outcome, which is `aborted` under presumed abort.
async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Payload> {
    let txn_id = TxnId(id);
    match state.engine.get_transaction_status(txn_id) {
        Ok(txn) => Ok(Json(to_payload(&txn)?)),
        Err(Error::NotFound(_, _)) => match state.engine.coordinator().get_state(txn_id) {
            Some(status) => Ok(Json(serde_json::json!({
                "transaction_id": txn_id,
                "status": status,
                "retained": false,
            }))),
            None => Err(engine_error(Error::not_found("Transaction", txn_id.to_string()))),
        },
        Err(err) => Err(engine_error(err)),
    }
}

async fn cancel_transaction(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Payload> {
    let txn = state
        .engine
        .cancel_transaction(TxnId(id))
        .await
        .map_err(engine_error)?;
    Ok(Json(to_payload(&txn)?))
}

async fn acquire_lock(
    State(state): State<AppState>,
    Json(request): Json<AcquireLockRequest>,
) -> ApiResult<LockOutcome> {
    let outcome = state
        .engine
        .acquire_lock(
            &request.resource_key,
            request.lock_type,
            &request.owner_id,
            request.timeout_seconds,
        )
        .map_err(engine_error)?;

    match outcome {
        LockOutcome::Acquired(_) => Ok(Json(outcome)),
        LockOutcome::Conflict { .. } => {
            let details = to_payload(&outcome)?;
            let err = ApiError::new(
                "LOCK_CONFLICT",
                format!("{} is held by an incompatible owner", request.resource_key),
            )
            .with_details(details);
            Err((StatusCode::CONFLICT, Json(err)))
        }
    }
}

async fn release_lock(
    State(state): State<AppState>,
    Path((key, owner)): Path<(String, String)>,
) -> Json<ReleaseLockResponse> {
    let released = state
        .engine
        .release_lock(&ResourceKey::new(key), &OwnerId::new(owner));
    Json(ReleaseLockResponse { released })
}

async fn submit(
    State(state): State<AppState>,
    Json(request): Json<TransactionRequest>,
) -> ApiResult<SubmitOutcome> {
    let outcome = state.engine.submit(request).await.map_err(engine_error)?;
    Ok(Json(outcome))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.engine.stats();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        coordinator_id: state.engine.config().two_phase.coordinator_id.clone(),
        uptime_seconds: stats.uptime_seconds,
    })
}

async fn stats(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.engine.stats())
}
