//! Birthday CRUD API
//!
//! Mutations publish the matching birthday lifecycle event after the store
//! call succeeds. Publishing happens off the request path and never changes
//! the response.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::events::{
    ConsumerState, EventPublisher, BIRTHDAY_CREATED, BIRTHDAY_DELETED, BIRTHDAY_UPDATED,
};
use crate::models::{
    Birthday, CreateBirthdayRequest, ErrorResponse, UpdateBirthdayRequest, UserRef,
};
use crate::store::{BirthdayStore, StoreError};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BirthdayStore>,
    pub publisher: Arc<EventPublisher>,
    pub consumer_state: watch::Receiver<ConsumerState>,
}

pub fn birthdays_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/birthdays", get(list_birthdays).post(create_birthday))
        .route(
            "/birthdays/{id}",
            get(get_birthday).put(update_birthday).delete(delete_birthday),
        )
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("birthday {0} not found")]
    NotFound(String),

    #[error("birthday {0} already exists")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Store(e) => {
                tracing::error!(error = %e, "Store operation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "store_error")
            }
        };

        let message = match &self {
            ApiError::Store(_) => "Failed to access birthday records".to_string(),
            other => other.to_string(),
        };

        (
            status,
            Json(ErrorResponse {
                error: error.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let consumer = *state.consumer_state.borrow();
    Json(serde_json::json!({
        "status": "healthy",
        "module": "birthdays",
        "version": env!("CARGO_PKG_VERSION"),
        "consumer": consumer
    }))
}

/// GET /birthdays
async fn list_birthdays(
    State(state): State<AppState>,
) -> Result<Json<Vec<Birthday>>, ApiError> {
    Ok(Json(state.store.list_all().await?))
}

/// GET /birthdays/{id}
async fn get_birthday(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Birthday>, ApiError> {
    state
        .store
        .get(&id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

/// POST /birthdays - id is generated when omitted
async fn create_birthday(
    State(state): State<AppState>,
    body: Result<Json<CreateBirthdayRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Birthday>), ApiError> {
    let Json(req) = body?;

    let id = match req.id {
        Some(id) if id.trim().is_empty() => {
            return Err(ApiError::BadRequest("id cannot be empty".to_string()));
        }
        Some(id) => id,
        None => Uuid::new_v4().to_string(),
    };

    if !state.store.upsert_if_absent(&id, req.birthday).await? {
        return Err(ApiError::Conflict(id));
    }

    let record = Birthday::new(id, req.birthday);
    tracing::info!(user_id = %record.id, "Birthday created via API");
    state.publisher.publish_detached(BIRTHDAY_CREATED, &record);

    Ok((StatusCode::CREATED, Json(record)))
}

/// PUT /birthdays/{id} - only existing records are updated
async fn update_birthday(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<UpdateBirthdayRequest>, JsonRejection>,
) -> Result<Json<Birthday>, ApiError> {
    let Json(req) = body?;

    let record = state
        .store
        .update_birthday(&id, req.birthday)
        .await?
        .ok_or(ApiError::NotFound(id))?;

    tracing::info!(user_id = %record.id, "Birthday updated via API");
    state.publisher.publish_detached(BIRTHDAY_UPDATED, &record);

    Ok(Json(record))
}

/// DELETE /birthdays/{id} - 204 whether or not the record existed
async fn delete_birthday(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.store.delete_if_present(&id).await? {
        tracing::info!(user_id = %id, "Birthday deleted via API");
        state
            .publisher
            .publish_detached(BIRTHDAY_DELETED, &UserRef { id });
    }

    Ok(StatusCode::NO_CONTENT)
}
