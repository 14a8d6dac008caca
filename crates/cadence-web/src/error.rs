//! Error types for the lifecycle API.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use cadence_scheduler::SchedulerError;
use cadence_store::StoreError;

/// Errors surfaced by API handlers.
#[derive(Debug, Error)]
pub enum WebError {
    /// Scheduler error.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Request lacks a valid `x-user-id` header.
    #[error("missing or invalid x-user-id header")]
    Unauthorized,

    /// Campaign exists but belongs to another user.
    #[error("campaign belongs to another user")]
    Forbidden,

    /// No such campaign.
    #[error("campaign not found")]
    NotFound,
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebError::Unauthorized => StatusCode::UNAUTHORIZED,
            WebError::Forbidden => StatusCode::FORBIDDEN,
            WebError::NotFound => StatusCode::NOT_FOUND,
            WebError::Scheduler(SchedulerError::CampaignNotFound(_)) => StatusCode::NOT_FOUND,
            WebError::Scheduler(SchedulerError::AlreadyRunning(_)) => StatusCode::CONFLICT,
            WebError::Scheduler(SchedulerError::InvalidPacing(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            WebError::Scheduler(SchedulerError::Store(_)) | WebError::Store(_) => {
                error!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
