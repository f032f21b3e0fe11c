//! Error handling module
//!
//! Provides unified error types and handling for the entire application.

use crate::chain::ChainError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Application-wide error type
#[derive(Error, Debug, Clone)]
pub enum AppError {
    /// Realm or multisig lacks something this service needs. Needs an operator.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Account does not exist on-chain (yet)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Multisig transaction cannot execute yet
    #[error("Threshold not met: {approvals}/{threshold} approvals")]
    ThresholdNotMet { approvals: usize, threshold: u16 },

    /// Creating a multisig transaction or governance proposal was rejected
    #[error("Creation failed: {0}")]
    CreationFailed(ChainError),

    /// Vote, approval or execution was rejected
    #[error("Submission failed: {0}")]
    SubmissionFailed(ChainError),

    /// Reading from the cluster failed
    #[error("Cluster unavailable: {0}")]
    Unavailable(ChainError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl AppError {
    /// Whether the same call may simply be repeated.
    ///
    /// Creation is never retryable as-is: a blind retry can mint a second,
    /// disconnected multisig transaction. Re-read the multisig first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::NotFound(_) | AppError::SubmissionFailed(_) | AppError::Unavailable(_)
        )
    }

    /// Underlying chain error, if this wraps one
    pub fn chain_error(&self) -> Option<&ChainError> {
        match self {
            AppError::CreationFailed(e) | AppError::SubmissionFailed(e) | AppError::Unavailable(e) => {
                Some(e)
            }
            _ => None,
        }
    }
}

/// Error response structure
///
/// `data` carries whatever else happened before the failure, flattened
/// into the body next to the error fields.
#[derive(Serialize)]
pub struct ErrorResponse<T: Serialize = ()> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.into_response_with::<()>(None)
    }
}

impl AppError {
    /// Error response with extra fields attached to the body
    pub fn into_response_with<T: Serialize>(self, data: Option<T>) -> Response {
        let (status, error_code, message, details) = match &self {
            AppError::Configuration(msg) => {
                error!("Configuration error: {}", msg);
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "CONFIGURATION_ERROR",
                    msg.clone(),
                    None,
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None),
            AppError::ThresholdNotMet { .. } => (
                StatusCode::CONFLICT,
                "THRESHOLD_NOT_MET",
                self.to_string(),
                None,
            ),
            AppError::CreationFailed(e) => {
                error!("Creation failed: {}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    "CREATION_FAILED",
                    "The program rejected the creation request".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::SubmissionFailed(e) => (
                StatusCode::BAD_GATEWAY,
                "SUBMISSION_FAILED",
                "The program rejected the transaction".to_string(),
                Some(e.to_string()),
            ),
            AppError::Unavailable(e) => {
                error!("Cluster read failed: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "CLUSTER_UNAVAILABLE",
                    "Could not read from the cluster".to_string(),
                    Some(e.to_string()),
                )
            }
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone(), None),
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
            data,
        });

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}
