use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Accrual error: {0}")]
    Accrual(#[from] AccrualError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid order number: {0}")]
    InvalidOrderNumber(String),

    #[error("Unauthorized")]
    Unauthorized,
}

/// Ledger store errors.
///
/// Domain conflicts are typed variants and are never retried; only
/// `Storage` can carry a transient connection failure.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: Decimal, available: Decimal },

    #[error("Order {0} was uploaded by another user")]
    OrderOwnedByAnotherUser(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("User already exists: {0}")]
    UserExists(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Invalid amount {0}: must be positive with at most two decimal places")]
    InvalidAmount(Decimal),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Accrual service errors
#[derive(Error, Debug)]
pub enum AccrualError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Accrual service rate limited the request (retry after: {retry_after:?})")]
    RateLimited { retry_after: Option<String> },

    #[error("Accrual service returned status {0}")]
    UnexpectedStatus(u16),

    #[error("Failed to decode accrual response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Reconciliation agent errors that stop the run loop
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to list unresolved orders: {0}")]
    ListUnresolved(#[source] LedgerError),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            AppError::Ledger(LedgerError::InsufficientFunds { .. }) => (
                StatusCode::PAYMENT_REQUIRED,
                "INSUFFICIENT_FUNDS",
                "Insufficient funds on balance".to_string(),
            ),
            AppError::Ledger(LedgerError::OrderOwnedByAnotherUser(number)) => (
                StatusCode::CONFLICT,
                "ORDER_OWNED_BY_ANOTHER_USER",
                format!("Order {} was uploaded by another user", number),
            ),
            AppError::Ledger(LedgerError::UserExists(login)) => (
                StatusCode::CONFLICT,
                "USER_EXISTS",
                format!("Login {} is already taken", login),
            ),
            AppError::Ledger(LedgerError::InvalidAmount(amount)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "INVALID_AMOUNT",
                format!("Invalid amount {}: must be positive with at most two decimal places", amount),
            ),
            AppError::Ledger(LedgerError::UserNotFound(_)) | AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "Authentication required".to_string(),
            ),
            AppError::InvalidOrderNumber(number) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "INVALID_ORDER_NUMBER",
                format!("Invalid order number: {}", number),
            ),
            AppError::InvalidInput(message) => {
                (StatusCode::BAD_REQUEST, "INVALID_INPUT", message)
            }
            AppError::Ledger(LedgerError::Storage(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(error: sqlx::Error) -> Self {
        AppError::Ledger(LedgerError::Storage(error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
