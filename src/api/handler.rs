use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{debug, info};

use super::models::*;
use crate::{
    error::{AppError, AppResult},
    hasher::PasswordHasher,
    ledger::{
        models::{Balance, OrderSubmission},
        AccountStore,
    },
    luhn,
};

/// Header carrying the login authenticated by the upstream auth layer
pub const USER_HEADER: &str = "x-user-login";

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn AccountStore>,
    pub hasher: Arc<dyn PasswordHasher>,
}

/// Login of the caller, taken from [`USER_HEADER`]
#[derive(Debug, Clone)]
pub struct CurrentUser(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|login| !login.is_empty())
            .map(|login| CurrentUser(login.to_string()))
            .ok_or(AppError::Unauthorized)
    }
}

/// Register a new user
/// POST /api/user/register
///
/// - 200: registered
/// - 400: empty login or password
/// - 409: login already taken
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<CredentialsRequest>,
) -> AppResult<StatusCode> {
    let login = request.validated()?;
    let password_hash = state.hasher.hash(&request.password);

    state.ledger.create_user(login, &password_hash).await?;

    info!(user = %login, "User registered");
    Ok(StatusCode::OK)
}

/// Check a user's credentials
/// POST /api/user/login
///
/// - 200: credentials match
/// - 400: empty login or password
/// - 401: unknown login or wrong password
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<CredentialsRequest>,
) -> AppResult<StatusCode> {
    let login = request.validated()?;

    let Some(user) = state.ledger.get_user(login).await? else {
        debug!(user = %login, "Login for unknown user");
        return Err(AppError::Unauthorized);
    };

    if !state.hasher.verify(&request.password, &user.password_hash) {
        debug!(user = %login, "Login with wrong password");
        return Err(AppError::Unauthorized);
    }

    info!(user = %login, "User logged in");
    Ok(StatusCode::OK)
}

/// Upload an order number for accrual
/// POST /api/user/orders
///
/// - 202: accepted for processing
/// - 200: already uploaded by this user
/// - 409: uploaded by someone else
/// - 422: fails the Luhn check
pub async fn upload_order(
    State(state): State<AppState>,
    CurrentUser(login): CurrentUser,
    body: String,
) -> AppResult<StatusCode> {
    let number = body.trim();
    if number.is_empty() {
        return Err(AppError::InvalidInput("order number is required".to_string()));
    }
    if !luhn::is_valid(number) {
        return Err(AppError::InvalidOrderNumber(number.to_string()));
    }

    match state.ledger.add_order(&login, number).await? {
        OrderSubmission::Accepted => {
            info!(user = %login, order = %number, "Order accepted");
            Ok(StatusCode::ACCEPTED)
        }
        OrderSubmission::AlreadyUploaded => {
            debug!(user = %login, order = %number, "Order already uploaded");
            Ok(StatusCode::OK)
        }
    }
}

/// List the caller's orders, newest first
/// GET /api/user/orders
pub async fn list_orders(
    State(state): State<AppState>,
    CurrentUser(login): CurrentUser,
) -> AppResult<Response> {
    let orders = state.ledger.list_orders(&login).await?;
    if orders.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok(Json(orders).into_response())
}

/// GET /api/user/balance
pub async fn get_balance(
    State(state): State<AppState>,
    CurrentUser(login): CurrentUser,
) -> AppResult<Json<Balance>> {
    let balance = state.ledger.get_balance(&login).await?;
    Ok(Json(balance))
}

/// Spend points against a new order number
/// POST /api/user/balance/withdraw
///
/// - 402: not enough points
/// - 422: bad order number, or a sum that is not positive or has more
///   than two decimal places
pub async fn withdraw(
    State(state): State<AppState>,
    CurrentUser(login): CurrentUser,
    Json(request): Json<WithdrawRequest>,
) -> AppResult<StatusCode> {
    let order = request.order.trim();
    if !luhn::is_valid(order) {
        return Err(AppError::InvalidOrderNumber(order.to_string()));
    }

    let withdrawal = state
        .ledger
        .record_withdrawal(&login, order, request.sum)
        .await?;

    info!(user = %login, order = %withdrawal.order, sum = %withdrawal.sum, "Withdrawal recorded");
    Ok(StatusCode::OK)
}

/// List the caller's withdrawals, newest first
/// GET /api/user/withdrawals
pub async fn list_withdrawals(
    State(state): State<AppState>,
    CurrentUser(login): CurrentUser,
) -> AppResult<Response> {
    let withdrawals = state.ledger.list_withdrawals(&login).await?;
    if withdrawals.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    Ok(Json(withdrawals).into_response())
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
    })
}
