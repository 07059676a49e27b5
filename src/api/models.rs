use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Registration and login request
/// POST /api/user/register, POST /api/user/login
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
}

impl CredentialsRequest {
    /// Trimmed login, or `InvalidInput` if either field is empty.
    pub fn validated(&self) -> Result<&str, AppError> {
        let login = self.login.trim();
        if login.is_empty() || self.password.is_empty() {
            return Err(AppError::InvalidInput(
                "login and password are required".to_string(),
            ));
        }
        Ok(login)
    }
}

/// Withdrawal request
/// POST /api/user/balance/withdraw
#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawRequest {
    pub order: String,
    pub sum: Decimal,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}
