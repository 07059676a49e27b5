use rust_decimal::Decimal;
use serde::Deserialize;

use crate::ledger::models::{OrderStatus, Resolution};

/// Order status as reported by the accrual service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccrualStatus {
    Registered,
    Invalid,
    Processing,
    Processed,
}

impl From<AccrualStatus> for OrderStatus {
    fn from(status: AccrualStatus) -> Self {
        match status {
            // registered but not yet looked at: still new from our side
            AccrualStatus::Registered => OrderStatus::New,
            AccrualStatus::Invalid => OrderStatus::Invalid,
            AccrualStatus::Processing => OrderStatus::Processing,
            AccrualStatus::Processed => OrderStatus::Processed,
        }
    }
}

/// `GET /api/orders/{number}` response body
#[derive(Debug, Clone, Deserialize)]
pub struct AccrualResponse {
    #[serde(default)]
    pub order: Option<String>,
    pub status: AccrualStatus,
    #[serde(default)]
    pub accrual: Option<Decimal>,
}

/// What the accrual service currently says about one order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccrualReport {
    pub status: OrderStatus,
    pub accrual: Option<Decimal>,
}

impl From<AccrualResponse> for AccrualReport {
    fn from(response: AccrualResponse) -> Self {
        Self {
            status: response.status.into(),
            accrual: response.accrual,
        }
    }
}

impl AccrualReport {
    pub fn into_resolution(self, order_number: String) -> Resolution {
        Resolution {
            order_number,
            status: self.status,
            accrual: self.accrual,
        }
    }
}
