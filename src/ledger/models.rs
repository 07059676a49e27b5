use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;

/// Order status enum
///
/// `New` and `Processing` are unresolved; `Invalid` and `Processed` are
/// terminal and never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "order_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Processing,
    Invalid,
    Processed,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }

    /// Valid transitions:
    /// - New → Processing, Invalid, Processed
    /// - Processing → Invalid, Processed
    /// - Terminal states → none
    ///
    /// Anything else (same status, Processing → New) leaves the order as is.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        match self {
            OrderStatus::New => matches!(
                next,
                OrderStatus::Processing | OrderStatus::Invalid | OrderStatus::Processed
            ),
            OrderStatus::Processing => next.is_terminal(),
            OrderStatus::Invalid | OrderStatus::Processed => false,
        }
    }
}

/// User entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub login: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Order entity, with the accrual credited for it (if any)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub number: String,
    #[serde(skip_serializing)]
    pub owner: String,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
}

/// Signed ledger entry: positive accrual, negative withdrawal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub id: i64,
    pub owner: String,
    pub order_number: Option<String>,
    pub amount: Decimal,
    pub processed_at: DateTime<Utc>,
}

/// Withdrawal as shown to its owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Withdrawal {
    pub order: String,
    pub sum: Decimal,
    pub processed_at: DateTime<Utc>,
}

/// Derived balance for one owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub current: Decimal,
    pub withdrawn: Decimal,
}

impl Balance {
    /// Builds the caller-facing balance from raw sums. `current` is never
    /// reported below zero.
    pub fn from_sums(total: Decimal, withdrawn: Decimal) -> Self {
        Self {
            current: total.max(Decimal::ZERO),
            withdrawn,
        }
    }
}

/// Decimal places stored by the ledger (`NUMERIC(14, 2)`)
pub const MONEY_SCALE: u32 = 2;

/// Largest magnitude `NUMERIC(14, 2)` can hold, exclusive
const MONEY_LIMIT: Decimal = Decimal::from_parts(3_567_587_328, 232, 0, false, 0);

/// Rounds a reported amount to ledger precision, half away from zero like
/// PostgreSQL does on insert.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// True if the ledger can store `amount` exactly.
pub fn is_money(amount: Decimal) -> bool {
    amount.normalize().scale() <= MONEY_SCALE && amount.abs() < MONEY_LIMIT
}

/// Status reported by the accrual service for one order, ready to be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub order_number: String,
    pub status: OrderStatus,
    pub accrual: Option<Decimal>,
}

/// Outcome of an order submission that did not conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSubmission {
    Accepted,
    AlreadyUploaded,
}
