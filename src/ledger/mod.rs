// Ledger store: users, orders and the signed balance ledger.
pub mod memory;
pub mod models;
pub mod repository;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::LedgerError;
use models::{Balance, Order, OrderSubmission, Resolution, User, Withdrawal};

pub use memory::InMemoryLedger;
pub use repository::LedgerRepository;

/// What the reconciliation agent needs from the store
///
/// INVARIANTS:
/// - `list_unresolved_orders` returns oldest uploads first
/// - `apply_resolution` is idempotent for orders that are already terminal
/// - a PROCESSED resolution writes status and accrual in one transaction
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// Numbers of NEW and PROCESSING orders, oldest upload first.
    async fn list_unresolved_orders(&self) -> Result<Vec<String>, LedgerError>;

    async fn apply_resolution(&self, resolution: &Resolution) -> Result<(), LedgerError>;
}

/// What the upstream caller surface needs from the store
///
/// INVARIANT: no committed state ever has a negative balance sum for an owner.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn create_user(&self, login: &str, password_hash: &str) -> Result<User, LedgerError>;

    async fn get_user(&self, login: &str) -> Result<Option<User>, LedgerError>;

    async fn add_order(&self, owner: &str, number: &str) -> Result<OrderSubmission, LedgerError>;

    /// Orders of `owner`, newest upload first.
    async fn list_orders(&self, owner: &str) -> Result<Vec<Order>, LedgerError>;

    /// Debits `amount` from `owner`, or fails with `InsufficientFunds`
    /// without writing anything.
    async fn record_withdrawal(
        &self,
        owner: &str,
        order_number: &str,
        amount: Decimal,
    ) -> Result<Withdrawal, LedgerError>;

    async fn get_balance(&self, owner: &str) -> Result<Balance, LedgerError>;

    /// Withdrawals of `owner`, newest first.
    async fn list_withdrawals(&self, owner: &str) -> Result<Vec<Withdrawal>, LedgerError>;
}

/// Both capabilities, for components that own the whole store.
pub trait LedgerStore: ReconciliationStore + AccountStore {}

impl<T: ReconciliationStore + AccountStore> LedgerStore for T {}
