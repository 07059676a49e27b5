// External accrual service access
pub mod client;
pub mod models;

use async_trait::async_trait;

use crate::error::AccrualError;
use models::AccrualReport;

pub use client::AccrualClient;

/// Single-order status lookup - the only thing the agent asks of the
/// accrual service
#[async_trait]
pub trait AccrualSource: Send + Sync {
    async fn fetch(&self, order_number: &str) -> Result<AccrualReport, AccrualError>;
}
