// Caller-facing HTTP surface over the account side of the ledger
pub mod handler;
pub mod models;
