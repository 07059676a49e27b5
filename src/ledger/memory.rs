use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;

use super::models::{
    is_money, round_money, Balance, LedgerEntry, Order, OrderStatus, OrderSubmission, Resolution,
    User, Withdrawal,
};
use super::{AccountStore, ReconciliationStore};
use crate::error::LedgerError;

/// Process-local ledger used when no database is configured, and by tests.
///
/// All state sits behind one lock, so every check-and-write is atomic and no
/// `.await` happens while it is held.
pub struct InMemoryLedger {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    users: HashMap<String, User>,
    orders: HashMap<String, Order>,
    entries: Vec<LedgerEntry>,
    next_entry_id: i64,
    // keeps uploads of the same instant in insertion order
    upload_seq: Vec<String>,
}

impl State {
    fn sum_for(&self, owner: &str) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.owner == owner)
            .map(|e| e.amount)
            .sum()
    }

    fn append(&mut self, owner: &str, order_number: Option<&str>, amount: Decimal) -> LedgerEntry {
        self.next_entry_id += 1;
        let entry = LedgerEntry {
            id: self.next_entry_id,
            owner: owner.to_string(),
            order_number: order_number.map(str::to_string),
            amount,
            processed_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        entry
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }
}

#[cfg(test)]
impl InMemoryLedger {
    /// Every entry ever written, in insertion order.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().entries.clone()
    }

    pub fn order(&self, number: &str) -> Option<Order> {
        self.state.lock().orders.get(number).cloned()
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReconciliationStore for InMemoryLedger {
    async fn list_unresolved_orders(&self) -> Result<Vec<String>, LedgerError> {
        let state = self.state.lock();
        let mut pending: Vec<(usize, &Order)> = state
            .upload_seq
            .iter()
            .enumerate()
            .filter_map(|(seq, number)| state.orders.get(number).map(|o| (seq, o)))
            .filter(|(_, o)| !o.status.is_terminal())
            .collect();
        pending.sort_by_key(|(seq, o)| (o.uploaded_at, *seq));

        Ok(pending.into_iter().map(|(_, o)| o.number.clone()).collect())
    }

    async fn apply_resolution(&self, resolution: &Resolution) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(&resolution.order_number)
            .ok_or_else(|| LedgerError::OrderNotFound(resolution.order_number.clone()))?;

        if !order.status.can_transition_to(resolution.status) {
            return Ok(());
        }

        order.status = resolution.status;
        let owner = order.owner.clone();

        if resolution.status == OrderStatus::Processed {
            if let Some(accrual) = resolution
                .accrual
                .map(round_money)
                .filter(|a| *a > Decimal::ZERO)
            {
                order.accrual = Some(accrual);
                state.append(&owner, Some(&resolution.order_number), accrual);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl AccountStore for InMemoryLedger {
    async fn create_user(&self, login: &str, password_hash: &str) -> Result<User, LedgerError> {
        let mut state = self.state.lock();
        if state.users.contains_key(login) {
            return Err(LedgerError::UserExists(login.to_string()));
        }

        let user = User {
            login: login.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };
        state.users.insert(login.to_string(), user.clone());
        Ok(user)
    }

    async fn get_user(&self, login: &str) -> Result<Option<User>, LedgerError> {
        Ok(self.state.lock().users.get(login).cloned())
    }

    async fn add_order(&self, owner: &str, number: &str) -> Result<OrderSubmission, LedgerError> {
        let mut state = self.state.lock();
        if !state.users.contains_key(owner) {
            return Err(LedgerError::UserNotFound(owner.to_string()));
        }

        if let Some(existing) = state.orders.get(number) {
            return if existing.owner == owner {
                Ok(OrderSubmission::AlreadyUploaded)
            } else {
                Err(LedgerError::OrderOwnedByAnotherUser(number.to_string()))
            };
        }

        state.orders.insert(
            number.to_string(),
            Order {
                number: number.to_string(),
                owner: owner.to_string(),
                status: OrderStatus::New,
                accrual: None,
                uploaded_at: Utc::now(),
            },
        );
        state.upload_seq.push(number.to_string());
        Ok(OrderSubmission::Accepted)
    }

    async fn list_orders(&self, owner: &str) -> Result<Vec<Order>, LedgerError> {
        let state = self.state.lock();
        Ok(state
            .upload_seq
            .iter()
            .rev()
            .filter_map(|number| state.orders.get(number))
            .filter(|o| o.owner == owner)
            .cloned()
            .collect())
    }

    async fn record_withdrawal(
        &self,
        owner: &str,
        order_number: &str,
        amount: Decimal,
    ) -> Result<Withdrawal, LedgerError> {
        if amount <= Decimal::ZERO || !is_money(amount) {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mut state = self.state.lock();
        if !state.users.contains_key(owner) {
            return Err(LedgerError::UserNotFound(owner.to_string()));
        }

        let available = state.sum_for(owner);
        if available - amount < Decimal::ZERO {
            return Err(LedgerError::InsufficientFunds {
                requested: amount,
                available,
            });
        }

        let entry = state.append(owner, Some(order_number), -amount);
        Ok(Withdrawal {
            order: order_number.to_string(),
            sum: amount,
            processed_at: entry.processed_at,
        })
    }

    async fn get_balance(&self, owner: &str) -> Result<Balance, LedgerError> {
        let state = self.state.lock();
        let (total, withdrawn) = state
            .entries
            .iter()
            .filter(|e| e.owner == owner)
            .fold((Decimal::ZERO, Decimal::ZERO), |(total, withdrawn), e| {
                let withdrawn = if e.amount < Decimal::ZERO {
                    withdrawn - e.amount
                } else {
                    withdrawn
                };
                (total + e.amount, withdrawn)
            });

        Ok(Balance::from_sums(total, withdrawn))
    }

    async fn list_withdrawals(&self, owner: &str) -> Result<Vec<Withdrawal>, LedgerError> {
        let state = self.state.lock();
        Ok(state
            .entries
            .iter()
            .rev()
            .filter(|e| e.owner == owner && e.amount < Decimal::ZERO)
            .map(|e| Withdrawal {
                order: e.order_number.clone().unwrap_or_default(),
                sum: -e.amount,
                processed_at: e.processed_at,
            })
            .collect())
    }
}
