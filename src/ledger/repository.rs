use super::models::*;
use super::{AccountStore, ReconciliationStore};
use crate::error::LedgerError;
use crate::retry::{retry, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::future::Future;
use tracing::{debug, info};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
/// Raised by the `balance_entries_non_negative` trigger.
const CHECK_VIOLATION: &str = "23514";

/// Ledger repository - THE source of truth for orders and balances
///
/// Every statement runs under the retry policy. Writers touching one owner's
/// balance are serialized by locking that owner's `users` row.
pub struct LedgerRepository {
    pool: PgPool,
    retry_policy: RetryPolicy,
    shutdown: ShutdownSignal,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::default(),
            shutdown: ShutdownSignal::never(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        retry(&self.retry_policy, &self.shutdown, op).await
    }

    // ========== RESOLUTION ==========

    async fn apply_resolution_once(&self, resolution: &Resolution) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String, OrderStatus)> = sqlx::query_as(
            r#"
            SELECT owner, status
            FROM orders
            WHERE number = $1
            FOR UPDATE
            "#,
        )
        .bind(&resolution.order_number)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((owner, status)) = current else {
            return Err(LedgerError::OrderNotFound(resolution.order_number.clone()));
        };

        if !status.can_transition_to(resolution.status) {
            debug!(
                order = %resolution.order_number,
                current = %status,
                reported = %resolution.status,
                "Resolution leaves order unchanged"
            );
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE orders
            SET status = $2
            WHERE number = $1
            "#,
        )
        .bind(&resolution.order_number)
        .bind(resolution.status)
        .execute(&mut *tx)
        .await?;

        if resolution.status == OrderStatus::Processed {
            if let Some(accrual) = resolution
                .accrual
                .map(round_money)
                .filter(|a| *a > Decimal::ZERO)
            {
                sqlx::query(
                    r#"
                    INSERT INTO balance_entries (owner, order_number, amount)
                    VALUES ($1, $2, $3)
                    "#,
                )
                .bind(&owner)
                .bind(&resolution.order_number)
                .bind(accrual)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        info!(
            order = %resolution.order_number,
            from = %status,
            to = %resolution.status,
            "Order resolution applied"
        );
        Ok(())
    }

    // ========== WITHDRAWALS ==========

    async fn record_withdrawal_once(
        &self,
        owner: &str,
        order_number: &str,
        amount: Decimal,
    ) -> Result<Withdrawal, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // serializes every balance writer for this owner
        let locked: Option<String> = sqlx::query_scalar(
            r#"
            SELECT login
            FROM users
            WHERE login = $1
            FOR UPDATE
            "#,
        )
        .bind(owner)
        .fetch_optional(&mut *tx)
        .await?;

        if locked.is_none() {
            return Err(LedgerError::UserNotFound(owner.to_string()));
        }

        let available: Decimal = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM balance_entries
            WHERE owner = $1
            "#,
        )
        .bind(owner)
        .fetch_one(&mut *tx)
        .await?;

        if available - amount < Decimal::ZERO {
            return Err(LedgerError::InsufficientFunds {
                requested: amount,
                available,
            });
        }

        let processed_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO balance_entries (owner, order_number, amount)
            VALUES ($1, $2, $3)
            RETURNING processed_at
            "#,
        )
        .bind(owner)
        .bind(order_number)
        .bind(-amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match db_code(&e).as_deref() {
            Some(CHECK_VIOLATION) => LedgerError::InsufficientFunds {
                requested: amount,
                available,
            },
            _ => LedgerError::Storage(e),
        })?;

        tx.commit().await?;

        Ok(Withdrawal {
            order: order_number.to_string(),
            sum: amount,
            processed_at,
        })
    }

    // ========== ORDERS ==========

    async fn add_order_once(&self, owner: &str, number: &str) -> Result<OrderSubmission, LedgerError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (number, owner, status)
            VALUES ($1, $2, 'NEW')
            ON CONFLICT (number) DO NOTHING
            "#,
        )
        .bind(number)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| match db_code(&e).as_deref() {
            Some(FOREIGN_KEY_VIOLATION) => LedgerError::UserNotFound(owner.to_string()),
            _ => LedgerError::Storage(e),
        })?;

        if inserted.rows_affected() == 1 {
            return Ok(OrderSubmission::Accepted);
        }

        let existing_owner: String = sqlx::query_scalar(
            r#"
            SELECT owner
            FROM orders
            WHERE number = $1
            "#,
        )
        .bind(number)
        .fetch_one(&self.pool)
        .await?;

        if existing_owner == owner {
            Ok(OrderSubmission::AlreadyUploaded)
        } else {
            Err(LedgerError::OrderOwnedByAnotherUser(number.to_string()))
        }
    }
}

fn db_code(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

#[async_trait]
impl ReconciliationStore for LedgerRepository {
    async fn list_unresolved_orders(&self) -> Result<Vec<String>, LedgerError> {
        self.with_retry(move || async move {
            let numbers = sqlx::query_scalar::<_, String>(
                r#"
                SELECT number
                FROM orders
                WHERE status IN ('NEW', 'PROCESSING')
                ORDER BY uploaded_at ASC, number ASC
                "#,
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(numbers)
        })
        .await
    }

    async fn apply_resolution(&self, resolution: &Resolution) -> Result<(), LedgerError> {
        self.with_retry(|| self.apply_resolution_once(resolution)).await
    }
}

#[async_trait]
impl AccountStore for LedgerRepository {
    async fn create_user(&self, login: &str, password_hash: &str) -> Result<User, LedgerError> {
        self.with_retry(move || async move {
            sqlx::query_as::<_, User>(
                r#"
                INSERT INTO users (login, password_hash)
                VALUES ($1, $2)
                RETURNING login, password_hash, created_at
                "#,
            )
            .bind(login)
            .bind(password_hash)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match db_code(&e).as_deref() {
                Some(UNIQUE_VIOLATION) => LedgerError::UserExists(login.to_string()),
                _ => LedgerError::Storage(e),
            })
        })
        .await
    }

    async fn get_user(&self, login: &str) -> Result<Option<User>, LedgerError> {
        self.with_retry(move || async move {
            let user = sqlx::query_as::<_, User>(
                r#"
                SELECT login, password_hash, created_at
                FROM users
                WHERE login = $1
                "#,
            )
            .bind(login)
            .fetch_optional(&self.pool)
            .await?;
            Ok(user)
        })
        .await
    }

    async fn add_order(&self, owner: &str, number: &str) -> Result<OrderSubmission, LedgerError> {
        self.with_retry(|| self.add_order_once(owner, number)).await
    }

    async fn list_orders(&self, owner: &str) -> Result<Vec<Order>, LedgerError> {
        self.with_retry(move || async move {
            let orders = sqlx::query_as::<_, Order>(
                r#"
                SELECT o.number, o.owner, o.status, e.amount AS accrual, o.uploaded_at
                FROM orders o
                LEFT JOIN balance_entries e
                    ON e.order_number = o.number AND e.amount > 0
                WHERE o.owner = $1
                ORDER BY o.uploaded_at DESC
                "#,
            )
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
            Ok(orders)
        })
        .await
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

        self.with_retry(|| self.record_withdrawal_once(owner, order_number, amount))
            .await
    }

    async fn get_balance(&self, owner: &str) -> Result<Balance, LedgerError> {
        self.with_retry(move || async move {
            let (total, withdrawn): (Decimal, Decimal) = sqlx::query_as(
                r#"
                SELECT
                    COALESCE(SUM(amount), 0),
                    COALESCE(SUM(-amount) FILTER (WHERE amount < 0), 0)
                FROM balance_entries
                WHERE owner = $1
                "#,
            )
            .bind(owner)
            .fetch_one(&self.pool)
            .await?;
            Ok(Balance::from_sums(total, withdrawn))
        })
        .await
    }

    async fn list_withdrawals(&self, owner: &str) -> Result<Vec<Withdrawal>, LedgerError> {
        self.with_retry(move || async move {
            let withdrawals = sqlx::query_as::<_, Withdrawal>(
                r#"
                SELECT COALESCE(order_number, '') AS "order", -amount AS sum, processed_at
                FROM balance_entries
                WHERE owner = $1 AND amount < 0
                ORDER BY processed_at DESC, id DESC
                "#,
            )
            .bind(owner)
            .fetch_all(&self.pool)
            .await?;
            Ok(withdrawals)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;

    async fn connect() -> LedgerRepository {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&url)
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        LedgerRepository::new(pool)
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a disposable PostgreSQL database"]
    async fn concurrent_withdrawals_never_overdraw_in_postgres() {
        let repo = Arc::new(connect().await);
        let owner = unique("alice");
        let order = unique("O");
        repo.create_user(&owner, "hash").await.unwrap();
        repo.add_order(&owner, &order).await.unwrap();
        repo.apply_resolution(&Resolution {
            order_number: order.clone(),
            status: OrderStatus::Processed,
            accrual: Some(dec!(100)),
        })
        .await
        .unwrap();

        let mut tasks = Vec::new();
        for i in 0..10 {
            let repo = Arc::clone(&repo);
            let owner = owner.clone();
            tasks.push(tokio::spawn(async move {
                repo.record_withdrawal(&owner, &format!("W{i}"), dec!(30)).await
            }));
        }

        let mut succeeded = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 3);
        let balance = repo.get_balance(&owner).await.unwrap();
        assert_eq!(balance.current, dec!(10));
        assert_eq!(balance.withdrawn, dec!(90));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a disposable PostgreSQL database"]
    async fn processed_resolution_is_idempotent_in_postgres() {
        let repo = connect().await;
        let owner = unique("bob");
        let order = unique("O");
        repo.create_user(&owner, "hash").await.unwrap();
        repo.add_order(&owner, &order).await.unwrap();

        let resolution = Resolution {
            order_number: order.clone(),
            status: OrderStatus::Processed,
            accrual: Some(dec!(500)),
        };
        repo.apply_resolution(&resolution).await.unwrap();
        repo.apply_resolution(&resolution).await.unwrap();

        let orders = repo.list_orders(&owner).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Processed);
        assert_eq!(orders[0].accrual, Some(dec!(500)));
        assert_eq!(repo.get_balance(&owner).await.unwrap().current, dec!(500));
    }
}
