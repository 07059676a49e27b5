use std::{sync::Arc, time::Duration};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use crate::{
    accrual::AccrualClient,
    agent::ReconciliationAgent,
    api::handler::AppState,
    config::Config,
    error::AppResult,
    hasher::SaltedSha256,
    ledger::{InMemoryLedger, LedgerRepository, LedgerStore},
    shutdown::ShutdownSignal,
};

/// Everything `main` needs to run: the HTTP state and the background agent,
/// both backed by the same ledger.
pub struct Services {
    pub state: AppState,
    pub agent: ReconciliationAgent,
}

pub async fn initialize_services(config: &Config, shutdown: ShutdownSignal) -> AppResult<Services> {
    info!("Initializing application components ...");

    let accrual = Arc::new(
        AccrualClient::new(&config.accrual_system_address)?
            .with_retry_budget(config.accrual_retry_budget)
            .with_shutdown(shutdown.clone()),
    );
    info!("✅ Accrual client targeting {}", accrual.base_url());

    let services = match &config.database_uri {
        Some(database_uri) => {
            let pool = initialize_database(database_uri).await?;
            let ledger = LedgerRepository::new(pool)
                .with_retry_policy(config.db_retry.clone())
                .with_shutdown(shutdown);
            wire(Arc::new(ledger), accrual, config)
        }
        None => {
            warn!("⚠️  DATABASE_URI not set - using the in-memory ledger, nothing will persist");
            wire(Arc::new(InMemoryLedger::new()), accrual, config)
        }
    };

    info!("✓ All components initialized");
    Ok(services)
}

fn wire<S>(ledger: Arc<S>, accrual: Arc<AccrualClient>, config: &Config) -> Services
where
    S: LedgerStore + 'static,
{
    let state = AppState {
        ledger: ledger.clone(),
        hasher: Arc::new(SaltedSha256),
    };
    let agent = ReconciliationAgent::new(
        ledger,
        accrual,
        config.poll_interval,
        config.worker_limit,
    );
    Services { state, agent }
}

pub async fn initialize_database(database_uri: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_uri)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✅ Database connected and migrated");
    Ok(pool)
}
