// Reconciliation agent - polls the ledger for unresolved orders and settles
// them against the accrual service.
//
// Cycle:
// - Idle until the poll interval elapses (or shutdown)
// - List NEW/PROCESSING orders, oldest upload first
// - One pool job per order: fetch status, apply it to the ledger
// - Wait for the batch to drain, back to Idle
//
// A failed job is logged and the order is simply picked up again on the next
// tick. Only a failure to list orders stops the agent.

use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

use crate::accrual::AccrualSource;
use crate::error::AgentError;
use crate::ledger::ReconciliationStore;
use crate::shutdown::ShutdownSignal;
use crate::worker_pool::{BatchReport, Job, WorkerPool};

pub struct ReconciliationAgent {
    store: Arc<dyn ReconciliationStore>,
    accrual: Arc<dyn AccrualSource>,
    poll_interval: Duration,
    worker_limit: usize,
}

impl ReconciliationAgent {
    pub fn new(
        store: Arc<dyn ReconciliationStore>,
        accrual: Arc<dyn AccrualSource>,
        poll_interval: Duration,
        worker_limit: usize,
    ) -> Self {
        Self {
            store,
            accrual,
            poll_interval,
            worker_limit,
        }
    }

    /// Run until `shutdown` fires or listing unresolved orders fails.
    ///
    /// A batch in flight when shutdown arrives is allowed to drain.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<(), AgentError> {
        let pool = WorkerPool::spawn(self.worker_limit);
        info!(
            workers = pool.size(),
            poll_interval_secs = self.poll_interval.as_secs(),
            "Reconciliation agent started"
        );

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            if let Err(e) = self.reconcile_once(&pool).await {
                error!(error = %e, "Reconciliation agent stopping");
                break Err(e);
            }
        };

        pool.shutdown().await;
        info!("Reconciliation agent stopped");
        result
    }

    /// One polling tick: dispatch every unresolved order and wait for the
    /// batch to drain.
    #[instrument(skip_all)]
    pub async fn reconcile_once(&self, pool: &WorkerPool) -> Result<BatchReport, AgentError> {
        let numbers = self
            .store
            .list_unresolved_orders()
            .await
            .map_err(AgentError::ListUnresolved)?;

        if numbers.is_empty() {
            debug!("No unresolved orders");
            return Ok(BatchReport::default());
        }

        info!(orders = numbers.len(), "🔄 Reconciling unresolved orders");

        let batch = pool.batch();
        for number in numbers {
            let job = self.resolve_job(number.clone());
            if let Err(e) = pool.submit(&batch, number, job).await {
                // pool closed under us; nothing more can be queued this tick
                error!(error = %e, "Could not queue reconciliation job");
                break;
            }
        }

        let report = batch.wait().await;
        info!(
            total = report.total(),
            succeeded = report.succeeded,
            failed = report.failed,
            "✓ Reconciliation tick completed"
        );
        Ok(report)
    }

    fn resolve_job(&self, order_number: String) -> Job {
        let store = Arc::clone(&self.store);
        let accrual = Arc::clone(&self.accrual);

        async move {
            let report = accrual.fetch(&order_number).await?;
            store
                .apply_resolution(&report.into_resolution(order_number))
                .await?;
            Ok(())
        }
        .boxed()
    }
}
