// Fixed-size pool of job executors fed by a bounded queue.
//
// The pool knows nothing about batches beyond the outcome sender each job
// carries; whoever submits a batch owns its completion.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{AppError, AppResult};

pub type Job = BoxFuture<'static, AppResult<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Succeeded,
    Failed,
}

struct QueuedJob {
    label: String,
    job: Job,
    outcome: mpsc::UnboundedSender<JobOutcome>,
}

/// Tally of one drained batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Completion handle for a group of submitted jobs
pub struct Batch {
    outcome_tx: mpsc::UnboundedSender<JobOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<JobOutcome>,
}

impl Batch {
    /// Waits until every job submitted with this batch has run.
    pub async fn wait(self) -> BatchReport {
        let Batch {
            outcome_tx,
            mut outcome_rx,
        } = self;
        // only queued jobs hold senders now; recv yields None once they finish
        drop(outcome_tx);

        let mut report = BatchReport::default();
        while let Some(outcome) = outcome_rx.recv().await {
            match outcome {
                JobOutcome::Succeeded => report.succeeded += 1,
                JobOutcome::Failed => report.failed += 1,
            }
        }
        report
    }
}

pub struct WorkerPool {
    queue: mpsc::Sender<QueuedJob>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` executors sharing a queue of the same capacity.
    pub fn spawn(size: usize) -> Self {
        let size = size.max(1);
        let (queue, rx) = mpsc::channel(size);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move { worker_loop(worker_id, rx).await })
            })
            .collect();

        Self { queue, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn batch(&self) -> Batch {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Batch {
            outcome_tx,
            outcome_rx,
        }
    }

    /// Queue `job` as part of `batch`. Waits while the queue is full.
    pub async fn submit(&self, batch: &Batch, label: impl Into<String>, job: Job) -> AppResult<()> {
        let queued = QueuedJob {
            label: label.into(),
            job,
            outcome: batch.outcome_tx.clone(),
        };
        self.queue
            .send(queued)
            .await
            .map_err(|_| AppError::Internal("worker pool is shut down".to_string()))
    }

    /// Close the queue and wait for executors to finish in-flight jobs.
    pub async fn shutdown(self) {
        let WorkerPool { queue, workers } = self;
        drop(queue);
        for worker in workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(worker_id: usize, rx: Arc<Mutex<mpsc::Receiver<QueuedJob>>>) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(QueuedJob { label, job, outcome }) = next else {
            debug!(worker_id, "Job queue closed, worker exiting");
            return;
        };

        let result = match AssertUnwindSafe(job).catch_unwind().await {
            Ok(Ok(())) => JobOutcome::Succeeded,
            Ok(Err(e)) => {
                warn!(worker_id, job = %label, error = %e, "Job failed");
                JobOutcome::Failed
            }
            Err(_) => {
                error!(worker_id, job = %label, "Job panicked");
                JobOutcome::Failed
            }
        };

        // the batch may have been dropped without waiting
        let _ = outcome.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn batch_counts_successes_and_failures() {
        let pool = WorkerPool::spawn(3);
        let batch = pool.batch();

        for i in 0..10 {
            let job: Job = async move {
                if i % 3 == 0 {
                    Err(AppError::Internal(format!("job {i} failed")))
                } else {
                    Ok(())
                }
            }
            .boxed();
            pool.submit(&batch, format!("job-{i}"), job).await.unwrap();
        }

        let report = batch.wait().await;
        assert_eq!(report, BatchReport { succeeded: 6, failed: 4 });
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_job_does_not_take_down_the_pool() {
        let pool = WorkerPool::spawn(1);
        let batch = pool.batch();

        let boom: Job = async {
            if true {
                panic!("boom");
            }
            Ok(())
        }
        .boxed();
        pool.submit(&batch, "boom", boom).await.unwrap();
        pool.submit(&batch, "fine", async { Ok(()) }.boxed())
            .await
            .unwrap();

        let report = batch.wait().await;
        assert_eq!(report, BatchReport { succeeded: 1, failed: 1 });
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_pool_size() {
        let pool = WorkerPool::spawn(2);
        let batch = pool.batch();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let job: Job = async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed();
            pool.submit(&batch, format!("job-{i}"), job).await.unwrap();
        }

        assert_eq!(batch.wait().await.succeeded, 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn empty_batch_completes_immediately() {
        let pool = WorkerPool::spawn(2);
        let report = pool.batch().wait().await;
        assert_eq!(report.total(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_finishes_queued_work() {
        let pool = WorkerPool::spawn(1);
        let batch = pool.batch();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let done = Arc::clone(&done);
            let job: Job = async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed();
            pool.submit(&batch, "slow", job).await.unwrap();
        }

        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert_eq!(batch.wait().await.succeeded, 2);
    }
}
