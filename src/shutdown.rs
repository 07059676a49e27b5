//! Cooperative shutdown signal shared by the agent, retry waits, the accrual
//! client and the HTTP server.
//!
//! Dropping the [`ShutdownTrigger`] counts as a shutdown request, so a
//! forgotten trigger never leaves waiters parked forever.

use tokio::sync::watch;

/// Sending half. Owned by whoever decides the process is stopping.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half. Cheap to clone; every clone observes the same trigger.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Option<watch::Receiver<bool>>,
}

pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx: Some(rx) })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // receivers may already be gone
        let _ = self.tx.send(true);
    }
}

impl ShutdownSignal {
    /// A signal that never fires, for components constructed outside of a
    /// running service.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
