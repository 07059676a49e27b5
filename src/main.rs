mod accrual;
mod agent;
mod api;
mod bootstrap;
mod config;
mod error;
mod hasher;
mod ledger;
mod luhn;
mod retry;
mod server;
mod shutdown;
mod worker_pool;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,loyalty_backend=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting loyalty accrual backend");

    let config = Config::from_env().context("invalid configuration")?;
    let (trigger, signal) = shutdown::channel();

    let services = bootstrap::initialize_services(&config, signal.clone())
        .await
        .context("failed to initialize services")?;

    let app = server::create_app(services.state).await;
    let agent = services.agent;

    let mut agent_task = tokio::spawn({
        let signal = signal.clone();
        async move { agent.run(signal).await }
    });
    let mut server_task = tokio::spawn({
        let run_address = config.run_address.clone();
        async move { server::run_server(app, &run_address, signal).await }
    });

    // Whichever stops first takes the rest of the process down with it.
    let mut agent_result = None;
    let mut server_result = None;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("Shutdown requested");
        }
        res = &mut agent_task => agent_result = Some(res),
        res = &mut server_task => server_result = Some(res),
    }
    trigger.trigger();

    let agent_result = match agent_result {
        Some(res) => res,
        None => agent_task.await,
    };
    let server_result = match server_result {
        Some(res) => res,
        None => server_task.await,
    };

    agent_result
        .context("reconciliation agent panicked")?
        .context("reconciliation agent failed")?;
    server_result
        .context("HTTP server panicked")?
        .context("HTTP server failed")?;

    info!("👋 Shutdown complete");
    Ok(())
}
