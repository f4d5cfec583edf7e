//! Retry scheduler loop
//!
//! Calls [`ScheduleEngine::tick`] on a fixed interval until SIGINT/SIGTERM.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::engine::ScheduleEngine;
use crate::error::ScheduleResult;

/// Run the tick loop until a shutdown signal arrives
pub async fn run_scheduler(engine: Arc<ScheduleEngine>, interval: Duration) -> ScheduleResult<()> {
    info!("⏱  Retry scheduler started, ticking every {:?}", interval);
    run_until(engine, interval, shutdown_signal()).await;
    info!("Retry scheduler shutdown complete");
    Ok(())
}

/// Run the tick loop until `shutdown` resolves. A tick in progress finishes first.
pub async fn run_until<F>(engine: Arc<ScheduleEngine>, interval: Duration, shutdown: F) -> u64
where
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut ticks = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                ticks += 1;
                match engine.tick().await {
                    Ok(results) if results.is_empty() => {}
                    Ok(results) => {
                        let ok = results.iter().filter(|r| r.is_success()).count();
                        info!(ran = results.len(), succeeded = ok, "scheduled retries finished");
                    }
                    Err(e) => warn!(error = %e, "scheduler tick failed"),
                }
            }
        }
    }
    ticks
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping scheduler...");
}
