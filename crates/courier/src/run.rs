//! The `run` command: replay stored work and keep executing until told to stop.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use courier_jobs::{Dispatcher, DispatcherConfig, JobHandlers};
use miette::Result;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::handlers::SimulatedHandler;

/// How often the idle check looks at the dispatcher.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub async fn run(
    data_dir: &Path,
    config: DispatcherConfig,
    idle_exit_secs: Option<u64>,
) -> Result<()> {
    let store = crate::open_store(data_dir).await?;

    // Create shutdown channel
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let dispatcher = Dispatcher::spawn(
        store,
        JobHandlers::all(Arc::new(SimulatedHandler)),
        config,
        shutdown_rx.clone(),
    )
    .map_err(|e| miette::miette!("{}", e))?;

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    let resumed = match dispatcher.resume().await {
        Ok(count) => count,
        Err(e) => {
            let _ = shutdown_tx.send(true);
            dispatcher.join().await;
            return Err(miette::miette!("Failed to resume pending jobs: {}", e));
        }
    };
    info!(resumed, data_dir = %data_dir.display(), "courier running");

    let idle_exit = idle_exit_secs.map(Duration::from_secs);
    let mut idle_since: Option<Instant> = None;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(IDLE_POLL_INTERVAL), if idle_exit.is_some() => {
                let busy = dispatcher.in_flight() > 0 || dispatcher.pending_retries() > 0;
                if busy {
                    idle_since = None;
                    continue;
                }

                let since = *idle_since.get_or_insert_with(Instant::now);
                if idle_exit.is_some_and(|limit| since.elapsed() >= limit) {
                    info!("no remaining work; exiting");
                    let _ = shutdown_tx.send(true);
                }
            }
        }
    }

    debug!("waiting for dispatcher to stop");
    dispatcher.join().await;
    info!("courier stopped");
    Ok(())
}
