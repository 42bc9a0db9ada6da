//! Periodic removal of builder pods that outlived their timeout

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::pipeline::Pipeline;

/// Run the sweep every `interval` until `shutdown` flips to true
pub async fn run_sweeper(pipeline: Arc<Pipeline>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!("Starting builder pod sweeper: interval={}s", interval.as_secs());
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match pipeline.sweep_builder_pods().await {
                    Ok(0) => debug!("no stale builder pods"),
                    Ok(removed) => info!(removed, "removed stale builder pods"),
                    Err(e) => warn!("builder pod sweep failed: {}", e),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Builder pod sweeper shutting down");
                    break;
                }
            }
        }
    }
}

/// Spawn the sweeper; the returned sender stops it
pub fn spawn_sweeper(pipeline: Arc<Pipeline>, interval: Duration) -> watch::Sender<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(run_sweeper(pipeline, interval, shutdown_rx));
    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::pipeline;
    use crate::test_support::TestEnv;

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let env = TestEnv::new();
        let pipeline = Arc::new(pipeline(&env));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_sweeper(pipeline, Duration::from_millis(5), rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
