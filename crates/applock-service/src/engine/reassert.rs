//! Periodic re-assertion loop.
//!
//! Every interval the loop posts a `Tick` into the engine mailbox; the
//! engine then re-hides any locked process that became visible again and
//! purges terminated ones. This is the safety net behind the activation
//! handler: it catches coalesced or missed notifications and window
//! animations that finish after the initial hide burst gave up. The loop
//! itself never touches engine state.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::EngineCommand;

pub struct ReassertLoopHandle {
    /// Send `true` to shut down.
    pub shutdown_tx: watch::Sender<bool>,
}

pub fn spawn_reassert_loop(
    mailbox: mpsc::UnboundedSender<EngineCommand>,
    interval: Duration,
) -> (tokio::task::JoinHandle<()>, ReassertLoopHandle) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        info!(
            interval_ms = interval.as_millis() as u64,
            "re-assertion loop started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("re-assertion loop shutting down");
                        return;
                    }
                }
            }

            if *shutdown_rx.borrow() {
                return;
            }

            if mailbox.send(EngineCommand::Tick).is_err() {
                debug!("engine mailbox closed, re-assertion loop exiting");
                return;
            }
        }
    });

    (handle, ReassertLoopHandle { shutdown_tx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_on_interval_until_shutdown() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (task, handle) = spawn_reassert_loop(tx, Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let mut ticks = 0;
        while let Ok(cmd) = rx.try_recv() {
            assert!(matches!(cmd, EngineCommand::Tick));
            ticks += 1;
        }
        assert_eq!(ticks, 2);

        handle.shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
