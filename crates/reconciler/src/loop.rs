//! Event dispatch loop.
//!
//! Every notification collapses into [`WORK_QUEUE_KEY`], and one worker runs
//! [`RevisionController::sync`] per dequeue until the stop signal fires.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::reconciler::{CONTROLLER_NAME, RevisionController, WORK_QUEUE_KEY};
use crate::types::Notification;

/// Change feeds the controller reacts to.
pub struct EventSources {
    pub operator: broadcast::Receiver<Notification>,
    pub config_maps: broadcast::Receiver<Notification>,
    pub secrets: broadcast::Receiver<Notification>,
}

/// Create a stop signal for [`RevisionController::run`].
pub fn stop_signal() -> (LoopStopper, watch::Receiver<bool>) {
    let (stop_tx, stop_rx) = watch::channel(false);
    (LoopStopper { stop_tx }, stop_rx)
}

/// Handle to stop a running controller.
#[derive(Clone)]
pub struct LoopStopper {
    stop_tx: watch::Sender<bool>,
}

impl LoopStopper {
    /// Stop the loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl RevisionController {
    /// Run until `stop` turns true or its sender is dropped.
    ///
    /// Errors from passes are logged and retried with backoff; nothing is
    /// returned to the caller.
    pub async fn run(self: Arc<Self>, sources: EventSources, mut stop: watch::Receiver<bool>) {
        info!(
            controller = CONTROLLER_NAME,
            namespace = %self.target_namespace,
            queue = self.queue.name(),
            "Starting controller"
        );
        if self.workers > 1 {
            info!(
                requested = self.workers,
                "Only one worker is supported, starting one"
            );
        }

        // Initial pass, as a fresh watch would list every object.
        self.enqueue().await;

        let watchers = [
            self.watch("operator", sources.operator),
            self.watch("configmaps", sources.config_maps),
            self.watch("secrets", sources.secrets),
        ];

        let worker = {
            let controller = Arc::clone(&self);
            tokio::spawn(async move { controller.run_worker().await })
        };

        while !*stop.borrow_and_update() {
            if stop.changed().await.is_err() {
                break;
            }
        }

        info!(controller = CONTROLLER_NAME, "Shutting down controller");
        self.queue.shut_down().await;
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker task ended abnormally");
        }
        for watcher in watchers {
            watcher.abort();
        }
        info!(controller = CONTROLLER_NAME, "Controller stopped");
    }

    async fn run_worker(&self) {
        while self.process_next_work_item().await {}
        debug!("Worker exiting");
    }

    /// Take one key off the queue and reconcile it. Returns `false` once the
    /// queue is shut down.
    pub(crate) async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.sync().await {
            Ok(()) => self.queue.forget(&key).await,
            Err(e) => {
                error!(key, error = %e, "sync failed");
                self.queue.add_rate_limited(key).await;
            }
        }

        self.queue.done(&key).await;
        true
    }

    async fn enqueue(&self) {
        self.queue.add(WORK_QUEUE_KEY).await;
    }

    fn watch(
        self: &Arc<Self>,
        source: &'static str,
        mut events: broadcast::Receiver<Notification>,
    ) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(notification) => {
                        debug!(source, object = %notification.key(), "Change observed");
                        controller.enqueue().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(source, missed, "Watch lagged, resyncing");
                        controller.enqueue().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(source, "Watch closed");
                        return;
                    }
                }
            }
        })
    }
}
