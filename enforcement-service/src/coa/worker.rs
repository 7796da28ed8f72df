//! Bounded pool of network control workers fed through a channel.

use service_core::error::AppError;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::{CoaAction, CoaDispatcher, CoaResult};
use crate::services::Store;

/// A queued control action for one subscriber.
#[derive(Debug)]
pub struct CoaCommand {
    pub subscription_id: Uuid,
    pub username: String,
    pub action: CoaAction,
    /// Receives the result once the device answered or timed out.
    pub reply: Option<oneshot::Sender<CoaResult>>,
}

/// Producer side of the worker pool.
#[derive(Clone)]
pub struct CoaQueue {
    tx: mpsc::Sender<CoaCommand>,
}

impl CoaQueue {
    pub async fn enqueue(&self, command: CoaCommand) -> Result<(), AppError> {
        self.tx.send(command).await.map_err(|_| {
            tracing::error!("CoA worker pool is not running");
            AppError::ServiceUnavailable
        })
    }

    /// Enqueue and hand back a receiver for the result.
    pub async fn request(
        &self,
        subscription_id: Uuid,
        username: &str,
        action: CoaAction,
    ) -> Result<oneshot::Receiver<CoaResult>, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(CoaCommand {
            subscription_id,
            username: username.to_string(),
            action,
            reply: Some(reply_tx),
        })
        .await?;
        Ok(reply_rx)
    }
}

pub struct CoaWorkerPool {
    dispatcher: Arc<CoaDispatcher>,
    store: Arc<dyn Store>,
    workers: usize,
    rx: mpsc::Receiver<CoaCommand>,
    shutdown: CancellationToken,
}

impl CoaWorkerPool {
    pub fn new(
        dispatcher: Arc<CoaDispatcher>,
        store: Arc<dyn Store>,
        workers: usize,
        queue_size: usize,
        shutdown: CancellationToken,
    ) -> (Self, CoaQueue) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let pool = Self {
            dispatcher,
            store,
            workers: workers.max(1),
            rx,
            shutdown,
        };
        (pool, CoaQueue { tx })
    }

    /// Spawn the distributor. The returned handle completes after shutdown
    /// once in-flight requests have finished.
    pub fn start(self) -> JoinHandle<()> {
        let CoaWorkerPool {
            dispatcher,
            store,
            workers,
            mut rx,
            shutdown,
        } = self;

        tracing::info!(worker_count = workers, "Starting CoA worker pool");

        tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(workers));
            let tracker = TaskTracker::new();

            loop {
                let command = tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("CoA distributor shutting down");
                        break;
                    }
                    command = rx.recv() => match command {
                        Some(command) => command,
                        None => {
                            tracing::info!("Channel closed, CoA distributor exiting");
                            break;
                        }
                    },
                };

                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let dispatcher = dispatcher.clone();
                let store = store.clone();
                tracker.spawn(async move {
                    let _permit = permit;
                    execute(&dispatcher, store.as_ref(), command).await;
                });
            }

            tracker.close();
            tracker.wait().await;
            tracing::info!("CoA worker pool stopped");
        })
    }
}

async fn execute(dispatcher: &CoaDispatcher, store: &dyn Store, command: CoaCommand) {
    let CoaCommand {
        subscription_id,
        username,
        action,
        reply,
    } = command;

    let result = dispatcher.dispatch(&username, &action).await;

    if let Err(e) = store
        .record_coa_outcome(subscription_id, result.as_str(), result.is_failure())
        .await
    {
        tracing::warn!(
            subscription_id = %subscription_id,
            error = %e,
            "Failed to record CoA outcome"
        );
    }

    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}
