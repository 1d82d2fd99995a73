//! # Dispatcher
//!
//! Owns the fixed worker pool and routes work items to idle workers.
//!
//! Idle workers publish a [`WorkerHandle`] onto a registration queue sized to
//! the pool. A single fan-out task waits for an idle handle first and only
//! then takes the next inbound item, so nothing leaves the inbound queue
//! while every worker is busy and submitters block once it is full. Items for
//! the same tenant carry no ordering guarantee.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::work::WorkItem;
use crate::worker::{WorkProcessor, Worker, WorkerHandle};

/// Running worker pool.
pub struct Dispatcher {
    shutdown: CancellationToken,
    worker_quits: Vec<CancellationToken>,
    worker_tasks: Vec<JoinHandle<()>>,
    fan_out: JoinHandle<()>,
}

impl Dispatcher {
    /// Start `pool_size` workers and the fan-out task reading `inbound`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        pool_size: usize,
        inbound: mpsc::Receiver<WorkItem>,
        processor: Arc<WorkProcessor>,
    ) -> Self {
        let pool_size = pool_size.max(1);
        let shutdown = CancellationToken::new();
        let (registration_tx, registration_rx) = mpsc::channel::<WorkerHandle>(pool_size);

        let mut worker_quits = Vec::with_capacity(pool_size);
        let mut worker_tasks = Vec::with_capacity(pool_size);
        for id in 0..pool_size {
            let quit = shutdown.child_token();
            let worker = Worker::new(
                id,
                processor.clone(),
                registration_tx.clone(),
                quit.clone(),
            );
            worker_quits.push(quit);
            worker_tasks.push(tokio::spawn(worker.run()));
        }
        // Only workers hold the registration sender; once they are all gone
        // the fan-out observes a closed queue instead of waiting forever.
        drop(registration_tx);

        let fan_out = tokio::spawn(fan_out(inbound, registration_rx, shutdown.clone()));

        info!(pool_size, "Dispatcher started");

        Self {
            shutdown,
            worker_quits,
            worker_tasks,
            fan_out,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.worker_quits.len()
    }

    /// Signal one worker to quit after its current item. Returns false for an
    /// unknown worker ID.
    pub fn stop_worker(&self, worker_id: usize) -> bool {
        match self.worker_quits.get(worker_id) {
            Some(quit) => {
                quit.cancel();
                info!(worker_id, "Worker stop requested");
                true
            }
            None => false,
        }
    }

    /// Stop the fan-out task and every worker, then wait for them. Workers
    /// finish the item they hold; items still queued are abandoned.
    #[instrument(skip_all)]
    pub async fn shutdown(self) {
        info!("Dispatcher shutdown requested");
        self.shutdown.cancel();

        if let Err(err) = self.fan_out.await {
            error!(error = ?err, "Fan-out task failed");
        }
        for (worker_id, task) in self.worker_tasks.into_iter().enumerate() {
            if let Err(err) = task.await {
                error!(worker_id, error = ?err, "Worker task failed");
            }
        }

        info!("Dispatcher stopped");
    }
}

async fn fan_out(
    mut inbound: mpsc::Receiver<WorkItem>,
    mut idle: mpsc::Receiver<WorkerHandle>,
    shutdown: CancellationToken,
) {
    // Item given back by a worker that quit before accepting it.
    let mut returned: Option<WorkItem> = None;

    loop {
        let handle = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            handle = idle.recv() => handle,
        };
        let Some(handle) = handle else {
            warn!("Every worker has stopped");
            break;
        };

        let item = match returned.take() {
            Some(item) => item,
            None => {
                let item = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    item = inbound.recv() => item,
                };
                let Some(item) = item else {
                    info!("Inbound queue closed");
                    break;
                };
                item
            }
        };

        if let Err(item) = handle.assign(item).await {
            debug!(
                worker_id = handle.worker_id,
                item_id = %item.id,
                "Worker quit before accepting item, trying next"
            );
            returned = Some(item);
        }
    }

    let abandoned = inbound.len() + usize::from(returned.is_some());
    if abandoned > 0 {
        warn!(abandoned, "Abandoning queued work items");
        counter!("steward_dispatch_dropped_total").increment(abandoned as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TenantRegistry;
    use crate::responses::BuiltinHandlerFactory;
    use crate::tenant::Integration;
    use std::time::Duration;

    fn processor() -> Arc<WorkProcessor> {
        Arc::new(WorkProcessor::new(
            Arc::new(TenantRegistry::new()),
            Arc::new(BuiltinHandlerFactory),
        ))
    }

    fn integration_item(tenant_id: i64) -> WorkItem {
        WorkItem::new(tenant_id).with_integration(Integration {
            tenant_id,
            installation_id: tenant_id,
            app_id: 1,
        })
    }

    async fn wait_for_tenants(processor: &WorkProcessor, count: usize) {
        for _ in 0..200 {
            if processor.registry().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {count} tenants, found {}",
            processor.registry().len()
        );
    }

    #[tokio::test]
    async fn zero_pool_size_starts_one_worker() {
        let (_tx, rx) = mpsc::channel(1);
        let dispatcher = Dispatcher::start(0, rx, processor());
        assert_eq!(dispatcher.pool_size(), 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn stopped_worker_does_not_lose_items() {
        let processor = processor();
        let (tx, rx) = mpsc::channel(16);
        let dispatcher = Dispatcher::start(2, rx, processor.clone());

        assert!(dispatcher.stop_worker(0));
        assert!(!dispatcher.stop_worker(7));

        for tenant_id in 0..6 {
            tx.send(integration_item(tenant_id)).await.unwrap();
        }
        wait_for_tenants(&processor, 6).await;

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_returns_with_idle_workers() {
        let (_tx, rx) = mpsc::channel(4);
        let dispatcher = Dispatcher::start(3, rx, processor());

        tokio::time::timeout(Duration::from_secs(1), dispatcher.shutdown())
            .await
            .expect("shutdown completes");
    }
}
