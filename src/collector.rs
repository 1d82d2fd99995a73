//! # Collector
//!
//! Producer side of the inbound work queue. Cloned freely: the sync loop and
//! any ingestion path submit through their own copy.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::tenant::TenantId;
use crate::work::WorkItem;

#[derive(Debug, Error)]
#[error("inbound work queue is closed; {unsent} work item(s) not submitted")]
pub struct QueueClosed {
    pub unsent: usize,
}

#[derive(Clone)]
pub struct Collector {
    inbound: mpsc::Sender<WorkItem>,
}

impl Collector {
    /// Create the bounded inbound queue and its first producer.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<WorkItem>) {
        let (inbound, receiver) = mpsc::channel(depth.max(1));
        (Self { inbound }, receiver)
    }

    /// Enqueue one item, waiting for queue space.
    pub async fn submit(&self, item: WorkItem) -> Result<(), QueueClosed> {
        self.inbound
            .send(item)
            .await
            .map_err(|_| QueueClosed { unsent: 1 })
    }

    /// Enqueue every item of a tick, ordered by tenant. Returns the number
    /// submitted.
    pub async fn submit_batch(
        &self,
        items: HashMap<TenantId, WorkItem>,
    ) -> Result<usize, QueueClosed> {
        let mut items: Vec<_> = items.into_iter().collect();
        items.sort_unstable_by_key(|(tenant_id, _)| *tenant_id);

        let total = items.len();
        for (submitted, (_, item)) in items.into_iter().enumerate() {
            if self.inbound.send(item).await.is_err() {
                return Err(QueueClosed {
                    unsent: total - submitted,
                });
            }
        }

        debug!(submitted = total, "Submitted work batch");
        Ok(total)
    }

    /// Free slots in the inbound queue.
    pub fn capacity(&self) -> usize {
        self.inbound.capacity()
    }
}
