//! # Sync Loop
//!
//! Bridges the durable store and the scheduler. On startup it bootstraps the
//! registry from everything stored; afterwards it polls the store on a fixed
//! interval for integrations, removals, settings and events written since the
//! last read, merges them per tenant and submits them through the collector.
//!
//! Each query keeps its own watermark. A watermark is held back only when its
//! query failed outright, so the next tick's window covers the same rows
//! again; rows that were read but rejected are reported once and skipped.
//! Rows read successfully alongside a failure may be delivered twice.
//!
//! Settings for a tenant whose integration has not been seen yet are held
//! back and attached to the integration when it arrives.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use tokio::sync::{Semaphore, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, instrument, warn};

use crate::collector::Collector;
use crate::config::SchedulerConfig;
use crate::error::{StoreError, WorkError};
use crate::store::{Store, StoreQuery, StoreRead};
use crate::tenant::{Settings, TenantId};
use crate::work::WorkItem;
use crate::worker::WorkProcessor;

/// Upper bounds of the last read that covered its whole window, per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub integrations: DateTime<Utc>,
    pub removals: DateTime<Utc>,
    pub settings: DateTime<Utc>,
    pub events: DateTime<Utc>,
}

impl Watermarks {
    fn at(instant: DateTime<Utc>) -> Self {
        Self {
            integrations: instant,
            removals: instant,
            settings: instant,
            events: instant,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootstrapStats {
    pub tenants_onboarded: u64,
    pub tenants_failed: u64,
    pub orphaned_settings: u64,
    pub orphaned_event_batches: u64,
    pub read_errors: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickStats {
    pub integrations_read: u64,
    pub removals_read: u64,
    pub settings_read: u64,
    pub settings_held: u64,
    pub events_read: u64,
    pub items_submitted: u64,
    pub read_errors: u64,
}

/// Periodic store poller.
pub struct SyncLoop {
    store: Arc<dyn Store>,
    collector: Collector,
    processor: Arc<WorkProcessor>,
    tick_interval: Duration,
    bootstrap_concurrency: usize,
    watermarks: Watermarks,
    /// Tenants with an active integration seen by this loop.
    integrated: HashSet<TenantId>,
    /// Settings waiting for their tenant's integration.
    pending_settings: HashMap<TenantId, Settings>,
}

impl SyncLoop {
    pub fn new(
        store: Arc<dyn Store>,
        collector: Collector,
        processor: Arc<WorkProcessor>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            collector,
            processor,
            tick_interval: config.tick_interval(),
            bootstrap_concurrency: config.sync_bootstrap_concurrency.max(1),
            watermarks: Watermarks::at(DateTime::UNIX_EPOCH),
            integrated: HashSet::new(),
            pending_settings: HashMap::new(),
        }
    }

    pub fn watermarks(&self) -> Watermarks {
        self.watermarks
    }

    /// Tenants whose settings are held until their integration is read.
    pub fn pending_tenants(&self) -> Vec<TenantId> {
        let mut tenant_ids: Vec<_> = self.pending_settings.keys().copied().collect();
        tenant_ids.sort_unstable();
        tenant_ids
    }

    /// Populate the registry from everything stored.
    ///
    /// Onboarding items are applied directly, bypassing the worker pool, so
    /// the registry is complete before live traffic is dispatched.
    #[instrument(skip_all)]
    pub async fn bootstrap(&mut self) -> BootstrapStats {
        let started_at = Utc::now();
        let mut stats = BootstrapStats::default();

        let (integrations, settings, events) = tokio::join!(
            self.store.read_integrations(StoreQuery::All),
            self.store.read_settings(StoreQuery::All),
            self.store.read_events(StoreQuery::All),
        );

        // A failed bootstrap query leaves its watermark at the epoch so the
        // first tick reads that table in full.
        let mut watermarks = Watermarks::at(started_at);
        let integrations = accept(integrations, "integrations", &mut stats.read_errors)
            .on_held(|| watermarks.integrations = DateTime::UNIX_EPOCH);
        let mut settings = accept(settings, "settings", &mut stats.read_errors)
            .on_held(|| watermarks.settings = DateTime::UNIX_EPOCH);
        let mut events = accept(events, "events", &mut stats.read_errors)
            .on_held(|| watermarks.events = DateTime::UNIX_EPOCH);

        self.integrated = integrations.data.keys().copied().collect();
        let mut items: Vec<WorkItem> = integrations
            .data
            .into_values()
            .map(|integration| {
                let tenant_id = integration.tenant_id;
                WorkItem::onboarding(
                    integration,
                    settings.data.remove(&tenant_id).unwrap_or_default(),
                )
                .with_events(events.data.remove(&tenant_id).unwrap_or_default())
            })
            .collect();
        items.sort_unstable_by_key(|item| item.tenant_id);

        stats.orphaned_settings = settings.data.len() as u64;
        for (tenant_id, document) in settings.data {
            warn!(tenant_id, "Settings stored without an integration; holding them");
            self.pending_settings.insert(tenant_id, document);
        }
        for tenant_id in events.data.keys() {
            debug!(tenant_id, "Events stored without an integration; skipping");
        }
        stats.orphaned_event_batches = events.data.len() as u64;

        let semaphore = Arc::new(Semaphore::new(self.bootstrap_concurrency));
        let mut tasks = JoinSet::new();
        for item in items {
            let semaphore = semaphore.clone();
            let processor = self.processor.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                processor.process(item).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) if report.is_success() => stats.tenants_onboarded += 1,
                Ok(_) => stats.tenants_failed += 1,
                Err(err) => {
                    stats.tenants_failed += 1;
                    error!(error = ?err, "Bootstrap task panicked or was cancelled");
                }
            }
        }

        self.watermarks = watermarks;
        gauge!("steward_sync_pending_settings").set(self.pending_settings.len() as f64);

        info!(
            onboarded = stats.tenants_onboarded,
            failed = stats.tenants_failed,
            orphaned_settings = stats.orphaned_settings,
            read_errors = stats.read_errors,
            "Bootstrap completed"
        );

        stats
    }

    /// Read one window of changes and submit it.
    #[instrument(skip_all)]
    pub async fn tick(&mut self) -> TickStats {
        let until = Utc::now();
        let mut stats = TickStats::default();
        let watermarks = self.watermarks;
        let window = |since| StoreQuery::Changed { since, until };

        let (integrations, removals, settings, events) = tokio::join!(
            self.store.read_integrations(window(watermarks.integrations)),
            self.store.read_removals(window(watermarks.removals)),
            self.store.read_settings(window(watermarks.settings)),
            self.store.read_events(window(watermarks.events)),
        );

        let integrations = accept(integrations, "integrations", &mut stats.read_errors)
            .on_advance(|| self.watermarks.integrations = until);
        let removals = accept(removals, "removals", &mut stats.read_errors)
            .on_advance(|| self.watermarks.removals = until);
        let settings = accept(settings, "settings", &mut stats.read_errors)
            .on_advance(|| self.watermarks.settings = until);
        let events = accept(events, "events", &mut stats.read_errors)
            .on_advance(|| self.watermarks.events = until);

        stats.integrations_read = integrations.data.len() as u64;
        stats.removals_read = removals.data.len() as u64;
        stats.settings_read = settings.data.len() as u64;
        stats.events_read = events.data.values().map(|batch| batch.len() as u64).sum();

        let mut items: HashMap<TenantId, WorkItem> = HashMap::new();
        for tenant_id in removals.data {
            self.integrated.remove(&tenant_id);
            self.pending_settings.remove(&tenant_id);
            items.insert(tenant_id, WorkItem::removal(tenant_id));
        }
        for (tenant_id, integration) in integrations.data {
            self.integrated.insert(tenant_id);
            let item = items
                .entry(tenant_id)
                .or_insert_with(|| WorkItem::new(tenant_id));
            item.integration = Some(integration);
            if let Some(held) = self.pending_settings.remove(&tenant_id) {
                debug!(tenant_id, "Attaching held settings to integration");
                item.settings = Some(held);
            }
        }
        for (tenant_id, document) in settings.data {
            if !self.integrated.contains(&tenant_id) {
                debug!(tenant_id, "Holding settings until the integration arrives");
                self.pending_settings.insert(tenant_id, document);
                stats.settings_held += 1;
                continue;
            }
            items
                .entry(tenant_id)
                .or_insert_with(|| WorkItem::new(tenant_id))
                .settings = Some(document);
        }
        for (tenant_id, batch) in events.data {
            items
                .entry(tenant_id)
                .or_insert_with(|| WorkItem::new(tenant_id))
                .events
                .extend(batch);
        }
        gauge!("steward_sync_pending_settings").set(self.pending_settings.len() as f64);

        if !items.is_empty() {
            match self.collector.submit_batch(items).await {
                Ok(submitted) => stats.items_submitted = submitted as u64,
                Err(err) => error!(error = %err, "Failed to submit work batch"),
            }
        }

        debug!(
            integrations = stats.integrations_read,
            removals = stats.removals_read,
            settings = stats.settings_read,
            settings_held = stats.settings_held,
            events = stats.events_read,
            submitted = stats.items_submitted,
            read_errors = stats.read_errors,
            "Sync tick completed"
        );

        stats
    }

    /// Run ticks on the configured interval until the returned handle is
    /// stopped (or dropped).
    pub fn start(self) -> SyncLoopHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(stop_rx));
        SyncLoopHandle {
            stop_tx: Some(stop_tx),
            task,
        }
    }

    #[instrument(skip_all)]
    async fn run(mut self, mut stop_rx: oneshot::Receiver<oneshot::Sender<()>>) {
        info!(
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            "Starting sync loop"
        );
        let mut ticker = interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                stop = &mut stop_rx => {
                    info!("Sync loop stop requested");
                    if let Ok(ack) = stop {
                        let _ = ack.send(());
                    }
                    break;
                }
                _ = ticker.tick() => {
                    let tick_started = Instant::now();
                    self.tick().await;
                    let elapsed = tick_started.elapsed();
                    histogram!("steward_sync_tick_duration_ms")
                        .record(elapsed.as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Sync loop stopped");
    }
}

/// Stop handle for a running [`SyncLoop`].
pub struct SyncLoopHandle {
    stop_tx: Option<oneshot::Sender<oneshot::Sender<()>>>,
    task: JoinHandle<()>,
}

impl SyncLoopHandle {
    /// Stop the loop and wait until it has acknowledged and exited. A tick
    /// in progress completes first. Returns whether the loop acknowledged.
    pub async fn stop(mut self) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        let acknowledged = match self.stop_tx.take() {
            Some(stop_tx) => stop_tx.send(ack_tx).is_ok() && ack_rx.await.is_ok(),
            None => false,
        };

        if let Err(err) = (&mut self.task).await {
            error!(error = ?err, "Sync loop task failed");
        }
        acknowledged
    }
}

/// Data of one read plus whether its watermark may move past the window.
struct Accepted<T> {
    data: T,
    advance: bool,
}

impl<T> Accepted<T> {
    fn on_advance(self, advance: impl FnOnce()) -> Self {
        if self.advance {
            advance();
        }
        self
    }

    fn on_held(self, held: impl FnOnce()) -> Self {
        if !self.advance {
            held();
        }
        self
    }
}

fn accept<T>(read: StoreRead<T>, query: &'static str, read_errors: &mut u64) -> Accepted<T> {
    let advance = read.is_exhausted();
    let StoreRead { data, error } = read;
    if let Some(source) = error {
        report_read_error(query, source);
        *read_errors += 1;
    }
    Accepted { data, advance }
}

fn report_read_error(query: &'static str, source: StoreError) {
    let err = WorkError::StoreRead { query, source };
    error!(query, error = %err, "Store read failed");
    counter!("steward_work_item_errors_total", "kind" => err.kind()).increment(1);
}
