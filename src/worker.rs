//! # Worker
//!
//! Applies work items to the tenant registry. [`WorkProcessor`] holds the
//! processing rules and is shared by every worker in the pool (and by the
//! sync loop bootstrap). [`Worker`] is the pool member: it announces itself
//! as idle on the registration queue, waits for one item on its own inbox,
//! processes it and announces itself again.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::error::WorkError;
use crate::reconciler::{self, ReconcileError, release_all};
use crate::registry::{TenantRegistry, TenantState};
use crate::responses::{HandlerFactory, HandlerKey, HandlerMap, Suggestion};
use crate::telemetry::{TraceContext, current_trace_id};
use crate::tenant::{EventContainer, Integration, Settings, TenantId};
use crate::work::WorkItem;

/// Outcome of processing one work item.
#[derive(Debug)]
pub struct WorkReport {
    pub item_id: Uuid,
    pub tenant_id: TenantId,
    /// Trace ID active while the item was applied.
    pub trace_id: Option<String>,
    pub errors: Vec<WorkError>,
    pub suggestions: Vec<(HandlerKey, Suggestion)>,
}

impl WorkReport {
    fn new(item: &WorkItem) -> Self {
        Self {
            item_id: item.id,
            tenant_id: item.tenant_id,
            trace_id: current_trace_id(),
            errors: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Rules for applying a work item to the registry.
pub struct WorkProcessor {
    registry: Arc<TenantRegistry>,
    factory: Arc<dyn HandlerFactory>,
}

impl WorkProcessor {
    pub fn new(registry: Arc<TenantRegistry>, factory: Arc<dyn HandlerFactory>) -> Self {
        Self { registry, factory }
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    /// Apply one item. Errors are logged, counted and returned in the report;
    /// they never propagate further.
    pub async fn process(&self, item: WorkItem) -> WorkReport {
        let context = TraceContext::for_work_item(item.id);
        let span = info_span!("work_item", trace_id = %context.trace_id);
        let report = context.scope(self.apply(item)).instrument(span).await;

        for error in &report.errors {
            warn!(
                trace_id = report.trace_id.as_deref(),
                tenant_id = report.tenant_id,
                kind = error.kind(),
                error = %error,
                "Work item failed"
            );
            counter!("steward_work_item_errors_total", "kind" => error.kind()).increment(1);
        }

        report
    }

    #[instrument(skip_all, fields(tenant_id = item.tenant_id, kind = item.kind()))]
    async fn apply(&self, item: WorkItem) -> WorkReport {
        let mut report = WorkReport::new(&item);
        counter!("steward_work_items_processed_total", "kind" => item.kind()).increment(1);

        if item.is_malformed() {
            report.errors.push(WorkError::MalformedWorkItem {
                tenant_id: item.tenant_id,
                item_id: item.id,
            });
            return report;
        }

        // Removal wins over anything else carried by the item.
        if item.remove {
            self.remove_tenant(item.tenant_id);
            return report;
        }

        let tenant_id = item.tenant_id;
        let outcome = match (item.integration, item.settings) {
            (Some(integration), Some(settings)) => self.onboard(integration, settings),
            (Some(integration), None) => self.register_integration(integration),
            (None, Some(settings)) => self.update_settings(tenant_id, settings),
            (None, None) => Ok(()),
        };
        if let Err(err) = outcome {
            report.errors.push(err);
        }

        if !item.events.is_empty() {
            self.dispatch_events(tenant_id, &item.events, &mut report)
                .await;
        }

        report
    }

    fn onboard(&self, integration: Integration, settings: Settings) -> Result<(), WorkError> {
        let tenant_id = integration.tenant_id;
        let reconciled = match reconciler::reconcile(
            tenant_id,
            &HandlerMap::new(),
            &settings,
            self.factory.as_ref(),
        ) {
            Ok(reconciled) => reconciled,
            Err(source) => {
                // Register the identity without handlers so a corrected
                // settings update can still reach the tenant. A tenant that
                // is already registered keeps its current handlers.
                let bare = TenantState::new(integration, Settings::default(), HandlerMap::new());
                if self.registry.insert_if_absent(tenant_id, bare) {
                    info!(tenant_id, "Tenant registered without handlers");
                }
                return Err(WorkError::UnrecognizedHandler { tenant_id, source });
            }
        };

        let handlers = reconciled.handlers.len();
        let state = TenantState::new(integration, settings, reconciled.handlers);
        if let Some(previous) = self.registry.put(tenant_id, state) {
            let stopped = release_all(&previous.active_handlers);
            debug!(tenant_id, stopped, "Replaced existing tenant state");
        }

        info!(tenant_id, handlers, "Tenant onboarded");
        Ok(())
    }

    /// An integration without settings only matters for unknown tenants;
    /// for known ones the integration is immutable.
    fn register_integration(&self, integration: Integration) -> Result<(), WorkError> {
        if self.registry.contains(integration.tenant_id) {
            debug!(
                tenant_id = integration.tenant_id,
                "Integration already registered"
            );
            return Ok(());
        }
        self.onboard(integration, Settings::default())
    }

    fn update_settings(&self, tenant_id: TenantId, settings: Settings) -> Result<(), WorkError> {
        let factory = self.factory.as_ref();
        let outcome = self.registry.update(tenant_id, |state| -> Result<_, ReconcileError> {
            let reconciled =
                reconciler::reconcile(tenant_id, &state.active_handlers, &settings, factory)?;
            let summary = (
                reconciled.started.len(),
                reconciled.updated.len(),
                reconciled.stopped.len(),
            );
            state.active_handlers = reconciled.handlers;
            state.settings = settings;
            Ok(summary)
        });

        match outcome {
            None => Err(WorkError::TenantNotFound { tenant_id }),
            Some(Err(source)) => Err(WorkError::UnrecognizedHandler { tenant_id, source }),
            Some(Ok((started, updated, stopped))) => {
                info!(tenant_id, started, updated, stopped, "Tenant settings applied");
                Ok(())
            }
        }
    }

    fn remove_tenant(&self, tenant_id: TenantId) {
        match self.registry.delete(tenant_id) {
            Some(state) => {
                let stopped = release_all(&state.active_handlers);
                info!(tenant_id, stopped, "Tenant removed");
            }
            None => debug!(tenant_id, "Removal for unknown tenant ignored"),
        }
    }

    async fn dispatch_events(
        &self,
        tenant_id: TenantId,
        events: &[EventContainer],
        report: &mut WorkReport,
    ) {
        let Some(state) = self.registry.get(tenant_id) else {
            report.errors.push(WorkError::TenantNotFound { tenant_id });
            return;
        };

        for key in state.handler_keys() {
            let handler = &state.active_handlers[&key];
            let batch: Vec<EventContainer> = events
                .iter()
                .filter(|event| event.action == key.action && handler.accepts(event))
                .cloned()
                .collect();
            if batch.is_empty() {
                continue;
            }

            match handler.consume(&batch).await {
                Ok(suggestions) => {
                    if !suggestions.is_empty() {
                        info!(
                            tenant_id,
                            handler = %key,
                            suggestions = suggestions.len(),
                            "Handler produced suggestions"
                        );
                    }
                    report
                        .suggestions
                        .extend(suggestions.into_iter().map(|s| (key.clone(), s)));
                }
                Err(source) => report.errors.push(WorkError::Handler {
                    tenant_id,
                    key: key.clone(),
                    source,
                }),
            }
        }
    }
}

/// Handle to an idle worker's inbox, published on the registration queue.
pub struct WorkerHandle {
    pub worker_id: usize,
    inbox: mpsc::Sender<WorkItem>,
}

impl WorkerHandle {
    /// Hand `item` to the worker. Gives the item back if the worker has quit.
    pub async fn assign(&self, item: WorkItem) -> Result<(), WorkItem> {
        self.inbox.send(item).await.map_err(|returned| returned.0)
    }
}

/// One member of the dispatcher's pool.
pub struct Worker {
    id: usize,
    processor: Arc<WorkProcessor>,
    registration: mpsc::Sender<WorkerHandle>,
    quit: CancellationToken,
}

impl Worker {
    pub fn new(
        id: usize,
        processor: Arc<WorkProcessor>,
        registration: mpsc::Sender<WorkerHandle>,
        quit: CancellationToken,
    ) -> Self {
        Self {
            id,
            processor,
            registration,
            quit,
        }
    }

    /// Serve items until the quit token fires. An item already handed over is
    /// always processed before the worker exits.
    pub async fn run(self) {
        let span = info_span!("worker", worker_id = self.id);
        self.serve().instrument(span).await
    }

    async fn serve(self) {
        let (inbox_tx, mut inbox_rx) = mpsc::channel::<WorkItem>(1);
        debug!("Worker started");

        loop {
            let handle = WorkerHandle {
                worker_id: self.id,
                inbox: inbox_tx.clone(),
            };
            let registered = tokio::select! {
                biased;
                _ = self.quit.cancelled() => false,
                sent = self.registration.send(handle) => sent.is_ok(),
            };
            if !registered {
                break;
            }

            let item = tokio::select! {
                biased;
                _ = self.quit.cancelled() => None,
                item = inbox_rx.recv() => item,
            };
            let Some(item) = item else {
                break;
            };
            self.processor.process(item).await;
        }

        // The dispatcher may have handed us an item just before quit fired.
        inbox_rx.close();
        while let Ok(item) = inbox_rx.try_recv() {
            self.processor.process(item).await;
        }
        debug!("Worker stopped");
    }
}
