//! End-to-end scheduler tests: collector, dispatcher, worker pool, registry
//! and sync loop wired together the way the binary wires them.

mod test_utils;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use serde_json::json;
use tokio::sync::Semaphore;

use steward::collector::Collector;
use steward::config::SchedulerConfig;
use steward::dispatcher::Dispatcher;
use steward::error::WorkError;
use steward::registry::TenantRegistry;
use steward::responses::{
    BuiltinHandlerFactory, HandlerError, HandlerFactory, HandlerKey, HandlerKind,
    ResponseHandler, Suggestion,
};
use steward::repositories::{IntegrationRepository, SettingsRepository};
use steward::store::DatabaseStore;
use steward::sync_loop::SyncLoop;
use steward::tenant::{EventContainer, Options, Settings, TenantId};
use steward::work::WorkItem;
use steward::worker::WorkProcessor;
use test_utils::{insert_opened_issue, install_tenant, integration, setup_test_db};

/// Tracks how many handlers are consuming at once across all tenants.
#[derive(Default)]
struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
    consumed: AtomicUsize,
}

struct SlowHandler {
    concurrency: Arc<Concurrency>,
    gate: Option<Arc<Semaphore>>,
    options: std::sync::Mutex<Options>,
    running: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl ResponseHandler for SlowHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Label
    }

    fn options(&self) -> Options {
        self.options.lock().unwrap().clone()
    }

    fn apply_options(&self, options: Options) {
        *self.options.lock().unwrap() = options;
    }

    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn accepts(&self, _event: &EventContainer) -> bool {
        true
    }

    async fn consume(&self, events: &[EventContainer]) -> Result<Vec<Suggestion>, HandlerError> {
        let now = self.concurrency.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.concurrency.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.concurrency.current.fetch_sub(1, Ordering::SeqCst);
        self.concurrency
            .consumed
            .fetch_add(events.len(), Ordering::SeqCst);
        Ok(Vec::new())
    }
}

struct SlowFactory {
    concurrency: Arc<Concurrency>,
    /// Consumers wait for a permit when set.
    gate: Option<Arc<Semaphore>>,
}

impl HandlerFactory for SlowFactory {
    fn create(
        &self,
        _tenant_id: TenantId,
        _kind: HandlerKind,
        options: Options,
    ) -> Arc<dyn ResponseHandler> {
        Arc::new(SlowHandler {
            concurrency: self.concurrency.clone(),
            gate: self.gate.clone(),
            options: std::sync::Mutex::new(options),
            running: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

fn label_settings() -> Settings {
    Settings::default().with_handler("opened", "label", Options::default())
}

fn opened_issue(tenant_id: TenantId, number: i64) -> EventContainer {
    EventContainer::new(
        tenant_id,
        "issues",
        "opened",
        json!({ "issue": { "number": number } }),
    )
}

fn slow_processor(concurrency: &Arc<Concurrency>, gate: Option<Arc<Semaphore>>) -> Arc<WorkProcessor> {
    Arc::new(WorkProcessor::new(
        Arc::new(TenantRegistry::new()),
        Arc::new(SlowFactory {
            concurrency: concurrency.clone(),
            gate,
        }),
    ))
}

/// A bootstrapped sync loop over `db` feeding a two-worker pool.
async fn database_pipeline(
    db: &DatabaseConnection,
    processor: &Arc<WorkProcessor>,
) -> (SyncLoop, Dispatcher) {
    let (collector, inbound) = Collector::channel(16);
    let mut sync_loop = SyncLoop::new(
        Arc::new(DatabaseStore::new(db.clone())),
        collector,
        processor.clone(),
        &SchedulerConfig::default(),
    );
    sync_loop.bootstrap().await;
    let dispatcher = Dispatcher::start(2, inbound, processor.clone());
    // Rows written from here on land after the bootstrap watermarks.
    tokio::time::sleep(Duration::from_millis(5)).await;
    (sync_loop, dispatcher)
}

fn builtin_processor() -> Arc<WorkProcessor> {
    Arc::new(WorkProcessor::new(
        Arc::new(TenantRegistry::new()),
        Arc::new(BuiltinHandlerFactory),
    ))
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn pool_never_exceeds_its_size() {
    const POOL_SIZE: usize = 3;
    const TENANTS: i64 = 12;

    let concurrency = Arc::new(Concurrency::default());
    let processor = slow_processor(&concurrency, None);
    let (collector, inbound) = Collector::channel(64);
    let dispatcher = Dispatcher::start(POOL_SIZE, inbound, processor.clone());

    for tenant_id in 1..=TENANTS {
        let item = WorkItem::onboarding(integration(tenant_id), label_settings())
            .with_events(vec![opened_issue(tenant_id, tenant_id)]);
        collector.submit(item).await.unwrap();
    }

    eventually(|| concurrency.consumed.load(Ordering::SeqCst) == TENANTS as usize).await;
    assert!(concurrency.peak.load(Ordering::SeqCst) <= POOL_SIZE);
    assert_eq!(processor.registry().len(), TENANTS as usize);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn failing_item_does_not_block_other_tenants() {
    let processor = builtin_processor();
    let (collector, inbound) = Collector::channel(16);
    let dispatcher = Dispatcher::start(2, inbound, processor.clone());

    collector
        .submit(WorkItem::settings_update(999, label_settings()))
        .await
        .unwrap();
    collector.submit(WorkItem::new(998)).await.unwrap();
    for tenant_id in 1..=4 {
        collector
            .submit(WorkItem::onboarding(integration(tenant_id), label_settings()))
            .await
            .unwrap();
    }

    eventually(|| processor.registry().len() == 4).await;
    assert!(!processor.registry().contains(999));
    assert!(!processor.registry().contains(998));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn settings_update_keeps_handler_instance() {
    let processor = builtin_processor();
    let (collector, inbound) = Collector::channel(16);
    let dispatcher = Dispatcher::start(2, inbound, processor.clone());
    let registry = processor.registry().clone();
    let assignment = HandlerKey::new("opened", HandlerKind::Assignment);
    let label = HandlerKey::new("opened", HandlerKind::Label);

    let first = Settings::default().with_handler(
        "opened",
        "assignment",
        Options {
            max_assigned: 1,
            ..Default::default()
        },
    );
    collector
        .submit(WorkItem::onboarding(integration(66), first))
        .await
        .unwrap();
    eventually(|| registry.contains(66)).await;
    let before = registry.get(66).unwrap().active_handlers[&assignment].clone();

    let second = Settings::default()
        .with_handler(
            "opened",
            "assignment",
            Options {
                max_assigned: 2,
                ..Default::default()
            },
        )
        .with_handler(
            "opened",
            "label",
            Options {
                default: vec!["bug".into()],
                ..Default::default()
            },
        );
    collector
        .submit(WorkItem::settings_update(66, second.clone()))
        .await
        .unwrap();
    eventually(|| {
        registry
            .get(66)
            .is_some_and(|state| state.active_handlers.len() == 2)
    })
    .await;

    let state = registry.get(66).unwrap();
    assert_eq!(state.handler_keys(), vec![assignment.clone(), label.clone()]);
    assert_eq!(state.settings, second);
    let after = &state.active_handlers[&assignment];
    assert!(std::ptr::addr_eq(Arc::as_ptr(&before), Arc::as_ptr(after)));
    assert_eq!(after.options().max_assigned, 2);
    assert_eq!(state.active_handlers[&label].options().default, vec!["bug"]);
    assert!(state.active_handlers.values().all(|h| h.is_running()));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn unrecognized_handler_leaves_active_handlers_untouched() {
    let processor = builtin_processor();
    let onboard = processor
        .process(WorkItem::onboarding(integration(7), label_settings()))
        .await;
    assert!(onboard.is_success());
    let before = processor.registry().get(7).unwrap();

    let triage = label_settings()
        .with_handler("opened", "triage", Options::default())
        .with_handler("closed", "assignment", Options::default());
    let report = processor
        .process(WorkItem::settings_update(7, triage))
        .await;

    assert!(matches!(
        report.errors.as_slice(),
        [WorkError::UnrecognizedHandler { tenant_id: 7, .. }]
    ));
    let after = processor.registry().get(7).unwrap();
    assert_eq!(after.handler_keys(), before.handler_keys());
    assert_eq!(after.settings, label_settings());
    for (key, handler) in &before.active_handlers {
        assert!(std::ptr::addr_eq(
            Arc::as_ptr(handler),
            Arc::as_ptr(&after.active_handlers[key])
        ));
        assert!(handler.is_running());
    }
}

#[tokio::test]
async fn events_reach_handlers_through_the_pool() {
    let processor = builtin_processor();
    let label = Settings::default().with_handler(
        "opened",
        "label",
        Options {
            default: vec!["bug".into()],
            ..Default::default()
        },
    );
    processor
        .process(WorkItem::onboarding(integration(8), label))
        .await;

    let report = processor
        .process(WorkItem::events(8, vec![opened_issue(8, 42)]))
        .await;

    assert!(report.is_success());
    assert_eq!(
        report.suggestions,
        vec![(
            HandlerKey::new("opened", HandlerKind::Label),
            Suggestion::Label {
                issue_number: 42,
                labels: vec!["bug".into()],
                as_comment: false,
            }
        )]
    );
}

#[tokio::test]
async fn tick_with_one_bad_settings_row_still_delivers_other_tenants() {
    let db = setup_test_db().await.unwrap();
    let processor = builtin_processor();
    let (collector, inbound) = Collector::channel(16);
    let config = SchedulerConfig::default();
    let mut sync_loop = SyncLoop::new(
        Arc::new(DatabaseStore::new(db.clone())),
        collector,
        processor.clone(),
        &config,
    );
    sync_loop.bootstrap().await;
    let bootstrapped = sync_loop.watermarks();
    let dispatcher = Dispatcher::start(2, inbound, processor.clone());

    tokio::time::sleep(Duration::from_millis(5)).await;
    install_tenant(&db, 1, &label_settings()).await.unwrap();
    install_tenant(&db, 3, &label_settings()).await.unwrap();
    IntegrationRepository::new(&db)
        .insert(&integration(2))
        .await
        .unwrap();
    SettingsRepository::new(&db)
        .upsert_document(2, json!({ "actions": ["broken"] }))
        .await
        .unwrap();
    insert_opened_issue(&db, 3, 5).await.unwrap();

    let stats = sync_loop.tick().await;

    assert_eq!(stats.read_errors, 1);
    assert_eq!(stats.items_submitted, 3);
    let registry = processor.registry().clone();
    eventually(|| registry.len() == 3).await;
    assert_eq!(registry.get(1).unwrap().active_handlers.len(), 1);
    assert_eq!(registry.get(3).unwrap().active_handlers.len(), 1);
    assert!(registry.get(2).unwrap().active_handlers.is_empty());

    let watermarks = sync_loop.watermarks();
    assert!(watermarks.settings > bootstrapped.settings);
    assert!(watermarks.integrations > bootstrapped.integrations);
    assert!(watermarks.events > bootstrapped.events);

    // The rejected row is not read again.
    let quiet = sync_loop.tick().await;
    assert_eq!(quiet.read_errors, 0);
    assert_eq!(quiet.items_submitted, 0);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn bootstrap_onboards_stored_tenants_before_dispatch() {
    let db = setup_test_db().await.unwrap();
    install_tenant(&db, 10, &label_settings()).await.unwrap();
    install_tenant(&db, 11, &Settings::default()).await.unwrap();
    SettingsRepository::new(&db)
        .upsert(12, &label_settings())
        .await
        .unwrap();

    let processor = builtin_processor();
    let (collector, _inbound) = Collector::channel(4);
    let mut sync_loop = SyncLoop::new(
        Arc::new(DatabaseStore::new(db)),
        collector,
        processor.clone(),
        &SchedulerConfig::default(),
    );

    let stats = sync_loop.bootstrap().await;

    assert_eq!(stats.tenants_onboarded, 2);
    assert_eq!(stats.orphaned_settings, 1);
    assert_eq!(stats.read_errors, 0);
    let registry = processor.registry();
    assert_eq!(registry.tenant_ids(), vec![10, 11]);
    assert_eq!(registry.get(10).unwrap().active_handlers.len(), 1);
}

#[tokio::test]
async fn submit_blocks_while_every_worker_is_busy_and_the_queue_is_full() {
    const DEPTH: usize = 2;

    let concurrency = Arc::new(Concurrency::default());
    let gate = Arc::new(Semaphore::new(0));
    let processor = slow_processor(&concurrency, Some(gate.clone()));
    let (collector, inbound) = Collector::channel(DEPTH);
    let dispatcher = Dispatcher::start(1, inbound, processor.clone());
    let item = |tenant_id: TenantId| {
        WorkItem::onboarding(integration(tenant_id), label_settings())
            .with_events(vec![opened_issue(tenant_id, 1)])
    };

    collector.submit(item(1)).await.unwrap();
    eventually(|| concurrency.current.load(Ordering::SeqCst) == 1).await;

    let mut accepted = 1;
    let mut blocked = false;
    for tenant_id in 2..=10 {
        let submit = collector.submit(item(tenant_id));
        match tokio::time::timeout(Duration::from_millis(50), submit).await {
            Ok(result) => {
                result.unwrap();
                accepted += 1;
            }
            Err(_) => {
                blocked = true;
                break;
            }
        }
    }
    assert!(blocked);
    assert_eq!(accepted, DEPTH + 1);

    gate.add_permits(64);
    eventually(|| concurrency.consumed.load(Ordering::SeqCst) == accepted).await;
    assert_eq!(processor.registry().len(), accepted);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn events_for_unknown_tenant_do_not_disturb_other_items() {
    let concurrency = Arc::new(Concurrency::default());
    let processor = slow_processor(&concurrency, None);
    let (collector, inbound) = Collector::channel(16);
    let dispatcher = Dispatcher::start(2, inbound, processor.clone());

    collector
        .submit(WorkItem::events(77, vec![opened_issue(77, 1)]))
        .await
        .unwrap();
    for tenant_id in 1..=3 {
        collector
            .submit(
                WorkItem::onboarding(integration(tenant_id), label_settings())
                    .with_events(vec![opened_issue(tenant_id, tenant_id)]),
            )
            .await
            .unwrap();
    }
    collector
        .submit(WorkItem::events(77, vec![opened_issue(77, 2)]))
        .await
        .unwrap();

    eventually(|| concurrency.consumed.load(Ordering::SeqCst) == 3).await;
    let registry = processor.registry();
    assert_eq!(registry.tenant_ids(), vec![1, 2, 3]);
    assert!(!registry.contains(77));

    dispatcher.shutdown().await;
    assert_eq!(concurrency.consumed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn settings_written_before_the_integration_are_applied() {
    let db = setup_test_db().await.unwrap();
    let processor = builtin_processor();
    let (mut sync_loop, dispatcher) = database_pipeline(&db, &processor).await;

    SettingsRepository::new(&db)
        .upsert(20, &label_settings())
        .await
        .unwrap();
    let first = sync_loop.tick().await;
    assert_eq!(first.settings_held, 1);
    assert_eq!(first.items_submitted, 0);
    assert_eq!(sync_loop.pending_tenants(), vec![20]);

    tokio::time::sleep(Duration::from_millis(5)).await;
    IntegrationRepository::new(&db)
        .insert(&integration(20))
        .await
        .unwrap();
    let second = sync_loop.tick().await;
    assert_eq!(second.items_submitted, 1);

    let registry = processor.registry().clone();
    eventually(|| registry.contains(20)).await;
    let state = registry.get(20).unwrap();
    assert_eq!(state.settings, label_settings());
    assert_eq!(state.active_handlers.len(), 1);
    assert!(sync_loop.pending_tenants().is_empty());

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn tenant_with_rejected_settings_recovers_after_a_fix() {
    let db = setup_test_db().await.unwrap();
    let processor = builtin_processor();
    let (mut sync_loop, dispatcher) = database_pipeline(&db, &processor).await;
    let registry = processor.registry().clone();

    let triage = label_settings().with_handler("opened", "triage", Options::default());
    install_tenant(&db, 30, &triage).await.unwrap();
    sync_loop.tick().await;
    eventually(|| registry.contains(30)).await;
    let rejected = registry.get(30).unwrap();
    assert!(rejected.active_handlers.is_empty());
    assert_eq!(rejected.integration, integration(30));

    tokio::time::sleep(Duration::from_millis(5)).await;
    SettingsRepository::new(&db)
        .upsert(30, &label_settings())
        .await
        .unwrap();
    let stats = sync_loop.tick().await;
    assert_eq!(stats.items_submitted, 1);

    eventually(|| {
        registry
            .get(30)
            .is_some_and(|state| state.active_handlers.len() == 1)
    })
    .await;
    assert_eq!(registry.get(30).unwrap().settings, label_settings());

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn uninstalled_tenant_is_removed_on_the_next_tick() {
    let db = setup_test_db().await.unwrap();
    let processor = builtin_processor();
    let (mut sync_loop, dispatcher) = database_pipeline(&db, &processor).await;
    let registry = processor.registry().clone();

    install_tenant(&db, 40, &label_settings()).await.unwrap();
    install_tenant(&db, 41, &label_settings()).await.unwrap();
    sync_loop.tick().await;
    eventually(|| registry.len() == 2).await;
    let handler = registry.get(40).unwrap().active_handlers
        [&HandlerKey::new("opened", HandlerKind::Label)]
        .clone();

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(IntegrationRepository::new(&db).delete(40).await.unwrap());
    let stats = sync_loop.tick().await;
    assert_eq!(stats.removals_read, 1);

    eventually(|| !registry.contains(40)).await;
    assert!(!handler.is_running());
    assert!(registry.contains(41));

    dispatcher.shutdown().await;
}
