//! # Telemetry
//!
//! Global subscriber setup plus the trace context carried by each work item.
//!
//! A worker runs every item inside [`TraceContext::scope`]; code further down
//! the work path reads the item's trace ID with [`current_trace_id`] without
//! it being threaded through every call.

use std::any::type_name_of_val;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use thiserror::Error;
use tokio::task_local;
use tracing_log::LogTracer;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::{EnvFilter, Registry, fmt};
use uuid::Uuid;

use crate::config::AppConfig;

task_local! {
    static ACTIVE_TRACE_CONTEXT: TraceContext;
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Correlation metadata for one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
}

impl TraceContext {
    /// The item's ID doubles as its trace ID, so reports and log lines can
    /// be joined on either.
    pub fn for_work_item(item_id: Uuid) -> Self {
        Self {
            trace_id: item_id.to_string(),
        }
    }

    /// Run `future` with this context active.
    pub async fn scope<F: Future>(self, future: F) -> F::Output {
        ACTIVE_TRACE_CONTEXT.scope(self, future).await
    }
}

/// Trace ID of the work item being processed by the current task.
pub fn current_trace_id() -> Option<String> {
    ACTIVE_TRACE_CONTEXT
        .try_with(|context| context.trace_id.clone())
        .ok()
}

#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("another logger is installed, `log` records would bypass tracing: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("a global tracing subscriber is already installed: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),
}

/// Install the `log` bridge and the global subscriber.
///
/// Repeated calls after a successful one are no-ops. A failed call can be
/// retried.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    let installed = install_log_bridge().and_then(|()| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
        // Set directly: the bridge is already in place and `try_init` would
        // attempt a second one.
        let subscriber = Registry::default()
            .with(format_layer(&config.log_format))
            .with(filter);
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    });
    if installed.is_err() {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
    }
    installed
}

/// Route `log` records (sqlx, sea-orm) into tracing. An already installed
/// bridge counts as success.
fn install_log_bridge() -> Result<(), TelemetryInitError> {
    match LogTracer::builder().with_max_level(LevelFilter::Trace).init() {
        Ok(()) => Ok(()),
        Err(_) if type_name_of_val(log::logger()).contains("LogTracer") => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn format_layer(log_format: &str) -> Box<dyn Layer<Registry> + Send + Sync> {
    match log_format {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().boxed(),
    }
}
