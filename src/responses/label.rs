//! Label handler
//!
//! Suggests default labels for issues, restricted to the configured label
//! types and never including blacklisted labels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use super::{HandlerError, HandlerKind, ResponseHandler, Suggestion};
use crate::tenant::{EventContainer, Options, TenantId};

pub struct LabelHandler {
    tenant_id: TenantId,
    options: RwLock<Options>,
    running: AtomicBool,
}

impl LabelHandler {
    pub fn new(tenant_id: TenantId, options: Options) -> Self {
        Self {
            tenant_id,
            options: RwLock::new(options),
            running: AtomicBool::new(false),
        }
    }

    fn labels_for(options: &Options) -> Vec<String> {
        options
            .default
            .iter()
            .filter(|label| options.types.is_empty() || options.types.contains(*label))
            .filter(|label| !options.blacklist.contains(*label))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ResponseHandler for LabelHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Label
    }

    fn options(&self) -> Options {
        self.options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply_options(&self, options: Options) {
        *self.options.write().unwrap_or_else(PoisonError::into_inner) = options;
    }

    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        debug!(tenant_id = self.tenant_id, "Label handler started");
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        debug!(tenant_id = self.tenant_id, "Label handler stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn accepts(&self, event: &EventContainer) -> bool {
        event.event_type == "issues"
    }

    async fn consume(&self, events: &[EventContainer]) -> Result<Vec<Suggestion>, HandlerError> {
        if !self.is_running() {
            return Err(HandlerError::NotRunning {
                kind: HandlerKind::Label,
            });
        }

        let options = self.options();
        let labels = Self::labels_for(&options);
        if labels.is_empty() {
            return Ok(Vec::new());
        }

        events
            .iter()
            .filter(|event| self.accepts(event))
            .map(|event| {
                let issue_number =
                    event
                        .issue_number()
                        .ok_or_else(|| HandlerError::MalformedPayload {
                            kind: HandlerKind::Label,
                            details: "issue event without a number".to_string(),
                        })?;
                Ok(Suggestion::Label {
                    issue_number,
                    labels: labels.clone(),
                    as_comment: options.as_comment,
                })
            })
            .collect()
    }
}
