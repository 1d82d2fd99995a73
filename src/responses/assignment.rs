//! Assignment handler
//!
//! Learns which contributors pick up issues in a repository and suggests the
//! most frequent ones for newly opened issues.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use super::{HandlerError, HandlerKind, ResponseHandler, Suggestion};
use crate::tenant::{EventContainer, Options, TenantId};

pub struct AssignmentHandler {
    tenant_id: TenantId,
    options: RwLock<Options>,
    running: AtomicBool,
    assignee_counts: Mutex<HashMap<String, u64>>,
    events_seen: AtomicU64,
}

impl AssignmentHandler {
    pub fn new(tenant_id: TenantId, options: Options) -> Self {
        Self {
            tenant_id,
            options: RwLock::new(options),
            running: AtomicBool::new(false),
            assignee_counts: Mutex::new(HashMap::new()),
            events_seen: AtomicU64::new(0),
        }
    }

    /// Number of events consumed since creation.
    pub fn events_seen(&self) -> u64 {
        self.events_seen.load(Ordering::Relaxed)
    }

    fn learn(&self, event: &EventContainer, blacklist: &[String]) {
        let Some(assignees) = event
            .payload
            .get("issue")
            .and_then(|issue| issue.get("assignees"))
            .and_then(serde_json::Value::as_array)
        else {
            return;
        };

        let mut counts = self
            .assignee_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for login in assignees
            .iter()
            .filter_map(|assignee| assignee.get("login").and_then(serde_json::Value::as_str))
            .filter(|login| !blacklist.iter().any(|blocked| blocked.as_str() == *login))
        {
            *counts.entry(login.to_string()).or_insert(0) += 1;
        }
    }

    fn top_assignees(&self, options: &Options) -> Vec<String> {
        let counts = self
            .assignee_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut ranked: Vec<(&String, &u64)> = counts
            .iter()
            .filter(|(login, _)| !options.blacklist.contains(*login))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(options.max_assigned as usize)
            .map(|(login, _)| login.clone())
            .collect()
    }
}

#[async_trait]
impl ResponseHandler for AssignmentHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Assignment
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
        debug!(tenant_id = self.tenant_id, "Assignment handler started");
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        debug!(tenant_id = self.tenant_id, "Assignment handler stopped");
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
                kind: HandlerKind::Assignment,
            });
        }

        let options = self.options();
        let mut suggestions = Vec::new();

        for event in events.iter().filter(|event| self.accepts(event)) {
            self.events_seen.fetch_add(1, Ordering::Relaxed);
            self.learn(event, &options.blacklist);

            if event.action != "opened" || options.max_assigned == 0 {
                continue;
            }

            let issue_number = event.issue_number().ok_or_else(|| HandlerError::MalformedPayload {
                kind: HandlerKind::Assignment,
                details: "opened issue without a number".to_string(),
            })?;

            let assignees = self.top_assignees(&options);
            if !assignees.is_empty() {
                suggestions.push(Suggestion::Assign {
                    issue_number,
                    assignees,
                    as_comment: options.as_comment,
                });
            }
        }

        Ok(suggestions)
    }
}
