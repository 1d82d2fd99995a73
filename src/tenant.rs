//! # Tenant Domain Types
//!
//! Plain data carried between the store, the scheduler and the response
//! handlers: installation identity, desired settings and normalized events.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// GitHub repository identifier; one tenant per repository.
pub type TenantId = i64;

/// Immutable identity binding a tenant to its GitHub App installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Integration {
    pub tenant_id: TenantId,
    pub installation_id: i64,
    pub app_id: i64,
}

/// Handler parameters for one `(action, handler)` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct Options {
    /// Logins (assignment) or labels (label) that must never be suggested.
    pub blacklist: Vec<String>,
    /// Post the suggestion as a comment instead of applying it.
    pub as_comment: bool,
    /// Upper bound on suggested assignees.
    pub max_assigned: u32,
    /// Labels applied by default.
    pub default: Vec<String>,
    /// Allowed label types; empty means no restriction.
    pub types: Vec<String>,
}

/// Desired configuration for one tenant.
///
/// `actions` maps an event action (`"opened"`, `"closed"`, ...) to the
/// handlers that should run for it, keyed by handler name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub actions: BTreeMap<String, BTreeMap<String, Options>>,
}

impl Settings {
    /// Convenience builder used by onboarding paths and tests.
    pub fn with_handler(
        mut self,
        action: impl Into<String>,
        handler: impl Into<String>,
        options: Options,
    ) -> Self {
        self.actions
            .entry(action.into())
            .or_default()
            .insert(handler.into(), options);
        self
    }

    /// Iterate over every configured `(action, handler name, options)` triple.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &Options)> {
        self.actions.iter().flat_map(|(action, handlers)| {
            handlers
                .iter()
                .map(move |(name, options)| (action.as_str(), name.as_str(), options))
        })
    }
}

/// One normalized unit of repository activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventContainer {
    pub tenant_id: TenantId,
    /// GitHub event name, e.g. `issues` or `pull_request`.
    pub event_type: String,
    pub action: String,
    pub payload: serde_json::Value,
    /// Cross references filled by preprocessing (e.g. pull requests closing an issue).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub linked: HashMap<String, Vec<EventContainer>>,
}

impl EventContainer {
    pub fn new(
        tenant_id: TenantId,
        event_type: impl Into<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            tenant_id,
            event_type: event_type.into(),
            action: action.into(),
            payload,
            linked: HashMap::new(),
        }
    }

    /// Issue number from an `issues` payload, when present.
    pub fn issue_number(&self) -> Option<i64> {
        self.payload
            .get("issue")
            .and_then(|issue| issue.get("number"))
            .and_then(serde_json::Value::as_i64)
    }
}
