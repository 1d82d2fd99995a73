//! Response handlers
//!
//! This module defines the handler SDK used by the scheduler:
//! - The `ResponseHandler` trait every handler implements
//! - The enumeration of recognized handler names and the key type used in
//!   a tenant's active handler map
//! - The `HandlerFactory` seam through which the reconciler instantiates
//!   handlers
//! - The built-in `assignment` and `label` handlers

pub mod assignment;
pub mod label;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::tenant::{EventContainer, Options, TenantId};

pub use assignment::AssignmentHandler;
pub use label::LabelHandler;

/// Recognized handler names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Assignment,
    Label,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 2] = [HandlerKind::Assignment, HandlerKind::Label];

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Assignment => "assignment",
            HandlerKind::Label => "label",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a settings document names a handler outside the enumeration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler '{name}' not recognized")]
pub struct UnknownHandler {
    pub name: String,
}

impl FromStr for HandlerKind {
    type Err = UnknownHandler;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "assignment" => Ok(HandlerKind::Assignment),
            "label" => Ok(HandlerKind::Label),
            other => Err(UnknownHandler {
                name: other.to_string(),
            }),
        }
    }
}

/// Key of a tenant's active handler map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, ToSchema)]
pub struct HandlerKey {
    pub action: String,
    pub kind: HandlerKind,
}

impl HandlerKey {
    pub fn new(action: impl Into<String>, kind: HandlerKind) -> Self {
        Self {
            action: action.into(),
            kind,
        }
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.action, self.kind)
    }
}

/// Active handler instances for one tenant.
pub type HandlerMap = HashMap<HandlerKey, Arc<dyn ResponseHandler>>;

/// Something a handler would do on the tenant's repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Suggestion {
    Assign {
        issue_number: i64,
        assignees: Vec<String>,
        as_comment: bool,
    },
    Label {
        issue_number: i64,
        labels: Vec<String>,
        as_comment: bool,
    },
}

/// Failure raised by a handler while consuming a batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("handler {kind} is not running")]
    NotRunning { kind: HandlerKind },
    #[error("malformed payload for {kind}: {details}")]
    MalformedPayload { kind: HandlerKind, details: String },
}

/// A named, configurable unit that reacts to or learns from tenant events.
///
/// Options may be replaced while a batch is being consumed; implementations
/// guard them so `apply_options` is safe to call concurrently with `consume`.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    /// Current options (a snapshot).
    fn options(&self) -> Options;

    /// Hot reload: replace the options without recreating the instance.
    fn apply_options(&self, options: Options);

    fn start(&self);

    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Whether the handler consumes events of this type.
    fn accepts(&self, event: &EventContainer) -> bool;

    /// Learn from and act on a batch of events.
    async fn consume(&self, events: &[EventContainer]) -> Result<Vec<Suggestion>, HandlerError>;
}

/// Creates handler instances for the reconciler.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, tenant_id: TenantId, kind: HandlerKind, options: Options)
    -> Arc<dyn ResponseHandler>;
}

/// Factory producing the built-in handlers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinHandlerFactory;

impl HandlerFactory for BuiltinHandlerFactory {
    fn create(
        &self,
        tenant_id: TenantId,
        kind: HandlerKind,
        options: Options,
    ) -> Arc<dyn ResponseHandler> {
        match kind {
            HandlerKind::Assignment => Arc::new(AssignmentHandler::new(tenant_id, options)),
            HandlerKind::Label => Arc::new(LabelHandler::new(tenant_id, options)),
        }
    }
}
