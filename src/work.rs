//! # Work Items
//!
//! The unit submitted to the scheduler. A work item carries any combination of
//! a new integration, new settings and a batch of events for a single tenant,
//! and is consumed exactly once by exactly one worker.

use uuid::Uuid;

use crate::tenant::{EventContainer, Integration, Settings, TenantId};

#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Correlation identifier attached to every log line emitted while the
    /// item is processed.
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub integration: Option<Integration>,
    pub settings: Option<Settings>,
    pub events: Vec<EventContainer>,
    /// Remove the tenant and stop all of its handlers.
    pub remove: bool,
}

impl WorkItem {
    /// An empty item for `tenant_id`; malformed until something is attached.
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            integration: None,
            settings: None,
            events: Vec::new(),
            remove: false,
        }
    }

    /// Onboarding item for a newly connected tenant.
    pub fn onboarding(integration: Integration, settings: Settings) -> Self {
        Self::new(integration.tenant_id)
            .with_integration(integration)
            .with_settings(settings)
    }

    /// Configuration update for an existing tenant.
    pub fn settings_update(tenant_id: TenantId, settings: Settings) -> Self {
        Self::new(tenant_id).with_settings(settings)
    }

    /// Batch of live activity for an existing tenant.
    pub fn events(tenant_id: TenantId, events: Vec<EventContainer>) -> Self {
        Self::new(tenant_id).with_events(events)
    }

    /// Removal of a tenant (app uninstalled or repository removed).
    pub fn removal(tenant_id: TenantId) -> Self {
        Self {
            remove: true,
            ..Self::new(tenant_id)
        }
    }

    pub fn with_integration(mut self, integration: Integration) -> Self {
        self.integration = Some(integration);
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_events(mut self, events: Vec<EventContainer>) -> Self {
        self.events.extend(events);
        self
    }

    /// True when the item carries nothing to apply.
    pub fn is_malformed(&self) -> bool {
        self.integration.is_none() && self.settings.is_none() && self.events.is_empty() && !self.remove
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match (self.remove, self.integration.is_some(), self.settings.is_some()) {
            (true, _, _) => "removal",
            (false, true, true) => "onboarding",
            (false, true, false) => "integration",
            (false, false, true) => "settings_update",
            (false, false, false) if !self.events.is_empty() => "events",
            _ => "malformed",
        }
    }
}
