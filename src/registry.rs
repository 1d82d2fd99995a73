//! Tenant registry
//!
//! In-memory, concurrency-safe map from tenant ID to the tenant's live state.
//! The registry holds no business logic; workers decide what to store.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use metrics::gauge;

use crate::responses::{HandlerKey, HandlerMap};
use crate::tenant::{Integration, Settings, TenantId};

/// Live state for one tenant.
#[derive(Clone)]
pub struct TenantState {
    pub tenant_id: TenantId,
    pub integration: Integration,
    pub settings: Settings,
    pub active_handlers: HandlerMap,
}

impl TenantState {
    pub fn new(integration: Integration, settings: Settings, active_handlers: HandlerMap) -> Self {
        Self {
            tenant_id: integration.tenant_id,
            integration,
            settings,
            active_handlers,
        }
    }

    /// Active handler keys in a stable order.
    pub fn handler_keys(&self) -> Vec<HandlerKey> {
        let mut keys: Vec<_> = self.active_handlers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl fmt::Debug for TenantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantState")
            .field("tenant_id", &self.tenant_id)
            .field("integration", &self.integration)
            .field("settings", &self.settings)
            .field("active_handlers", &self.handler_keys())
            .finish()
    }
}

/// Guarded tenant map. Readers run concurrently; writers are exclusive.
#[derive(Default)]
pub struct TenantRegistry {
    tenants: RwLock<HashMap<TenantId, TenantState>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one tenant's state. Handler instances are shared, not copied.
    pub fn get(&self, tenant_id: TenantId) -> Option<TenantState> {
        self.read().get(&tenant_id).cloned()
    }

    /// Insert or replace a tenant, returning the displaced state.
    pub fn put(&self, tenant_id: TenantId, state: TenantState) -> Option<TenantState> {
        let mut tenants = self.write();
        let previous = tenants.insert(tenant_id, state);
        gauge!("steward_registry_tenants").set(tenants.len() as f64);
        previous
    }

    /// Insert `state` only when the tenant is not registered yet. Returns
    /// whether it was inserted.
    pub fn insert_if_absent(&self, tenant_id: TenantId, state: TenantState) -> bool {
        let mut tenants = self.write();
        if tenants.contains_key(&tenant_id) {
            return false;
        }
        tenants.insert(tenant_id, state);
        gauge!("steward_registry_tenants").set(tenants.len() as f64);
        true
    }

    /// Remove a tenant, returning its last state.
    pub fn delete(&self, tenant_id: TenantId) -> Option<TenantState> {
        let mut tenants = self.write();
        let removed = tenants.remove(&tenant_id);
        gauge!("steward_registry_tenants").set(tenants.len() as f64);
        removed
    }

    /// Run `f` against a tenant's state while holding write access.
    ///
    /// Every mutation of a tenant's handler set goes through here, so two
    /// updates for the same tenant can never interleave. Returns `None` when
    /// the tenant is not registered.
    pub fn update<R>(&self, tenant_id: TenantId, f: impl FnOnce(&mut TenantState) -> R) -> Option<R> {
        self.write().get_mut(&tenant_id).map(f)
    }

    pub fn contains(&self, tenant_id: TenantId) -> bool {
        self.read().contains_key(&tenant_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Registered tenant IDs in ascending order.
    pub fn tenant_ids(&self) -> Vec<TenantId> {
        let mut ids: Vec<_> = self.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of every tenant, ordered by tenant ID.
    pub fn snapshot(&self) -> Vec<TenantState> {
        let mut states: Vec<_> = self.read().values().cloned().collect();
        states.sort_by_key(|state| state.tenant_id);
        states
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TenantId, TenantState>> {
        self.tenants.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TenantId, TenantState>> {
        self.tenants.write().unwrap_or_else(PoisonError::into_inner)
    }
}
