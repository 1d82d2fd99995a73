//! Settings reconciler
//!
//! Diffs a tenant's desired settings against its active handlers and produces
//! the new handler set. Existing instances are kept and receive new options in
//! place; missing ones are created and started; surplus ones are stopped.
//!
//! Reconciliation is all-or-nothing: every handler name is validated before any
//! handler is touched, so a rejected update leaves the active set exactly as
//! it was.

use std::collections::HashSet;

use metrics::counter;
use tracing::debug;

use crate::responses::{HandlerFactory, HandlerKey, HandlerKind, HandlerMap};
use crate::tenant::{Options, Settings, TenantId};

/// Result of a successful reconciliation.
pub struct Reconciled {
    pub handlers: HandlerMap,
    pub started: Vec<HandlerKey>,
    pub updated: Vec<HandlerKey>,
    pub stopped: Vec<HandlerKey>,
}

impl Reconciled {
    /// True when nothing was started, updated or stopped.
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.updated.is_empty() && self.stopped.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("handler '{name}' configured for action '{action}' is not recognized")]
    UnrecognizedHandler { action: String, name: String },
}

/// Reconcile `active` against `settings`.
///
/// `active` is never modified structurally; on error the caller simply keeps
/// using it.
pub fn reconcile(
    tenant_id: TenantId,
    active: &HandlerMap,
    settings: &Settings,
    factory: &dyn HandlerFactory,
) -> Result<Reconciled, ReconcileError> {
    let desired = desired_handlers(settings)?;
    let desired_keys: HashSet<&HandlerKey> = desired.iter().map(|(key, _)| key).collect();

    let mut handlers = HandlerMap::with_capacity(desired.len());
    let mut started = Vec::new();
    let mut updated = Vec::new();
    let mut stopped = Vec::new();

    for (key, options) in &desired {
        match active.get(key) {
            Some(handler) => {
                if handler.options() != **options {
                    handler.apply_options((*options).clone());
                    updated.push(key.clone());
                }
                handlers.insert(key.clone(), handler.clone());
            }
            None => {
                let handler = factory.create(tenant_id, key.kind, (*options).clone());
                handler.start();
                started.push(key.clone());
                handlers.insert(key.clone(), handler);
            }
        }
    }

    for (key, handler) in active {
        if !desired_keys.contains(key) {
            handler.stop();
            stopped.push(key.clone());
        }
    }

    started.sort();
    updated.sort();
    stopped.sort();

    counter!("steward_reconcile_handlers_started_total").increment(started.len() as u64);
    counter!("steward_reconcile_handlers_updated_total").increment(updated.len() as u64);
    counter!("steward_reconcile_handlers_stopped_total").increment(stopped.len() as u64);

    debug!(
        tenant_id,
        started = started.len(),
        updated = updated.len(),
        stopped = stopped.len(),
        "Reconciled tenant handlers"
    );

    Ok(Reconciled {
        handlers,
        started,
        updated,
        stopped,
    })
}

/// Stop every handler in `handlers`; used when a tenant is removed or replaced.
pub fn release_all(handlers: &HandlerMap) -> usize {
    for handler in handlers.values() {
        handler.stop();
    }
    counter!("steward_reconcile_handlers_stopped_total").increment(handlers.len() as u64);
    handlers.len()
}

fn desired_handlers(settings: &Settings) -> Result<Vec<(HandlerKey, &Options)>, ReconcileError> {
    settings
        .entries()
        .map(|(action, name, options)| {
            let kind: HandlerKind = name.parse().map_err(|_| ReconcileError::UnrecognizedHandler {
                action: action.to_string(),
                name: name.to_string(),
            })?;
            Ok((HandlerKey::new(action, kind), options))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responses::BuiltinHandlerFactory;
    use std::sync::Arc;

    fn assignment(max_assigned: u32) -> Options {
        Options {
            max_assigned,
            ..Default::default()
        }
    }

    #[test]
    fn new_tenant_gets_started_handlers() {
        let settings = Settings::default()
            .with_handler("opened", "assignment", assignment(1))
            .with_handler("closed", "label", Options::default());

        let reconciled =
            reconcile(1, &HandlerMap::new(), &settings, &BuiltinHandlerFactory).unwrap();

        assert_eq!(reconciled.handlers.len(), 2);
        assert_eq!(reconciled.started.len(), 2);
        assert!(reconciled.handlers.values().all(|handler| handler.is_running()));
    }

    #[test]
    fn existing_instances_are_updated_in_place() {
        let factory = BuiltinHandlerFactory;
        let first = Settings::default().with_handler("opened", "assignment", assignment(1));
        let active = reconcile(1, &HandlerMap::new(), &first, &factory)
            .unwrap()
            .handlers;
        let key = HandlerKey::new("opened", HandlerKind::Assignment);

        let second = Settings::default().with_handler("opened", "assignment", assignment(3));
        let reconciled = reconcile(1, &active, &second, &factory).unwrap();

        assert!(Arc::ptr_eq(&active[&key], &reconciled.handlers[&key]));
        assert_eq!(reconciled.updated, vec![key.clone()]);
        assert!(reconciled.started.is_empty());
        assert_eq!(reconciled.handlers[&key].options().max_assigned, 3);
    }

    #[test]
    fn same_settings_twice_is_a_noop() {
        let factory = BuiltinHandlerFactory;
        let settings = Settings::default()
            .with_handler("opened", "assignment", assignment(2))
            .with_handler("opened", "label", Options::default());

        let active = reconcile(1, &HandlerMap::new(), &settings, &factory)
            .unwrap()
            .handlers;
        let again = reconcile(1, &active, &settings, &factory).unwrap();

        assert!(again.is_noop());
        for (key, handler) in &active {
            assert!(Arc::ptr_eq(handler, &again.handlers[key]));
            assert!(handler.is_running());
        }
    }

    #[test]
    fn removed_keys_are_stopped() {
        let factory = BuiltinHandlerFactory;
        let both = Settings::default()
            .with_handler("opened", "assignment", assignment(1))
            .with_handler("opened", "label", Options::default());
        let active = reconcile(1, &HandlerMap::new(), &both, &factory)
            .unwrap()
            .handlers;
        let label_key = HandlerKey::new("opened", HandlerKind::Label);
        let label = active[&label_key].clone();

        let only_assignment =
            Settings::default().with_handler("opened", "assignment", assignment(1));
        let reconciled = reconcile(1, &active, &only_assignment, &factory).unwrap();

        assert_eq!(reconciled.stopped, vec![label_key.clone()]);
        assert!(!reconciled.handlers.contains_key(&label_key));
        assert!(!label.is_running());
    }

    #[test]
    fn unrecognized_handler_leaves_active_set_untouched() {
        let factory = BuiltinHandlerFactory;
        let initial = Settings::default().with_handler("opened", "assignment", assignment(1));
        let active = reconcile(1, &HandlerMap::new(), &initial, &factory)
            .unwrap()
            .handlers;
        let key = HandlerKey::new("opened", HandlerKind::Assignment);

        let rejected = Settings::default()
            .with_handler("opened", "assignment", assignment(5))
            .with_handler("opened", "triage", Options::default());
        let err = match reconcile(1, &active, &rejected, &factory) {
            Err(err) => err,
            Ok(_) => panic!("expected reconciliation to fail"),
        };

        assert_eq!(
            err,
            ReconcileError::UnrecognizedHandler {
                action: "opened".into(),
                name: "triage".into(),
            }
        );
        assert_eq!(active.len(), 1);
        assert_eq!(active[&key].options().max_assigned, 1);
        assert!(active[&key].is_running());
    }
}
