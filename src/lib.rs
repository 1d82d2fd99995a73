//! # Steward
//!
//! Tenant work scheduler: keeps a live registry of tenants and their response
//! handlers in sync with a durable store, and applies onboarding, settings
//! and event work items through a fixed worker pool.

pub mod collector;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod models;
pub mod reconciler;
pub mod registry;
pub mod repositories;
pub mod responses;
pub mod server;
pub mod store;
pub mod sync_loop;
pub mod telemetry;
pub mod tenant;
pub mod work;
pub mod worker;
pub use migration;
