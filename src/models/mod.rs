//! # Data Models
//!
//! SeaORM entities for the durable store plus the service info returned by the
//! status API.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod event;
pub mod integration;
pub mod tenant_settings;

pub use event::Entity as Event;
pub use integration::Entity as Integration;
pub use tenant_settings::Entity as TenantSettings;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "steward".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
