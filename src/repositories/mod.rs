//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for the
//! store tables. Write methods serve the ingestion path; `list` methods back
//! [`crate::store::DatabaseStore`].

pub mod event;
pub mod integration;
pub mod settings;

pub use event::EventRepository;
pub use integration::IntegrationRepository;
pub use settings::SettingsRepository;
