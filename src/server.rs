//! # Server Configuration
//!
//! Status API exposing the scheduler's view of its tenants.

use std::sync::Arc;

use anyhow::Context;
use axum::{Router, routing::get};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::handlers;
use crate::registry::TenantRegistry;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub registry: Arc<TenantRegistry>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/tenants", get(handlers::tenants::list_tenants))
        .route("/tenants/{tenant_id}", get(handlers::tenants::get_tenant))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
}

/// Serve the status API until `shutdown` fires.
pub async fn run_server(
    config: &AppConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_app(state);

    let addr = config.bind_addr().context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, profile = %config.profile, "Status server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Status server failed")?;

    info!("Status server stopped");
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::tenants::list_tenants,
        crate::handlers::tenants::get_tenant,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthStatus,
            crate::handlers::tenants::TenantSummary,
            crate::handlers::tenants::TenantListResponse,
            crate::handlers::tenants::TenantDetail,
            crate::handlers::tenants::HandlerStatus,
            crate::tenant::Integration,
            crate::tenant::Options,
            crate::responses::HandlerKind,
            crate::error::ApiError,
        )
    ),
    info(
        title = "Steward Scheduler API",
        description = "Status of the tenant work scheduler",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
