//! # Tenants API Handlers
//!
//! Read-only view of the tenant registry.

use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::registry::TenantState;
use crate::responses::HandlerKind;
use crate::server::AppState;
use crate::tenant::{Integration, Options, TenantId};

/// One registered tenant
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantSummary {
    /// Repository identifier
    #[schema(example = 66)]
    pub tenant_id: TenantId,
    pub installation_id: i64,
    /// Settings title, when one is configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Number of active handlers
    pub handler_count: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantListResponse {
    pub tenants: Vec<TenantSummary>,
}

/// One active handler of a tenant
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HandlerStatus {
    /// Event action the handler is bound to
    #[schema(example = "opened")]
    pub action: String,
    pub handler: HandlerKind,
    pub running: bool,
    pub options: Options,
}

/// Full state of one tenant
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TenantDetail {
    pub tenant_id: TenantId,
    pub integration: Integration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub handlers: Vec<HandlerStatus>,
}

impl From<&TenantState> for TenantSummary {
    fn from(state: &TenantState) -> Self {
        Self {
            tenant_id: state.tenant_id,
            installation_id: state.integration.installation_id,
            title: state.settings.title.clone(),
            handler_count: state.active_handlers.len(),
        }
    }
}

impl From<TenantState> for TenantDetail {
    fn from(state: TenantState) -> Self {
        let handlers = state
            .handler_keys()
            .into_iter()
            .map(|key| {
                let handler = &state.active_handlers[&key];
                HandlerStatus {
                    running: handler.is_running(),
                    options: handler.options(),
                    handler: key.kind,
                    action: key.action,
                }
            })
            .collect();

        Self {
            tenant_id: state.tenant_id,
            integration: state.integration,
            title: state.settings.title,
            handlers,
        }
    }
}

/// List registered tenants
#[utoipa::path(
    get,
    path = "/tenants",
    responses(
        (status = 200, description = "Registered tenants ordered by ID", body = TenantListResponse)
    ),
    tag = "tenants"
)]
pub async fn list_tenants(State(state): State<AppState>) -> Json<TenantListResponse> {
    let tenants = state
        .registry
        .snapshot()
        .iter()
        .map(TenantSummary::from)
        .collect();
    Json(TenantListResponse { tenants })
}

/// Get one tenant with its active handlers
#[utoipa::path(
    get,
    path = "/tenants/{tenant_id}",
    params(
        ("tenant_id" = i64, Path, description = "Repository identifier")
    ),
    responses(
        (status = 200, description = "Tenant state", body = TenantDetail),
        (status = 404, description = "Tenant not registered", body = ApiError)
    ),
    tag = "tenants"
)]
pub async fn get_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<TenantId>,
) -> Result<Json<TenantDetail>, ApiError> {
    state
        .registry
        .get(tenant_id)
        .map(|tenant| Json(TenantDetail::from(tenant)))
        .ok_or_else(|| ApiError::tenant_not_found(tenant_id))
}
