//! # Error Handling
//!
//! Error taxonomy for the scheduler (work item, store and reconciliation
//! failures) and the problem+json error type returned by the status API.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use sea_orm::DbErr;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::reconciler::ReconcileError;
use crate::responses::{HandlerError, HandlerKey};
use crate::telemetry;
use crate::tenant::TenantId;

/// Failure of a durable store query.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: DbErr,
    },
    #[error("{table} rows for tenants {tenant_ids:?} could not be decoded: {details}")]
    InvalidRows {
        table: &'static str,
        tenant_ids: Vec<TenantId>,
        details: String,
    },
}

impl StoreError {
    pub fn database(context: &'static str, source: DbErr) -> Self {
        tracing::error!(error = ?source, context, "Database operation failed");
        Self::Database { context, source }
    }
}

/// Errors raised while applying a single work item or reading a sync batch.
///
/// None of these stop a worker or the sync loop; they are reported and the
/// offending item (or query) is dropped.
#[derive(Debug, Error)]
pub enum WorkError {
    #[error("store read of {query} failed: {source}")]
    StoreRead {
        query: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("settings for tenant {tenant_id} rejected: {source}")]
    UnrecognizedHandler {
        tenant_id: TenantId,
        #[source]
        source: ReconcileError,
    },
    #[error("tenant {tenant_id} not found")]
    TenantNotFound { tenant_id: TenantId },
    #[error("work item {item_id} for tenant {tenant_id} carries nothing to apply")]
    MalformedWorkItem { tenant_id: TenantId, item_id: Uuid },
    #[error("handler {key} failed for tenant {tenant_id}: {source}")]
    Handler {
        tenant_id: TenantId,
        key: HandlerKey,
        #[source]
        source: HandlerError,
    },
}

impl WorkError {
    /// Metric label for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkError::StoreRead { .. } => "store_read",
            WorkError::UnrecognizedHandler { .. } => "unrecognized_handler",
            WorkError::TenantNotFound { .. } => "tenant_not_found",
            WorkError::MalformedWorkItem { .. } => "malformed_work_item",
            WorkError::Handler { .. } => "handler",
        }
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Tenant absent from the registry (404)
    pub fn tenant_not_found(tenant_id: TenantId) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND".to_string(),
            format!("Tenant {tenant_id} is not registered"),
        )
        .with_details(serde_json::json!({ "tenant_id": tenant_id }))
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responses::HandlerKind;

    #[test]
    fn api_error_serializes_without_status() {
        let error = ApiError::tenant_not_found(66);
        let body = serde_json::to_value(&error).unwrap();

        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
        assert_eq!(body["details"]["tenant_id"], 66);
        assert!(body.get("status").is_none());
        assert!(body["trace_id"].as_str().is_some());
    }

    #[test]
    fn from_anyhow_hides_internal_message() {
        let api_error: ApiError = anyhow::anyhow!("disk on fire").into();

        assert_eq!(api_error.code, Box::from("INTERNAL_SERVER_ERROR"));
        assert_eq!(api_error.message, Box::from("An internal error occurred"));
    }

    #[test]
    fn work_error_kinds_are_stable_metric_labels() {
        let not_found = WorkError::TenantNotFound { tenant_id: 3 };
        assert_eq!(not_found.kind(), "tenant_not_found");
        assert_eq!(not_found.to_string(), "tenant 3 not found");

        let handler = WorkError::Handler {
            tenant_id: 3,
            key: HandlerKey::new("opened", HandlerKind::Label),
            source: HandlerError::NotRunning {
                kind: HandlerKind::Label,
            },
        };
        assert_eq!(handler.kind(), "handler");
        assert!(handler.to_string().contains("opened/label"));
    }

    #[tokio::test]
    async fn into_response_uses_problem_json() {
        let response = ApiError::tenant_not_found(1).into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }
}
