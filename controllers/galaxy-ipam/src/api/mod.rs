//! Admin REST API
//!
//! - `GET /ips` lists allocations with paging and sorting
//! - `POST /ips/release` releases addresses whose pods are gone
//! - `GET|POST|DELETE /pools/{name}` manages pools
//! - `GET /metrics` exports Prometheus metrics

pub mod ips;
pub mod page;
pub mod pools;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use floatingip::FloatingIpError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::cluster::ClusterError;
use crate::metrics::Metrics;
use crate::plugin::{FloatingIpPlugin, PluginError};
use crate::pool::PoolManager;

/// Shared state of the admin handlers
#[derive(Debug, Clone)]
pub struct ApiState {
    pub plugin: Arc<FloatingIpPlugin>,
    pub pools: Arc<PoolManager>,
    pub metrics: Option<Metrics>,
}

/// Status code and message returned by every admin call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resp {
    pub code: u16,
    #[serde(default)]
    pub message: String,
}

impl Resp {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            message: message.into(),
        }
    }
}

/// Errors answered by the admin API
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Admin request failed: {}", self);
        }
        (status, Json(Resp::new(status, self.to_string()))).into_response()
    }
}

impl From<FloatingIpError> for ApiError {
    fn from(err: FloatingIpError) -> Self {
        match err {
            FloatingIpError::NotFound(_) => Self::NotFound(err.to_string()),
            FloatingIpError::StaleOwner { .. } | FloatingIpError::Conflict(_) => Self::Conflict(err.to_string()),
            FloatingIpError::MalformedKey(_) | FloatingIpError::MalformedInput(_) | FloatingIpError::InvalidPool(_) => {
                Self::BadRequest(err.to_string())
            }
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<PluginError> for ApiError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Store(e) => e.into(),
            PluginError::Cluster(ClusterError::NotFound(msg)) => Self::NotFound(msg),
            PluginError::InvalidPod(msg) => Self::BadRequest(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Build the admin router
pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/ips", get(ips::list_ips))
        .route("/ips/release", post(ips::release_ips))
        .route(
            "/pools/{name}",
            get(pools::get_pool).post(pools::apply_pool).delete(pools::delete_pool),
        )
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let Some(metrics) = &state.metrics else {
        return Err(ApiError::NotFound("metrics are disabled".to_string()));
    };
    state.plugin.refresh_ip_counter().await?;
    let body = metrics.render().map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;
    use floatingip::{Attr, ReleasePolicy};
    use tower::ServiceExt;

    use super::testing::*;
    use super::*;
    use crate::plugin::testing::*;

    #[test]
    fn test_error_status_mapping() {
        let err: ApiError = FloatingIpError::MalformedKey("x".to_string()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let err: ApiError = PluginError::Cluster(ClusterError::NotFound("pool web".to_string())).into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let err: ApiError = FloatingIpError::CapacityExhausted.into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let f = fixture().await;
        let metrics = Metrics::new().unwrap();
        let plugin = Arc::new(
            FloatingIpPlugin::new(
                f.plugin.ipam().clone(),
                None,
                f.plugin.cluster().clone(),
                RESOURCE,
            )
            .with_metrics(metrics.clone()),
        );
        plugin
            .ipam()
            .allocate_in_subnet("sts_ns_db_db-0", None, ReleasePolicy::Immediate, &Attr::default())
            .await
            .unwrap();
        let state = ApiState {
            plugin: plugin.clone(),
            pools: Arc::new(PoolManager::new(plugin)),
            metrics: Some(metrics),
        };
        let response = api_router(state).oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("galaxy_ip_counter"));
        assert!(text.contains(r#"type="allocated""#));
    }

    #[tokio::test]
    async fn test_metrics_disabled() {
        let f = fixture().await;
        let response = api_router(state(&f)).oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], 404);
    }
}
