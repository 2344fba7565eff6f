//! `/pools/{name}` handlers

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use crds::PoolSpec;
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiState, Resp};
use crate::pool::PreAllocation;

/// Pool as shown by the admin API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolView {
    pub name: String,
    pub size: u32,
    #[serde(default, rename = "preAllocateIP")]
    pub pre_allocate_ip: bool,
}

/// Response of `GET /pools/{name}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPoolResp {
    #[serde(flatten)]
    pub resp: Resp,
    pub pool: PoolView,
}

/// Response of `POST /pools/{name}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePoolResp {
    #[serde(flatten)]
    pub resp: Resp,
    /// Addresses held by the pool after pre-allocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_pool_size: Option<u32>,
}

pub(super) async fn get_pool(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<GetPoolResp>, ApiError> {
    let spec = state
        .pools
        .get(&name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("pool {name} not found")))?;
    Ok(Json(GetPoolResp {
        resp: Resp::new(StatusCode::OK, ""),
        pool: PoolView {
            name,
            size: spec.size,
            pre_allocate_ip: spec.pre_allocate_ip,
        },
    }))
}

pub(super) async fn apply_pool(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(spec): Json<PoolSpec>,
) -> Result<(StatusCode, Json<UpdatePoolResp>), ApiError> {
    let (code, message, real_pool_size) = match state.pools.apply(&name, spec).await? {
        None => (StatusCode::OK, "", None),
        Some(PreAllocation::Complete { real_pool_size }) => (StatusCode::OK, "", Some(real_pool_size)),
        Some(PreAllocation::Short { real_pool_size }) => (StatusCode::ACCEPTED, "No enough IPs", Some(real_pool_size)),
    };
    Ok((
        code,
        Json(UpdatePoolResp {
            resp: Resp::new(code, message),
            real_pool_size,
        }),
    ))
}

pub(super) async fn delete_pool(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Resp>, ApiError> {
    if !state.pools.delete(&name).await? {
        return Err(ApiError::NotFound(format!("pool {name} not found")));
    }
    Ok(Json(Resp::new(StatusCode::OK, "")))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use tower::ServiceExt;

    use super::super::api_router;
    use super::super::testing::*;
    use crate::plugin::testing::*;

    #[tokio::test]
    async fn test_pool_lifecycle() {
        let f = fixture().await;
        let router = api_router(state(&f));

        let response = router.clone().oneshot(get_request("/pools/web")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = serde_json::json!({"size": 2});
        let response = router
            .clone()
            .oneshot(send_json("POST", "/pools/web", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await.get("realPoolSize").is_none());

        let response = router.clone().oneshot(get_request("/pools/web")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["code"], 200);
        assert_eq!(body["pool"], serde_json::json!({"name": "web", "size": 2, "preAllocateIP": false}));

        let delete = axum::http::Request::builder()
            .method("DELETE")
            .uri("/pools/web")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = router.clone().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let delete = axum::http::Request::builder()
            .method("DELETE")
            .uri("/pools/web")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = router.oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pre_allocation_shortfall_is_accepted() {
        let f = fixture().await;
        let body = serde_json::json!({"size": 8, "preAllocateIP": true});
        let response = api_router(state(&f))
            .oneshot(send_json("POST", "/pools/big", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["message"], "No enough IPs");
        assert_eq!(body["realPoolSize"], 5);
    }

    #[tokio::test]
    async fn test_pre_allocation_complete() {
        let f = fixture().await;
        let body = serde_json::json!({"size": 2, "preAllocateIP": true});
        let response = api_router(state(&f))
            .oneshot(send_json("POST", "/pools/web", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["realPoolSize"], 2);
    }

    #[tokio::test]
    async fn test_invalid_pool_name() {
        let f = fixture().await;
        let body = serde_json::json!({"size": 1});
        let response = api_router(state(&f))
            .oneshot(send_json("POST", "/pools/bad_name", &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
