//! Scheduler extender HTTP server
//!
//! Implements the kube-scheduler extender v1 protocol on top of the plugin:
//! `POST /v1/filter`, `POST /v1/priority`, `POST /v1/bind` and `GET /healthy`.
//! Failures are reported inside the response body; the HTTP status is always 200
//! so the scheduler keeps the pod pending instead of treating the extender as down.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use k8s_openapi::api::core::v1::{Node, Pod};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cluster::pod_name;
use crate::plugin::FloatingIpPlugin;
use crate::plugin::bind::BindRequest;

/// Nodes sent by the scheduler when it does not cache node objects itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeList {
    /// Node objects
    #[serde(default)]
    pub items: Vec<Node>,
}

/// Arguments of filter and prioritize
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtenderArgs {
    /// Pod being scheduled
    pub pod: Pod,
    /// Candidate nodes, when the extender is not node cache capable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeList>,
    /// Candidate node names, when the extender is node cache capable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodenames: Option<Vec<String>>,
}

impl ExtenderArgs {
    fn node_names(&self) -> Vec<String> {
        match (&self.nodenames, &self.nodes) {
            (Some(names), _) => names.clone(),
            (None, Some(list)) => list.items.iter().filter_map(|n| n.metadata.name.clone()).collect(),
            (None, None) => Vec::new(),
        }
    }
}

/// Result of filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtenderFilterResult {
    /// Nodes that passed, mirroring the request when it carried node objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<NodeList>,
    /// Names of nodes that passed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodenames: Option<Vec<String>>,
    /// Rejected nodes with reason
    #[serde(default)]
    pub failed_nodes: BTreeMap<String, String>,
    /// Error that fails the whole filter
    #[serde(default)]
    pub error: String,
}

/// Score of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPriority {
    /// Node name
    pub host: String,
    /// Score
    pub score: i64,
}

/// Arguments of bind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtenderBindingArgs {
    /// Pod name
    pub pod_name: String,
    /// Pod namespace
    pub pod_namespace: String,
    /// Pod uid
    #[serde(rename = "podUID")]
    pub pod_uid: String,
    /// Target node
    pub node: String,
}

/// Result of bind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtenderBindingResult {
    /// Empty on success
    #[serde(default)]
    pub error: String,
}

/// Build the extender router
pub fn extender_router(plugin: Arc<FloatingIpPlugin>) -> Router {
    Router::new()
        .route("/v1/filter", post(filter_handler))
        .route("/v1/priority", post(priority_handler))
        .route("/v1/bind", post(bind_handler))
        .route("/healthy", get(|| async { "ok" }))
        .with_state(plugin)
}

async fn filter_handler(
    State(plugin): State<Arc<FloatingIpPlugin>>,
    Json(args): Json<ExtenderArgs>,
) -> Json<ExtenderFilterResult> {
    let started = Instant::now();
    if let Some(list) = &args.nodes {
        for node in &list.items {
            plugin.observe_node(node);
        }
    }
    let names = args.node_names();
    let result = match plugin.filter(&args.pod, &names).await {
        Ok(outcome) => {
            let nodes = args.nodes.as_ref().map(|list| NodeList {
                items: list
                    .items
                    .iter()
                    .filter(|n| n.metadata.name.as_ref().is_some_and(|name| outcome.nodes.contains(name)))
                    .cloned()
                    .collect(),
            });
            ExtenderFilterResult {
                nodes,
                nodenames: Some(outcome.nodes),
                failed_nodes: outcome.failed,
                error: String::new(),
            }
        }
        Err(e) => {
            warn!("Filter of pod {} failed: {}", pod_name(&args.pod), e);
            ExtenderFilterResult {
                error: e.to_string(),
                ..Default::default()
            }
        }
    };
    plugin.observe_latency("filter", started);
    Json(result)
}

async fn priority_handler(
    State(plugin): State<Arc<FloatingIpPlugin>>,
    Json(args): Json<ExtenderArgs>,
) -> Json<Vec<HostPriority>> {
    let started = Instant::now();
    let names = args.node_names();
    let priorities = match plugin.prioritize(&args.pod, &names).await {
        Ok(scores) => scores
            .into_iter()
            .map(|(host, score)| HostPriority { host, score })
            .collect(),
        Err(e) => {
            warn!("Prioritize of pod {} failed: {}", pod_name(&args.pod), e);
            names.into_iter().map(|host| HostPriority { host, score: 0 }).collect()
        }
    };
    plugin.observe_latency("priority", started);
    Json(priorities)
}

async fn bind_handler(
    State(plugin): State<Arc<FloatingIpPlugin>>,
    Json(args): Json<ExtenderBindingArgs>,
) -> Json<ExtenderBindingResult> {
    let started = Instant::now();
    let request = BindRequest {
        namespace: args.pod_namespace,
        name: args.pod_name,
        uid: args.pod_uid,
        node: args.node,
    };
    let error = match plugin.bind(&request).await {
        Ok(()) => String::new(),
        Err(e) => {
            info!("Bind of pod {}/{} failed: {}", request.namespace, request.name, e);
            e.to_string()
        }
    };
    plugin.observe_latency("bind", started);
    Json(ExtenderBindingResult { error })
}
