//! `/ips` handlers

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use floatingip::{AppType, FloatingIpRecord, Key};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::page::{Page, paginate, parse_page, parse_size};
use super::{ApiError, ApiState, Resp};
use crate::cluster::{Cluster, finished, pod_phase};

/// Allocation as shown by the admin API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloatingIp {
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pool_name: String,
    #[serde(default)]
    pub policy: u16,
    /// `deployment`, `statefulset` or `tapp`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<DateTime<Utc>>,
    /// Pod phase, `Deleted` when the pod is gone
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default)]
    pub releasable: bool,
}

impl From<&FloatingIpRecord> for FloatingIp {
    fn from(record: &FloatingIpRecord) -> Self {
        let mut fip = Self {
            ip: record.ip.to_string(),
            policy: record.policy as u16,
            update_time: Some(record.updated_at),
            ..Self::default()
        };
        // free rows and foreign keys show only the address
        if let Ok(key) = Key::decode(&record.key) {
            fip.namespace = key.namespace;
            fip.app_name = key.app_name;
            fip.pod_name = key.pod_name;
            fip.pool_name = key.pool_name;
            fip.app_type = key.app_type.map(|t| t.to_string()).unwrap_or_default();
        }
        fip
    }
}

/// Query of `GET /ips`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    /// Substring match on the key; overrides every other filter
    pub keyword: Option<String>,
    pub pool_name: Option<String>,
    pub app_name: Option<String>,
    pub pod_name: Option<String>,
    pub namespace: Option<String>,
    /// Defaults to `statefulset`
    pub app_type: Option<String>,
    pub sort: Option<String>,
    pub page: Option<String>,
    pub size: Option<String>,
}

impl ListQuery {
    /// Key prefix selected by the filters
    fn prefix(&self) -> Result<String, ApiError> {
        let app_type = match self.app_type.as_deref() {
            None | Some("") => AppType::StatefulSet,
            Some(name) => parse_app_type(name).ok_or_else(|| ApiError::BadRequest(format!("invalid appType {name}")))?,
        };
        let field = |f: &Option<String>| f.clone().unwrap_or_default();
        let key = Key::new(
            app_type,
            &field(&self.namespace),
            &field(&self.app_name),
            &field(&self.pod_name),
            &field(&self.pool_name),
        );
        Ok(key.to_string())
    }
}

/// Response of `GET /ips`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListIpResp {
    #[serde(flatten)]
    pub page: Page,
    #[serde(default)]
    pub content: Vec<FloatingIp>,
}

pub(super) async fn list_ips(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListIpResp>, ApiError> {
    let store = state.plugin.store();
    let records = match query.keyword.as_deref() {
        Some(keyword) if !keyword.is_empty() => {
            debug!("Listing ips by keyword {}", keyword);
            store.lookup_by_keyword(keyword).await?
        }
        _ => {
            let prefix = query.prefix()?;
            debug!("Listing ips by prefix {:?}", prefix);
            store.lookup_by_prefix(&prefix).await?
        }
    };
    let mut fips: Vec<FloatingIp> = records.iter().map(FloatingIp::from).collect();
    fips.sort_by(sort_order(query.sort.as_deref().unwrap_or_default()));

    let (start, end, page) = paginate(
        parse_page(query.page.as_deref()),
        parse_size(query.size.as_deref()),
        fips.len(),
    );
    let mut content: Vec<FloatingIp> = fips.drain(start..end).collect();
    for fip in &mut content {
        let (releasable, status) = pod_state(state.plugin.cluster().as_ref(), fip).await;
        fip.releasable = releasable;
        fip.status = status;
    }
    Ok(Json(ListIpResp { page, content }))
}

type Compare = fn(&FloatingIp, &FloatingIp) -> Ordering;

fn sort_order(sort: &str) -> Compare {
    match sort.to_ascii_lowercase().as_str() {
        "namespace" | "namespace asc" => |a, b| a.namespace.cmp(&b.namespace),
        "namespace desc" => |a, b| b.namespace.cmp(&a.namespace),
        "podname" | "podname asc" => |a, b| a.pod_name.cmp(&b.pod_name),
        "podname desc" => |a, b| b.pod_name.cmp(&a.pod_name),
        "policy" | "policy asc" => |a, b| a.policy.cmp(&b.policy),
        "policy desc" => |a, b| b.policy.cmp(&a.policy),
        "ip desc" => |a, b| b.ip.cmp(&a.ip),
        _ => |a, b| a.ip.cmp(&b.ip),
    }
}

fn parse_app_type(name: &str) -> Option<AppType> {
    match name.to_ascii_lowercase().as_str() {
        "deployment" | "deployments" => Some(AppType::Deployment),
        "statefulset" | "statefulsets" => Some(AppType::StatefulSet),
        "tapp" | "tapps" => Some(AppType::TApp),
        _ => None,
    }
}

/// Whether the address of `fip` may be released, and the phase of its pod.
///
/// Rows without an owner are never releasable. Reservations (no pod name) and rows
/// whose pod is gone or finished are.
async fn pod_state(cluster: &dyn Cluster, fip: &FloatingIp) -> (bool, String) {
    if fip.pod_name.is_empty() && fip.app_name.is_empty() && fip.pool_name.is_empty() {
        return (false, String::new());
    }
    if fip.pod_name.is_empty() {
        return (true, "Deleted".to_string());
    }
    match cluster.get_pod(&fip.namespace, &fip.pod_name).await {
        Ok(Some(pod)) => (finished(&pod), pod_phase(&pod).to_string()),
        Ok(None) => (true, "Deleted".to_string()),
        Err(e) if e.is_not_found() => (true, "Deleted".to_string()),
        Err(e) => {
            debug!("Failed to get pod {}/{}: {}", fip.namespace, fip.pod_name, e);
            (false, "Unknown".to_string())
        }
    }
}

/// One entry of `POST /ips/release`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseEntry {
    pub ip: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub pod_name: String,
    #[serde(default)]
    pub pool_name: String,
    #[serde(default)]
    pub is_deployment: bool,
    /// Takes precedence over `isDeployment`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_type: Option<String>,
}

impl ReleaseEntry {
    fn key(&self) -> Result<String, ApiError> {
        let app_type = match self.app_type.as_deref() {
            Some(name) if !name.is_empty() => {
                parse_app_type(name).ok_or_else(|| ApiError::BadRequest(format!("unknown app type {name:?}")))?
            }
            _ if self.is_deployment => AppType::Deployment,
            _ => AppType::StatefulSet,
        };
        Ok(Key::new(app_type, &self.namespace, &self.app_name, &self.pod_name, &self.pool_name).to_string())
    }

    fn as_floating_ip(&self) -> FloatingIp {
        FloatingIp {
            ip: self.ip.clone(),
            namespace: self.namespace.clone(),
            app_name: self.app_name.clone(),
            pod_name: self.pod_name.clone(),
            pool_name: self.pool_name.clone(),
            ..FloatingIp::default()
        }
    }
}

/// Body of `POST /ips/release`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseIpReq {
    #[serde(default)]
    pub ips: Vec<ReleaseEntry>,
}

/// Response of `POST /ips/release`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseIpResp {
    #[serde(flatten)]
    pub resp: Resp,
    #[serde(default)]
    pub released: Vec<String>,
    /// Addresses whose owner changed while releasing
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unreleased: Vec<String>,
}

/// Release every listed address or none of them
pub(super) async fn release_ips(
    State(state): State<ApiState>,
    Json(req): Json<ReleaseIpReq>,
) -> Result<(StatusCode, Json<ReleaseIpResp>), ApiError> {
    let mut expected: BTreeMap<Ipv4Addr, (String, &ReleaseEntry)> = BTreeMap::new();
    for entry in &req.ips {
        let ip: Ipv4Addr = entry
            .ip
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("{:?} is not a valid ip", entry.ip)))?;
        expected.insert(ip, (entry.key()?, entry));
    }
    let ips: Vec<Ipv4Addr> = expected.keys().copied().collect();
    let rows: BTreeMap<Ipv4Addr, FloatingIpRecord> = state
        .plugin
        .store()
        .lookup_by_ip_set(&ips)
        .await?
        .into_iter()
        .map(|r| (r.ip, r))
        .collect();

    let cluster = state.plugin.cluster().as_ref();
    for (ip, (key, entry)) in &expected {
        let row = rows
            .get(ip)
            .ok_or_else(|| ApiError::NotFound(format!("ip {ip} is not in any pool")))?;
        if row.key != *key {
            return Err(ApiError::Conflict(format!(
                "ip {ip} is owned by {:?}, not {key:?}",
                row.key
            )));
        }
        let (releasable, status) = pod_state(cluster, &entry.as_floating_ip()).await;
        if !releasable {
            return Err(ApiError::Conflict(format!(
                "ip {ip} of {key} is not releasable, pod status {status:?}"
            )));
        }
    }

    // one row at a time: an address is freed only right after it left the cloud
    let mut released: Vec<String> = Vec::new();
    let mut unreleased: BTreeSet<String> = BTreeSet::new();
    for (ip, (key, _)) in expected {
        let Some(row) = rows.get(&ip) else {
            continue;
        };
        if let Err(e) = state.plugin.unassign(row, &row.attr.node_name).await {
            return Err(ApiError::Internal(format!(
                "released {released:?}, failed to unassign {ip}: {e}"
            )));
        }
        let outcome = state.plugin.release_ips(BTreeMap::from([(ip, key)])).await?;
        released.extend(outcome.released.keys().map(ToString::to_string));
        unreleased.extend(outcome.unreleased.keys().map(ToString::to_string));
    }
    info!("Admin released {:?}", released);

    let (code, message) = if unreleased.is_empty() {
        (StatusCode::OK, String::new())
    } else {
        (
            StatusCode::ACCEPTED,
            format!("Released {} ips, {} ips changed owner meanwhile", released.len(), unreleased.len()),
        )
    };
    Ok((
        code,
        Json(ReleaseIpResp {
            resp: Resp::new(code, message),
            released,
            unreleased: unreleased.into_iter().collect(),
        }),
    ))
}
