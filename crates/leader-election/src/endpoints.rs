//! Endpoints-backed ResourceLock

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset, Endpoints};
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::debug;

use crate::config::ElectionConfig;
use crate::error::{ElectionError, is_status};
use crate::lock_trait::{ObservedRecord, ResourceLock};
use crate::record::{LEADER_ANNOTATION, LeaderElectionRecord};

/// Lock stored in the leader annotation of an Endpoints object
pub struct EndpointsLock {
    api: Api<Endpoints>,
    name: String,
    namespace: String,
    subsets: Option<Vec<EndpointSubset>>,
}

impl std::fmt::Debug for EndpointsLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointsLock")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl EndpointsLock {
    /// Lock on `config.namespace/config.name`
    #[must_use]
    pub fn new(client: Client, config: &ElectionConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            name: config.name.clone(),
            namespace: config.namespace.clone(),
            subsets: populate_subsets(config),
        }
    }

    fn annotate(endpoints: &mut Endpoints, record: &LeaderElectionRecord) -> Result<(), ElectionError> {
        let value = serde_json::to_string(record)?;
        endpoints
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(LEADER_ANNOTATION.to_string(), value);
        Ok(())
    }
}

/// Subsets advertising the leader's own address, so the Endpoints object can back a Service
fn populate_subsets(config: &ElectionConfig) -> Option<Vec<EndpointSubset>> {
    if !config.advertises_address() {
        return None;
    }
    Some(vec![EndpointSubset {
        addresses: Some(vec![EndpointAddress {
            ip: config.bind.clone(),
            ..Default::default()
        }]),
        ports: Some(vec![EndpointPort {
            port: i32::from(config.port),
            ..Default::default()
        }]),
        ..Default::default()
    }])
}

#[async_trait::async_trait]
impl ResourceLock for EndpointsLock {
    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    async fn get(&self) -> Result<Option<ObservedRecord>, ElectionError> {
        let Some(endpoints) = self.api.get_opt(&self.name).await? else {
            return Ok(None);
        };
        let record = endpoints
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(LEADER_ANNOTATION))
            .filter(|value| !value.is_empty())
            .map(|value| serde_json::from_str::<LeaderElectionRecord>(value))
            .transpose()?;
        Ok(Some(ObservedRecord {
            record,
            resource_version: endpoints.metadata.resource_version.unwrap_or_default(),
        }))
    }

    async fn create(&self, record: &LeaderElectionRecord) -> Result<(), ElectionError> {
        let mut endpoints = Endpoints {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            subsets: self.subsets.clone(),
        };
        Self::annotate(&mut endpoints, record)?;
        match self.api.create(&PostParams::default(), &endpoints).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 409) => Err(ElectionError::Conflict(format!(
                "endpoints {} already exists",
                self.describe()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, record: &LeaderElectionRecord, resource_version: &str) -> Result<(), ElectionError> {
        let mut endpoints = self.api.get(&self.name).await?;
        if endpoints.metadata.resource_version.as_deref() != Some(resource_version) {
            debug!(lock = %self.describe(), "Lock changed since it was observed");
        }
        // Pin the observed version so the server rejects a stale write
        endpoints.metadata.resource_version = Some(resource_version.to_string());
        Self::annotate(&mut endpoints, record)?;
        if self.subsets.is_some() {
            endpoints.subsets.clone_from(&self.subsets);
        }
        match self.api.replace(&self.name, &PostParams::default(), &endpoints).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 409) => Err(ElectionError::Conflict(format!(
                "endpoints {} modified concurrently",
                self.describe()
            ))),
            Err(e) => Err(e.into()),
        }
    }
}
