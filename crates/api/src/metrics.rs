//! Resource usage from `metrics.k8s.io`, when the cluster serves it.

use kestrel_core::ApiResourceInfo;
use kestrel_kubehub::ResourceCatalog;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use tracing::debug;

const METRICS_GROUP: &str = "metrics.k8s.io";

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics api unavailable: {0}")]
    Unavailable(String),
    #[error("metrics request failed: {0}")]
    Request(#[from] kube::Error),
}

fn api_resource(info: &ApiResourceInfo) -> ApiResource {
    ApiResource {
        group: info.group.clone(),
        version: info.version.clone(),
        api_version: info.api_version(),
        kind: info.kind.clone(),
        plural: info.plural.clone(),
    }
}

/// One-shot pod and node usage listings.
#[derive(Clone)]
pub struct ResourceMetrics {
    client: Client,
    pods: ApiResource,
    nodes: ApiResource,
}

impl std::fmt::Debug for ResourceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMetrics").field("version", &self.pods.version).finish_non_exhaustive()
    }
}

impl ResourceMetrics {
    /// Fails unless discovery found both `PodMetrics` and `NodeMetrics`.
    pub fn probe(client: Client, catalog: &ResourceCatalog) -> Result<Self, MetricsError> {
        let find = |kind: &str| {
            catalog
                .iter()
                .find(|r| r.group == METRICS_GROUP && r.kind == kind)
                .map(api_resource)
                .ok_or_else(|| MetricsError::Unavailable(format!("{METRICS_GROUP} does not serve {kind}")))
        };
        let pods = find("PodMetrics")?;
        let nodes = find("NodeMetrics")?;
        debug!(version = %pods.version, "metrics api available");
        Ok(Self { client, pods, nodes })
    }

    pub fn api_version(&self) -> &str { &self.pods.api_version }

    /// Pod usage in `namespace`, or across all namespaces.
    pub async fn pod_metrics(&self, namespace: Option<&str>) -> Result<Vec<DynamicObject>, MetricsError> {
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.pods),
            None => Api::all_with(self.client.clone(), &self.pods),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    pub async fn node_metrics(&self) -> Result<Vec<DynamicObject>, MetricsError> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.nodes);
        Ok(api.list(&ListParams::default()).await?.items)
    }
}
