//! Resource catalog: one-time discovery of served kinds and their verbs.

use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kestrel_core::{split_api_version, ApiResourceInfo, CoreError, Gvk, Gvr};
use kube::Client;
use metrics::histogram;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery request failed: {0}")]
    Request(#[from] kube::Error),
    #[error("malformed groupVersion in discovery: {0}")]
    GroupVersion(#[from] CoreError),
}

/// Preferred resource lists, one per group/version, plus the groups whose
/// enumeration failed as `(groupVersion, error)`.
#[derive(Debug, Default)]
pub struct PreferredResources {
    pub lists: Vec<APIResourceList>,
    pub failed_groups: Vec<(String, String)>,
}

/// Source of discovery data. Implemented for `kube::Client`.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Resource lists for the preferred version of every API group.
    ///
    /// Failing to enumerate one group is reported in `failed_groups`; failing
    /// to enumerate the groups themselves (or the core group) is an error.
    async fn server_preferred_resources(&self) -> Result<PreferredResources, DiscoveryError>;
}

#[async_trait]
impl DiscoveryClient for Client {
    async fn server_preferred_resources(&self) -> Result<PreferredResources, DiscoveryError> {
        let mut out = PreferredResources::default();
        let core = self.list_core_api_versions().await?;
        if let Some(version) = core.versions.first() {
            out.lists.push(self.list_core_api_resources(version).await?);
        }
        let groups = self.list_api_groups().await?;
        for group in groups.groups {
            let preferred = group
                .preferred_version
                .as_ref()
                .or_else(|| group.versions.first())
                .map(|v| v.group_version.clone());
            let Some(gv) = preferred else {
                debug!(group = %group.name, "group without versions");
                continue;
            };
            match self.list_api_group_resources(&gv).await {
                Ok(list) => out.lists.push(list),
                Err(e) => out.failed_groups.push((gv, e.to_string())),
            }
        }
        Ok(out)
    }
}

/// Filtered, sorted list of served resource kinds supporting `get` and `list`.
#[derive(Debug, Clone, Default)]
pub struct ResourceCatalog {
    resources: Vec<ApiResourceInfo>,
    failed_groups: Vec<(String, String)>,
}

impl ResourceCatalog {
    /// Run discovery against `client`. Per-group failures are logged and
    /// the group is left out; anything else aborts.
    pub async fn discover(client: &dyn DiscoveryClient) -> Result<Self, DiscoveryError> {
        let t0 = Instant::now();
        let preferred = client.server_preferred_resources().await?;
        for (gv, err) in &preferred.failed_groups {
            warn!(group = %gv, error = %err, "group discovery failed");
        }
        let mut catalog = Self::from_lists(&preferred.lists)?;
        catalog.failed_groups = preferred.failed_groups;
        histogram!("discovery_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            resources = catalog.resources.len(),
            failed_groups = catalog.failed_groups.len(),
            took_ms = %t0.elapsed().as_millis(),
            "discovery ok"
        );
        Ok(catalog)
    }

    /// Build from raw discovery lists. Entries without their own group/version
    /// inherit it from the list header.
    pub fn from_lists(lists: &[APIResourceList]) -> Result<Self, DiscoveryError> {
        let mut resources = Vec::new();
        for list in lists {
            let (group, version) = split_api_version(&list.group_version)?;
            for res in &list.resources {
                resources.push(ApiResourceInfo {
                    group: res.group.clone().filter(|g| !g.is_empty()).unwrap_or_else(|| group.clone()),
                    version: res.version.clone().filter(|v| !v.is_empty()).unwrap_or_else(|| version.clone()),
                    kind: res.kind.clone(),
                    plural: res.name.clone(),
                    namespaced: res.namespaced,
                    verbs: res.verbs.iter().cloned().collect(),
                });
            }
        }
        Ok(Self::from_resources(resources))
    }

    /// Apply the catalog rules (listable, no subresources) and sort by kind.
    pub fn from_resources(resources: impl IntoIterator<Item = ApiResourceInfo>) -> Self {
        let mut resources: Vec<_> = resources
            .into_iter()
            .filter(|r| !r.plural.contains('/'))
            .filter(ApiResourceInfo::is_listable)
            .collect();
        resources.sort_by(|a, b| {
            a.kind.cmp(&b.kind).then_with(|| a.group.cmp(&b.group)).then_with(|| a.version.cmp(&b.version))
        });
        Self { resources, failed_groups: Vec::new() }
    }

    pub fn resources(&self) -> &[ApiResourceInfo] { &self.resources }

    pub fn iter(&self) -> impl Iterator<Item = &ApiResourceInfo> { self.resources.iter() }

    pub fn len(&self) -> usize { self.resources.len() }

    pub fn is_empty(&self) -> bool { self.resources.is_empty() }

    /// Groups left out because their enumeration failed, as `(groupVersion, error)`.
    pub fn failed_groups(&self) -> &[(String, String)] { &self.failed_groups }

    pub fn lookup_by_kind(&self, gvk: &Gvk) -> Option<&ApiResourceInfo> {
        self.resources
            .iter()
            .find(|r| r.group == gvk.group && r.version == gvk.version && r.kind == gvk.kind)
    }

    pub fn lookup_by_resource(&self, gvr: &Gvr) -> Option<&ApiResourceInfo> {
        self.resources
            .iter()
            .find(|r| r.group == gvr.group && r.version == gvr.version && r.plural == gvr.resource)
    }

    /// Whether any resource of `group` is served.
    pub fn serves_group(&self, group: &str) -> bool { self.resources.iter().any(|r| r.group == group) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;

    fn res(name: &str, kind: &str, verbs: &[&str]) -> APIResource {
        APIResource {
            name: name.into(),
            kind: kind.into(),
            namespaced: true,
            verbs: verbs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn list(gv: &str, resources: Vec<APIResource>) -> APIResourceList {
        APIResourceList { group_version: gv.into(), resources }
    }

    #[test]
    fn keeps_only_get_and_list() {
        let lists = vec![list(
            "v1",
            vec![
                res("pods", "Pod", &["get", "list", "watch"]),
                res("configmaps", "ConfigMap", &["get", "list", "watch"]),
                res("secretexports", "SecretExportOnly", &["create"]),
            ],
        )];
        let catalog = ResourceCatalog::from_lists(&lists).unwrap();
        let kinds: Vec<_> = catalog.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(kinds, vec!["ConfigMap", "Pod"]);
        assert!(catalog.iter().all(|r| r.supports("get") && r.supports("list")));
    }

    #[test]
    fn inherits_group_version_from_header() {
        let mut scale = res("deployments", "Deployment", &["get", "list"]);
        scale.group = Some(String::new());
        let mut explicit = res("widgets", "Widget", &["get", "list"]);
        explicit.group = Some("example.com".into());
        explicit.version = Some("v2".into());
        let lists = vec![list("apps/v1", vec![scale, explicit])];
        let catalog = ResourceCatalog::from_lists(&lists).unwrap();
        let dep = catalog.lookup_by_kind(&Gvk::new("apps", "v1", "Deployment")).unwrap();
        assert_eq!(dep.plural, "deployments");
        assert!(catalog.lookup_by_kind(&Gvk::new("example.com", "v2", "Widget")).is_some());
        assert!(catalog.lookup_by_resource(&Gvr::new("apps", "v1", "deployments")).is_some());
    }

    #[test]
    fn drops_subresources_and_sorts_by_kind() {
        let lists = vec![
            list("v1", vec![res("pods", "Pod", &["get", "list"]), res("pods/log", "Pod", &["get", "list"])]),
            list("batch/v1", vec![res("jobs", "Job", &["get", "list"]), res("cronjobs", "CronJob", &["get", "list"])]),
        ];
        let catalog = ResourceCatalog::from_lists(&lists).unwrap();
        let plurals: Vec<_> = catalog.iter().map(|r| r.plural.as_str()).collect();
        assert_eq!(plurals, vec!["cronjobs", "jobs", "pods"]);
    }

    #[test]
    fn malformed_group_version_is_fatal() {
        let lists = vec![list("a/b/c", vec![res("pods", "Pod", &["get", "list"])])];
        assert!(matches!(ResourceCatalog::from_lists(&lists), Err(DiscoveryError::GroupVersion(_))));
    }

    struct Partial;

    #[async_trait]
    impl DiscoveryClient for Partial {
        async fn server_preferred_resources(&self) -> Result<PreferredResources, DiscoveryError> {
            Ok(PreferredResources {
                lists: vec![list("v1", vec![res("pods", "Pod", &["get", "list", "watch"])])],
                failed_groups: vec![("metrics.k8s.io/v1beta1".into(), "service unavailable".into())],
            })
        }
    }

    #[tokio::test]
    async fn partial_group_failure_is_not_fatal() {
        let catalog = ResourceCatalog::discover(&Partial).await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.failed_groups()[0].0, "metrics.k8s.io/v1beta1");
        assert!(!catalog.serves_group("metrics.k8s.io"));
    }
}
