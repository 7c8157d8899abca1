//! Bidirectional kind/resource mapping over the catalog and the scheme.

use std::sync::Arc;

use kestrel_core::{ApiResourceInfo, Gvk, Gvr};
use kestrel_schema::Scheme;

/// Maps collection endpoints to kind identifiers and back.
///
/// Discovery data wins; the scheme's built-in table answers for anything the
/// server did not report (or before discovery ran).
#[derive(Debug, Clone)]
pub struct ResourceMapper {
    catalog: Arc<crate::ResourceCatalog>,
    scheme: Arc<Scheme>,
}

impl ResourceMapper {
    pub fn new(catalog: Arc<crate::ResourceCatalog>, scheme: Arc<Scheme>) -> Self { Self { catalog, scheme } }

    pub fn catalog(&self) -> &Arc<crate::ResourceCatalog> { &self.catalog }

    pub fn scheme(&self) -> &Arc<Scheme> { &self.scheme }

    pub fn resource_to_kind(&self, resource: &ApiResourceInfo) -> Gvk { resource.gvk() }

    pub fn resource_to_gvr(&self, resource: &ApiResourceInfo) -> Gvr { resource.gvr() }

    /// Kind served at `gvr`, if known.
    pub fn gvr_to_kind(&self, gvr: &Gvr) -> Option<Gvk> {
        if let Some(info) = self.catalog.lookup_by_resource(gvr) {
            return Some(info.gvk());
        }
        self.scheme.lookup_resource(gvr).map(|e| e.gvk.clone())
    }

    /// Collection endpoint serving `gvk`, if known.
    pub fn kind_to_resource(&self, gvk: &Gvk) -> Option<Gvr> {
        if let Some(info) = self.catalog.lookup_by_kind(gvk) {
            return Some(info.gvr());
        }
        self.scheme.lookup(gvk).map(|e| e.gvr())
    }

    /// Catalog entry for `gvk`. Only discovered kinds have one.
    pub fn lookup_by_kind(&self, gvk: &Gvk) -> Option<&ApiResourceInfo> { self.catalog.lookup_by_kind(gvk) }

    pub fn lookup_by_resource(&self, gvr: &Gvr) -> Option<&ApiResourceInfo> { self.catalog.lookup_by_resource(gvr) }

    /// Whether objects at `gvr` live in namespaces. Unknown endpoints count as namespaced.
    pub fn is_namespaced(&self, gvr: &Gvr) -> bool {
        if let Some(info) = self.catalog.lookup_by_resource(gvr) {
            return info.namespaced;
        }
        self.scheme.lookup_resource(gvr).map(|e| e.namespaced).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceCatalog;

    fn info(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> ApiResourceInfo {
        ApiResourceInfo {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            plural: plural.into(),
            namespaced,
            verbs: ["get", "list", "watch"].iter().map(|s| s.to_string()).collect(),
        }
    }

    fn mapper() -> ResourceMapper {
        let catalog = ResourceCatalog::from_resources(vec![
            info("", "v1", "Pod", "pods", true),
            info("cert-manager.io", "v1", "Certificate", "certificates", true),
            info("", "v1", "Node", "nodes", false),
        ]);
        ResourceMapper::new(Arc::new(catalog), Arc::new(Scheme::with_builtins()))
    }

    #[test]
    fn round_trips_every_catalog_entry() {
        let m = mapper();
        for entry in m.catalog().iter() {
            let gvk = m.resource_to_kind(entry);
            assert_eq!(m.kind_to_resource(&gvk), Some(m.resource_to_gvr(entry)));
            assert_eq!(m.gvr_to_kind(&m.resource_to_gvr(entry)), Some(gvk));
        }
    }

    #[test]
    fn falls_back_to_scheme_for_undiscovered_kinds() {
        let m = mapper();
        let gvr = m.kind_to_resource(&Gvk::new("apps", "v1", "Deployment")).unwrap();
        assert_eq!(gvr, Gvr::new("apps", "v1", "deployments"));
        assert_eq!(m.gvr_to_kind(&gvr), Some(Gvk::new("apps", "v1", "Deployment")));
        assert!(m.lookup_by_kind(&Gvk::new("apps", "v1", "Deployment")).is_none());
    }

    #[test]
    fn unknown_mappings_are_none() {
        let m = mapper();
        assert_eq!(m.gvr_to_kind(&Gvr::new("example.com", "v1", "widgets")), None);
        assert_eq!(m.kind_to_resource(&Gvk::new("example.com", "v1", "Widget")), None);
        assert!(m.is_namespaced(&Gvr::new("example.com", "v1", "widgets")));
        assert!(!m.is_namespaced(&Gvr::new("", "v1", "nodes")));
    }
}
