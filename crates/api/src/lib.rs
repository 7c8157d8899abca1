//! Kestrel cluster session: the single entry point consumers hold per
//! connected cluster.
//!
//! A session assembles the type registry, connects a client from
//! [`ClusterPreferences`], runs discovery once, and owns the watch cache
//! registry whose sync loops live as long as the session context.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use kestrel_core::{ApiResourceInfo, CoreError, Gvk, Gvr, ObjectRef};
use kestrel_kubehub::{
    CacheEntry, DiscoveryError, KubeWatchSource, ResourceCatalog, ResourceMapper, Subscription, WatchCacheRegistry,
};
use kestrel_schema::{ClusterObject, Collectable, ConvertError, Scheme};
use kestrel_store::Property;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod events;
mod metrics;
mod prefs;

pub use config::SyncConfig;
pub use events::{event_time, events_gvr, EventFeed};
pub use metrics::{MetricsError, ResourceMetrics};
pub use prefs::{ClusterPreferences, ExecCredential, PrefsError, TlsMaterial};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("config: {0}")]
    Config(#[from] PrefsError),
    #[error("connect: {0}")]
    Connect(#[source] kube::Error),
    #[error("discovery: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("not_found: {kind} {name:?} in {namespace:?}")]
    NotFound { kind: String, namespace: Option<String>, name: String },
    #[error("type_resolution: {0}")]
    TypeResolution(String),
    #[error("conversion: {0}")]
    Conversion(#[from] ConvertError),
    #[error("api: {0}")]
    Api(#[source] kube::Error),
}

impl From<CoreError> for SessionError {
    fn from(e: CoreError) -> Self { SessionError::TypeResolution(e.to_string()) }
}

pub type SessionResult<T> = Result<T, SessionError>;

fn api_resource(gvk: &Gvk, plural: &str) -> ApiResource {
    ApiResource {
        group: gvk.group.clone(),
        version: gvk.version.clone(),
        api_version: gvk.api_version(),
        kind: gvk.kind.clone(),
        plural: plural.to_string(),
    }
}

/// Live connection to one cluster.
pub struct ClusterSession {
    ctx: CancellationToken,
    prefs: Property<ClusterPreferences>,
    config: SyncConfig,
    client: Client,
    scheme: Arc<Scheme>,
    catalog: Arc<ResourceCatalog>,
    mapper: Arc<ResourceMapper>,
    registry: WatchCacheRegistry,
    metrics: Option<ResourceMetrics>,
    events: EventFeed,
}

impl ClusterSession {
    /// Connect and discover. Background work stops when `ctx` is cancelled
    /// or the session is dropped.
    pub async fn connect(
        ctx: CancellationToken,
        prefs: Property<ClusterPreferences>,
        config: SyncConfig,
    ) -> SessionResult<Self> {
        let t0 = Instant::now();
        let ctx = ctx.child_token();
        let current = prefs.get();
        info!(cluster = %current.name, host = %current.host, "session: connect start");

        let scheme = Arc::new(Scheme::with_builtins());
        let client_config = current.client_config().await?;
        let client = Client::try_from(client_config).map_err(SessionError::Connect)?;

        let catalog = Arc::new(ResourceCatalog::discover(&client).await?);
        let mapper = Arc::new(ResourceMapper::new(catalog.clone(), scheme.clone()));
        let source = Arc::new(KubeWatchSource::new(client.clone(), mapper.clone()));
        let registry = WatchCacheRegistry::new(source, mapper.clone(), ctx.clone(), config.relist);

        let metrics = match ResourceMetrics::probe(client.clone(), &catalog) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(error = %e, "metrics disabled");
                None
            }
        };
        let events = EventFeed::start(ctx.clone(), &registry, &catalog);

        info!(
            resources = catalog.len(),
            kinds = scheme.len(),
            metrics = metrics.is_some(),
            events = events.is_active(),
            took_ms = %t0.elapsed().as_millis(),
            "session: connect ok"
        );
        Ok(Self { ctx, prefs, config, client, scheme, catalog, mapper, registry, metrics, events })
    }

    pub fn client(&self) -> &Client { &self.client }

    pub fn scheme(&self) -> &Arc<Scheme> { &self.scheme }

    pub fn mapper(&self) -> &Arc<ResourceMapper> { &self.mapper }

    pub fn config(&self) -> SyncConfig { self.config }

    pub fn preferences(&self) -> Arc<ClusterPreferences> { self.prefs.get() }

    /// Discovered resources, sorted by kind.
    pub fn resources(&self) -> &[ApiResourceInfo] { self.catalog.resources() }

    /// Catalog entry for `gvk`, if the cluster serves it.
    pub fn api_resource(&self, gvk: &Gvk) -> Option<&ApiResourceInfo> { self.catalog.lookup_by_kind(gvk) }

    pub fn metrics(&self) -> Option<&ResourceMetrics> { self.metrics.as_ref() }

    pub fn events(&self) -> &EventFeed { &self.events }

    /// Fetch one object by reference, decoded into its registered type.
    pub async fn get_reference(&self, reference: &ObjectRef) -> SessionResult<ClusterObject> {
        let t0 = Instant::now();
        let gvk = reference.gvk()?;
        let Some(entry) = self.scheme.lookup(&gvk) else {
            return Err(SessionError::TypeResolution(format!("no registered type for {gvk}")));
        };
        let (plural, namespaced) = match self.catalog.lookup_by_kind(&gvk) {
            Some(info) => (info.plural.clone(), info.namespaced),
            None => (entry.plural.clone(), entry.namespaced),
        };
        let ar = api_resource(&gvk, &plural);
        let namespace = reference
            .namespace
            .clone()
            .or_else(|| self.prefs.get().namespace.clone())
            .filter(|_| namespaced);
        let api: Api<DynamicObject> = match namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        let obj = match api.get(&reference.name).await {
            Ok(obj) => obj,
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                return Err(SessionError::NotFound {
                    kind: gvk.to_string(),
                    namespace,
                    name: reference.name.clone(),
                })
            }
            Err(e) => return Err(SessionError::Api(e)),
        };
        let out = self.scheme.convert(&gvk, obj)?;
        info!(gvk = %gvk, name = %reference.name, took_ms = %t0.elapsed().as_millis(), "session: get_reference ok");
        Ok(out)
    }

    /// One-shot list across all namespaces. Items that fail to convert are skipped.
    pub async fn list_dynamic(&self, resource: &ApiResourceInfo, params: &ListParams) -> SessionResult<Vec<ClusterObject>> {
        let t0 = Instant::now();
        let gvk = resource.gvk();
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &api_resource(&gvk, &resource.plural));
        let list = api.list(params).await.map_err(SessionError::Api)?;
        let total = list.items.len();
        let mut out = Vec::with_capacity(total);
        for item in list.items {
            let name = item.metadata.name.clone().unwrap_or_default();
            match self.scheme.convert(&gvk, item) {
                Ok(obj) => out.push(obj),
                Err(e) => warn!(gvk = %gvk, name = %name, error = %e, "skipping unconvertible item"),
            }
        }
        info!(gvk = %gvk, items = out.len(), skipped = total - out.len(), took_ms = %t0.elapsed().as_millis(), "session: list_dynamic ok");
        Ok(out)
    }

    /// Shared watch cache for `gvr`, started on first use.
    pub fn watch_entry(&self, gvr: &Gvr) -> Arc<CacheEntry> { self.registry.get(gvr) }

    pub fn has_watch(&self, gvr: &Gvr) -> bool { self.registry.contains(gvr) }

    /// Delta stream for `gvr`, replaying the current cache first.
    pub fn subscribe(&self, ctx: CancellationToken, gvr: &Gvr) -> Subscription { self.registry.subscribe(ctx, gvr) }

    /// Keep `prop` equal to the cached objects of `gvr` that convert to `T`.
    pub fn bind<T: Collectable>(&self, ctx: CancellationToken, gvr: &Gvr, prop: Property<Vec<T>>) -> JoinHandle<()> {
        kestrel_store::bind_property(ctx, &self.registry, gvr, prop, self.config.debounce)
    }

    /// Stop every watch loop and subscription of this session.
    pub fn shutdown(&self) {
        info!(watches = self.registry.len(), "session: shutdown");
        self.ctx.cancel();
    }

    pub fn is_shut_down(&self) -> bool { self.ctx.is_cancelled() }
}

impl Drop for ClusterSession {
    fn drop(&mut self) { self.ctx.cancel(); }
}
