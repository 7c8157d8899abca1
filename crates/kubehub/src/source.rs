//! Where watch streams come from.

use std::sync::Arc;

use futures::{stream::BoxStream, StreamExt};
use kestrel_core::Gvr;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use tracing::debug;

use crate::ResourceMapper;

pub type WatchStream = BoxStream<'static, Result<watcher::Event<DynamicObject>, watcher::Error>>;

/// Opens list+watch streams for collection endpoints.
///
/// A stream starts with an initial listing (`Restarted`), then yields
/// incremental events. Errors are reported in-band and the stream keeps
/// going; ending the stream means the source gave up.
pub trait WatchSource: Send + Sync + 'static {
    fn open(&self, gvr: &Gvr) -> WatchStream;
}

/// Watch source backed by the API server, across all namespaces.
#[derive(Clone)]
pub struct KubeWatchSource {
    client: Client,
    mapper: Arc<ResourceMapper>,
}

impl KubeWatchSource {
    pub fn new(client: Client, mapper: Arc<ResourceMapper>) -> Self { Self { client, mapper } }

    fn api_resource(&self, gvr: &Gvr) -> ApiResource {
        let kind = self.mapper.gvr_to_kind(gvr).map(|g| g.kind).unwrap_or_default();
        ApiResource {
            group: gvr.group.clone(),
            version: gvr.version.clone(),
            api_version: gvr.api_version(),
            kind,
            plural: gvr.resource.clone(),
        }
    }
}

impl WatchSource for KubeWatchSource {
    fn open(&self, gvr: &Gvr) -> WatchStream {
        let ar = self.api_resource(gvr);
        debug!(gvr = %gvr, kind = %ar.kind, "opening watch");
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        watcher::watcher(api, watcher::Config::default()).default_backoff().boxed()
    }
}
