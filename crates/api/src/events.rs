//! Recent cluster events, indexed by the object they regard.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::events::v1::Event;
use kestrel_core::Gvr;
use kestrel_kubehub::{Delta, ResourceCatalog, Subscription, WatchCacheRegistry};
use kestrel_schema::Collectable;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type Index = FxHashMap<String, FxHashMap<String, (Option<DateTime<Utc>>, Arc<Event>)>>;

pub fn events_gvr() -> Gvr { Gvr::new("events.k8s.io", "v1", "events") }

/// When the event happened, falling back through the legacy timestamps.
pub fn event_time(raw: &serde_json::Value) -> Option<DateTime<Utc>> {
    [&raw["eventTime"], &raw["deprecatedLastTimestamp"], &raw["metadata"]["creationTimestamp"]]
        .into_iter()
        .filter_map(|v| v.as_str())
        .find_map(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn regarding_uid(ev: &Event) -> Option<String> { ev.regarding.as_ref().and_then(|r| r.uid.clone()) }

fn event_uid(ev: &Event) -> String {
    ev.metadata.uid.clone().or_else(|| ev.metadata.name.clone()).unwrap_or_default()
}

#[derive(Clone)]
struct Active {
    index: Arc<RwLock<Index>>,
    ready: watch::Receiver<bool>,
}

/// Live event index. Inert when the cluster does not serve `events.k8s.io/v1`.
#[derive(Clone, Default)]
pub struct EventFeed {
    active: Option<Active>,
}

impl std::fmt::Debug for EventFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFeed").field("active", &self.is_active()).field("ready", &self.is_ready()).finish()
    }
}

impl EventFeed {
    pub fn inert() -> Self { Self::default() }

    /// Start following events through `registry` until `ctx` is cancelled.
    pub fn start(ctx: CancellationToken, registry: &WatchCacheRegistry, catalog: &ResourceCatalog) -> Self {
        let gvr = events_gvr();
        if catalog.lookup_by_resource(&gvr).is_none() {
            debug!("events.k8s.io/v1 not served, event feed disabled");
            return Self::inert();
        }
        let index = Arc::new(RwLock::new(Index::default()));
        let (ready_tx, ready) = watch::channel(false);
        let sub = registry.subscribe(ctx, &gvr);
        tokio::spawn(follow(sub, index.clone(), ready_tx));
        info!("event feed started");
        Self { active: Some(Active { index, ready }) }
    }

    pub fn is_active(&self) -> bool { self.active.is_some() }

    /// True once the first full event listing has been indexed.
    pub fn is_ready(&self) -> bool { self.active.as_ref().map(|a| *a.ready.borrow()).unwrap_or(false) }

    /// Wait until the first full event listing has been indexed. Returns
    /// immediately for an inert feed and when the feed stops first.
    pub async fn wait_ready(&self) {
        let Some(active) = &self.active else { return };
        let mut ready = active.ready.clone();
        let _ = ready.wait_for(|r| *r).await;
    }

    /// Events regarding the object with `uid`, oldest first.
    pub fn for_object(&self, uid: &str) -> Vec<Arc<Event>> {
        let Some(active) = &self.active else { return Vec::new() };
        let mut out: Vec<_> = active.index.read().get(uid).map(|m| m.values().cloned().collect()).unwrap_or_default();
        out.sort_by_key(|(time, _)| *time);
        out.into_iter().map(|(_, ev)| ev).collect()
    }
}

async fn follow(mut sub: Subscription, index: Arc<RwLock<Index>>, ready: watch::Sender<bool>) {
    let entry = sub.entry().clone();
    loop {
        tokio::select! {
            delta = sub.recv() => match delta {
                Some(delta) => apply(&index, &delta),
                None => break,
            },
            _ = entry.wait_synced(), if !*ready.borrow() => {}
        }
        // Everything from the first listing is queued before the entry reports synced.
        let synced = entry.has_synced();
        while let Some(delta) = sub.try_recv() {
            apply(&index, &delta);
        }
        if synced && !*ready.borrow() {
            ready.send_replace(true);
            debug!(objects = index.read().len(), "event feed ready");
        }
    }
    debug!("event feed stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::{stream, StreamExt};
    use kestrel_core::ApiResourceInfo;
    use kestrel_kubehub::{ResourceMapper, WatchSource, WatchStream, DEFAULT_RELIST};
    use kestrel_schema::{ClusterObject, Scheme, TypedObject};
    use kube::{core::DynamicObject, runtime::watcher};

    fn event(uid: &str, regarding: &str, time: &str) -> Arc<ClusterObject> {
        let ev: Event = serde_json::from_value(serde_json::json!({
            "apiVersion": "events.k8s.io/v1",
            "kind": "Event",
            "metadata": { "name": uid, "namespace": "default", "uid": uid },
            "eventTime": time,
            "reason": "Scheduled",
            "regarding": { "kind": "Pod", "name": "web-0", "uid": regarding }
        }))
        .unwrap();
        Arc::new(ClusterObject::Typed(TypedObject::from(ev)))
    }

    fn feed() -> (EventFeed, Arc<RwLock<Index>>) {
        let index = Arc::new(RwLock::new(Index::default()));
        let (_, ready) = watch::channel(true);
        (EventFeed { active: Some(Active { index: index.clone(), ready }) }, index)
    }

    struct Scripted(Vec<DynamicObject>);

    impl WatchSource for Scripted {
        fn open(&self, _gvr: &Gvr) -> WatchStream {
            let listing = Ok(watcher::Event::Restarted(self.0.clone()));
            stream::iter(vec![listing]).chain(stream::pending()).boxed()
        }
    }

    fn raw_event(uid: &str, regarding: &str, time: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "events.k8s.io/v1",
            "kind": "Event",
            "metadata": { "name": uid, "namespace": "default", "uid": uid, "resourceVersion": "1" },
            "eventTime": time,
            "reason": "Pulled",
            "regarding": { "kind": "Pod", "name": "web-0", "uid": regarding }
        }))
        .unwrap()
    }

    fn events_registry(listing: Vec<DynamicObject>, ctx: CancellationToken) -> (WatchCacheRegistry, ResourceCatalog) {
        let info = ApiResourceInfo {
            group: "events.k8s.io".into(),
            version: "v1".into(),
            kind: "Event".into(),
            plural: "events".into(),
            namespaced: true,
            verbs: ["get", "list", "watch"].iter().map(|s| s.to_string()).collect(),
        };
        let catalog = ResourceCatalog::from_resources(vec![info.clone()]);
        let mapper = ResourceMapper::new(Arc::new(ResourceCatalog::from_resources(vec![info])), Arc::new(Scheme::with_builtins()));
        let registry = WatchCacheRegistry::new(Arc::new(Scripted(listing)), Arc::new(mapper), ctx, DEFAULT_RELIST);
        (registry, catalog)
    }

    #[test]
    fn events_are_grouped_by_regarding_uid_and_sorted() {
        let (feed, index) = feed();
        apply(&index, &Delta::Added(event("e2", "pod-1", "2024-01-01T00:00:05.000000Z")));
        apply(&index, &Delta::Added(event("e1", "pod-1", "2024-01-01T00:00:01.000000Z")));
        apply(&index, &Delta::Added(event("e3", "pod-2", "2024-01-01T00:00:03.000000Z")));
        let names: Vec<_> = feed.for_object("pod-1").iter().filter_map(|e| e.metadata.name.clone()).collect();
        assert_eq!(names, vec!["e1", "e2"]);
        assert_eq!(feed.for_object("pod-2").len(), 1);
        assert!(feed.for_object("nope").is_empty());
    }

    #[test]
    fn deleted_events_leave_the_index() {
        let (feed, index) = feed();
        let e = event("e1", "pod-1", "2024-01-01T00:00:01.000000Z");
        apply(&index, &Delta::Added(e.clone()));
        apply(&index, &Delta::Deleted(e));
        assert!(feed.for_object("pod-1").is_empty());
        assert!(index.read().is_empty());
    }

    #[test]
    fn inert_feed_is_empty() {
        let feed = EventFeed::inert();
        assert!(!feed.is_active());
        assert!(feed.for_object("pod-1").is_empty());
    }

    #[tokio::test]
    async fn feed_is_ready_once_first_listing_is_indexed() {
        let ctx = CancellationToken::new();
        let listing = vec![
            raw_event("e2", "pod-1", "2024-01-01T00:00:05.000000Z"),
            raw_event("e1", "pod-1", "2024-01-01T00:00:01.000000Z"),
            raw_event("e3", "pod-2", "2024-01-01T00:00:03.000000Z"),
        ];
        let (registry, catalog) = events_registry(listing, ctx.clone());
        let feed = EventFeed::start(ctx.clone(), &registry, &catalog);
        assert!(feed.is_active());
        tokio::time::timeout(Duration::from_secs(5), feed.wait_ready()).await.unwrap();
        assert!(feed.is_ready());
        let names: Vec<_> = feed.for_object("pod-1").iter().filter_map(|e| e.metadata.name.clone()).collect();
        assert_eq!(names, vec!["e1", "e2"]);
        assert_eq!(feed.for_object("pod-2").len(), 1);
        ctx.cancel();
    }

    #[tokio::test]
    async fn empty_listing_still_makes_feed_ready() {
        let ctx = CancellationToken::new();
        let (registry, catalog) = events_registry(Vec::new(), ctx.clone());
        let feed = EventFeed::start(ctx.clone(), &registry, &catalog);
        tokio::time::timeout(Duration::from_secs(5), feed.wait_ready()).await.unwrap();
        assert!(feed.is_ready());
        assert!(feed.for_object("pod-1").is_empty());
        ctx.cancel();
    }

    #[tokio::test]
    async fn inert_feed_does_not_block_waiters() {
        let feed = EventFeed::inert();
        feed.wait_ready().await;
        assert!(!feed.is_ready());
    }
}
