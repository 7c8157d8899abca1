//! Shared watch caches: one live, list+watch backed store per collection
//! endpoint, fanned out to any number of subscribers.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use kestrel_core::{Gvk, Gvr};
use kestrel_schema::{ClusterObject, Scheme};
use kube::{core::DynamicObject, runtime::watcher};
use metrics::counter;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ResourceMapper, WatchSource};

/// Default interval between forced full relists.
pub const DEFAULT_RELIST: Duration = Duration::from_secs(3600);

/// A change to one cached object.
#[derive(Debug, Clone)]
pub enum Delta {
    Added(Arc<ClusterObject>),
    Updated { old: Arc<ClusterObject>, new: Arc<ClusterObject> },
    Deleted(Arc<ClusterObject>),
}

impl Delta {
    /// The object as it is after the change (the last known state for deletes).
    pub fn object(&self) -> &Arc<ClusterObject> {
        match self {
            Delta::Added(o) | Delta::Deleted(o) => o,
            Delta::Updated { new, .. } => new,
        }
    }
}

/// 405 from list/watch: the endpoint exists but cannot be watched.
pub fn is_method_not_supported(err: &watcher::Error) -> bool {
    let resp = match err {
        watcher::Error::InitialListFailed(kube::Error::Api(r))
        | watcher::Error::WatchStartFailed(kube::Error::Api(r))
        | watcher::Error::WatchFailed(kube::Error::Api(r)) => r,
        watcher::Error::WatchError(r) => r,
        _ => return false,
    };
    resp.code == 405 || resp.reason == "MethodNotAllowed"
}

#[derive(Default)]
struct EntryState {
    items: BTreeMap<String, Arc<ClusterObject>>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<Delta>)>,
    next_id: u64,
}

impl EntryState {
    fn fan_out(&mut self, deltas: &[Delta]) {
        if deltas.is_empty() {
            return;
        }
        self.subscribers.retain(|(_, tx)| deltas.iter().all(|d| tx.send(d.clone()).is_ok()));
    }
}

/// Cache for a single collection endpoint.
pub struct CacheEntry {
    gvr: Gvr,
    gvk: Option<Gvk>,
    scheme: Arc<Scheme>,
    state: Mutex<EntryState>,
    synced: watch::Sender<bool>,
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("gvr", &self.gvr)
            .field("gvk", &self.gvk)
            .field("len", &self.len())
            .field("synced", &self.has_synced())
            .finish()
    }
}

impl CacheEntry {
    fn new(gvr: Gvr, gvk: Option<Gvk>, scheme: Arc<Scheme>) -> Self {
        Self { gvr, gvk, scheme, state: Mutex::new(EntryState::default()), synced: watch::channel(false).0 }
    }

    pub fn gvr(&self) -> &Gvr { &self.gvr }

    /// Kind the entry converts into; `None` when the endpoint is unknown to
    /// both discovery and the scheme.
    pub fn gvk(&self) -> Option<&Gvk> { self.gvk.as_ref() }

    pub fn len(&self) -> usize { self.state.lock().items.len() }

    pub fn is_empty(&self) -> bool { self.state.lock().items.is_empty() }

    pub fn subscriber_count(&self) -> usize { self.state.lock().subscribers.len() }

    /// Current store contents, ordered by object identity.
    pub fn snapshot(&self) -> Vec<Arc<ClusterObject>> { self.state.lock().items.values().cloned().collect() }

    /// True once the first complete listing has been applied.
    pub fn has_synced(&self) -> bool { *self.synced.borrow() }

    /// Wait for the first complete listing.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }

    fn convert(&self, mut obj: DynamicObject) -> ClusterObject {
        obj.metadata.managed_fields = None;
        match &self.gvk {
            Some(gvk) => self.scheme.convert_or_raw(gvk, obj),
            None => ClusterObject::Raw(obj),
        }
    }

    /// Apply one watch event to the store and deliver the resulting deltas.
    pub fn apply(&self, event: watcher::Event<DynamicObject>) {
        match event {
            watcher::Event::Applied(obj) => {
                let new = Arc::new(self.convert(obj));
                let mut st = self.state.lock();
                let delta = match st.items.insert(new.key(), new.clone()) {
                    Some(old) => Delta::Updated { old, new },
                    None => Delta::Added(new),
                };
                st.fan_out(std::slice::from_ref(&delta));
                drop(st);
                counter!("watch_deltas_total", 1u64, "gvr" => self.gvr.to_string());
            }
            watcher::Event::Deleted(obj) => {
                let gone = Arc::new(self.convert(obj));
                let mut st = self.state.lock();
                let last = st.items.remove(&gone.key()).unwrap_or(gone);
                st.fan_out(&[Delta::Deleted(last)]);
                drop(st);
                counter!("watch_deltas_total", 1u64, "gvr" => self.gvr.to_string());
            }
            watcher::Event::Restarted(list) => {
                let fresh: Vec<_> = list.into_iter().map(|o| Arc::new(self.convert(o))).collect();
                let mut st = self.state.lock();
                let mut previous = std::mem::take(&mut st.items);
                let mut deltas = Vec::new();
                for new in fresh {
                    let key = new.key();
                    match previous.remove(&key) {
                        Some(old) if old.resource_version() == new.resource_version() => {}
                        Some(old) => deltas.push(Delta::Updated { old, new: new.clone() }),
                        None => deltas.push(Delta::Added(new.clone())),
                    }
                    st.items.insert(key, new);
                }
                deltas.extend(previous.into_values().map(Delta::Deleted));
                st.fan_out(&deltas);
                drop(st);
                debug!(gvr = %self.gvr, items = self.len(), deltas = deltas.len(), "relist applied");
                counter!("watch_deltas_total", deltas.len() as u64, "gvr" => self.gvr.to_string());
                self.synced.send_replace(true);
            }
        }
    }

    /// Register a subscriber. The current store is replayed as `Added`
    /// deltas under the same lock that admits it to the fan-out.
    fn add_subscriber(&self) -> (u64, mpsc::UnboundedReceiver<Delta>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = self.state.lock();
        for obj in st.items.values() {
            let _ = tx.send(Delta::Added(obj.clone()));
        }
        let id = st.next_id;
        st.next_id += 1;
        st.subscribers.push((id, tx));
        (id, rx)
    }

    fn remove_subscriber(&self, id: u64) { self.state.lock().subscribers.retain(|(sid, _)| *sid != id); }

    fn on_error(&self, err: &watcher::Error) {
        if is_method_not_supported(err) {
            return;
        }
        counter!("watch_errors_total", 1u64, "gvr" => self.gvr.to_string());
        warn!(gvr = %self.gvr, error = %err, "watch error");
    }

    async fn run(self: Arc<Self>, source: Arc<dyn WatchSource>, ctx: CancellationToken, relist: Duration) {
        enum Step {
            Stop,
            Relist,
            Event(watcher::Event<DynamicObject>),
            Error(watcher::Error),
            Ended,
        }

        info!(gvr = %self.gvr, gvk = ?self.gvk, "watch cache started");
        'open: loop {
            let t0 = Instant::now();
            let mut stream = source.open(&self.gvr);
            let deadline = tokio::time::sleep(relist);
            tokio::pin!(deadline);
            loop {
                let step = tokio::select! {
                    _ = ctx.cancelled() => Step::Stop,
                    _ = &mut deadline => Step::Relist,
                    ev = stream.next() => match ev {
                        Some(Ok(ev)) => Step::Event(ev),
                        Some(Err(e)) => Step::Error(e),
                        None => Step::Ended,
                    },
                };
                match step {
                    Step::Stop => break 'open,
                    Step::Relist => {
                        debug!(gvr = %self.gvr, took_ms = %t0.elapsed().as_millis(), "relist interval reached");
                        continue 'open;
                    }
                    Step::Event(ev) => self.apply(ev),
                    Step::Error(e) => self.on_error(&e),
                    Step::Ended => {
                        warn!(gvr = %self.gvr, "watch stream ended, waiting for relist");
                        tokio::select! {
                            _ = ctx.cancelled() => break 'open,
                            _ = &mut deadline => continue 'open,
                        }
                    }
                }
            }
        }
        // Dropping the senders ends every subscription stream.
        self.state.lock().subscribers.clear();
        info!(gvr = %self.gvr, "watch cache stopped");
    }
}

/// Keyed set of watch caches for one session.
pub struct WatchCacheRegistry {
    source: Arc<dyn WatchSource>,
    mapper: Arc<ResourceMapper>,
    ctx: CancellationToken,
    relist: Duration,
    entries: Mutex<FxHashMap<Gvr, Arc<CacheEntry>>>,
}

impl WatchCacheRegistry {
    /// Sync loops run until `ctx` is cancelled.
    pub fn new(
        source: Arc<dyn WatchSource>,
        mapper: Arc<ResourceMapper>,
        ctx: CancellationToken,
        relist: Duration,
    ) -> Self {
        Self { source, mapper, ctx, relist, entries: Mutex::new(FxHashMap::default()) }
    }

    /// Entry for `gvr`, creating it and spawning its sync loop on first use.
    /// Must be called from within a tokio runtime.
    pub fn get(&self, gvr: &Gvr) -> Arc<CacheEntry> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(gvr) {
            return entry.clone();
        }
        let gvk = self.mapper.gvr_to_kind(gvr);
        if gvk.is_none() {
            warn!(gvr = %gvr, "no kind known for resource, objects stay dynamic");
        }
        let entry = Arc::new(CacheEntry::new(gvr.clone(), gvk, self.mapper.scheme().clone()));
        entries.insert(gvr.clone(), entry.clone());
        tokio::spawn(entry.clone().run(self.source.clone(), self.ctx.clone(), self.relist));
        entry
    }

    pub fn contains(&self, gvr: &Gvr) -> bool { self.entries.lock().contains_key(gvr) }

    pub fn len(&self) -> usize { self.entries.lock().len() }

    pub fn is_empty(&self) -> bool { self.entries.lock().is_empty() }

    /// Object counts per running entry.
    pub fn stats(&self) -> HashMap<Gvr, usize> {
        self.entries.lock().iter().map(|(gvr, e)| (gvr.clone(), e.len())).collect()
    }

    /// Subscribe to the entry for `gvr` (created on demand). The subscriber
    /// is deregistered when `ctx` is cancelled or the subscription dropped;
    /// the entry keeps running either way.
    pub fn subscribe(&self, ctx: CancellationToken, gvr: &Gvr) -> Subscription {
        let entry = self.get(gvr);
        let (id, rx) = entry.add_subscriber();
        let closed = ctx.child_token();
        let watcher_entry = entry.clone();
        let guard = closed.clone();
        tokio::spawn(async move {
            guard.cancelled().await;
            watcher_entry.remove_subscriber(id);
        });
        Subscription { entry, rx, closed }
    }

    /// Stop every sync loop.
    pub fn shutdown(&self) { self.ctx.cancel(); }
}

/// Ordered delta stream from one cache entry.
///
/// Starts with the entry's contents as `Added` deltas, then live changes.
/// Ends when the subscription context is cancelled or the entry stops.
pub struct Subscription {
    entry: Arc<CacheEntry>,
    rx: mpsc::UnboundedReceiver<Delta>,
    closed: CancellationToken,
}

impl Subscription {
    pub fn entry(&self) -> &Arc<CacheEntry> { &self.entry }

    pub async fn recv(&mut self) -> Option<Delta> { self.rx.recv().await }

    /// Next delta if one is already queued.
    pub fn try_recv(&mut self) -> Option<Delta> { self.rx.try_recv().ok() }
}

impl Stream for Subscription {
    type Item = Delta;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Delta>> { self.rx.poll_recv(cx) }
}

impl Drop for Subscription {
    fn drop(&mut self) { self.closed.cancel(); }
}
