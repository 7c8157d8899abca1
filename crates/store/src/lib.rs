//! Kestrel store: folds watch-cache deltas into ordered object sequences and
//! publishes them, debounced, through observable properties.

#![forbid(unsafe_code)]

use std::time::Duration;

use futures::{Stream, StreamExt};
use kestrel_core::Gvr;
use kestrel_kubehub::{Delta, WatchCacheRegistry};
use kestrel_schema::Collectable;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod debounce;
mod property;

pub use debounce::{expired, DebounceState, Debouncer, DEFAULT_WINDOW};
pub use property::Property;

/// Ordered sequence of known objects, maintained by object identity
/// (UID, or `namespace/name` when the server sent none).
#[derive(Debug, Clone)]
pub struct ObjectSequence<T> {
    keys: Vec<String>,
    items: Vec<T>,
}

impl<T> Default for ObjectSequence<T> {
    fn default() -> Self { Self { keys: Vec::new(), items: Vec::new() } }
}

impl<T: Collectable> ObjectSequence<T> {
    pub fn new() -> Self { Self::default() }

    pub fn items(&self) -> &[T] { &self.items }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    fn position(&self, key: &str) -> Option<usize> { self.keys.iter().position(|k| k == key) }

    fn upsert(&mut self, key: String, item: T) {
        match self.position(&key) {
            Some(idx) => self.items[idx] = item,
            None => {
                self.keys.push(key);
                self.items.push(item);
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.position(key) {
            Some(idx) => {
                self.keys.remove(idx);
                self.items.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Fold one delta in. Returns whether the sequence changed.
    ///
    /// Adds append (or replace an object already present), updates replace in
    /// place and append when the object is unknown, deletes of unknown objects
    /// are ignored. Objects that do not convert to `T` are skipped; an update
    /// that no longer converts removes the stale element.
    pub fn apply(&mut self, delta: &Delta) -> bool {
        let obj = delta.object();
        let key = obj.key();
        match delta {
            Delta::Added(_) | Delta::Updated { .. } => match T::from_object(obj) {
                Some(item) => {
                    self.upsert(key, item);
                    true
                }
                None if matches!(delta, Delta::Updated { .. }) && self.remove(&key) => {
                    warn!(name = %obj.name(), gvk = ?obj.gvk(), "updated object no longer fits collection, removed");
                    true
                }
                None => {
                    debug!(name = %obj.name(), gvk = ?obj.gvk(), "object does not fit collection, skipped");
                    false
                }
            },
            Delta::Deleted(_) => self.remove(&key),
        }
    }
}

/// Fold `deltas` into `prop` until the stream ends.
///
/// Every delta that changes the sequence re-arms the debounce deadline; when it passes, the whole
/// sequence is published. A pending publication is flushed when the stream
/// ends.
pub async fn run_notifier<T, S>(mut deltas: S, prop: Property<Vec<T>>, window: Duration)
where
    T: Collectable,
    S: Stream<Item = Delta> + Unpin,
{
    let mut seq = ObjectSequence::<T>::new();
    let mut debounce = Debouncer::new(window);
    let mut applied = 0u64;
    loop {
        tokio::select! {
            biased;
            next = deltas.next() => match next {
                Some(delta) => {
                    if seq.apply(&delta) {
                        applied += 1;
                        debounce.touch(Instant::now());
                    }
                }
                None => {
                    if debounce.fire() {
                        publish(&prop, &seq, applied);
                    }
                    break;
                }
            },
            _ = expired(debounce.deadline()) => {
                debounce.fire();
                publish(&prop, &seq, applied);
                applied = 0;
            }
        }
    }
    debug!(items = seq.len(), "notifier stopped");
}

fn publish<T: Collectable>(prop: &Property<Vec<T>>, seq: &ObjectSequence<T>, applied: u64) {
    let version = prop.set(seq.items().to_vec());
    counter!("notifier_emits_total", 1u64);
    debug!(items = seq.len(), deltas = applied, version, "collection published");
}

/// Keep `prop` equal to the objects cached for `gvr`, converted to `T`.
///
/// The binding lasts until `ctx` is cancelled or the session stops.
pub fn bind_property<T: Collectable>(
    ctx: CancellationToken,
    registry: &WatchCacheRegistry,
    gvr: &Gvr,
    prop: Property<Vec<T>>,
    window: Duration,
) -> JoinHandle<()> {
    let sub = registry.subscribe(ctx, gvr);
    info!(gvr = %gvr, window_ms = %window.as_millis(), "binding collection");
    tokio::spawn(run_notifier(sub, prop, window))
}
