//! Observable, versioned values updated by whole replacement.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

struct Inner<T> {
    value: ArcSwap<T>,
    version: watch::Sender<u64>,
}

/// A shared value that readers can load at any time and watch for swaps.
///
/// Every `set` replaces the whole value and bumps the version by one, so a
/// reader never sees a partially applied update.
pub struct Property<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Property<T> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<T: Default> Default for Property<T> {
    fn default() -> Self { Self::new(T::default()) }
}

impl<T> std::fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Property").field("version", &self.version()).finish_non_exhaustive()
    }
}

impl<T> Property<T> {
    pub fn new(value: T) -> Self {
        let (version, _) = watch::channel(0u64);
        Self { inner: Arc::new(Inner { value: ArcSwap::from_pointee(value), version }) }
    }

    pub fn get(&self) -> Arc<T> { self.inner.value.load_full() }

    /// Replace the value; returns the new version.
    pub fn set(&self, value: T) -> u64 {
        let value = Arc::new(value);
        let mut out = 0;
        self.inner.version.send_modify(|v| {
            self.inner.value.store(value);
            *v += 1;
            out = *v;
        });
        out
    }

    pub fn version(&self) -> u64 { *self.inner.version.borrow() }

    /// Receiver that observes every version bump.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.inner.version.subscribe() }

    /// Wait until the version moves past `seen`, then return the current value.
    pub async fn changed_since(&self, seen: u64) -> Arc<T> {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|v| *v > seen).await;
        self.get()
    }
}
