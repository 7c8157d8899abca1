//! Kestrel kubehub: discovery, kind/resource mapping and shared watch caches.

#![forbid(unsafe_code)]

mod discovery;
mod informer;
mod mapper;
mod source;

pub use discovery::{DiscoveryClient, DiscoveryError, PreferredResources, ResourceCatalog};
pub use informer::{is_method_not_supported, CacheEntry, Delta, Subscription, WatchCacheRegistry, DEFAULT_RELIST};
pub use mapper::ResourceMapper;
pub use source::{KubeWatchSource, WatchSource, WatchStream};
