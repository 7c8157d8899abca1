//! Runtime knobs for the sync layer, read from the environment.

use std::time::Duration;

/// Sync tuning for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Interval between forced full relists of every watch cache.
    pub relist: Duration,
    /// Quiet period before a bound collection is republished.
    pub debounce: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { relist: kestrel_kubehub::DEFAULT_RELIST, debounce: kestrel_store::DEFAULT_WINDOW }
    }
}

impl SyncConfig {
    /// `KESTREL_RELIST_SECS` and `KESTREL_DEBOUNCE_MS`; unset or unparsable
    /// values keep their defaults.
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let relist = get("KESTREL_RELIST_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.relist);
        let debounce = get("KESTREL_DEBOUNCE_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.debounce);
        Self { relist, debounce }
    }
}
