//! Trailing-edge debounce: `Idle` until a change arrives, then `Pending`
//! until the window passes without another change.

use std::time::Duration;

use tokio::time::Instant;

/// Default quiet period before an emission.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Pending(Instant),
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    state: DebounceState,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self { Self { window, state: DebounceState::Idle } }

    pub fn window(&self) -> Duration { self.window }

    pub fn state(&self) -> DebounceState { self.state }

    pub fn is_pending(&self) -> bool { matches!(self.state, DebounceState::Pending(_)) }

    /// Record a change at `now`, pushing the deadline out to `now + window`.
    pub fn touch(&mut self, now: Instant) { self.state = DebounceState::Pending(now + self.window); }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Pending(d) => Some(d),
            DebounceState::Idle => None,
        }
    }

    /// Return to `Idle`. True if an emission was pending.
    pub fn fire(&mut self) -> bool { std::mem::replace(&mut self.state, DebounceState::Idle) != DebounceState::Idle }
}

/// Resolves at `deadline`; never resolves for `None`.
pub async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
