//! In-process fixed-window rate limiting.
//!
//! Each key owns one window `{count, reset_at_ms}`. The first hit after the
//! window expires opens a new one. Bursts straddling a window edge can reach
//! roughly twice the limit; that is accepted.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    pub count: u32,
    pub reset_at_ms: i64,
}

impl WindowEntry {
    /// Expired entries count as absent everywhere, including the sweep.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.reset_at_ms <= now_ms
    }
}

/// Storage for rate-limit windows.
///
/// `update` must run `apply` atomically with respect to other calls on the
/// same key, and `remove_expired` must re-check expiry under the same lock.
pub trait WindowStore: Send + Sync {
    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<WindowEntry>) -> WindowEntry,
    ) -> WindowEntry;
    fn get(&self, key: &str) -> Option<WindowEntry>;
    fn remove_expired(&self, now_ms: i64) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sharded concurrent map; the shard write lock is held across `apply`.
#[derive(Debug, Default)]
pub struct MemoryWindowStore {
    entries: DashMap<String, WindowEntry>,
}

impl WindowStore for MemoryWindowStore {
    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<WindowEntry>) -> WindowEntry,
    ) -> WindowEntry {
        if let Some(mut slot) = self.entries.get_mut(key) {
            let next = apply(Some(*slot));
            *slot = next;
            return next;
        }
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let next = apply(Some(*slot.get()));
                slot.insert(next);
                next
            }
            Entry::Vacant(slot) => {
                let next = apply(None);
                slot.insert(next);
                next
            }
        }
    }

    fn get(&self, key: &str) -> Option<WindowEntry> {
        self.entries.get(key).map(|e| *e)
    }

    fn remove_expired(&self, now_ms: i64) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now_ms);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub limit: u32,
    pub window_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: i64,
}

impl RateDecision {
    /// Whole seconds until the window resets, never less than 1.
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let ms = (self.reset_at_ms - now_ms).max(0);
        u64::try_from((ms + 999) / 1000).unwrap_or(1).max(1)
    }
}

pub struct RateLimiter<S: WindowStore = MemoryWindowStore> {
    store: S,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_store(MemoryWindowStore::default())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: WindowStore> RateLimiter<S> {
    pub fn with_store(store: S) -> Self {
        Self { store }
    }

    /// Count one hit against `key` and decide whether it is allowed.
    pub fn check(&self, key: &str, policy: RatePolicy, now_ms: i64) -> RateDecision {
        let entry = self.store.update(key, &mut |current| match current {
            Some(e) if !e.is_expired(now_ms) => WindowEntry {
                count: e.count.saturating_add(1),
                ..e
            },
            _ => WindowEntry {
                count: 1,
                reset_at_ms: now_ms + policy.window_ms,
            },
        });
        RateDecision {
            allowed: entry.count <= policy.limit,
            limit: policy.limit,
            remaining: policy.limit.saturating_sub(entry.count),
            reset_at_ms: entry.reset_at_ms,
        }
    }

    /// `true` when the hit is allowed.
    pub fn check_and_increment(&self, key: &str, limit: u32, window_ms: i64, now_ms: i64) -> bool {
        self.check(key, RatePolicy { limit, window_ms }, now_ms)
            .allowed
    }

    /// Hits left in the current window without counting one.
    pub fn remaining(&self, key: &str, limit: u32, now_ms: i64) -> u32 {
        match self.store.get(key) {
            Some(e) if !e.is_expired(now_ms) => limit.saturating_sub(e.count),
            _ => limit,
        }
    }

    /// Drop every expired window; returns how many were removed.
    pub fn sweep(&self, now_ms: i64) -> usize {
        self.store.remove_expired(now_ms)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// Periodically drop expired windows until `shutdown` is cancelled.
///
/// The first sweep runs one `every` after start. Missed ticks are skipped.
pub fn spawn_sweeper<S>(
    limiter: Arc<RateLimiter<S>>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    S: WindowStore + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = limiter.sweep(now_ms());
                    if removed > 0 {
                        tracing::debug!(removed, remaining = limiter.len(), "swept expired rate limit windows");
                    }
                    metrics::gauge!("forecaster_rate_limit_keys").set(limiter.len() as f64);
                }
            }
        }
        tracing::debug!("rate limit sweeper stopped");
    })
}
