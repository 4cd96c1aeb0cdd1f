use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::entities::report::Report;
use crate::domain::entities::report_key::{ReportKey, ReportKind};
use crate::domain::errors::PipelineResult;

/// Sales, purchase, outstanding and financial snapshots
pub const DEFAULT_REPORT_TTL: Duration = Duration::from_secs(300);
/// Stock levels move slower
pub const DEFAULT_INVENTORY_TTL: Duration = Duration::from_secs(600);

type SharedFetch = Shared<BoxFuture<'static, PipelineResult<Arc<Report>>>>;

/// Cache performance statistics
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Requests that joined a fetch already in flight
    pub joins: u64,
    pub evictions: u64,
    pub failures: u64,
}

impl CacheStats {
    /// Calculate hit rate as percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.joins;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Time-to-live per report kind
#[derive(Debug, Clone, PartialEq)]
pub struct TtlPolicy {
    pub default: Duration,
    pub overrides: BTreeMap<ReportKind, Duration>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        let mut overrides = BTreeMap::new();
        overrides.insert(ReportKind::Inventory, DEFAULT_INVENTORY_TTL);
        Self {
            default: DEFAULT_REPORT_TTL,
            overrides,
        }
    }
}

impl TtlPolicy {
    pub fn uniform(ttl: Duration) -> Self {
        Self {
            default: ttl,
            overrides: BTreeMap::new(),
        }
    }

    pub fn for_kind(&self, kind: ReportKind) -> Duration {
        self.overrides.get(&kind).copied().unwrap_or(self.default)
    }
}

/// A built report together with when it was fetched. Replaced whole, never
/// mutated.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: ReportKey,
    pub value: Arc<Report>,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.duration_since(self.fetched_at) > self.ttl
    }
}

struct InFlight {
    id: u64,
    fetch: SharedFetch,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ReportKey, CacheEntry>,
    in_flight: HashMap<ReportKey, InFlight>,
    next_fetch_id: u64,
    stats: CacheStats,
}

/// TTL cache of built reports with de-duplication of concurrent fetches.
///
/// Concurrent callers asking for the same key while a fetch is running wait
/// on that fetch instead of starting their own, and all of them receive its
/// result, success or failure. Failures are never stored.
#[derive(Clone)]
pub struct ReportCache {
    state: Arc<Mutex<CacheState>>,
    ttl: TtlPolicy,
}

impl Default for ReportCache {
    fn default() -> Self {
        Self::new(TtlPolicy::default())
    }
}

impl ReportCache {
    pub fn new(ttl: TtlPolicy) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            ttl,
        }
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Return the cached report for `key`, or run `fetcher` to produce it.
    ///
    /// `fetcher` is only invoked on a miss with no fetch in flight for the
    /// same key.
    pub async fn get_or_fetch<F, Fut>(&self, key: &ReportKey, fetcher: F) -> PipelineResult<Arc<Report>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult<Report>> + Send + 'static,
    {
        let fetch = {
            let mut state = self.state.lock().await;
            let now = Instant::now();

            if let Some(entry) = state.entries.get(key) {
                if !entry.is_expired_at(now) {
                    let value = Arc::clone(&entry.value);
                    let age_ms = now.duration_since(entry.fetched_at).as_millis() as u64;
                    state.stats.hits += 1;
                    debug!(key = %key, age_ms, "Cache hit");
                    return Ok(value);
                }
                state.entries.remove(key);
                state.stats.evictions += 1;
                debug!(key = %key, "Cache entry expired");
            }

            if let Some(pending) = state.in_flight.get(key) {
                let fetch = pending.fetch.clone();
                state.stats.joins += 1;
                debug!(key = %key, "Joining in-flight fetch");
                fetch
            } else {
                state.stats.misses += 1;
                state.next_fetch_id += 1;
                let id = state.next_fetch_id;
                debug!(key = %key, "Cache miss - fetching");

                let fetch = Self::spawn_fetch(
                    Arc::clone(&self.state),
                    key.clone(),
                    id,
                    self.ttl.for_kind(key.kind),
                    fetcher(),
                );
                state.in_flight.insert(
                    key.clone(),
                    InFlight {
                        id,
                        fetch: fetch.clone(),
                    },
                );
                fetch
            }
        };

        fetch.await
    }

    /// Wrap `fut` so that whoever drives it to completion also settles the
    /// cache: the in-flight slot is released and a success is stored.
    fn spawn_fetch<Fut>(
        state: Arc<Mutex<CacheState>>,
        key: ReportKey,
        id: u64,
        ttl: Duration,
        fut: Fut,
    ) -> SharedFetch
    where
        Fut: Future<Output = PipelineResult<Report>> + Send + 'static,
    {
        async move {
            let result = fut.await.map(Arc::new);

            let mut state = state.lock().await;
            // A slot replaced by invalidate() belongs to a newer fetch
            let current = matches!(state.in_flight.get(&key), Some(f) if f.id == id);
            if current {
                state.in_flight.remove(&key);
            }

            match &result {
                Ok(report) if current => {
                    state.entries.insert(
                        key.clone(),
                        CacheEntry {
                            key: key.clone(),
                            value: Arc::clone(report),
                            fetched_at: Instant::now(),
                            ttl,
                        },
                    );
                    debug!(key = %key, ttl_secs = ttl.as_secs(), "Report cached");
                }
                Ok(_) => {
                    debug!(key = %key, "Discarding report fetched before invalidation");
                }
                Err(e) => {
                    state.stats.failures += 1;
                    warn!(key = %key, error = %e, "Fetch failed, nothing cached");
                }
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Drop the entry for `key` and detach any fetch in flight for it.
    /// Returns whether anything was removed.
    pub async fn invalidate(&self, key: &ReportKey) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.entries.remove(key).is_some();
        let detached = state.in_flight.remove(key).is_some();
        debug!(key = %key, removed, detached, "Cache entry invalidated");
        removed || detached
    }

    /// Drop every entry of one report kind
    pub async fn invalidate_kind(&self, kind: ReportKind) -> usize {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|k, _| k.kind != kind);
        state.in_flight.retain(|k, _| k.kind != kind);
        let removed = before - state.entries.len();
        debug!(kind = %kind, removed, "Cache invalidated for report kind");
        removed
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        let cleared = state.entries.len();
        state.entries.clear();
        state.in_flight.clear();
        debug!(cleared_entries = cleared, "Report cache cleared");
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        self.state.lock().await.stats.clone()
    }
}
