//! Endpoint health tracking, ranking and retry backoff.
//!
//! Every connector ranks a chain's endpoints by recorded health before each
//! connection cycle: fewest consecutive failures first, then lowest observed
//! latency, with the registry order breaking ties. Health survives restarts
//! through [`SqliteHealthStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::persistence::Database;

// ---------------------------------------------------------------------------
// Endpoint health
// ---------------------------------------------------------------------------

/// Learned health of a single RPC endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub url: String,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_latency_ms: Option<u64>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl EndpointHealth {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            consecutive_failures: 0,
            total_failures: 0,
            last_latency_ms: None,
            last_success: None,
            last_error: None,
        }
    }

    pub fn record_success(&mut self, latency: Duration) {
        self.consecutive_failures = 0;
        self.last_latency_ms = Some(latency.as_millis() as u64);
        self.last_success = Some(Utc::now());
    }

    pub fn record_failure(&mut self, error: &str) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures = self.total_failures.saturating_add(1);
        self.last_error = Some(error.to_string());
    }

    fn rank_key(&self) -> (u32, u64) {
        (
            self.consecutive_failures,
            self.last_latency_ms.unwrap_or(u64::MAX),
        )
    }
}

/// Order `urls` by recorded health. Endpoints with no record keep their
/// registry position relative to each other and sort as "no failures,
/// unknown latency".
pub fn rank_endpoints(urls: &[String], known: &HashMap<String, EndpointHealth>) -> Vec<String> {
    let mut ranked: Vec<(usize, (u32, u64), &String)> = urls
        .iter()
        .enumerate()
        .map(|(i, url)| {
            let key = known.get(url).map(|h| h.rank_key()).unwrap_or((0, u64::MAX));
            (i, key, url)
        })
        .collect();
    ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().map(|(_, _, url)| url.clone()).collect()
}

// ---------------------------------------------------------------------------
// Health stores
// ---------------------------------------------------------------------------

/// Connection metadata cache: learned per-endpoint health.
pub trait HealthStore: Send + Sync {
    fn get(&self, url: &str) -> Option<EndpointHealth>;
    fn record_success(&self, url: &str, latency: Duration);
    fn record_failure(&self, url: &str, error: &str);
    fn snapshot(&self) -> HashMap<String, EndpointHealth>;

    /// Rank a chain's endpoints using this store's knowledge.
    fn rank(&self, urls: &[String]) -> Vec<String> {
        rank_endpoints(urls, &self.snapshot())
    }
}

/// Process-local health store.
#[derive(Debug, Default)]
pub struct MemoryHealthStore {
    entries: RwLock<HashMap<String, EndpointHealth>>,
}

impl MemoryHealthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HealthStore for MemoryHealthStore {
    fn get(&self, url: &str) -> Option<EndpointHealth> {
        self.entries.read().get(url).cloned()
    }

    fn record_success(&self, url: &str, latency: Duration) {
        self.entries
            .write()
            .entry(url.to_string())
            .or_insert_with(|| EndpointHealth::new(url))
            .record_success(latency);
    }

    fn record_failure(&self, url: &str, error: &str) {
        self.entries
            .write()
            .entry(url.to_string())
            .or_insert_with(|| EndpointHealth::new(url))
            .record_failure(error);
    }

    fn snapshot(&self) -> HashMap<String, EndpointHealth> {
        self.entries.read().clone()
    }
}

/// Health store backed by the `endpoint_health` table. Reads are served from
/// memory; every update is written through.
pub struct SqliteHealthStore {
    db: Arc<Mutex<Database>>,
    cache: MemoryHealthStore,
}

impl SqliteHealthStore {
    /// Load previously learned health from `db`.
    pub fn load(db: Arc<Mutex<Database>>) -> anyhow::Result<Self> {
        let rows = db.lock().load_endpoint_health()?;
        debug!(count = rows.len(), "loaded endpoint health");
        let cache = MemoryHealthStore::new();
        {
            let mut entries = cache.entries.write();
            for row in rows {
                entries.insert(row.url.clone(), row);
            }
        }
        Ok(Self { db, cache })
    }

    fn persist(&self, url: &str) {
        if let Some(health) = self.cache.get(url) {
            if let Err(e) = self.db.lock().upsert_endpoint_health(&health) {
                warn!(endpoint = %url, "failed to persist endpoint health: {e}");
            }
        }
    }
}

impl HealthStore for SqliteHealthStore {
    fn get(&self, url: &str) -> Option<EndpointHealth> {
        self.cache.get(url)
    }

    fn record_success(&self, url: &str, latency: Duration) {
        self.cache.record_success(url, latency);
        self.persist(url);
    }

    fn record_failure(&self, url: &str, error: &str) {
        self.cache.record_failure(url, error);
        self.persist(url);
    }

    fn snapshot(&self) -> HashMap<String, EndpointHealth> {
        self.cache.snapshot()
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff: `base * 2^attempt`, capped, plus up to
/// `jitter * delay` of random extra wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// The un-jittered delay for a given attempt (0-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.cap)
    }

    /// The delay for a given attempt, including jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = delay.as_secs_f64() * self.jitter.min(1.0) * rand::rng().random::<f64>();
        delay + Duration::from_secs_f64(extra)
    }
}

/// Stateful backoff counter over a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next retry; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unknown_endpoints_keep_registry_order() {
        let ranked = rank_endpoints(&urls(&["a", "b", "c"]), &HashMap::new());
        assert_eq!(ranked, urls(&["a", "b", "c"]));
    }

    #[test]
    fn failing_endpoints_sink_to_the_bottom() {
        let store = MemoryHealthStore::new();
        store.record_failure("a", "refused");
        store.record_failure("a", "refused");
        store.record_failure("b", "timeout");
        assert_eq!(store.rank(&urls(&["a", "b", "c"])), urls(&["c", "b", "a"]));
    }

    #[test]
    fn lower_latency_wins_among_healthy() {
        let store = MemoryHealthStore::new();
        store.record_success("a", Duration::from_millis(300));
        store.record_success("b", Duration::from_millis(20));
        assert_eq!(store.rank(&urls(&["a", "b"])), urls(&["b", "a"]));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let store = MemoryHealthStore::new();
        store.record_failure("a", "x");
        store.record_success("a", Duration::from_millis(5));
        let health = store.get("a").unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.total_failures, 1);
        assert_eq!(health.last_error.as_deref(), Some("x"));
    }

    #[test]
    fn sqlite_store_survives_reload() {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        {
            let store = SqliteHealthStore::load(Arc::clone(&db)).unwrap();
            store.record_failure("wss://bad", "refused");
            store.record_success("wss://good", Duration::from_millis(10));
        }
        let store = SqliteHealthStore::load(db).unwrap();
        assert_eq!(store.get("wss://bad").unwrap().consecutive_failures, 1);
        assert_eq!(
            store.rank(&urls(&["wss://bad", "wss://good"])),
            urls(&["wss://good", "wss://bad"])
        );
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(1_000),
            jitter: 0.0,
        };
        let delays: Vec<_> = (0..6).map(|a| policy.delay(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(policy.base_delay(200), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(10),
            jitter: 0.5,
        };
        for _ in 0..100 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn backoff_counter_resets() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::from_millis(10),
            cap: Duration::from_secs(1),
            jitter: 0.0,
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
