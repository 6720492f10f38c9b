// Response cache with per-category policies.
//
// Every category (guest profiles, room status, ...) carries its own TTL, capacity and
// invalidation hooks. Entries are keyed `scope:category:identifier[:param_hash]`, so two
// clients for different hotels never see each other's data.
//
// All mutation happens inside one synchronous critical section per call: a caller that is
// cancelled can never observe or leave behind a half-applied insert, eviction or size update.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

// Roughly a century; longer TTLs are clamped to it.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationStrategy {
    TimeBased,
    EventBased,
    DependencyBased,
    Manual,
}

#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub max_size: usize,
    pub invalidation_strategy: InvalidationStrategy,
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
}

impl CachePolicy {
    pub fn new(ttl_seconds: u64, max_size: usize, strategy: InvalidationStrategy) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_seconds),
            max_size,
            invalidation_strategy: strategy,
            dependencies: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: &[&str]) -> Self {
        self.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::new(600, 100, InvalidationStrategy::TimeBased)
    }
}

// Policies for the data categories the hotel API serves.
pub fn builtin_policies() -> HashMap<String, CachePolicy> {
    use InvalidationStrategy::*;

    [
        (
            "guest_profile",
            CachePolicy::new(3600, 1000, EventBased)
                .with_dependencies(&["guest_updates", "profile_merges"])
                .with_tags(&["guest", "profile", "crm"]),
        ),
        (
            "room_status",
            CachePolicy::new(300, 500, TimeBased)
                .with_dependencies(&["housekeeping_updates", "maintenance"])
                .with_tags(&["rooms", "housekeeping", "inventory"]),
        ),
        (
            "reservation",
            CachePolicy::new(900, 2000, DependencyBased)
                .with_dependencies(&["reservation_updates", "cancellations", "modifications"])
                .with_tags(&["reservations", "bookings"]),
        ),
        (
            "rate_codes",
            CachePolicy::new(7200, 200, TimeBased).with_tags(&["rates", "pricing", "revenue"]),
        ),
        (
            "room_types",
            CachePolicy::new(14400, 100, Manual)
                .with_tags(&["inventory", "room_types", "configuration"]),
        ),
        (
            "daily_reports",
            CachePolicy::new(600, 50, TimeBased)
                .with_tags(&["reports", "operations", "analytics"]),
        ),
        (
            "financial_transactions",
            CachePolicy::new(1800, 1000, EventBased)
                .with_dependencies(&["payment_processing", "folio_updates", "charges"])
                .with_tags(&["financial", "transactions", "billing"]),
        ),
    ]
    .into_iter()
    .map(|(name, policy)| (name.to_string(), policy))
    .collect()
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub category: String,
    pub identifier: String,
    pub value: Value,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub access_count: u64,
    // None until the first hit; a never-read entry carries no idle penalty.
    pub last_accessed: Option<Instant>,
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
    pub size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    // Higher means evicted sooner.
    fn eviction_score(&self, now: Instant) -> f64 {
        let age = now.saturating_duration_since(self.created_at).as_secs_f64();
        let frequency = 1.0 / self.access_count.max(1) as f64;
        let idle = self
            .last_accessed
            .map_or(0.0, |at| now.saturating_duration_since(at).as_secs_f64());
        age + frequency + idle
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub scope_id: String,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub invalidations: u64,
    pub expirations: u64,
    pub size_bytes: usize,
    pub entries_count: usize,
    pub max_entries: usize,
    pub dependencies_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheHealthStatus {
    Healthy,
    LowHitRate,
    NearCapacity,
    ManyExpired,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub status: CacheHealthStatus,
    pub stats: CacheStats,
    pub expired_entries: usize,
    pub capacity_usage: f64,
    pub dependencies_tracked: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    expirations: AtomicU64,
}

#[derive(Debug, Default)]
struct Store {
    entries: HashMap<String, CacheEntry>,
    dependency_index: HashMap<String, HashSet<String>>,
    category_counts: HashMap<String, usize>,
    size_bytes: usize,
}

impl Store {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.size_bytes = self.size_bytes.saturating_sub(entry.size_bytes);

        for dep in &entry.dependencies {
            if let Some(keys) = self.dependency_index.get_mut(dep) {
                keys.remove(key);
                if keys.is_empty() {
                    self.dependency_index.remove(dep);
                }
            }
        }

        if let Some(count) = self.category_counts.get_mut(&entry.category) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.category_counts.remove(&entry.category);
            }
        }

        Some(entry)
    }

    fn insert(&mut self, entry: CacheEntry) {
        for dep in &entry.dependencies {
            self.dependency_index
                .entry(dep.clone())
                .or_default()
                .insert(entry.key.clone());
        }
        *self.category_counts.entry(entry.category.clone()).or_default() += 1;
        self.size_bytes += entry.size_bytes;
        self.entries.insert(entry.key.clone(), entry);
    }

    // Removes the highest scoring entries (optionally within one category) until `target`
    // remain. Returns how many were evicted.
    fn evict_to(&mut self, category: Option<&str>, target: usize, now: Instant) -> usize {
        let mut scored: Vec<(String, f64)> = self
            .entries
            .values()
            .filter(|e| category.map_or(true, |c| e.category == c))
            .map(|e| (e.key.clone(), e.eviction_score(now)))
            .collect();

        let excess = scored.len().saturating_sub(target);
        if excess == 0 {
            return 0;
        }

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        for (key, _) in scored.iter().take(excess) {
            self.remove(key);
        }
        excess
    }
}

struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct CacheManager {
    scope_id: String,
    max_entries: usize,
    policies: HashMap<String, CachePolicy>,
    default_policy: CachePolicy,
    store: Mutex<Store>,
    counters: Counters,
    sweeper: Mutex<Option<Sweeper>>,
}

impl CacheManager {
    pub fn new(scope_id: impl Into<String>, max_entries: usize) -> Self {
        let scope_id = scope_id.into();
        info!(scope_id = %scope_id, max_entries, "cache manager initialized");
        Self {
            scope_id,
            max_entries,
            policies: builtin_policies(),
            default_policy: CachePolicy::default(),
            store: Mutex::new(Store::default()),
            counters: Counters::default(),
            sweeper: Mutex::new(None),
        }
    }

    /// Registers or replaces the policy for `category`.
    pub fn with_policy(mut self, category: impl Into<String>, policy: CachePolicy) -> Self {
        self.policies.insert(category.into(), policy);
        self
    }

    pub fn policy(&self, category: &str) -> &CachePolicy {
        self.policies.get(category).unwrap_or(&self.default_policy)
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn key_for(&self, category: &str, identifier: &str, params: Option<&Value>) -> String {
        let mut key = format!("{}:{}:{}", self.scope_id, category, identifier);
        if let Some(hash) = params.and_then(params_hash) {
            key.push(':');
            key.push_str(&hash);
        }
        key
    }

    pub fn get(&self, category: &str, identifier: &str, params: Option<&Value>) -> Option<Value> {
        let key = self.key_for(category, identifier, params);
        let now = Instant::now();

        let mut store = self.store.lock();
        let expired = store.entries.get(&key).map(|e| e.is_expired(now));
        let hit = match expired {
            Some(false) => store.entries.get_mut(&key).map(|entry| {
                entry.access_count += 1;
                entry.last_accessed = Some(now);
                (entry.value.clone(), entry.access_count)
            }),
            Some(true) => {
                store.remove(&key);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        };
        drop(store);

        match hit {
            Some((value, access_count)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(cache_key = %key, category, access_count, "cache hit");
                Some(value)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!(cache_key = %key, category, "cache miss");
                None
            }
        }
    }

    /// Stores `value` under the category's policy. `ttl_override` replaces the policy TTL;
    /// a zero TTL stores an entry that is already expired.
    pub fn set(
        &self,
        category: &str,
        identifier: &str,
        value: Value,
        params: Option<&Value>,
        ttl_override: Option<Duration>,
    ) -> bool {
        if self.max_entries == 0 {
            return false;
        }

        let policy = self.policy(category);
        let ttl = ttl_override.unwrap_or(policy.ttl);
        let key = self.key_for(category, identifier, params);
        let size_bytes = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
        let now = Instant::now();

        let entry = CacheEntry {
            key: key.clone(),
            category: category.to_string(),
            identifier: identifier.to_string(),
            value,
            created_at: now,
            expires_at: expiry(now, ttl),
            access_count: 0,
            last_accessed: None,
            dependencies: policy.dependencies.clone(),
            tags: policy.tags.clone(),
            size_bytes,
        };

        let mut store = self.store.lock();
        if store.remove(&key).is_none() {
            let evicted = self.ensure_capacity(&mut store, category, policy, now);
            if evicted > 0 {
                self.counters
                    .evictions
                    .fetch_add(evicted as u64, Ordering::Relaxed);
                debug!(evicted, category, "cache capacity reached, evicted entries");
            }
        }
        store.insert(entry);
        drop(store);

        debug!(
            cache_key = %key,
            category,
            ttl_seconds = ttl.as_secs(),
            size_bytes,
            "cache set"
        );
        true
    }

    fn ensure_capacity(
        &self,
        store: &mut Store,
        category: &str,
        policy: &CachePolicy,
        now: Instant,
    ) -> usize {
        let mut evicted = 0;
        if store.entries.len() >= self.max_entries {
            evicted += store.evict_to(None, self.max_entries / 2, now);
        }

        // Global eviction may have spared this category, so check it on its own.
        let in_category = store.category_counts.get(category).copied().unwrap_or(0);
        if policy.max_size > 0 && in_category >= policy.max_size {
            evicted += store.evict_to(Some(category), policy.max_size / 2, now);
        }
        evicted
    }

    /// Removes every entry matched by any of the given selectors.
    ///
    /// The selectors are independent and their matches are unioned. `category` matches the
    /// whole category. `identifier` matches entries with that identifier, scoped to
    /// `category` when one is given. `dependency` matches entries whose policy declared it,
    /// and `tags` matches entries sharing at least one tag.
    pub fn invalidate(
        &self,
        category: Option<&str>,
        identifier: Option<&str>,
        dependency: Option<&str>,
        tags: &[&str],
    ) -> usize {
        let mut store = self.store.lock();
        let mut doomed: HashSet<String> = HashSet::new();

        if let Some(dep) = dependency {
            if let Some(keys) = store.dependency_index.remove(dep) {
                doomed.extend(keys);
            }
        }

        if category.is_some() || identifier.is_some() || !tags.is_empty() {
            for entry in store.entries.values() {
                let by_category = category.is_some_and(|c| entry.category == c);
                let by_identifier = identifier.is_some_and(|id| {
                    entry.identifier == id && category.map_or(true, |c| entry.category == c)
                });
                let by_tag = entry.tags.iter().any(|t| tags.contains(&t.as_str()));
                if by_category || by_identifier || by_tag {
                    doomed.insert(entry.key.clone());
                }
            }
        }

        let removed = doomed
            .iter()
            .filter(|key| store.remove(key).is_some())
            .count();
        drop(store);

        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        info!(
            invalidated = removed,
            category = ?category,
            identifier = ?identifier,
            dependency = ?dependency,
            tags = ?tags,
            "cache invalidation completed"
        );
        removed
    }

    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut store = self.store.lock();
        let expired: Vec<String> = store
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            store.remove(key);
        }
        drop(store);

        self.counters
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn clear(&self) {
        *self.store.lock() = Store::default();
    }

    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let (size_bytes, entries_count, dependencies_count) = {
            let store = self.store.lock();
            (
                store.size_bytes,
                store.entries.len(),
                store.dependency_index.len(),
            )
        };
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            scope_id: self.scope_id.clone(),
            hits,
            misses,
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            size_bytes,
            entries_count,
            max_entries: self.max_entries,
            dependencies_count,
        }
    }

    pub fn health(&self) -> CacheHealth {
        let now = Instant::now();
        let expired_entries = self
            .store
            .lock()
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .count();
        let stats = self.stats();
        let entries = stats.entries_count as f64;

        // No lookups yet is not a low hit rate.
        let status = if stats.hits + stats.misses > 0 && stats.hit_rate < 0.3 {
            CacheHealthStatus::LowHitRate
        } else if entries > self.max_entries as f64 * 0.9 {
            CacheHealthStatus::NearCapacity
        } else if expired_entries as f64 > entries * 0.2 {
            CacheHealthStatus::ManyExpired
        } else {
            CacheHealthStatus::Healthy
        };

        CacheHealth {
            status,
            capacity_usage: if self.max_entries > 0 {
                entries / self.max_entries as f64
            } else {
                0.0
            },
            dependencies_tracked: stats.dependencies_count,
            expired_entries,
            stats,
        }
    }

    /// Spawns the periodic expiry sweep. Calling it again while a sweep runs is a no-op.
    pub fn start_background_sweep(self: &Arc<Self>, interval: Duration) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        let interval = interval.max(Duration::from_millis(10));
        let (shutdown, mut stop) = watch::channel(false);
        let cache = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            info!(interval_seconds = interval.as_secs(), "cache sweep started");
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        let Some(cache) = cache.upgrade() else { break };
                        let removed = cache.cleanup_expired();
                        if removed > 0 {
                            debug!(removed, "swept expired cache entries");
                        }
                    }
                }
            }
            info!("cache sweep stopped");
        });

        *sweeper = Some(Sweeper { shutdown, handle });
    }

    pub fn sweep_running(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    /// Stops the sweep (waiting up to five seconds before aborting it) and drops all entries.
    pub async fn close(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(Sweeper { shutdown, mut handle }) = sweeper {
            let _ = shutdown.send(true);
            if tokio::time::timeout(Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                warn!("cache sweep did not stop in time, aborting");
                handle.abort();
            }
        }
        self.clear();
        info!(scope_id = %self.scope_id, "cache manager closed");
    }
}

// Clamps huge TTLs instead of overflowing the clock.
fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(MAX_TTL))
        .unwrap_or(now)
}

fn params_hash(params: &Value) -> Option<String> {
    match params {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        // serde_json maps are ordered by key, so this is canonical.
        other => {
            let digest = Sha256::digest(other.to_string().as_bytes());
            Some(digest[..4].iter().map(|b| format!("{b:02x}")).collect())
        }
    }
}
