//! Shared PnL cache with throttled write-back to the durable store.
//!
//! Price-derived writes land here on every flush; the durable store sees at
//! most one write per position per `pnl_sync_interval`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use options_core::db::PositionStore;
use options_core::types::PnlSnapshot;
use options_core::Result;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Storage for PnL snapshots with per-entry expiry.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    async fn put(&self, snapshot: &PnlSnapshot, ttl: Duration) -> Result<()>;
    async fn get(&self, position_id: Uuid) -> Result<Option<PnlSnapshot>>;
    async fn delete(&self, position_id: Uuid) -> Result<()>;
}

/// In-process backend. Expired entries are dropped on read.
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<Uuid, (PnlSnapshot, Instant)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotBackend for MemoryBackend {
    async fn put(&self, snapshot: &PnlSnapshot, ttl: Duration) -> Result<()> {
        self.entries
            .insert(snapshot.position_id, (snapshot.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, position_id: Uuid) -> Result<Option<PnlSnapshot>> {
        let expired = match self.entries.get(&position_id) {
            Some(entry) if entry.1 > Instant::now() => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries
                .remove_if(&position_id, |_, (_, expires)| *expires <= Instant::now());
        }
        Ok(None)
    }

    async fn delete(&self, position_id: Uuid) -> Result<()> {
        self.entries.remove(&position_id);
        Ok(())
    }
}

/// Redis backend: one JSON string per position under `pnl:<id>`, written
/// with `SET .. EX`.
#[derive(Clone)]
pub struct RedisBackend {
    redis: redis::aio::ConnectionManager,
}

impl RedisBackend {
    pub async fn new(redis_client: redis::Client) -> Result<Self> {
        let redis = redis::aio::ConnectionManager::new(redis_client).await?;
        Ok(Self { redis })
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Self::new(client).await
    }

    fn key(position_id: Uuid) -> String {
        format!("pnl:{position_id}")
    }
}

#[async_trait]
impl SnapshotBackend for RedisBackend {
    async fn put(&self, snapshot: &PnlSnapshot, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(snapshot)?;
        let mut conn = self.redis.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::key(snapshot.position_id))
            .arg(payload)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, position_id: Uuid) -> Result<Option<PnlSnapshot>> {
        let mut conn = self.redis.clone();
        let payload: Option<String> = conn.get(Self::key(position_id)).await?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, position_id: Uuid) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: () = conn.del(Self::key(position_id)).await?;
        Ok(())
    }
}

/// Settings for [`PnlCache`].
#[derive(Debug, Clone)]
pub struct PnlCacheConfig {
    pub ttl: Duration,
    pub staleness_threshold: Duration,
    pub sync_interval: Duration,
}

impl Default for PnlCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            staleness_threshold: Duration::from_secs(30),
            sync_interval: Duration::from_secs(30),
        }
    }
}

impl From<&options_core::config::RiskConfig> for PnlCacheConfig {
    fn from(config: &options_core::config::RiskConfig) -> Self {
        Self {
            ttl: config.pnl_cache_ttl(),
            staleness_threshold: config.pnl_staleness_threshold(),
            sync_interval: config.pnl_sync_interval(),
        }
    }
}

pub struct PnlCache {
    backend: Arc<dyn SnapshotBackend>,
    store: Arc<dyn PositionStore>,
    config: PnlCacheConfig,
    last_sync: DashMap<Uuid, Instant>,
    syncs: AtomicU64,
}

impl PnlCache {
    pub fn new(
        backend: Arc<dyn SnapshotBackend>,
        store: Arc<dyn PositionStore>,
        config: PnlCacheConfig,
    ) -> Self {
        Self {
            backend,
            store,
            config,
            last_sync: DashMap::new(),
            syncs: AtomicU64::new(0),
        }
    }

    pub fn staleness_threshold(&self) -> Duration {
        self.config.staleness_threshold
    }

    pub async fn store(&self, snapshot: &PnlSnapshot) -> Result<()> {
        self.backend.put(snapshot, self.config.ttl).await
    }

    pub async fn fetch(&self, position_id: Uuid) -> Result<Option<PnlSnapshot>> {
        self.backend.get(position_id).await
    }

    /// The snapshot, only if it is within the staleness threshold at `now`.
    pub async fn fetch_fresh(
        &self,
        position_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<PnlSnapshot>> {
        let snapshot = self.backend.get(position_id).await?;
        Ok(snapshot.filter(|s| s.is_fresh(now, self.config.staleness_threshold)))
    }

    /// Write the cached snapshot to the durable store unless this position
    /// was synced within the last `sync_interval`. Returns whether a write
    /// happened.
    pub async fn sync_throttled(&self, position_id: Uuid) -> Result<bool> {
        let now = Instant::now();
        match self.last_sync.entry(position_id) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.config.sync_interval {
                    return Ok(false);
                }
                entry.insert(now);
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
            }
        }

        let Some(snapshot) = self.backend.get(position_id).await? else {
            self.last_sync.remove(&position_id);
            return Ok(false);
        };

        if let Err(e) = self.store.update_pnl(&snapshot).await {
            warn!(position_id = %position_id, error = %e, "PnL write-back failed");
            self.last_sync.remove(&position_id);
            return Err(e);
        }

        self.syncs.fetch_add(1, Ordering::Relaxed);
        debug!(position_id = %position_id, pnl_pct = %snapshot.pnl_pct, "Synced PnL to store");
        Ok(true)
    }

    /// Drop the snapshot and its throttle state.
    pub async fn evict(&self, position_id: Uuid) -> Result<()> {
        self.last_sync.remove(&position_id);
        self.backend.delete(position_id).await
    }

    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use options_core::db::MemoryPositionStore;
    use options_core::types::{Instrument, Position, PositionSide};
    use rust_decimal::Decimal;

    fn active_position() -> Position {
        let mut position = Position::new(
            Instrument::new("NFO", "43512", "NIFTY"),
            PositionSide::Long,
            Decimal::new(50, 0),
            Decimal::new(100, 0),
        );
        position.activate().unwrap();
        position
    }

    fn cache_with(store: Arc<MemoryPositionStore>, config: PnlCacheConfig) -> PnlCache {
        PnlCache::new(Arc::new(MemoryBackend::new()), store, config)
    }

    #[tokio::test]
    async fn test_store_fetch_roundtrip_within_ttl() {
        let store = Arc::new(MemoryPositionStore::new());
        let cache = cache_with(store, PnlCacheConfig::default());
        let position = active_position();
        let snapshot = position.snapshot();

        cache.store(&snapshot).await.unwrap();
        assert_eq!(cache.fetch(position.id).await.unwrap(), Some(snapshot));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = Arc::new(MemoryPositionStore::new());
        let cache = cache_with(
            store,
            PnlCacheConfig {
                ttl: Duration::from_millis(20),
                ..Default::default()
            },
        );
        let position = active_position();
        cache.store(&position.snapshot()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.fetch(position.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_fresh_respects_staleness() {
        let store = Arc::new(MemoryPositionStore::new());
        let cache = cache_with(store, PnlCacheConfig::default());
        let position = active_position();
        let mut snapshot = position.snapshot();
        let now = Utc::now();

        snapshot.timestamp = now - chrono::Duration::seconds(30);
        cache.store(&snapshot).await.unwrap();
        assert!(cache.fetch_fresh(position.id, now).await.unwrap().is_some());

        snapshot.timestamp = now - chrono::Duration::milliseconds(30_001);
        cache.store(&snapshot).await.unwrap();
        assert!(cache.fetch_fresh(position.id, now).await.unwrap().is_none());
        assert!(cache.fetch(position.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_is_throttled() {
        let store = Arc::new(MemoryPositionStore::new());
        let mut position = active_position();
        store.create(&position).await.unwrap();
        let cache = cache_with(store.clone(), PnlCacheConfig::default());

        position.apply_price(Decimal::new(105, 0), Utc::now()).unwrap();
        cache.store(&position.snapshot()).await.unwrap();
        assert!(cache.sync_throttled(position.id).await.unwrap());

        position.apply_price(Decimal::new(120, 0), Utc::now()).unwrap();
        cache.store(&position.snapshot()).await.unwrap();
        assert!(!cache.sync_throttled(position.id).await.unwrap());

        let stored = store.get(position.id).await.unwrap().unwrap();
        assert_eq!(stored.current_price, Decimal::new(105, 0));
        assert_eq!(cache.sync_count(), 1);
    }

    #[tokio::test]
    async fn test_evict_resets_throttle() {
        let store = Arc::new(MemoryPositionStore::new());
        let position = active_position();
        store.create(&position).await.unwrap();
        let cache = cache_with(store, PnlCacheConfig::default());

        cache.store(&position.snapshot()).await.unwrap();
        assert!(cache.sync_throttled(position.id).await.unwrap());
        cache.evict(position.id).await.unwrap();
        assert!(cache.fetch(position.id).await.unwrap().is_none());

        cache.store(&position.snapshot()).await.unwrap();
        assert!(cache.sync_throttled(position.id).await.unwrap());
    }
}
