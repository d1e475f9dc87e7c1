use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{errors::Error, Result};

/// Backing key-value store for [`super::ResponseCache`].
///
/// Connection lifecycle belongs to the implementation; the cache only sees
/// [`CacheStore::is_available`]. Expiry is enforced store-side.
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn is_available(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    /// Returns whether a key was removed.
    async fn del(&self, key: &str) -> Result<bool>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Clone, Debug)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// Process-local store with per-entry TTL.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remove expired entries; returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.entries.lock().await;
        let before = map.len();
        map.retain(|_, v| v.expires_at > now);
        before - map.len()
    }

    /// Entries held, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Purge expired entries every `every` until `cancel` fires.
    pub fn spawn_purger(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let purged = store.purge_expired().await;
                        if purged > 0 {
                            debug!(purged, "purged expired cache entries");
                        }
                    }
                }
            }
            debug!("cache purger stopped");
        })
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::Cache("memory store offline".to_string()))
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_available()?;
        let mut map = self.entries.lock().await;
        match map.get(key) {
            Some(v) if v.expires_at > Instant::now() => Ok(Some(v.bytes.clone())),
            Some(_) => {
                map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.ensure_available()?;
        self.entries.lock().await.insert(
            key.to_string(),
            StoredValue {
                bytes: value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.entries.lock().await.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        let now = Instant::now();
        let map = self.entries.lock().await;
        Ok(map
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && v.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect())
    }
}
