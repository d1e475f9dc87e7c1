//! Content-addressed response cache over a pluggable [`CacheStore`].
//!
//! The cache is advisory: every store failure degrades to a miss (`get`) or a
//! `false`/`0` result (`set`/`delete`/`clear`) and is only logged.

pub mod store;

use std::{future::Future, sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{
    errors::Error,
    retry::{with_retry, RetryPolicy},
    Result,
};

pub use store::{CacheStore, MemoryStore};

/// Namespace for generated answers, keyed by (identity, prompt).
pub const NS_LLM: &str = "llm";
/// Namespace for document contents, keyed by file id.
pub const NS_FILE: &str = "file";

pub const LLM_RESPONSE_TTL: Duration = Duration::from_secs(3600);
pub const FILE_CONTENT_TTL: Duration = Duration::from_secs(1800);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub available: bool,
    pub keys: usize,
    pub prefix: String,
    pub default_ttl_secs: u64,
}

#[derive(Clone)]
pub struct ResponseCache {
    store: Option<Arc<dyn CacheStore>>,
    key_prefix: String,
    default_ttl: Duration,
    retry: Option<RetryPolicy>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, key_prefix: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            store: Some(store),
            key_prefix: key_prefix.into(),
            default_ttl,
            retry: None,
        }
    }

    /// A cache with no backing store: every lookup misses.
    pub fn disabled(key_prefix: impl Into<String>) -> Self {
        Self {
            store: None,
            key_prefix: key_prefix.into(),
            default_ttl: Duration::ZERO,
            retry: None,
        }
    }

    /// Route store calls through the retry executor.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn is_available(&self) -> bool {
        self.available_store().is_some()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// `{prefix}{namespace}:{sha256(namespace ":" canonical_json(input))}`.
    ///
    /// Namespaces must be non-empty and free of `:`, so one namespace is never a
    /// key prefix of another.
    pub fn key_for<I: Serialize + ?Sized>(&self, namespace: &str, input: &I) -> Result<String> {
        check_namespace(namespace)?;
        let canonical = canonical_json(&serde_json::to_value(input)?);

        let mut h = Sha256::new();
        h.update(namespace.as_bytes());
        h.update(b":");
        h.update(canonical.as_bytes());
        let digest = h.finalize();

        Ok(format!(
            "{}{}:{}",
            self.key_prefix,
            namespace,
            hex(&digest)
        ))
    }

    pub async fn get<I, T>(&self, namespace: &str, input: &I) -> Option<T>
    where
        I: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let store = self.available_store()?;
        let key = self.key_or_log(namespace, input)?;

        let bytes = match self.call(|| store.get(&key)).await {
            Ok(Some(b)) => b,
            Ok(None) => {
                debug!(%key, "cache miss");
                return None;
            }
            Err(e) => {
                warn!(%key, error = %e, "cache get failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(v) => {
                debug!(%key, "cache hit");
                Some(v)
            }
            Err(e) => {
                warn!(%key, error = %e, "cached value does not decode, treating as miss");
                None
            }
        }
    }

    /// Store `value`. `ttl` defaults to the configured TTL.
    pub async fn set<I, T>(&self, namespace: &str, input: &I, value: &T, ttl: Option<Duration>) -> bool
    where
        I: Serialize + ?Sized,
        T: Serialize + ?Sized,
    {
        let Some(store) = self.available_store() else {
            return false;
        };
        let Some(key) = self.key_or_log(namespace, input) else {
            return false;
        };
        let bytes = match serde_json::to_vec(value) {
            Ok(b) => b,
            Err(e) => {
                warn!(%key, error = %e, "cache value does not serialize");
                return false;
            }
        };
        let ttl = ttl.unwrap_or(self.default_ttl);

        match self.call(|| store.set(&key, bytes.clone(), ttl)).await {
            Ok(()) => {
                debug!(%key, ttl_secs = ttl.as_secs(), "cached");
                true
            }
            Err(e) => {
                warn!(%key, error = %e, "cache set failed");
                false
            }
        }
    }

    pub async fn delete<I: Serialize + ?Sized>(&self, namespace: &str, input: &I) -> bool {
        let Some(store) = self.available_store() else {
            return false;
        };
        let Some(key) = self.key_or_log(namespace, input) else {
            return false;
        };

        match self.call(|| store.del(&key)).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(%key, error = %e, "cache delete failed");
                false
            }
        }
    }

    /// Remove every key in `namespace`. Administrative, not for the hot path.
    pub async fn clear(&self, namespace: &str) -> usize {
        if let Err(e) = check_namespace(namespace) {
            warn!(namespace, error = %e, "refusing to clear");
            return 0;
        }
        let prefix = format!("{}{}:", self.key_prefix, namespace);
        self.clear_prefix(&prefix).await
    }

    /// Remove every key under the configured prefix.
    pub async fn clear_all(&self) -> usize {
        let prefix = self.key_prefix.clone();
        self.clear_prefix(&prefix).await
    }

    pub async fn stats(&self) -> CacheStats {
        let keys = match self.available_store() {
            Some(store) => self
                .call(|| store.keys(&self.key_prefix))
                .await
                .map(|k| k.len())
                .unwrap_or(0),
            None => 0,
        };

        CacheStats {
            available: self.is_available(),
            keys,
            prefix: self.key_prefix.clone(),
            default_ttl_secs: self.default_ttl.as_secs(),
        }
    }

    pub async fn get_response(&self, identity: &str, prompt: &str) -> Option<String> {
        self.get(NS_LLM, &ResponseKey { identity, prompt }).await
    }

    pub async fn set_response(&self, identity: &str, prompt: &str, response: &str) -> bool {
        self.set(
            NS_LLM,
            &ResponseKey { identity, prompt },
            response,
            Some(LLM_RESPONSE_TTL),
        )
        .await
    }

    pub async fn get_file(&self, file_id: &str) -> Option<String> {
        self.get(NS_FILE, &FileKey { file_id }).await
    }

    pub async fn set_file(&self, file_id: &str, content: &str) -> bool {
        self.set(NS_FILE, &FileKey { file_id }, content, Some(FILE_CONTENT_TTL))
            .await
    }

    async fn clear_prefix(&self, prefix: &str) -> usize {
        let Some(store) = self.available_store() else {
            return 0;
        };

        let keys = match self.call(|| store.keys(prefix)).await {
            Ok(k) => k,
            Err(e) => {
                warn!(prefix, error = %e, "cache key listing failed");
                return 0;
            }
        };

        let mut removed = 0usize;
        for key in &keys {
            match self.call(|| store.del(key)).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(%key, error = %e, "cache delete failed"),
            }
        }

        info!(prefix, removed, "cleared cache keys");
        removed
    }

    fn available_store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.store.as_ref().filter(|s| s.is_available())
    }

    fn key_or_log<I: Serialize + ?Sized>(&self, namespace: &str, input: &I) -> Option<String> {
        match self.key_for(namespace, input) {
            Ok(k) => Some(k),
            Err(e) => {
                warn!(namespace, error = %e, "cache key derivation failed");
                None
            }
        }
    }

    async fn call<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match &self.retry {
            Some(policy) => with_retry(policy, op).await.map_err(Error::from),
            None => op().await,
        }
    }
}

#[derive(Serialize)]
struct ResponseKey<'a> {
    identity: &'a str,
    prompt: &'a str,
}

#[derive(Serialize)]
struct FileKey<'a> {
    file_id: &'a str,
}

fn check_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() || namespace.contains(':') {
        return Err(Error::Cache(format!("invalid cache namespace {namespace:?}")));
    }
    Ok(())
}

/// JSON with object keys sorted at every level.
fn canonical_json(v: &Value) -> String {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        Value::String(k.clone()),
                        canonical_json(&map[k.as_str()])
                    )
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{fields}}}")
        }
        Value::Array(items) => {
            let items = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{items}]")
        }
        other => other.to_string(),
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
