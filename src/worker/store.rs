use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderName;
use http::{HeaderMap, HeaderValue, StatusCode};
use parking_lot::Mutex;

/// Synthetic header stamped onto a response at write time. Immutable once
/// set; staleness is computed from it at read time, never rewritten.
pub const CACHED_AT_HEADER: HeaderName = HeaderName::from_static("x-shellcache-cached-at");

/// A response snapshot as stored in a cache namespace: status, headers, and
/// the full body bytes.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Stamps the cached-at timestamp if not already present.
    pub fn stamp_cached_at(&mut self, now: SystemTime) {
        if self.headers.contains_key(&CACHED_AT_HEADER) {
            return;
        }
        let secs = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            self.headers.insert(CACHED_AT_HEADER.clone(), value);
        }
    }

    pub fn cached_at(&self) -> Option<SystemTime> {
        let value = self.headers.get(&CACHED_AT_HEADER)?;
        let secs: u64 = value.to_str().ok()?.parse().ok()?;
        Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }

    /// Age relative to `now`; `None` when the entry carries no timestamp.
    pub fn age(&self, now: SystemTime) -> Option<Duration> {
        let cached_at = self.cached_at()?;
        Some(now.duration_since(cached_at).unwrap_or_default())
    }

    pub fn is_fresh(&self, now: SystemTime, max_age: Duration) -> bool {
        match self.age(now) {
            Some(age) => age <= max_age,
            None => false,
        }
    }
}

/// One named cache: a (request identity -> response snapshot) map whose key
/// enumeration preserves insertion order. Single-key operations are atomic;
/// concurrent writes to the same key are last-write-wins.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    async fn get(&self, url: &str) -> Result<Option<CachedResponse>>;
    async fn put(&self, url: &str, response: CachedResponse) -> Result<()>;
    async fn delete(&self, url: &str) -> Result<bool>;
    /// Keys in insertion order, oldest first. A put over an existing key
    /// counts as a fresh insertion and moves the key to the back.
    async fn keys(&self) -> Result<Vec<String>>;
    async fn len(&self) -> Result<usize>;
}

/// The host-provided cache storage capability: open-by-name, delete, list.
#[async_trait]
pub trait CacheStorage: Send + Sync + 'static {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>>;
    async fn delete(&self, name: &str) -> Result<bool>;
    async fn list(&self) -> Result<Vec<String>>;
}

/// In-memory storage backend. Namespaces and entries live for the process
/// lifetime only; the gateway uses this when no cache_dir is configured.
#[derive(Default)]
pub struct MemoryStorage {
    caches: Mutex<HashMap<String, Arc<MemoryCache>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>> {
        let mut caches = self.caches.lock();
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCache::default()))
            .clone();
        Ok(cache)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.caches.lock().remove(name).is_some())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.caches.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[derive(Default)]
struct MemoryCache {
    inner: Mutex<MemoryCacheInner>,
}

#[derive(Default)]
struct MemoryCacheInner {
    order: Vec<String>,
    entries: HashMap<String, CachedResponse>,
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, url: &str) -> Result<Option<CachedResponse>> {
        Ok(self.inner.lock().entries.get(url).cloned())
    }

    async fn put(&self, url: &str, response: CachedResponse) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.entries.insert(url.to_string(), response).is_some() {
            inner.order.retain(|existing| existing != url);
        }
        inner.order.push(url.to_string());
        Ok(())
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(url).is_some();
        if removed {
            inner.order.retain(|existing| existing != url);
        }
        Ok(removed)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().order.clone())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.inner.lock().entries.len())
    }
}
