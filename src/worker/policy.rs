use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::metrics;

use super::dedup::InflightMap;
use super::fetcher::{FetchError, FetchResult, Fetcher, fetch_with_timeout};
use super::plan::NamespaceSpec;
use super::request::WorkerRequest;
use super::store::{Cache, CacheStorage, CachedResponse};

/// The caching strategies, expressed as pure async operations over
/// (request, namespace, limits). All network legs go through the in-flight
/// deduplicator; all write-backs are followed by a FIFO trim.
#[derive(Clone)]
pub struct PolicyEngine {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    inflight: InflightMap,
    offline_spec: NamespaceSpec,
    offline_url: String,
    default_timeout: Duration,
}

impl PolicyEngine {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        inflight: InflightMap,
        offline_spec: NamespaceSpec,
        offline_url: String,
        default_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            fetcher,
            inflight,
            offline_spec,
            offline_url,
            default_timeout,
        }
    }

    pub fn inflight(&self) -> &InflightMap {
        &self.inflight
    }

    /// Cache-first: serve a fresh hit outright; serve a stale hit while
    /// refreshing in the background; fetch on a miss. A failed miss for an
    /// HTML-accepting request degrades to the offline page.
    pub async fn cache_first(
        &self,
        request: &WorkerRequest,
        spec: &NamespaceSpec,
    ) -> FetchResult {
        let identity = request.identity();
        match self.lookup(spec, &identity).await {
            Some(entry) => {
                let fresh = match spec.max_age {
                    Some(max_age) => entry.is_fresh(SystemTime::now(), max_age),
                    None => true,
                };
                if fresh {
                    metrics::record_cache_lookup(spec.purpose.as_str(), "hit");
                    return Ok(entry);
                }
                metrics::record_cache_lookup(spec.purpose.as_str(), "stale");
                self.spawn_revalidate(request.clone(), spec.clone());
                Ok(entry)
            }
            None => {
                metrics::record_cache_lookup(spec.purpose.as_str(), "miss");
                match self.fetch_and_cache(request, spec, None).await {
                    Ok(response) => Ok(response),
                    Err(err) => {
                        metrics::record_fetch_error(err.kind());
                        if request.accepts_html()
                            && let Some(offline) = self.offline_response().await
                        {
                            metrics::record_offline_fallback();
                            return Ok(offline);
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    /// Network-first: a timeout-bounded fetch, falling back to any cached
    /// entry regardless of age.
    pub async fn network_first(
        &self,
        request: &WorkerRequest,
        spec: &NamespaceSpec,
        timeout: Duration,
    ) -> FetchResult {
        match self.fetch_and_cache(request, spec, Some(timeout)).await {
            Ok(response) => Ok(response),
            Err(err) => {
                metrics::record_fetch_error(err.kind());
                match self.lookup(spec, &request.identity()).await {
                    Some(entry) => {
                        metrics::record_cache_lookup(spec.purpose.as_str(), "hit");
                        Ok(entry)
                    }
                    None => {
                        metrics::record_cache_lookup(spec.purpose.as_str(), "miss");
                        Err(err)
                    }
                }
            }
        }
    }

    /// Stale-while-revalidate: any cached entry is returned immediately,
    /// with a background fetch updating the namespace for next time.
    pub async fn stale_while_revalidate(
        &self,
        request: &WorkerRequest,
        spec: &NamespaceSpec,
    ) -> FetchResult {
        let identity = request.identity();
        match self.lookup(spec, &identity).await {
            Some(entry) => {
                metrics::record_cache_lookup(spec.purpose.as_str(), "hit");
                self.spawn_revalidate(request.clone(), spec.clone());
                Ok(entry)
            }
            None => {
                metrics::record_cache_lookup(spec.purpose.as_str(), "miss");
                self.fetch_and_cache(request, spec, None).await
            }
        }
    }

    /// Navigation: network-first over the pages namespace, but a failure
    /// always resolves to cache or the offline page, never an error, as
    /// long as the offline page was precached. A preloaded response the
    /// host already started replaces the worker's own network leg.
    pub async fn navigation(
        &self,
        request: &WorkerRequest,
        spec: &NamespaceSpec,
        preload: Option<BoxFuture<'static, FetchResult>>,
        timeout: Duration,
    ) -> FetchResult {
        let identity = request.identity();
        let network = match preload {
            Some(pending) => {
                let result = match tokio::time::timeout(timeout, pending).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout(timeout)),
                };
                if let Ok(response) = &result {
                    if response.status.is_success() {
                        let mut stamped = response.clone();
                        stamped.stamp_cached_at(SystemTime::now());
                        self.write_back(spec, &identity, stamped).await;
                    }
                }
                result
            }
            None => self.fetch_and_cache(request, spec, Some(timeout)).await,
        };

        match network {
            Ok(response) => Ok(response),
            Err(err) => {
                metrics::record_fetch_error(err.kind());
                if let Some(entry) = self.lookup(spec, &identity).await {
                    metrics::record_cache_lookup(spec.purpose.as_str(), "hit");
                    return Ok(entry);
                }
                metrics::record_cache_lookup(spec.purpose.as_str(), "miss");
                match self.offline_response().await {
                    Some(offline) => {
                        metrics::record_offline_fallback();
                        Ok(offline)
                    }
                    None => Err(err),
                }
            }
        }
    }

    /// The cached offline fallback page, if install managed to store one.
    pub async fn offline_response(&self) -> Option<CachedResponse> {
        self.lookup(&self.offline_spec, &self.offline_url).await
    }

    /// Deduplicated fetch with write-back and trim on success. Only
    /// successful (2xx) responses are cached; anything else is returned to
    /// the caller uncached.
    async fn fetch_and_cache(
        &self,
        request: &WorkerRequest,
        spec: &NamespaceSpec,
        timeout: Option<Duration>,
    ) -> FetchResult {
        let identity = request.identity();
        let engine = self.clone();
        let headers = request.headers.clone();
        let spec = spec.clone();
        let target = identity.clone();
        let bound = timeout.unwrap_or(self.default_timeout);
        self.inflight
            .run(identity, async move {
                let result =
                    fetch_with_timeout(&engine.fetcher, &target, &headers, bound).await;
                match result {
                    Ok(mut response) => {
                        if response.status.is_success() {
                            response.stamp_cached_at(SystemTime::now());
                            engine.write_back(&spec, &target, response.clone()).await;
                        }
                        Ok(response)
                    }
                    Err(err) => Err(err),
                }
            })
            .await
    }

    fn spawn_revalidate(&self, request: WorkerRequest, spec: NamespaceSpec) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.fetch_and_cache(&request, &spec, None).await {
                metrics::record_fetch_error(err.kind());
                debug!(
                    identity = request.identity(),
                    error = %err,
                    "background revalidation failed"
                );
            }
        });
    }

    async fn lookup(&self, spec: &NamespaceSpec, identity: &str) -> Option<CachedResponse> {
        let cache = match self.storage.open(&spec.name).await {
            Ok(cache) => cache,
            Err(err) => {
                warn!(namespace = spec.name, error = %err, "failed to open cache namespace");
                return None;
            }
        };
        match cache.get(identity).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(namespace = spec.name, identity, error = %err, "cache read failed");
                None
            }
        }
    }

    /// A failed cache write never fails the response that triggered it.
    async fn write_back(&self, spec: &NamespaceSpec, identity: &str, response: CachedResponse) {
        let cache = match self.storage.open(&spec.name).await {
            Ok(cache) => cache,
            Err(err) => {
                warn!(namespace = spec.name, error = %err, "failed to open cache namespace");
                metrics::record_cache_store_error();
                return;
            }
        };
        if let Err(err) = cache.put(identity, response).await {
            warn!(namespace = spec.name, identity, error = %err, "cache write failed");
            metrics::record_cache_store_error();
            return;
        }
        self.trim(&cache, spec).await;
    }

    /// FIFO trim: drop the oldest entries by insertion order until the
    /// namespace is at or below its cap. Never recency-based.
    pub async fn trim(&self, cache: &Arc<dyn Cache>, spec: &NamespaceSpec) {
        if spec.max_entries == 0 {
            return;
        }
        let keys = match cache.keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(namespace = spec.name, error = %err, "cache key listing failed");
                return;
            }
        };
        if keys.len() <= spec.max_entries {
            return;
        }
        let excess = keys.len() - spec.max_entries;
        let mut removed = 0u64;
        for url in keys.iter().take(excess) {
            match cache.delete(url).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(namespace = spec.name, url, error = %err, "cache trim delete failed");
                }
            }
        }
        metrics::record_cache_eviction(spec.purpose.as_str(), removed);
    }
}
