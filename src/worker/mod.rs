pub mod dedup;
pub mod disk;
pub mod fetcher;
pub mod lifecycle;
pub mod message;
pub mod plan;
pub mod policy;
pub mod request;
pub mod router;
pub mod store;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use http::HeaderMap;
use tracing::{debug, info, warn};

use crate::manifest::PrecacheManifest;
use crate::metrics;
use crate::settings::Settings;

use dedup::InflightMap;
use fetcher::{FetchError, FetchResult, Fetcher, fetch_with_timeout};
use lifecycle::{Lifecycle, WorkerState};
use message::{ControlMessage, VersionReply};
use plan::{CachePlan, Purpose};
use policy::PolicyEngine;
use request::WorkerRequest;
use router::{RouteClass, Routing};
use store::CacheStorage;

/// Construction-time knobs that do not belong to the cache plan.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub offline_url: String,
    pub api_prefixes: Vec<String>,
    pub allowed_origins: Vec<String>,
    /// Short bound for API fetches.
    pub api_timeout: Duration,
    /// Default bound for every other network leg, installs included.
    pub fetch_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            offline_url: "/offline.html".to_string(),
            api_prefixes: vec!["/api/".to_string()],
            allowed_origins: Vec::new(),
            api_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Settings> for WorkerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            offline_url: settings.offline_url.clone(),
            api_prefixes: settings.api_prefixes.clone(),
            allowed_origins: settings.allowed_origins.clone(),
            api_timeout: settings.api_timeout(),
            fetch_timeout: settings.fetch_timeout(),
        }
    }
}

/// One intercepted request, optionally carrying a response the host already
/// started fetching (navigation preload).
pub struct FetchEvent {
    pub request: WorkerRequest,
    pub preload: Option<BoxFuture<'static, FetchResult>>,
}

impl FetchEvent {
    pub fn new(request: WorkerRequest) -> Self {
        Self {
            request,
            preload: None,
        }
    }

    pub fn with_preload(mut self, preload: BoxFuture<'static, FetchResult>) -> Self {
        self.preload = Some(preload);
        self
    }
}

/// What the worker decided for one fetch event.
pub enum FetchOutcome {
    Respond {
        class: RouteClass,
        strategy: &'static str,
        response: store::CachedResponse,
    },
    Failed {
        class: RouteClass,
        strategy: &'static str,
        error: FetchError,
    },
    /// Not intercepted; the host forwards the request untouched.
    Bypass,
}

#[derive(Debug, Default)]
pub struct InstallReport {
    pub attempted: usize,
    pub precached: usize,
    pub failures: Vec<PrecacheFailure>,
    pub offline_cached: bool,
}

#[derive(Debug)]
pub struct PrecacheFailure {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ActivateReport {
    pub purged: Vec<String>,
}

/// The long-lived service object: one handler method per event type, all
/// state explicit, constructed once per worker version.
pub struct ServiceWorker {
    plan: CachePlan,
    manifest: PrecacheManifest,
    precached_urls: std::collections::HashSet<String>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    policy: PolicyEngine,
    lifecycle: Lifecycle,
    options: WorkerOptions,
}

impl ServiceWorker {
    pub fn new(
        plan: CachePlan,
        manifest: PrecacheManifest,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        options: WorkerOptions,
    ) -> Self {
        let policy = PolicyEngine::new(
            storage.clone(),
            fetcher.clone(),
            InflightMap::new(),
            plan.namespace(Purpose::Offline).clone(),
            options.offline_url.clone(),
            options.fetch_timeout,
        );
        let precached_urls = manifest
            .entries()
            .iter()
            .map(|entry| entry.url.clone())
            .collect();
        Self {
            plan,
            manifest,
            precached_urls,
            storage,
            fetcher,
            policy,
            lifecycle: Lifecycle::new(),
            options,
        }
    }

    pub fn version(&self) -> &str {
        self.plan.version()
    }

    pub fn plan(&self) -> &CachePlan {
        &self.plan
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<WorkerState> {
        self.lifecycle.subscribe()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Install: seed the precache namespace from the manifest and stash the
    /// offline fallback page. Each URL fails in isolation; install itself
    /// succeeds even with partial precache failures and always ends in the
    /// waiting state.
    pub async fn handle_install(&self) -> Result<InstallReport> {
        anyhow::ensure!(
            self.lifecycle.state() == WorkerState::Installing,
            "install is only valid from the installing state (currently {})",
            self.lifecycle.state()
        );
        info!(
            version = self.version(),
            entries = self.manifest.len(),
            "installing worker"
        );

        let precache_spec = self.plan.namespace(Purpose::Precache);
        let cache = self
            .storage
            .open(&precache_spec.name)
            .await
            .context("failed to open precache namespace")?;

        let mut report = InstallReport::default();
        for entry in self.manifest.entries() {
            report.attempted += 1;
            let fetched = fetch_with_timeout(
                &self.fetcher,
                &entry.request_url(),
                &HeaderMap::new(),
                self.options.fetch_timeout,
            )
            .await;
            let failure = match fetched {
                Ok(mut response) if response.status.is_success() => {
                    response.stamp_cached_at(SystemTime::now());
                    match cache.put(&entry.url, response).await {
                        Ok(()) => {
                            report.precached += 1;
                            None
                        }
                        Err(err) => Some(format!("cache write failed: {err}")),
                    }
                }
                Ok(response) => Some(format!("unexpected status {}", response.status)),
                Err(err) => Some(err.to_string()),
            };
            if let Some(reason) = failure {
                warn!(url = entry.url, reason, "precache entry failed");
                metrics::record_precache_failure();
                report.failures.push(PrecacheFailure {
                    url: entry.url.clone(),
                    reason,
                });
            }
        }

        report.offline_cached = self.cache_offline_page().await;
        if !report.offline_cached {
            metrics::record_precache_failure();
        }

        self.lifecycle
            .transition(&[WorkerState::Installing], WorkerState::Waiting)?;
        info!(
            version = self.version(),
            precached = report.precached,
            failed = report.failures.len(),
            offline_cached = report.offline_cached,
            "worker installed, waiting"
        );
        Ok(report)
    }

    async fn cache_offline_page(&self) -> bool {
        let offline_spec = self.plan.namespace(Purpose::Offline);
        let fetched = fetch_with_timeout(
            &self.fetcher,
            &self.options.offline_url,
            &HeaderMap::new(),
            self.options.fetch_timeout,
        )
        .await;
        let mut response = match fetched {
            Ok(response) if response.status.is_success() => response,
            Ok(response) => {
                warn!(
                    url = self.options.offline_url,
                    status = response.status.as_u16(),
                    "offline page fetch returned unexpected status"
                );
                return false;
            }
            Err(err) => {
                warn!(url = self.options.offline_url, error = %err, "offline page fetch failed");
                return false;
            }
        };
        response.stamp_cached_at(SystemTime::now());
        let cache = match self.storage.open(&offline_spec.name).await {
            Ok(cache) => cache,
            Err(err) => {
                warn!(error = %err, "failed to open offline namespace");
                return false;
            }
        };
        match cache.put(&self.options.offline_url, response).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "failed to cache offline page");
                false
            }
        }
    }

    /// Activate: purge every namespace carrying this app's prefix but a
    /// non-current version tag, claim open pages, and enable navigation
    /// preload.
    pub async fn handle_activate(&self) -> Result<ActivateReport> {
        self.lifecycle
            .transition(&[WorkerState::Waiting], WorkerState::Activating)?;
        info!(version = self.version(), "activating worker");

        let mut report = ActivateReport::default();
        let names = self
            .storage
            .list()
            .await
            .context("failed to enumerate cache namespaces")?;
        for name in names {
            if !self.plan.is_owned(&name) || self.plan.is_current(&name) {
                continue;
            }
            match self.storage.delete(&name).await {
                Ok(true) => {
                    metrics::record_namespace_purge();
                    info!(namespace = name, "deleted stale cache namespace");
                    report.purged.push(name);
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(namespace = name, error = %err, "failed to delete stale namespace");
                }
            }
        }

        self.lifecycle.claim_clients();
        self.lifecycle.enable_navigation_preload();
        self.lifecycle
            .transition(&[WorkerState::Activating], WorkerState::Active)?;
        info!(
            version = self.version(),
            purged = report.purged.len(),
            "worker active"
        );
        Ok(report)
    }

    /// Skip-waiting: a waiting worker activates immediately instead of
    /// waiting for the old version's pages to go away. A no-op in any other
    /// state.
    pub async fn skip_waiting(&self) -> Result<()> {
        if self.lifecycle.state() != WorkerState::Waiting {
            debug!(
                state = %self.lifecycle.state(),
                "ignoring skip-waiting outside the waiting state"
            );
            return Ok(());
        }
        self.handle_activate().await?;
        Ok(())
    }

    /// Deletes every namespace owned by this app, current version included.
    /// Idempotent: purging an already-empty store succeeds.
    pub async fn purge_all(&self) -> Result<Vec<String>> {
        let names = self
            .storage
            .list()
            .await
            .context("failed to enumerate cache namespaces")?;
        let mut purged = Vec::new();
        for name in names {
            if !self.plan.is_owned(&name) {
                continue;
            }
            match self.storage.delete(&name).await {
                Ok(true) => {
                    metrics::record_namespace_purge();
                    purged.push(name);
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(namespace = name, error = %err, "failed to purge namespace");
                }
            }
        }
        info!(purged = purged.len(), "cache purge complete");
        Ok(purged)
    }

    /// The control-plane handler. Unrecognized shapes never reach this
    /// point; `message::parse_wire` drops them at the channel boundary.
    pub async fn handle_message(&self, message: ControlMessage) -> Result<()> {
        metrics::record_control_message(message.type_str());
        match message {
            ControlMessage::SkipWaiting => self.skip_waiting().await,
            ControlMessage::ClearCache => {
                self.purge_all().await?;
                Ok(())
            }
            ControlMessage::GetVersion { reply } => {
                let _ = reply.send(VersionReply {
                    version: self.version().to_string(),
                });
                Ok(())
            }
        }
    }

    /// The fetch-event handler: classify, dispatch to a policy, and report
    /// the decision. Only an active worker intercepts anything.
    pub async fn handle_fetch(&self, event: FetchEvent) -> FetchOutcome {
        if self.lifecycle.state() != WorkerState::Active {
            return FetchOutcome::Bypass;
        }

        let FetchEvent { request, preload } = event;
        let class = match router::classify(
            &request,
            &self.options.api_prefixes,
            &self.options.allowed_origins,
            &self.precached_urls,
        ) {
            Routing::Bypass => return FetchOutcome::Bypass,
            Routing::Handle(class) => class,
        };

        let started = Instant::now();
        let (strategy, result) = match class {
            RouteClass::Api => (
                "network-first",
                self.policy
                    .network_first(
                        &request,
                        self.plan.namespace(Purpose::Api),
                        self.options.api_timeout,
                    )
                    .await,
            ),
            RouteClass::Navigation => (
                "network-first",
                self.policy
                    .navigation(
                        &request,
                        self.plan.namespace(Purpose::Pages),
                        preload,
                        self.options.fetch_timeout,
                    )
                    .await,
            ),
            RouteClass::Image => (
                "stale-while-revalidate",
                self.policy
                    .stale_while_revalidate(&request, self.plan.namespace(Purpose::Images))
                    .await,
            ),
            RouteClass::Precached => (
                "cache-first",
                self.policy
                    .cache_first(&request, self.plan.namespace(Purpose::Precache))
                    .await,
            ),
            RouteClass::Static => (
                "stale-while-revalidate",
                self.policy
                    .stale_while_revalidate(&request, self.plan.namespace(Purpose::Runtime))
                    .await,
            ),
        };
        metrics::record_fetch(class.as_str(), started.elapsed());

        match result {
            Ok(response) => FetchOutcome::Respond {
                class,
                strategy,
                response,
            },
            Err(error) => FetchOutcome::Failed {
                class,
                strategy,
                error,
            },
        }
    }
}
