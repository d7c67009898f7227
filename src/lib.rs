pub mod cli;
pub mod gateway;
pub mod logging;
pub mod manifest;
pub mod metrics;
pub mod settings;
pub mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::manifest::PrecacheManifest;
use crate::settings::Settings;
use crate::worker::fetcher::{Fetcher, HttpFetcher};
use crate::worker::plan::CachePlan;
use crate::worker::store::{CacheStorage, MemoryStorage};
use crate::worker::{ServiceWorker, WorkerOptions, disk::DiskStorage, message::ControlMessage};

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    if let Some(addr) = settings.metrics_listen {
        let path = "/metrics".to_string();
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, path).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let storage: Arc<dyn CacheStorage> = match &settings.cache_dir {
        Some(dir) => Arc::new(
            DiskStorage::new(dir.clone())
                .await
                .context("failed to initialize disk cache storage")?,
        ),
        None => Arc::new(MemoryStorage::new()),
    };

    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(settings.origin.clone())?);

    let manifest = match &settings.precache_manifest {
        Some(path) => PrecacheManifest::load(path)?,
        None => {
            warn!("no precache manifest configured; install will only seed the offline page");
            PrecacheManifest::empty()
        }
    };

    let plan = CachePlan::new(&settings.app_prefix, &settings.version, &settings);
    let worker = Arc::new(ServiceWorker::new(
        plan,
        manifest,
        storage,
        fetcher.clone(),
        WorkerOptions::from(settings.as_ref()),
    ));

    let report = worker.handle_install().await?;
    if !report.failures.is_empty() {
        warn!(
            failed = report.failures.len(),
            "install completed with partial precache failures"
        );
    }

    if settings.auto_activate {
        // The deployment analog of the page's update prompt sending
        // SKIP_WAITING right away: a fresh daemon takes over immediately.
        worker.handle_message(ControlMessage::SkipWaiting).await?;
    } else {
        info!(
            version = worker.version(),
            "worker installed and waiting; send SKIP_WAITING to activate"
        );
    }

    let ctx = gateway::GatewayContext::new(settings, worker, fetcher)?;
    gateway::run(ctx).await
}
