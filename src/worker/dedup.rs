use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::metrics;

use super::fetcher::FetchResult;

pub type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Collapses concurrent identical outbound fetches into one shared pending
/// result. Pure coordination: no cache interaction, rebuilt empty on every
/// worker restart.
#[derive(Clone, Default)]
pub struct InflightMap {
    inner: Arc<Mutex<HashMap<String, SharedFetch>>>,
}

impl InflightMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the outstanding ticket for `identity`, if any.
    pub fn acquire(&self, identity: &str) -> Option<SharedFetch> {
        self.inner.lock().get(identity).cloned()
    }

    pub fn register(&self, identity: &str, ticket: SharedFetch) {
        self.inner.lock().insert(identity.to_string(), ticket);
    }

    /// Removes the ticket unconditionally; a later request for the same
    /// identity starts fresh.
    pub fn release(&self, identity: &str) {
        self.inner.lock().remove(identity);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Joins the in-flight ticket for `identity` or registers `fut` as the
    /// new one, atomically. The ticket is driven to settlement by a detached
    /// task, so it is released (and any write-back completes) even if every
    /// caller is dropped mid-flight.
    pub async fn run<F>(&self, identity: String, fut: F) -> FetchResult
    where
        F: Future<Output = FetchResult> + Send + 'static,
    {
        let (ticket, created) = {
            let mut guard = self.inner.lock();
            match guard.get(&identity) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let ticket = fut.boxed().shared();
                    guard.insert(identity.clone(), ticket.clone());
                    (ticket, true)
                }
            }
        };

        if created {
            let map = self.clone();
            let watched = ticket.clone();
            tokio::spawn(async move {
                let _ = watched.await;
                map.release(&identity);
            });
        } else {
            metrics::record_dedup_join();
        }

        ticket.await
    }
}
