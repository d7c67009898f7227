use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{
    CONNECTION, CONTENT_LENGTH, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRANSFER_ENCODING, UPGRADE,
};
use http::{HeaderMap, Method};
use thiserror::Error;

use super::store::CachedResponse;

/// Classified network failure. Timeouts and connection errors recover
/// differently only in logging and metrics; policies treat both as "the
/// network leg failed".
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("network fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("network fetch failed: {0}")]
    Network(Arc<anyhow::Error>),
}

impl FetchError {
    pub fn network(err: impl Into<anyhow::Error>) -> Self {
        Self::Network(Arc::new(err.into()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network",
        }
    }
}

pub type FetchResult = Result<CachedResponse, FetchError>;

/// The outbound network capability. `fetch` is the GET leg the policies use;
/// `forward` carries non-GET pass-through traffic verbatim.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, target: &str, headers: &HeaderMap) -> FetchResult;

    async fn forward(
        &self,
        method: &Method,
        target: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> FetchResult;
}

/// Bounds a fetch with the policy's timeout, aborting the underlying request
/// and surfacing a timeout-class failure.
pub async fn fetch_with_timeout(
    fetcher: &Arc<dyn Fetcher>,
    target: &str,
    headers: &HeaderMap,
    timeout: Duration,
) -> FetchResult {
    match tokio::time::timeout(timeout, fetcher.fetch(target, headers)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(timeout)),
    }
}

/// reqwest-backed fetcher. Relative targets are resolved against the origin
/// base URL; absolute targets (allow-listed cross-origin requests) are used
/// as-is.
pub struct HttpFetcher {
    client: reqwest::Client,
    origin: String,
}

impl HttpFetcher {
    pub fn new(origin: impl Into<String>) -> anyhow::Result<Self> {
        let origin = origin.into();
        let origin = origin.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| anyhow!("failed to build http client: {err}"))?;
        Ok(Self { client, origin })
    }

    fn absolute_url(&self, target: &str) -> String {
        if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            format!("{}{}", self.origin, target)
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, target: &str, headers: &HeaderMap) -> FetchResult {
        self.forward(&Method::GET, target, headers, Bytes::new())
            .await
    }

    async fn forward(
        &self,
        method: &Method,
        target: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> FetchResult {
        let url = self.absolute_url(target);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .headers(sanitize_request_headers(headers));
        if !body.is_empty() {
            request = request.body(body);
        }
        let response = request.send().await.map_err(FetchError::network)?;
        let status = response.status();
        let headers = sanitize_response_headers(response.headers());
        let body = response.bytes().await.map_err(FetchError::network)?;
        Ok(CachedResponse::new(status, headers, body))
    }
}

const HOP_BY_HOP: &[http::header::HeaderName] = &[
    CONNECTION,
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRANSFER_ENCODING,
    UPGRADE,
];

fn sanitize_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut sanitized = headers.clone();
    for name in HOP_BY_HOP {
        sanitized.remove(name);
    }
    sanitized.remove(HOST);
    sanitized.remove(CONTENT_LENGTH);
    sanitized
}

fn sanitize_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut sanitized = headers.clone();
    for name in HOP_BY_HOP {
        sanitized.remove(name);
    }
    sanitized
}
