use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    time::timeout,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static FETCH_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("fetch_requests_total", "Intercepted requests by route class");
    let vec = IntCounterVec::new(opts, &["route"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register fetch_requests_total");
    vec
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "cache_lookup_total",
        "Cache lookups by namespace purpose and outcome",
    );
    let vec = IntCounterVec::new(opts, &["purpose", "outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "cache_evictions_total",
        "Entries trimmed from a namespace by purpose",
    );
    let vec = IntCounterVec::new(opts, &["purpose"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_evictions_total");
    vec
});

static CACHE_STORE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_errors_total", "Swallowed cache write failures")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_errors_total");
    counter
});

static DEDUP_JOINED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "dedup_joined_total",
        "Fetches that joined an in-flight ticket instead of going to the network",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register dedup_joined_total");
    counter
});

static PRECACHE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "precache_failures_total",
        "Manifest URLs that failed to precache during install",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register precache_failures_total");
    counter
});

static OFFLINE_FALLBACKS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "offline_fallbacks_total",
        "Requests resolved with the offline fallback page",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register offline_fallbacks_total");
    counter
});

static FETCH_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("fetch_errors_total", "Network fetch failures by kind");
    let vec = IntCounterVec::new(opts, &["kind"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register fetch_errors_total");
    vec
});

static NAMESPACE_PURGES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "namespace_purges_total",
        "Cache namespaces deleted during activation or purge-all",
    )
    .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register namespace_purges_total");
    counter
});

static CONTROL_MESSAGES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("control_messages_total", "Control messages by type");
    let vec = IntCounterVec::new(opts, &["type"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register control_messages_total");
    vec
});

static FETCH_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "fetch_latency_seconds",
        "Time from fetch event dispatch to response by route class",
    );
    let vec = HistogramVec::new(opts, &["route"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register fetch_latency_seconds");
    vec
});

pub fn record_fetch(route: &str, elapsed: Duration) {
    FETCH_REQUESTS_TOTAL.with_label_values(&[route]).inc();
    FETCH_LATENCY_SECONDS
        .with_label_values(&[route])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(purpose: &str, outcome: &str) {
    CACHE_LOOKUP_TOTAL
        .with_label_values(&[purpose, outcome])
        .inc();
}

pub fn record_cache_eviction(purpose: &str, count: u64) {
    if count > 0 {
        CACHE_EVICTIONS_TOTAL
            .with_label_values(&[purpose])
            .inc_by(count);
    }
}

pub fn record_cache_store_error() {
    CACHE_STORE_ERRORS_TOTAL.inc();
}

pub fn record_dedup_join() {
    DEDUP_JOINED_TOTAL.inc();
}

pub fn record_precache_failure() {
    PRECACHE_FAILURES_TOTAL.inc();
}

pub fn record_offline_fallback() {
    OFFLINE_FALLBACKS_TOTAL.inc();
}

pub fn record_fetch_error(kind: &str) {
    FETCH_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_namespace_purge() {
    NAMESPACE_PURGES_TOTAL.inc();
}

pub fn record_control_message(message_type: &str) {
    CONTROL_MESSAGES_TOTAL
        .with_label_values(&[message_type])
        .inc();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}

const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);
const METRICS_MAX_REQUEST_BYTES: usize = 16 * 1024;

pub async fn serve(addr: SocketAddr, path: String) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let path = if path.is_empty() {
        "/metrics".to_string()
    } else {
        path
    };
    loop {
        let (stream, _) = listener.accept().await?;
        let path = path.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(stream, &path).await {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_stream(stream: tokio::net::TcpStream, path: &str) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    let mut total_bytes = 0usize;
    let bytes = read_line_with_limits(&mut reader, &mut request_line, &mut total_bytes).await?;
    if bytes == 0 {
        return Ok(());
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let uri = parts.next().unwrap_or_default();

    // Consume and ignore headers until empty line.
    loop {
        let mut line = String::new();
        let n = read_line_with_limits(&mut reader, &mut line, &mut total_bytes).await?;
        if n == 0 || line == "\r\n" {
            break;
        }
    }

    let response = if method == "GET" && uri == path {
        let body = gather();
        build_response(200, TextEncoder::new().format_type(), body)
    } else {
        build_response(404, "text/plain", b"not found".to_vec())
    };

    reader.get_mut().write_all(&response).await?;
    reader.get_mut().shutdown().await?;
    Ok(())
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}

async fn read_line_with_limits(
    reader: &mut BufReader<tokio::net::TcpStream>,
    buf: &mut String,
    total_bytes: &mut usize,
) -> Result<usize> {
    buf.clear();
    let read = timeout(METRICS_READ_TIMEOUT, reader.read_line(buf))
        .await
        .map_err(|_| anyhow!("timed out reading metrics request"))??;
    *total_bytes += read;
    if *total_bytes > METRICS_MAX_REQUEST_BYTES {
        return Err(anyhow!("metrics request exceeded size limit"));
    }
    Ok(read)
}
