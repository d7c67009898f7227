#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use shellcache::cli::LogFormat;
use shellcache::settings::Settings;
use shellcache::worker::fetcher::{FetchError, FetchResult, Fetcher};
use shellcache::worker::store::CachedResponse;

/// Scripted in-process fetcher for worker-level tests: per-target bodies,
/// failures, optional delay, and a global offline switch.
pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, ScriptedRoute>>,
    offline: AtomicBool,
    delay: Mutex<Option<Duration>>,
    hits: Mutex<HashMap<String, usize>>,
    total_hits: AtomicUsize,
}

#[derive(Clone)]
pub struct ScriptedRoute {
    pub status: StatusCode,
    pub body: &'static str,
}

impl Default for ScriptedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            delay: Mutex::new(None),
            hits: Mutex::new(HashMap::new()),
            total_hits: AtomicUsize::new(0),
        }
    }

    pub fn ok(&self, target: &str, body: &'static str) {
        self.routes.lock().insert(
            target.to_string(),
            ScriptedRoute {
                status: StatusCode::OK,
                body,
            },
        );
    }

    pub fn status(&self, target: &str, status: StatusCode, body: &'static str) {
        self.routes
            .lock()
            .insert(target.to_string(), ScriptedRoute { status, body });
    }

    pub fn remove(&self, target: &str) {
        self.routes.lock().remove(target);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn hits(&self, target: &str) -> usize {
        self.hits.lock().get(target).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.total_hits.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, target: &str, _headers: &HeaderMap) -> FetchResult {
        self.total_hits.fetch_add(1, Ordering::SeqCst);
        *self.hits.lock().entry(target.to_string()).or_insert(0) += 1;

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::network(anyhow!("origin unreachable")));
        }
        let route = self.routes.lock().get(target).cloned();
        match route {
            Some(route) => Ok(CachedResponse::new(
                route.status,
                HeaderMap::new(),
                Bytes::from_static(route.body.as_bytes()),
            )),
            None => Ok(CachedResponse::new(
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                Bytes::from_static(b"not found"),
            )),
        }
    }

    async fn forward(
        &self,
        _method: &Method,
        target: &str,
        headers: &HeaderMap,
        _body: Bytes,
    ) -> FetchResult {
        self.fetch(target, headers).await
    }
}

/// Minimal HTTP origin server on a real socket, for gateway end-to-end
/// tests. Routes are path -> (content type, body); flipping `online` off
/// makes it drop connections to simulate an unreachable origin.
pub struct MockOrigin {
    pub addr: std::net::SocketAddr,
    routes: Arc<Mutex<HashMap<String, (String, String)>>>,
    online: Arc<AtomicBool>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockOrigin {
    pub async fn spawn() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let routes: Arc<Mutex<HashMap<String, (String, String)>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let online = Arc::new(AtomicBool::new(true));
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));

        let accept_routes = routes.clone();
        let accept_online = online.clone();
        let accept_hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                if !accept_online.load(Ordering::SeqCst) {
                    drop(socket);
                    continue;
                }
                let routes = accept_routes.clone();
                let hits = accept_hits.clone();
                tokio::spawn(async move {
                    let mut data = Vec::new();
                    let mut buf = [0u8; 4096];
                    loop {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        data.extend_from_slice(&buf[..n]);
                        if data.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    if data.is_empty() {
                        return;
                    }
                    let head = String::from_utf8_lossy(&data);
                    let path = head
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("/")
                        .split('?')
                        .next()
                        .unwrap_or("/")
                        .to_string();
                    *hits.lock().entry(path.clone()).or_insert(0) += 1;

                    let response = match routes.lock().get(&path) {
                        Some((content_type, body)) => format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                            body.len()
                        ),
                        None => {
                            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                                .to_string()
                        }
                    };
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Ok(Self {
            addr,
            routes,
            online,
            hits,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn route(&self, path: &str, content_type: &str, body: &str) {
        self.routes.lock().insert(
            path.to_string(),
            (content_type.to_string(), body.to_string()),
        );
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().get(path).copied().unwrap_or(0)
    }
}

pub fn find_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

pub async fn wait_for_listener(addr: std::net::SocketAddr) -> Result<()> {
    for _ in 0..50 {
        match tokio::time::timeout(Duration::from_millis(50), TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                stream.shutdown().await.ok();
                return Ok(());
            }
            _ => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    Err(anyhow!("listener {addr} did not become ready"))
}

/// Settings for a test worker, pointed at an arbitrary origin.
pub fn test_settings(version: &str, origin: &str) -> Settings {
    Settings {
        listen: "127.0.0.1:0".parse().unwrap(),
        origin: origin.to_string(),
        version: version.to_string(),
        app_prefix: "drinkshell".to_string(),
        precache_manifest: None,
        cache_dir: None,
        offline_url: "/offline.html".to_string(),
        control_path: "/__shellcache/message".to_string(),
        api_prefixes: vec!["/api/".to_string()],
        allowed_origins: Vec::new(),
        log: LogFormat::Text,
        auto_activate: true,
        fetch_timeout: 5,
        api_timeout: 2,
        api_max_age: 300,
        asset_max_age: 604_800,
        runtime_max_entries: 60,
        image_max_entries: 100,
        api_max_entries: 50,
        pages_max_entries: 25,
        max_request_body_size: 4 * 1024 * 1024,
        metrics_listen: None,
    }
}

/// A parsed response from the raw test client.
#[derive(Debug)]
pub struct ClientResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ClientResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Sends one raw HTTP/1.1 request and reads the full close-delimited
/// response.
pub async fn send_request(addr: std::net::SocketAddr, raw: &str) -> Result<ClientResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(raw.as_bytes()).await?;

    let mut data = Vec::new();
    stream.read_to_end(&mut data).await?;

    let separator = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("response missing header separator"))?;
    let head = String::from_utf8_lossy(&data[..separator]).to_string();
    let body = data[separator + 4..].to_vec();

    let mut lines = head.lines();
    let status_line = lines.next().ok_or_else(|| anyhow!("empty response"))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("malformed status line"))?
        .parse()?;
    let headers = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Ok(ClientResponse {
        status,
        headers,
        body,
    })
}

pub async fn get(addr: std::net::SocketAddr, path: &str, extra_headers: &str) -> Result<ClientResponse> {
    let raw = format!("GET {path} HTTP/1.1\r\nHost: gateway\r\n{extra_headers}Connection: close\r\n\r\n");
    send_request(addr, &raw).await
}

pub async fn post_control(
    addr: std::net::SocketAddr,
    control_path: &str,
    payload: &str,
) -> Result<ClientResponse> {
    let raw = format!(
        "POST {control_path} HTTP/1.1\r\nHost: gateway\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len()
    );
    send_request(addr, &raw).await
}
