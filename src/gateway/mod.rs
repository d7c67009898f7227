pub mod codec;
mod listener;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use http::{HeaderMap, Method, StatusCode, Uri};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;

use crate::logging::FetchLogBuilder;
use crate::settings::Settings;
use crate::worker::fetcher::{FetchError, Fetcher};
use crate::worker::message::{ControlMessage, WireCommand, parse_wire};
use crate::worker::request::WorkerRequest;
use crate::worker::{FetchEvent, FetchOutcome, ServiceWorker};

use self::codec::{
    RequestHead, read_body, read_request_head, write_cached_response, write_error, write_response,
};

const CONTROL_BODY_LIMIT: usize = 64 * 1024;
const VERSION_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything one connection handler needs.
#[derive(Clone)]
pub struct GatewayContext {
    pub settings: Arc<Settings>,
    pub worker: Arc<ServiceWorker>,
    pub fetcher: Arc<dyn Fetcher>,
    origin: Uri,
}

impl GatewayContext {
    pub fn new(
        settings: Arc<Settings>,
        worker: Arc<ServiceWorker>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        let origin: Uri = settings
            .origin
            .parse()
            .with_context(|| format!("invalid origin base URL '{}'", settings.origin))?;
        Ok(Self {
            settings,
            worker,
            fetcher,
            origin,
        })
    }
}

pub async fn run(ctx: GatewayContext) -> Result<()> {
    listener::start_listener(ctx).await
}

async fn handle_connection(stream: TcpStream, ctx: GatewayContext) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let head = match read_request_head(&mut reader).await? {
        Some(head) => head,
        None => return Ok(()),
    };
    let body = read_body(&mut reader, &head.headers, ctx.settings.max_request_body_size).await?;
    let mut stream = reader.into_inner();

    if head.method == Method::POST && head.target == ctx.settings.control_path {
        return handle_control(&mut stream, &ctx, &body).await;
    }

    let request = match build_worker_request(&ctx, &head) {
        Ok(request) => request,
        Err(err) => {
            debug!(error = %err, target = head.target, "rejecting unparseable request");
            return write_error(&mut stream, StatusCode::BAD_REQUEST, "bad request").await;
        }
    };

    let started = Instant::now();
    let log = FetchLogBuilder::new(request.method.as_str(), request.identity());
    match ctx.worker.handle_fetch(FetchEvent::new(request.clone())).await {
        FetchOutcome::Respond {
            class,
            strategy,
            response,
        } => {
            log.route(class.as_str())
                .strategy(strategy)
                .status(response.status)
                .bytes_out(response.body.len() as u64)
                .elapsed(started.elapsed())
                .log();
            write_cached_response(&mut stream, &response).await
        }
        FetchOutcome::Failed {
            class,
            strategy,
            error,
        } => {
            let status = match &error {
                FetchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                FetchError::Network(_) => StatusCode::BAD_GATEWAY,
            };
            log.route(class.as_str())
                .strategy(strategy)
                .status(status)
                .elapsed(started.elapsed())
                .error_reason(error.kind())
                .log();
            write_error(&mut stream, status, &error.to_string()).await
        }
        FetchOutcome::Bypass => {
            let result = ctx
                .fetcher
                .forward(&request.method, &request.identity(), &request.headers, body)
                .await;
            match result {
                Ok(response) => {
                    log.route("bypass")
                        .status(response.status)
                        .bytes_out(response.body.len() as u64)
                        .elapsed(started.elapsed())
                        .log();
                    write_cached_response(&mut stream, &response).await
                }
                Err(error) => {
                    let status = match &error {
                        FetchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                        FetchError::Network(_) => StatusCode::BAD_GATEWAY,
                    };
                    log.route("bypass")
                        .status(status)
                        .elapsed(started.elapsed())
                        .error_reason(error.kind())
                        .log();
                    write_error(&mut stream, status, &error.to_string()).await
                }
            }
        }
    }
}

/// The page -> worker control channel, carried over a POST endpoint. The
/// reply channel of GET_VERSION becomes the HTTP response body.
async fn handle_control(stream: &mut TcpStream, ctx: &GatewayContext, body: &[u8]) -> Result<()> {
    if body.len() > CONTROL_BODY_LIMIT {
        return write_error(stream, StatusCode::PAYLOAD_TOO_LARGE, "message too large").await;
    }
    let command = match parse_wire(body) {
        Some(command) => command,
        None => {
            // Unknown shapes are ignored silently; protocol skew between
            // page and worker versions must not surface as an error.
            debug!("ignoring unrecognized control message");
            return write_response(stream, StatusCode::NO_CONTENT, &HeaderMap::new(), b"").await;
        }
    };

    match command {
        WireCommand::SkipWaiting => {
            ctx.worker.handle_message(ControlMessage::SkipWaiting).await?;
            write_response(stream, StatusCode::NO_CONTENT, &HeaderMap::new(), b"").await
        }
        WireCommand::ClearCache => {
            ctx.worker.handle_message(ControlMessage::ClearCache).await?;
            write_response(stream, StatusCode::NO_CONTENT, &HeaderMap::new(), b"").await
        }
        WireCommand::GetVersion => {
            let (tx, rx) = oneshot::channel();
            ctx.worker
                .handle_message(ControlMessage::GetVersion { reply: tx })
                .await?;
            let reply = tokio::time::timeout(VERSION_REPLY_TIMEOUT, rx)
                .await
                .map_err(|_| anyhow!("version reply timed out"))?
                .map_err(|_| anyhow!("version reply channel closed"))?;
            let payload = serde_json::to_vec(&reply)?;
            let mut headers = HeaderMap::new();
            headers.insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            );
            write_response(stream, StatusCode::OK, &headers, &payload).await
        }
    }
}

/// Maps a raw request head onto the worker's request model. Absolute-form
/// targets that match the configured origin collapse to origin-form;
/// anything else is flagged cross-origin.
fn build_worker_request(ctx: &GatewayContext, head: &RequestHead) -> Result<WorkerRequest> {
    let uri: Uri = head
        .target
        .parse()
        .map_err(|_| anyhow!("invalid request target"))?;

    let (uri, cross_origin) = if uri.scheme().is_some() {
        if same_origin(&ctx.origin, &uri) {
            let origin_form: Uri = uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
                .parse()
                .map_err(|_| anyhow!("invalid request path"))?;
            (origin_form, false)
        } else {
            (uri, true)
        }
    } else {
        (uri, false)
    };

    Ok(WorkerRequest {
        method: head.method.clone(),
        uri,
        headers: head.headers.clone(),
        cross_origin,
    })
}

fn same_origin(origin: &Uri, uri: &Uri) -> bool {
    origin.scheme_str() == uri.scheme_str()
        && origin.host().map(|h| h.to_ascii_lowercase())
            == uri.host().map(|h| h.to_ascii_lowercase())
        && effective_port(origin) == effective_port(uri)
}

fn effective_port(uri: &Uri) -> Option<u16> {
    uri.port_u16().or(match uri.scheme_str() {
        Some("http") => Some(80),
        Some("https") => Some(443),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_origin_normalizes_default_ports() {
        let origin: Uri = "http://localhost:80".parse().unwrap();
        let uri: Uri = "http://LOCALHOST/app.js".parse().unwrap();
        assert!(same_origin(&origin, &uri));

        let other: Uri = "https://localhost/app.js".parse().unwrap();
        assert!(!same_origin(&origin, &other));
    }
}
