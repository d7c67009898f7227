use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// One line per intercepted request, mirroring what the worker decided for it.
#[derive(Debug, Clone)]
pub struct FetchLogEvent {
    pub method: String,
    pub path: String,
    pub route: String,
    pub strategy: Option<String>,
    pub cache: Option<String>,
    pub status: u16,
    pub bytes_out: u64,
    pub elapsed_ms: u128,
    pub error_reason: Option<String>,
}

#[derive(Debug)]
pub struct FetchLogBuilder {
    event: FetchLogEvent,
}

impl FetchLogBuilder {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            event: FetchLogEvent {
                method: method.into(),
                path: path.into(),
                route: String::from("unrouted"),
                strategy: None,
                cache: None,
                status: 0,
                bytes_out: 0,
                elapsed_ms: 0,
                error_reason: None,
            },
        }
    }

    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.event.route = route.into();
        self
    }

    pub fn strategy(mut self, strategy: impl Into<String>) -> Self {
        self.event.strategy = Some(strategy.into());
        self
    }

    pub fn cache(mut self, outcome: impl Into<String>) -> Self {
        self.event.cache = Some(outcome.into());
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn bytes_out(mut self, bytes: u64) -> Self {
        self.event.bytes_out = bytes;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn error_reason(mut self, reason: impl Into<String>) -> Self {
        self.event.error_reason = Some(reason.into());
        self
    }

    pub fn build(self) -> FetchLogEvent {
        self.event
    }

    pub fn log(self) {
        log_fetch(self.build());
    }
}

pub fn log_fetch(event: FetchLogEvent) {
    let FetchLogEvent {
        method,
        path,
        route,
        strategy,
        cache,
        status,
        bytes_out,
        elapsed_ms,
        error_reason,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    let strategy_field = strategy.as_deref();
    let cache_field = cache.as_deref();
    let error_reason_field = error_reason.as_deref();

    tracing::info!(
        target = "fetch_log",
        ts,
        method,
        path,
        route,
        strategy = strategy_field,
        cache = cache_field,
        status,
        bytes_out,
        elapsed_ms,
        error_reason = error_reason_field
    );
}
