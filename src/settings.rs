use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_app_prefix() -> String {
    "shellcache".to_string()
}

fn default_offline_url() -> String {
    "/offline.html".to_string()
}

fn default_control_path() -> String {
    "/__shellcache/message".to_string()
}

fn default_api_prefixes() -> Vec<String> {
    vec!["/api/".to_string()]
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_api_timeout() -> u64 {
    10
}

fn default_api_max_age() -> u64 {
    300
}

fn default_asset_max_age() -> u64 {
    7 * 24 * 60 * 60
}

fn default_runtime_max_entries() -> usize {
    60
}

fn default_image_max_entries() -> usize {
    100
}

fn default_api_max_entries() -> usize {
    50
}

fn default_pages_max_entries() -> usize {
    25
}

fn default_auto_activate() -> bool {
    true
}

fn default_max_request_body_size() -> usize {
    4 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    /// Base URL of the origin server fetched on cache misses, e.g. "http://127.0.0.1:3000".
    pub origin: String,
    /// Version tag embedded in every cache namespace name.
    pub version: String,
    #[serde(default = "default_app_prefix")]
    pub app_prefix: String,
    #[serde(default)]
    pub precache_manifest: Option<PathBuf>,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_offline_url")]
    pub offline_url: String,
    #[serde(default = "default_control_path")]
    pub control_path: String,
    #[serde(default = "default_api_prefixes")]
    pub api_prefixes: Vec<String>,
    /// Cross-origin hosts the worker is allowed to intercept; all others pass through.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_auto_activate")]
    pub auto_activate: bool,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
    #[serde(default = "default_api_timeout")]
    pub api_timeout: u64,
    #[serde(default = "default_api_max_age")]
    pub api_max_age: u64,
    #[serde(default = "default_asset_max_age")]
    pub asset_max_age: u64,
    #[serde(default = "default_runtime_max_entries")]
    pub runtime_max_entries: usize,
    #[serde(default = "default_image_max_entries")]
    pub image_max_entries: usize,
    #[serde(default = "default_api_max_entries")]
    pub api_max_entries: usize,
    #[serde(default = "default_pages_max_entries")]
    pub pages_max_entries: usize,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));

        builder = builder.add_source(
            Environment::with_prefix("SHELLCACHE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout)
    }

    pub fn api_max_age(&self) -> Duration {
        Duration::from_secs(self.api_max_age)
    }

    pub fn asset_max_age(&self) -> Duration {
        Duration::from_secs(self.asset_max_age)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        if let Some(manifest) = self.precache_manifest.clone() {
            self.precache_manifest = Some(absolutize(&manifest, base_dir));
        }
        if let Some(cache_dir) = self.cache_dir.clone() {
            self.cache_dir = Some(absolutize(&cache_dir, base_dir));
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.version.is_empty(), "version must not be empty");
        ensure!(
            namespace_token_is_valid(&self.version),
            "version must contain only alphanumerics, dots, and underscores (got '{}')",
            self.version
        );
        ensure!(!self.app_prefix.is_empty(), "app_prefix must not be empty");
        ensure!(
            namespace_token_is_valid(&self.app_prefix),
            "app_prefix must contain only alphanumerics, dots, and underscores (got '{}')",
            self.app_prefix
        );
        ensure!(
            self.origin.starts_with("http://") || self.origin.starts_with("https://"),
            "origin must be an http(s) base URL (got '{}')",
            self.origin
        );
        ensure!(
            self.offline_url.starts_with('/'),
            "offline_url must be an absolute path (got '{}')",
            self.offline_url
        );
        ensure!(
            self.control_path.starts_with('/'),
            "control_path must be an absolute path (got '{}')",
            self.control_path
        );
        for prefix in &self.api_prefixes {
            ensure!(
                prefix.starts_with('/'),
                "api prefix must be an absolute path (got '{prefix}')"
            );
        }
        ensure!(
            self.fetch_timeout > 0,
            "fetch_timeout must be greater than 0 seconds (got {})",
            self.fetch_timeout
        );
        ensure!(
            self.api_timeout > 0,
            "api_timeout must be greater than 0 seconds (got {})",
            self.api_timeout
        );
        ensure!(
            self.runtime_max_entries > 0,
            "runtime_max_entries must be greater than 0 (got {})",
            self.runtime_max_entries
        );
        ensure!(
            self.image_max_entries > 0,
            "image_max_entries must be greater than 0 (got {})",
            self.image_max_entries
        );
        ensure!(
            self.api_max_entries > 0,
            "api_max_entries must be greater than 0 (got {})",
            self.api_max_entries
        );
        ensure!(
            self.pages_max_entries > 0,
            "pages_max_entries must be greater than 0 (got {})",
            self.pages_max_entries
        );
        ensure!(
            self.max_request_body_size > 0,
            "max_request_body_size must be greater than 0 (got {})",
            self.max_request_body_size
        );
        Ok(())
    }
}

/// Namespace names must survive both cache keys and on-disk directory names,
/// so the tokens composing them are restricted to a conservative character set.
fn namespace_token_is_valid(token: &str) -> bool {
    token
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_')
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config.as_deref() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/shellcache/shellcache.toml"),
        PathBuf::from("shellcache.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
