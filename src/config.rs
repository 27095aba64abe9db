use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Milter listen address: `inet:host:port` or `unix:/path/to/socket`
    pub socket: String,
    /// Scan backend upload URL
    pub scan_endpoint: String,
    /// Messages whose body grows beyond this many bytes pass unscanned
    pub max_message_size: usize,
    /// Apply quarantine decisions instead of only logging them
    pub active_mode: bool,
    /// Boolean expression evaluated once per finding
    pub quarantine_expression: String,
    /// Remaining-attempts budget handed to the scan client for every unit
    pub scan_retries: u32,
    /// Wait used when the backend sends no usable Retry-After header
    pub retry_wait_seconds: u64,
    /// Overall timeout for a single upload attempt
    pub scan_timeout_seconds: u64,
    pub max_nesting_depth: usize,
    pub max_parts: usize,
    pub quarantine_reason: String,
    pub log_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Inet(String),
    Unix(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket: "inet:127.0.0.1:7777".to_string(),
            scan_endpoint: "http://127.0.0.1:8080/api/check".to_string(),
            max_message_size: 10 * 1024 * 1024,
            active_mode: false,
            quarantine_expression: "fullMatch.score >= 70".to_string(),
            scan_retries: 1,
            retry_wait_seconds: 10,
            scan_timeout_seconds: 60,
            max_nesting_depth: 32,
            max_parts: 1000,
            quarantine_reason: "Quarantined by scan-milter".to_string(),
            log_file: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let endpoint = Url::parse(&self.scan_endpoint)
            .with_context(|| format!("invalid scan_endpoint '{}'", self.scan_endpoint))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            bail!("scan_endpoint must be an http(s) URL, got '{}'", endpoint);
        }
        if self.max_message_size == 0 {
            bail!("max_message_size must be greater than zero");
        }
        if self.max_nesting_depth == 0 || self.max_parts == 0 {
            bail!("max_nesting_depth and max_parts must be greater than zero");
        }
        if self.quarantine_expression.trim().is_empty() {
            bail!("quarantine_expression must not be empty");
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<ListenAddr> {
        if let Some(addr) = self.socket.strip_prefix("inet:") {
            if addr.rsplit_once(':').is_none() {
                bail!("inet socket '{}' is missing a port", self.socket);
            }
            Ok(ListenAddr::Inet(addr.to_string()))
        } else if let Some(path) = self.socket.strip_prefix("unix:") {
            Ok(ListenAddr::Unix(path.to_string()))
        } else if self.socket.starts_with('/') {
            Ok(ListenAddr::Unix(self.socket.clone()))
        } else {
            bail!(
                "socket '{}' must look like inet:host:port or unix:/path",
                self.socket
            )
        }
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(self.retry_wait_seconds)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_seconds)
    }
}
