use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::stream::RetryPolicy;

const DEFAULT_SERVER: &str = "127.0.0.1:8080";
const DEFAULT_PROFILE: &str = "default";

/// Engine configuration for one server profile.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL for request/response endpoints.
    pub server: Url,
    /// Credential sent as bearer token and as the first stream frame.
    pub token: Option<String>,
    /// Profile name; keys the persisted command queue.
    pub profile: String,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub request_connect_timeout: Duration,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub tail_lines: usize,
    pub ping_interval: Duration,
    pub queue_limit: usize,
    pub history_limit: usize,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("server address cannot be empty")]
    EmptyServer,
    #[error("invalid server url: {0}")]
    InvalidServer(#[from] url::ParseError),
    #[error("unsupported url scheme '{0}'")]
    UnsupportedScheme(String),
}

impl SyncConfig {
    pub fn new(server: impl AsRef<str>) -> Result<Self, ConfigError> {
        Ok(Self {
            server: parse_server(server.as_ref())?,
            token: None,
            profile: DEFAULT_PROFILE.to_string(),
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            request_connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(8),
            poll_interval: Duration::from_secs(2),
            tail_lines: 200,
            ping_interval: Duration::from_secs(15),
            queue_limit: 50,
            history_limit: 100,
        })
    }

    /// Load configuration from `BEACH_TIDE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let server = env::var("BEACH_TIDE_SERVER").unwrap_or_else(|_| DEFAULT_SERVER.into());
        let mut config = Self::new(server)?;
        config.token = env::var("BEACH_TIDE_TOKEN")
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        if let Ok(profile) = env::var("BEACH_TIDE_PROFILE") {
            let profile = profile.trim();
            if !profile.is_empty() {
                config.profile = profile.to_string();
            }
        }
        if let Some(ms) = env_number("BEACH_TIDE_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(lines) = env_number("BEACH_TIDE_TAIL_LINES") {
            config.tail_lines = lines as usize;
        }
        if let Some(ms) = env_number("BEACH_TIDE_RETRY_BASE_MS") {
            config.retry.base = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("BEACH_TIDE_RETRY_MAX_MS") {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(limit) = env_number("BEACH_TIDE_QUEUE_LIMIT") {
            config.queue_limit = (limit as usize).max(1);
        }
        Ok(config)
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    /// Base URL for duplex streams: same host, `ws`/`wss` scheme.
    pub fn stream_base_url(&self) -> Result<Url, ConfigError> {
        let scheme = match self.server.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        let mut url = self.server.clone();
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::UnsupportedScheme(scheme.to_string()))?;
        Ok(url)
    }
}

fn env_number(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn parse_server(raw: &str) -> Result<Url, ConfigError> {
    let mut base = raw.trim().to_string();
    if base.is_empty() {
        return Err(ConfigError::EmptyServer);
    }
    if !base.contains("://") {
        base = format!("{}{base}", infer_scheme(&base));
    }
    // Url::join drops the last path segment unless the base ends with '/'.
    if !base.ends_with('/') {
        base.push('/');
    }
    Ok(Url::parse(&base)?)
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host = host_part.to_ascii_lowercase();
    let private_172 = host
        .strip_prefix("172.")
        .and_then(|rest| rest.split('.').next())
        .and_then(|octet| octet.parse::<u8>().ok())
        .map(|octet| (16..32).contains(&octet))
        .unwrap_or(false);
    if host.starts_with("localhost")
        || host.starts_with("127.")
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || host == "0.0.0.0"
        || host == "::1"
        || private_172
    {
        "http://"
    } else {
        "https://"
    }
}
