//! Client configuration types.
//!
//! `ClientConfig` is built either in code through the builder methods or
//! loaded from a TOML file with [`ClientConfig::load`]:
//!
//! ```toml
//! address = "broker.example.com:8883"
//! client_id = "sensor-${HOSTNAME:-local}"
//! keep_alive = 30
//! session_expiry_interval = 3600
//! auto_reconnect = true
//!
//! [reconnect_backoff]
//! initial_delay = 0.5
//! max_delay = 30
//!
//! [tls]
//! enabled = true
//! ca_cert = "/etc/mqfive/ca.pem"
//!
//! [websocket]
//! enabled = true
//! path = "/mqtt"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::error::{ClientError, Result};
use crate::will::Will;

pub const DEFAULT_ADDRESS: &str = "localhost:1883";
pub const DEFAULT_KEEP_ALIVE: u16 = 60;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WS_PATH: &str = "/mqtt";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ClientError::Config(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Durations are written as (fractional) seconds.
fn deserialize_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

/// TLS settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// PEM file with the CA certificates to trust. Without it the bundled
    /// web PKI roots are used.
    pub ca_cert: Option<PathBuf>,
    /// PEM certificate chain for client authentication.
    pub client_cert: Option<PathBuf>,
    /// PEM private key for client authentication.
    pub client_key: Option<PathBuf>,
    /// Skip server certificate verification. Testing only.
    pub accept_invalid_certs: bool,
    /// SNI name; defaults to the host part of `address`.
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.client_cert.is_some() != self.client_key.is_some() {
            return Err("tls.client_cert and tls.client_key must be set together".into());
        }
        Ok(())
    }
}

/// MQTT over WebSocket. With `tls.enabled` the upgrade runs over TLS (wss).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub enabled: bool,
    /// Request path of the upgrade (default: /mqtt).
    pub path: String,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: DEFAULT_WS_PATH.to_string(),
        }
    }
}

/// Exponential backoff between reconnection attempts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectBackoff {
    #[serde(deserialize_with = "deserialize_secs")]
    pub initial_delay: Duration,
    #[serde(deserialize_with = "deserialize_secs")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl ReconnectBackoff {
    /// Delay before the given attempt (1-based): `initial * multiplier^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Remote broker address (host:port).
    pub address: String,
    /// Client identifier. Empty asks the server to assign one.
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    pub clean_start: bool,
    /// Seconds the server keeps the session after the connection closes.
    /// `u32::MAX` means the session never expires.
    pub session_expiry_interval: u32,
    /// How many QoS 1/2 PUBLISH packets we accept concurrently.
    pub receive_maximum: u16,
    /// Largest packet we accept, in bytes (0 = no limit).
    pub maximum_packet_size: u32,
    /// Topic aliases the server may use towards us (0 = none).
    pub topic_alias_maximum: u16,
    /// Use topic aliases for our own PUBLISH packets when the server allows it.
    pub outbound_topic_aliases: bool,
    pub request_response_information: bool,
    pub request_problem_information: bool,
    /// User properties sent in CONNECT.
    pub user_properties: Vec<(String, String)>,
    /// Enhanced authentication method sent in CONNECT.
    pub authentication_method: Option<String>,
    #[serde(skip)]
    pub authentication_data: Option<Bytes>,
    #[serde(skip)]
    pub will: Option<Will>,
    #[serde(deserialize_with = "deserialize_secs")]
    pub connect_timeout: Duration,
    /// Reconnect with backoff after the connection is lost.
    pub auto_reconnect: bool,
    pub reconnect_backoff: ReconnectBackoff,
    pub tls: TlsConfig,
    pub websocket: WebSocketConfig,
    pub log: LogConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_start: true,
            session_expiry_interval: 0,
            receive_maximum: u16::MAX,
            maximum_packet_size: 0,
            topic_alias_maximum: 0,
            outbound_topic_aliases: false,
            request_response_information: false,
            request_problem_information: true,
            user_properties: Vec::new(),
            authentication_method: None,
            authentication_data: None,
            will: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            auto_reconnect: false,
            reconnect_backoff: ReconnectBackoff::default(),
            tls: TlsConfig::default(),
            websocket: WebSocketConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new config with the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQFIVE__` prefix with double underscores for nesting:
    ///    - `MQFIVE__ADDRESS=broker:1883`
    ///    - `MQFIVE__TLS__ENABLED=true`
    ///
    /// A missing file is not an error; defaults and the environment still apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        if path.is_file() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content)?;
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MQFIVE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ClientConfig = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides.
    pub fn parse(content: &str) -> Result<Self> {
        let substituted = substitute_env_vars(content)?;
        let config: ClientConfig = config::Config::builder()
            .add_source(File::from_str(&substituted, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(ClientError::Config("address must not be empty".into()));
        }
        if self.receive_maximum == 0 {
            return Err(ClientError::Config("receive_maximum must be at least 1".into()));
        }
        if self.reconnect_backoff.multiplier < 1.0 {
            return Err(ClientError::Config(
                "reconnect_backoff.multiplier must be at least 1.0".into(),
            ));
        }
        if self.authentication_data.is_some() && self.authentication_method.is_none() {
            return Err(ClientError::Config(
                "authentication data requires an authentication method".into(),
            ));
        }
        if self.websocket.enabled && !self.websocket.path.starts_with('/') {
            return Err(ClientError::Config("websocket.path must start with '/'".into()));
        }
        self.tls.validate().map_err(ClientError::Config)
    }

    /// URL of the WebSocket upgrade request.
    pub fn websocket_url(&self) -> String {
        let scheme = if self.tls.enabled { "wss" } else { "ws" };
        format!("{}://{}{}", scheme, self.address, self.websocket.path)
    }

    /// Host part of `address`, used for TLS SNI.
    pub fn host(&self) -> &str {
        match self.address.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
            None => &self.address,
        }
    }

    /// Set the client ID.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set username and password.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set the Clean Start flag.
    pub fn clean_start(mut self, clean: bool) -> Self {
        self.clean_start = clean;
        self
    }

    /// Set the Session Expiry Interval in seconds.
    pub fn session_expiry_interval(mut self, seconds: u32) -> Self {
        self.session_expiry_interval = seconds;
        self
    }

    pub fn receive_maximum(mut self, max: u16) -> Self {
        self.receive_maximum = max;
        self
    }

    pub fn maximum_packet_size(mut self, bytes: u32) -> Self {
        self.maximum_packet_size = bytes;
        self
    }

    pub fn topic_alias_maximum(mut self, max: u16) -> Self {
        self.topic_alias_maximum = max;
        self
    }

    pub fn outbound_topic_aliases(mut self, enabled: bool) -> Self {
        self.outbound_topic_aliases = enabled;
        self
    }

    pub fn user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    /// Enable enhanced authentication.
    pub fn authentication(mut self, method: impl Into<String>, data: Option<Bytes>) -> Self {
        self.authentication_method = Some(method.into());
        self.authentication_data = data;
        self
    }

    /// Set the will message.
    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Set connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable automatic reconnection.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Connect through a WebSocket upgrade on `path`.
    pub fn websocket(mut self, path: impl Into<String>) -> Self {
        self.websocket = WebSocketConfig {
            enabled: true,
            path: path.into(),
        };
        self
    }
}
