//! Client configuration.
//!
//! Configuration comes from environment variables (with `.env` loaded by the
//! binary at startup) and an optional YAML file. Priority: YAML > ENV vars >
//! .env values > defaults. The merged result is validated before use.
//!
//! # Example
//! ```rust,no_run
//! use waav_realtime::config::ClientConfig;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::from_env()?;
//! let config = ClientConfig::from_file(Path::new("realtime.yaml"))?;
//! println!("Connecting to {} with {}", config.realtime_url, config.model);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

mod yaml;

pub use yaml::{RealtimeYaml, TokenYaml, ToolsYaml, YamlConfig};

use crate::core::descriptor::MAX_TOOL_TIMEOUT_MS;
use crate::core::realtime::transport::TransportKind;
use crate::core::realtime::{SessionConfig, SessionOptions};
use crate::utils::UrlPolicy;

pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";
pub const DEFAULT_TOOL_PREFIX: &str = "http_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    ParseError(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Client configuration
///
/// Secrets (`token_api_key`, `proxy_token`) are zeroized on drop.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // Realtime session
    pub realtime_url: Url,
    pub model: String,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub transport: TransportKind,
    pub heartbeat_interval: Duration,
    pub volume_interval: Duration,

    // Token issuance
    pub token_endpoint: Option<Url>,
    pub token_api_key: Option<String>,

    // Tools
    pub proxy_url: Option<Url>,
    pub proxy_token: Option<String>,
    pub tenant_id: Option<String>,
    pub tool_prefix: String,
    pub tool_timeout: Option<Duration>,
    /// Permit tool URLs on private networks (local development only)
    pub allow_private_hosts: bool,
    pub descriptors_path: Option<PathBuf>,
}

impl Drop for ClientConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(key) = &mut self.token_api_key {
            key.zeroize();
        }
        if let Some(token) = &mut self.proxy_token {
            token.zeroize();
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_sources(None, |key| std::env::var(key).ok())
    }

    /// Load configuration from a YAML file on top of environment variables.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = YamlConfig::from_file(path)?;
        Self::from_sources(Some(yaml), |key| std::env::var(key).ok())
    }

    /// Merge `yaml` over the values returned by `env`, then validate.
    pub fn from_sources(
        yaml: Option<YamlConfig>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let yaml = yaml.unwrap_or_default();
        let realtime = yaml.realtime.unwrap_or_default();
        let token = yaml.token.unwrap_or_default();
        let tools = yaml.tools.unwrap_or_default();
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let realtime_url = realtime
            .url
            .or_else(|| env("REALTIME_URL"))
            .unwrap_or_else(|| DEFAULT_REALTIME_URL.to_string());
        let realtime_url = parse_url("REALTIME_URL", &realtime_url)?;

        let transport = match realtime.transport.or_else(|| env("REALTIME_TRANSPORT")) {
            Some(raw) => TransportKind::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "REALTIME_TRANSPORT".to_string(),
                message: format!("unknown transport '{}' (expected webrtc or websocket)", raw),
            })?,
            None => TransportKind::default(),
        };

        let heartbeat_secs = match realtime.heartbeat_interval_secs {
            Some(v) => v,
            None => parse_number("HEARTBEAT_INTERVAL_SECS", env("HEARTBEAT_INTERVAL_SECS"))?
                .unwrap_or(30),
        };
        let volume_ms = match realtime.volume_interval_ms {
            Some(v) => v,
            None => {
                parse_number("VOLUME_INTERVAL_MS", env("VOLUME_INTERVAL_MS"))?.unwrap_or(100)
            }
        };

        let token_endpoint = token
            .endpoint
            .or_else(|| env("TOKEN_ENDPOINT"))
            .map(|raw| parse_url("TOKEN_ENDPOINT", &raw))
            .transpose()?;
        let proxy_url = tools
            .proxy_url
            .or_else(|| env("TOOL_PROXY_URL"))
            .map(|raw| parse_url("TOOL_PROXY_URL", &raw))
            .transpose()?;

        let tool_timeout_ms = match tools.timeout_ms {
            Some(v) => Some(v),
            None => parse_number("TOOL_TIMEOUT_MS", env("TOOL_TIMEOUT_MS"))?,
        };
        let allow_private_hosts = match tools.allow_private_hosts {
            Some(v) => v,
            None => parse_bool("ALLOW_PRIVATE_HOSTS", env("ALLOW_PRIVATE_HOSTS"))?,
        };

        let config = Self {
            realtime_url,
            model: realtime
                .model
                .or_else(|| env("REALTIME_MODEL"))
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice: realtime.voice.or_else(|| env("REALTIME_VOICE")),
            instructions: realtime
                .instructions
                .or_else(|| env("REALTIME_INSTRUCTIONS")),
            transport,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            volume_interval: Duration::from_millis(volume_ms),
            token_endpoint,
            token_api_key: token.api_key.or_else(|| env("TOKEN_API_KEY")),
            proxy_url,
            proxy_token: tools.proxy_token.or_else(|| env("TOOL_PROXY_TOKEN")),
            tenant_id: tools.tenant_id.or_else(|| env("TENANT_ID")),
            tool_prefix: tools
                .prefix
                .or_else(|| env("TOOL_PREFIX"))
                .unwrap_or_else(|| DEFAULT_TOOL_PREFIX.to_string()),
            tool_timeout: tool_timeout_ms.map(Duration::from_millis),
            allow_private_hosts,
            descriptors_path: tools
                .descriptors
                .or_else(|| env("TOOLS_FILE").map(PathBuf::from)),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let scheme = self.realtime_url.scheme();
        let scheme_ok = match self.transport {
            TransportKind::WebSocket => matches!(scheme, "ws" | "wss"),
            TransportKind::WebRtc => matches!(scheme, "http" | "https"),
        };
        if !scheme_ok {
            return Err(ConfigError::Validation(format!(
                "realtime URL scheme '{}' does not match the {} transport",
                scheme, self.transport
            )));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Validation("model must not be empty".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Validation(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.volume_interval < Duration::from_millis(10) {
            return Err(ConfigError::Validation(
                "volume interval must be at least 10ms".to_string(),
            ));
        }
        if let Some(timeout) = self.tool_timeout
            && (timeout.is_zero() || timeout > Duration::from_millis(MAX_TOOL_TIMEOUT_MS))
        {
            return Err(ConfigError::Validation(format!(
                "tool timeout must be between 1 and {} ms",
                MAX_TOOL_TIMEOUT_MS
            )));
        }
        if self.tool_prefix.is_empty()
            || !self
                .tool_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(ConfigError::Validation(format!(
                "tool prefix '{}' must be non-empty and use [A-Za-z0-9._-]",
                self.tool_prefix
            )));
        }
        for (key, url) in [
            ("token endpoint", &self.token_endpoint),
            ("tool proxy URL", &self.proxy_url),
        ] {
            if let Some(url) = url
                && !matches!(url.scheme(), "http" | "https")
            {
                return Err(ConfigError::Validation(format!(
                    "{} must use http or https",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Agent snapshot seeded from the configured voice and instructions
    pub fn agent(&self) -> SessionConfig {
        SessionConfig {
            voice: self.voice.clone(),
            instructions: self.instructions.clone(),
            ..Default::default()
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        let mut options = SessionOptions::new(self.realtime_url.clone(), self.model.clone());
        options.agent = self.agent();
        options.heartbeat_interval = self.heartbeat_interval;
        options.volume_interval = self.volume_interval;
        options
    }

    pub fn url_policy(&self) -> UrlPolicy {
        UrlPolicy {
            allow_private: self.allow_private_hosts,
            ..Default::default()
        }
    }
}

fn parse_url(key: &str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_number(key: &str, raw: Option<String>) -> Result<Option<u64>, ConfigError> {
    raw.map(|v| {
        v.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{}': {}", v, e),
        })
    })
    .transpose()
}

fn parse_bool(key: &str, raw: Option<String>) -> Result<bool, ConfigError> {
    match raw.as_deref().map(|v| v.trim().to_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{}' is not a boolean", v),
            }),
        },
    }
}
