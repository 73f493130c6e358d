use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::ConfigError;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present
/// here override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// realtime:
///   url: "https://api.openai.com/v1/realtime"
///   model: "gpt-4o-realtime-preview"
///   voice: "alloy"
///   instructions: "You are a helpful assistant."
///   transport: "websocket"
///   heartbeat_interval_secs: 30
///   volume_interval_ms: 100
///
/// token:
///   endpoint: "https://auth.example.com/realtime/token"
///   api_key: "issuer-key"
///
/// tools:
///   proxy_url: "https://tools.example.com/execute"
///   proxy_token: "proxy-secret"
///   tenant_id: "acme"
///   prefix: "http_"
///   timeout_ms: 15000
///   allow_private_hosts: false
///   descriptors: "tools.yaml"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub realtime: Option<RealtimeYaml>,
    pub token: Option<TokenYaml>,
    pub tools: Option<ToolsYaml>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeYaml {
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub transport: Option<String>,
    pub heartbeat_interval_secs: Option<u64>,
    pub volume_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TokenYaml {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsYaml {
    pub proxy_url: Option<String>,
    pub proxy_token: Option<String>,
    pub tenant_id: Option<String>,
    pub prefix: Option<String>,
    pub timeout_ms: Option<u64>,
    /// Development only
    pub allow_private_hosts: Option<bool>,
    pub descriptors: Option<PathBuf>,
}

impl YamlConfig {
    /// Load YAML configuration from a file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_str(&contents)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse YAML config: {e}")))
    }
}
