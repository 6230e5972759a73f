use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use utoipa::ToSchema;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_CONFIG_PATH: &str = "config/orrery.toml";
pub const CONFIG_PATH: &str = DEFAULT_CONFIG_PATH;

pub const DEFAULT_MAX_STEPS: usize = 5;
pub const DEFAULT_BUDGET_SECS: u64 = 60;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Which credential an endpoint needs from the request's bundle before a
/// connection may be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialKind {
    SessionCookie,
    BearerHeader,
}

/// Transport used to reach a tool endpoint: a persistent HTTP event stream
/// or a spawned child process speaking line-delimited JSON-RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum TransportConfig {
    #[serde(rename_all = "kebab-case")]
    StreamOverHttp {
        url: String,
        /// Header carrying the credential; defaults to a bearer
        /// `Authorization` header when unset.
        auth_header: Option<String>,
    },
    #[serde(rename_all = "kebab-case")]
    ProcessPipe {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        workdir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    pub credential: CredentialKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Falls back to the ORRERY_API_KEY environment variable when unset.
    pub api_key: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
        }
    }
}

impl ProviderConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("ORRERY_API_KEY").ok())
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_steps: usize,
    pub budget_secs: u64,
    pub handshake_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub provider: ProviderConfig,
    /// Optional service that exchanges a session for a tool API key.
    pub key_service_url: Option<String>,
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    model: Option<String>,
    system_prompt: Option<String>,
    max_steps: Option<usize>,
    budget_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    call_timeout_secs: Option<u64>,
    #[serde(default)]
    provider: Option<ProviderConfig>,
    key_service_url: Option<String>,
    #[serde(default)]
    endpoints: Vec<EndpointConfig>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file not found; using defaults");
                Ok(Self::default())
            }
            Err(other) => Err(other),
        }
    }

    pub fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
            max_steps: DEFAULT_MAX_STEPS,
            budget_secs: DEFAULT_BUDGET_SECS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            provider: ProviderConfig::default(),
            key_service_url: None,
            endpoints: Vec::new(),
        }
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(AppConfig {
        model: parsed.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        system_prompt: parsed.system_prompt,
        max_steps: parsed.max_steps.unwrap_or(DEFAULT_MAX_STEPS),
        budget_secs: parsed.budget_secs.unwrap_or(DEFAULT_BUDGET_SECS),
        handshake_timeout_secs: parsed
            .handshake_timeout_secs
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
        call_timeout_secs: parsed.call_timeout_secs.unwrap_or(DEFAULT_CALL_TIMEOUT_SECS),
        provider: parsed.provider.unwrap_or_default(),
        key_service_url: parsed.key_service_url,
        endpoints: parsed.endpoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_defaults_for_empty_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("orrery.toml");
        fs::write(&path, "").expect("write");

        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_steps, DEFAULT_MAX_STEPS);
        assert_eq!(config.budget_secs, DEFAULT_BUDGET_SECS);
        assert_eq!(config.call_timeout_secs, DEFAULT_CALL_TIMEOUT_SECS);
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn reads_endpoints_of_both_transports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("orrery.toml");
        fs::write(
            &path,
            r#"
model = "gpt-4o"
max_steps = 7

[provider]
base_url = "https://llm.internal/v1"
api_key = "sk-test"

[[endpoints]]
id = "meetings"
transport = "stream-over-http"
url = "https://tools.example.com/sse"
credential = "bearer-header"

[[endpoints]]
id = "local"
transport = "process-pipe"
command = "node"
args = ["server.js"]
credential = "session-cookie"

[endpoints.env]
LOG_LEVEL = "error"
"#,
        )
        .expect("write");

        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.max_steps, 7);
        assert_eq!(config.provider.base_url, "https://llm.internal/v1");
        assert_eq!(config.endpoints.len(), 2);

        match &config.endpoints[0].transport {
            TransportConfig::StreamOverHttp { url, .. } => {
                assert_eq!(url, "https://tools.example.com/sse");
            }
            other => panic!("expected http transport, got {other:?}"),
        }
        assert_eq!(config.endpoints[0].credential, CredentialKind::BearerHeader);

        match &config.endpoints[1].transport {
            TransportConfig::ProcessPipe { command, args, env, .. } => {
                assert_eq!(command, "node");
                assert_eq!(args, &vec!["server.js".to_string()]);
                assert_eq!(env.get("LOG_LEVEL").map(String::as_str), Some("error"));
            }
            other => panic!("expected process transport, got {other:?}"),
        }
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let missing = Path::new("/definitely/not/here/orrery.toml");
        let result = AppConfig::load(Some(missing));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
