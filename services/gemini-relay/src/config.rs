//! Configuration types and loading
//!
//! Settings come from one TOML file, falling back to built-in defaults. The
//! file path is `--config`, then CONFIG_PATH, then the default location.
//! Secrets never live in the TOML. The bearer token comes from CUSTOM_TOKEN or
//! `auth_token_file`; upstream keys from GEMINI_API_KEYS, GEMINI_API_KEY or
//! `keys_file`.

use common::Secret;
use key_pool::QuotaPolicy;
use provider::CredentialPlacement;
use provider::placement::DEFAULT_PLACEHOLDER;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file used when neither `--config` nor CONFIG_PATH is given.
pub const DEFAULT_CONFIG_PATH: &str = "gemini-relay.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub keys: KeysConfig,
}

/// Listener and client authentication
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Path to a file containing the bearer token (alternative to CUSTOM_TOKEN)
    #[serde(default)]
    pub auth_token_file: Option<PathBuf>,
    #[serde(skip)]
    pub auth_token: Option<Secret<String>>,
}

/// Where requests and sessions are forwarded, and how the key travels
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_http_url")]
    pub http_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub credential_mode: CredentialMode,
    #[serde(default = "default_query_param")]
    pub query_param: String,
    #[serde(default = "default_body_placeholder")]
    pub body_placeholder: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMode {
    #[default]
    Query,
    Body,
}

/// WebSocket relay settings
#[derive(Debug, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_close_grace")]
    pub close_grace_secs: u64,
    /// Apply the bearer check to upgrade requests too. Browsers cannot set
    /// headers on WebSocket requests, so this is off by default.
    #[serde(default)]
    pub require_auth: bool,
}

/// Upstream keys and quota policy
#[derive(Debug, Deserialize)]
pub struct KeysConfig {
    #[serde(default = "default_true")]
    pub rotate: bool,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u32,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default = "default_reset_after")]
    pub reset_after_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// One key per line; blank lines and `#` comments are skipped
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_max_connections() -> usize {
    1000
}

fn default_http_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_ws_url() -> String {
    "wss://generativelanguage.googleapis.com".to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_query_param() -> String {
    "key".to_string()
}

fn default_body_placeholder() -> String {
    DEFAULT_PLACEHOLDER.to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_close_grace() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_warning_threshold() -> u32 {
    45
}

fn default_daily_limit() -> u32 {
    50
}

fn default_reset_after() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
            auth_token_file: None,
            auth_token: None,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            http_url: default_http_url(),
            ws_url: default_ws_url(),
            timeout_secs: default_timeout(),
            credential_mode: CredentialMode::default(),
            query_param: default_query_param(),
            body_placeholder: default_body_placeholder(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            close_grace_secs: default_close_grace(),
            require_auth: false,
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            rotate: true,
            warning_threshold: default_warning_threshold(),
            daily_limit: default_daily_limit(),
            reset_after_secs: default_reset_after(),
            sweep_interval_secs: default_sweep_interval(),
            keys_file: None,
            api_keys: Vec::new(),
        }
    }
}

impl UpstreamConfig {
    pub fn placement(&self) -> CredentialPlacement {
        match self.credential_mode {
            CredentialMode::Query => CredentialPlacement::Query {
                param: self.query_param.clone(),
            },
            CredentialMode::Body => CredentialPlacement::BodyPlaceholder {
                token: self.body_placeholder.clone(),
            },
        }
    }
}

impl RelaySettings {
    pub fn relay_config(&self) -> duplex_relay::RelayConfig {
        duplex_relay::RelayConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            close_grace: Duration::from_secs(self.close_grace_secs),
        }
    }
}

impl KeysConfig {
    pub fn policy(&self) -> QuotaPolicy {
        QuotaPolicy {
            warning_threshold: self.warning_threshold,
            daily_limit: self.daily_limit,
            reset_after: Duration::from_secs(self.reset_after_secs),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. Only the secrets are read from the
    /// environment or the files the TOML names.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Like `load`, but a missing default config file means built-in defaults.
    /// An explicitly named file must exist.
    pub fn load_or_default(path: &Path) -> common::Result<Self> {
        if path == Path::new(DEFAULT_CONFIG_PATH) && !path.exists() {
            return Self::from_toml("");
        }
        Self::load(path)
    }

    /// Parse, validate and resolve secrets.
    ///
    /// Bearer token resolution order:
    /// 1. CUSTOM_TOKEN env var
    /// 2. auth_token_file path from config
    ///
    /// Upstream key resolution order:
    /// 1. GEMINI_API_KEYS env var (comma separated)
    /// 2. GEMINI_API_KEY env var
    /// 3. keys_file path from config
    pub fn from_toml(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.validate()?;

        config.server.auth_token = resolve_auth_token(config.server.auth_token_file.as_deref())?;
        config.keys.api_keys = resolve_api_keys(config.keys.keys_file.as_deref())?;

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let upstream = &self.upstream;
        if !upstream.http_url.starts_with("http://") && !upstream.http_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "http_url must start with http:// or https://, got: {}",
                upstream.http_url
            )));
        }
        if !upstream.ws_url.starts_with("ws://") && !upstream.ws_url.starts_with("wss://") {
            return Err(common::Error::Config(format!(
                "ws_url must start with ws:// or wss://, got: {}",
                upstream.ws_url
            )));
        }
        if upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if upstream.query_param.is_empty() {
            return Err(common::Error::Config("query_param must not be empty".into()));
        }
        if upstream.body_placeholder.is_empty() {
            return Err(common::Error::Config(
                "body_placeholder must not be empty".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.relay.connect_timeout_secs == 0 {
            return Err(common::Error::Config(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.relay.close_grace_secs == 0 {
            return Err(common::Error::Config(
                "close_grace_secs must be greater than 0".into(),
            ));
        }
        if self.keys.sweep_interval_secs == 0 {
            return Err(common::Error::Config(
                "sweep_interval_secs must be greater than 0".into(),
            ));
        }
        self.keys
            .policy()
            .validate()
            .map_err(|e| common::Error::Config(e.to_string()))
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }
}

fn resolve_auth_token(token_file: Option<&Path>) -> common::Result<Option<Secret<String>>> {
    if let Ok(token) = std::env::var("CUSTOM_TOKEN")
        && !token.is_empty()
    {
        return Ok(Some(Secret::new(token)));
    }
    let Some(path) = token_file else {
        return Ok(None);
    };
    let token = std::fs::read_to_string(path).map_err(|e| {
        common::Error::Config(format!(
            "failed to read auth_token_file {}: {e}",
            path.display()
        ))
    })?;
    let token = token.trim().to_owned();
    Ok((!token.is_empty()).then(|| Secret::new(token)))
}

fn resolve_api_keys(keys_file: Option<&Path>) -> common::Result<Vec<Secret<String>>> {
    if let Ok(list) = std::env::var("GEMINI_API_KEYS")
        && !list.trim().is_empty()
    {
        return non_empty(split_keys(list.split(',')), "GEMINI_API_KEYS");
    }
    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        let key = key.trim().to_owned();
        if !key.is_empty() {
            return Ok(vec![Secret::new(key)]);
        }
    }
    let Some(path) = keys_file else {
        return Ok(Vec::new());
    };
    let contents = std::fs::read_to_string(path).map_err(|e| {
        common::Error::Config(format!("failed to read keys_file {}: {e}", path.display()))
    })?;
    non_empty(
        split_keys(contents.lines().filter(|l| !l.trim_start().starts_with('#'))),
        "keys_file",
    )
}

fn split_keys<'a>(items: impl Iterator<Item = &'a str>) -> Vec<Secret<String>> {
    items
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| Secret::new(k.to_owned()))
        .collect()
}

/// A configured key list that yields nothing is a startup error, not "no keys".
fn non_empty(keys: Vec<Secret<String>>, source: &str) -> common::Result<Vec<Secret<String>>> {
    if keys.is_empty() {
        return Err(common::Error::Config(format!("{source} contains no keys")));
    }
    Ok(keys)
}
