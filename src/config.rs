use crate::facade::SyncSettings;
use crate::sync::reconnect::ReconnectPolicy;
use crate::sync::PollPolicy;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

const ENV_FILE: &str = ".env";
const USER_ID_VAR: &str = "EXEC_SYNC_USER_ID";
const API_TOKEN_VAR: &str = "EXEC_SYNC_API_TOKEN";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub api_base: String,
    pub ws_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout() -> u64 { 10_000 }

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:3000/api".to_string(),
            ws_url: "ws://localhost:3000/ws".to_string(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_s: u64,
    /// Safety-net poll fires after this many intervals even when idle.
    #[serde(default = "default_safety_net_factor")]
    pub safety_net_factor: u32,
    #[serde(default = "default_connection_sample")]
    pub connection_sample_ms: u64,
    /// Executions kept per timeline; 0 keeps everything.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,
}

fn default_poll_interval() -> u64 { 30 }
fn default_safety_net_factor() -> u32 { 3 }
fn default_connection_sample() -> u64 { 1000 }
fn default_history_limit() -> usize { 50 }
fn default_reconnect_delay() -> u64 { 2000 }
fn default_reconnect_max_delay() -> u64 { 60_000 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_s: default_poll_interval(),
            safety_net_factor: default_safety_net_factor(),
            connection_sample_ms: default_connection_sample(),
            history_limit: default_history_limit(),
            reconnect_delay_ms: default_reconnect_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
        }
    }
}

impl SyncConfig {
    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            poll: PollPolicy::new(
                Duration::from_secs(self.poll_interval_s.max(1)),
                self.safety_net_factor,
            ),
            connection_sample: Duration::from_millis(self.connection_sample_ms.max(50)),
            history_limit: self.history_limit,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let base_delay = Duration::from_millis(self.reconnect_delay_ms);
        ReconnectPolicy {
            base_delay,
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms).max(base_delay),
        }
    }
}

/// What the terminal monitor follows at startup.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct MonitorConfig {
    /// Follow one content item instead of the user's run list.
    pub content_id: Option<String>,
    /// Start watching this execution immediately.
    pub execution_id: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse config TOML")
    }

    /// Load .env file into process environment. Real env vars take precedence.
    pub fn load_env_file() {
        let content = match std::fs::read_to_string(ENV_FILE) {
            Ok(c) => c,
            Err(_) => return,
        };
        for (key, value) in parse_env(&content) {
            if std::env::var(&key).is_err() {
                std::env::set_var(key, value);
            }
        }
    }

    /// User id for the push channel and REST calls, prompted if unset.
    /// Prompted values are saved to .env for future runs.
    pub fn user_id() -> Result<String> {
        match std::env::var(USER_ID_VAR) {
            Ok(id) if !sanitize_key(&id).is_empty() => Ok(sanitize_key(&id)),
            _ => {
                let id = prompt("User id")?;
                save_env_var(USER_ID_VAR, &id);
                Ok(id)
            }
        }
    }

    /// Optional bearer token. Never prompted.
    pub fn api_token() -> Option<String> {
        std::env::var(API_TOKEN_VAR)
            .ok()
            .map(|t| sanitize_key(&t))
            .filter(|t| !t.is_empty())
    }
}

fn parse_env(content: &str) -> Vec<(String, String)> {
    // Strip BOM if present (common on Windows-created files)
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    content
        .lines()
        .map(|line| line.trim().trim_matches('\r'))
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}

fn prompt(label: &str) -> Result<String> {
    print!("  {} > ", label);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let value = sanitize_key(&input);
    if value.is_empty() {
        anyhow::bail!("{} cannot be empty", label);
    }
    Ok(value)
}

/// Strip carriage returns, BOM, and other invisible chars from a value.
fn sanitize_key(raw: &str) -> String {
    raw.replace(['\r', '\u{feff}', '\u{200b}'], "")
        .trim()
        .to_string()
}

/// Append a KEY=VALUE line to .env and set it in the current process.
fn save_env_var(key: &str, value: &str) {
    std::env::set_var(key, value);
    let path = Path::new(ENV_FILE);
    let mut contents = std::fs::read_to_string(path).unwrap_or_default();
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(&format!("{}={}\n", key, value));
    if let Err(e) = std::fs::write(path, contents) {
        tracing::warn!(error = %e, "could not save {} to .env", key);
    }
}
