use std::str::FromStr;
use std::time::Duration;

use agent_relay_error::RelayError;
use agent_relay_sandbox::{SandboxConfig, SandboxProvisioner};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2468;
pub const DEFAULT_MAX_SANDBOXES: usize = 8;
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_EVENT_RETENTION: usize = 1024;

/// Runtime configuration, resolved once at startup. Precedence: CLI flag,
/// then `RELAY_*` environment variable, then default.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// One sandbox shared by every session instead of one per session.
    pub shared_sandbox: bool,
    /// Attach shared mode to an externally managed sandbox instead of
    /// spawning one.
    pub sandbox_base_url: Option<String>,
    /// Sandbox runner command, whitespace-separated.
    pub sandbox_cmd: Vec<String>,
    pub max_sandboxes: usize,
    pub tool_timeout: Duration,
    pub idle_timeout: Duration,
    pub event_retention: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            shared_sandbox: false,
            sandbox_base_url: None,
            sandbox_cmd: SandboxConfig::default().runner,
            max_sandboxes: DEFAULT_MAX_SANDBOXES,
            tool_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            event_retention: DEFAULT_EVENT_RETENTION,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, RelayError> {
        let mut config = Self::default();
        if let Some(host) = env_string("RELAY_HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse::<u16>("RELAY_PORT")? {
            config.port = port;
        }
        if let Some(shared) = env_bool("RELAY_SHARED_SANDBOX")? {
            config.shared_sandbox = shared;
        }
        if let Some(url) = env_string("RELAY_SANDBOX_URL") {
            config.sandbox_base_url = Some(url);
        }
        if let Some(cmd) = env_string("RELAY_SANDBOX_CMD") {
            config.sandbox_cmd = cmd.split_whitespace().map(str::to_string).collect();
        }
        if let Some(max) = env_parse::<usize>("RELAY_MAX_SANDBOXES")? {
            config.max_sandboxes = max;
        }
        if let Some(secs) = env_parse::<u64>("RELAY_TOOL_TIMEOUT_SECS")? {
            config.tool_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("RELAY_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(retention) = env_parse::<usize>("RELAY_EVENT_RETENTION")? {
            config.event_retention = retention;
        }
        Ok(config)
    }

    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            runner: self.sandbox_cmd.clone(),
            base_url: self.sandbox_base_url.clone(),
            ..SandboxConfig::default()
        }
    }

    pub fn provisioner(&self) -> SandboxProvisioner {
        if self.shared_sandbox {
            SandboxProvisioner::shared(self.sandbox_config())
        } else {
            SandboxProvisioner::per_session(self.sandbox_config())
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, RelayError> {
    match env_string(key) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| RelayError::Validation {
                message: format!("invalid value for {key}: {value}"),
            }),
        None => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>, RelayError> {
    match env_string(key) {
        Some(value) => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(RelayError::Validation {
                message: format!("invalid value for {key}: {other}"),
            }),
        },
        None => Ok(None),
    }
}
