//! Lifecycle and RPC client for isolated sandbox instances.

use std::fs::{self, OpenOptions};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use agent_relay_error::RelayError;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

const HEALTH_ENDPOINTS: [&str; 2] = ["health", "healthz"];
const READY_ATTEMPTS: usize = 20;
const READY_DELAY_MS: u64 = 150;
const SHUTDOWN_RPC_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Command used to launch one sandbox runner; `--port <n>` is appended.
    pub runner: Vec<String>,
    /// When set, shared mode attaches to this externally managed runner
    /// instead of spawning one.
    pub base_url: Option<String>,
    pub log_dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runner: vec!["agent-sandboxd".to_string(), "serve".to_string()],
            base_url: None,
            log_dir: default_log_dir(),
        }
    }
}

/// Tool-level outcome of an `execute` RPC. Transport failures (the tool
/// never ran) surface separately as `RelayError::SandboxUnavailable`.
#[derive(Debug, Clone)]
pub enum ExecuteResult {
    Success(Value),
    Failure(String),
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    success: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// One live sandbox instance. Owns the child process when this handle
/// spawned it; attached handles (shared mode with a configured base URL)
/// have no child and never kill anything.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    base_url: String,
    child: Option<Arc<StdMutex<Option<Child>>>>,
    http_client: Client,
}

impl SandboxHandle {
    fn attached(base_url: String, http_client: Client) -> Self {
        Self {
            base_url,
            child: None,
            http_client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_alive(&self) -> bool {
        match &self.child {
            Some(child) => child_is_alive(child),
            // Attached instances are presumed alive; execute discovers
            // otherwise through the transport error.
            None => true,
        }
    }

    pub async fn health(&self) -> bool {
        for endpoint in HEALTH_ENDPOINTS {
            let url = format!("{}/{endpoint}", self.base_url);
            match self.http_client.get(&url).send().await {
                Ok(response) if response.status().is_success() => return true,
                Ok(_) | Err(_) => {}
            }
        }
        false
    }

    /// Runs one tool inside the sandbox. Never retries; a dead child or a
    /// failed transport maps to `SandboxUnavailable` so callers can tell
    /// "never ran" apart from "ran and failed".
    pub async fn execute(&self, tool: &str, arguments: &Value) -> Result<ExecuteResult, RelayError> {
        if !self.is_alive() {
            return Err(RelayError::SandboxUnavailable {
                message: "sandbox process exited".to_string(),
            });
        }

        let url = format!("{}/tools/execute", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&json!({ "tool": tool, "arguments": arguments }))
            .send()
            .await
            .map_err(|err| RelayError::SandboxUnavailable {
                message: format!("execute rpc failed: {err}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::SandboxUnavailable {
                message: format!("execute rpc returned status {status}"),
            });
        }

        let body: ExecuteResponse =
            response
                .json()
                .await
                .map_err(|err| RelayError::SandboxUnavailable {
                    message: format!("execute rpc returned malformed body: {err}"),
                })?;

        if body.success {
            Ok(ExecuteResult::Success(body.result))
        } else {
            Ok(ExecuteResult::Failure(
                body.error.unwrap_or_else(|| "tool failed".to_string()),
            ))
        }
    }

    /// Tears the instance down. Graceful shutdown RPC first, then kill.
    /// Idempotent; attached instances only get the RPC.
    pub async fn stop(&self) {
        let url = format!("{}/shutdown", self.base_url);
        let _ = self
            .http_client
            .post(&url)
            .timeout(Duration::from_millis(SHUTDOWN_RPC_TIMEOUT_MS))
            .send()
            .await;

        if let Some(child) = &self.child {
            kill_child(child);
        }
    }
}

async fn spawn_instance(
    config: &SandboxConfig,
    http_client: &Client,
) -> Result<SandboxHandle, RelayError> {
    let runner = config.runner.clone();
    if runner.is_empty() {
        return Err(RelayError::SandboxUnavailable {
            message: "sandbox runner command is empty".to_string(),
        });
    }
    let log_dir = config.log_dir.clone();

    let (base_url, child) = tokio::task::spawn_blocking(move || {
        let port = find_available_port()?;
        let mut command = Command::new(&runner[0]);
        if runner.len() > 1 {
            command.args(&runner[1..]);
        }
        let stderr = open_runner_log(&log_dir).unwrap_or_else(|_| Stdio::null());
        command
            .arg("--port")
            .arg(port.to_string())
            .stdout(Stdio::null())
            .stderr(stderr);

        let child = command.spawn().map_err(|err| RelayError::SandboxUnavailable {
            message: format!("failed to spawn sandbox runner: {err}"),
        })?;
        Ok::<(String, Child), RelayError>((format!("http://127.0.0.1:{port}"), child))
    })
    .await
    .map_err(|err| RelayError::Internal {
        message: format!("sandbox spawn task failed: {err}"),
    })??;

    let handle = SandboxHandle {
        base_url,
        child: Some(Arc::new(StdMutex::new(Some(child)))),
        http_client: http_client.clone(),
    };

    if let Err(err) = wait_until_ready(&handle).await {
        handle.stop().await;
        return Err(err);
    }

    debug!(base_url = %handle.base_url, "sandbox instance ready");
    Ok(handle)
}

async fn wait_until_ready(handle: &SandboxHandle) -> Result<(), RelayError> {
    for _ in 0..READY_ATTEMPTS {
        if !handle.is_alive() {
            return Err(RelayError::SandboxUnavailable {
                message: "sandbox runner exited during startup".to_string(),
            });
        }
        if handle.health().await {
            return Ok(());
        }
        sleep(Duration::from_millis(READY_DELAY_MS)).await;
    }

    Err(RelayError::SandboxUnavailable {
        message: format!("sandbox at {} failed its health check", handle.base_url),
    })
}

/// Process-wide singleton used when all sessions share one sandbox.
/// `ensure` is idempotent and revives a dead instance on the next call;
/// per-session `stop` is a no-op, only `shutdown` tears it down.
#[derive(Debug, Clone)]
pub struct SharedSandbox {
    inner: Arc<SharedInner>,
}

#[derive(Debug)]
struct SharedInner {
    config: SandboxConfig,
    http_client: Client,
    ensure_lock: Mutex<()>,
    state: Mutex<SharedState>,
    // The sandbox accepts one command at a time, so concurrent sessions
    // must take turns.
    exec_lock: Mutex<()>,
}

#[derive(Debug, Default)]
struct SharedState {
    handle: Option<SandboxHandle>,
    shutdown_requested: bool,
}

impl SharedSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            inner: Arc::new(SharedInner {
                config,
                http_client: Client::new(),
                ensure_lock: Mutex::new(()),
                state: Mutex::new(SharedState::default()),
                exec_lock: Mutex::new(()),
            }),
        }
    }

    pub async fn ensure(&self) -> Result<SandboxHandle, RelayError> {
        let _guard = self.inner.ensure_lock.lock().await;

        if self.inner.state.lock().await.shutdown_requested {
            return Err(RelayError::SandboxUnavailable {
                message: "shared sandbox is shutting down".to_string(),
            });
        }

        if let Some(handle) = self.running_handle().await {
            return Ok(handle);
        }

        let handle = match &self.inner.config.base_url {
            Some(base_url) => {
                let handle =
                    SandboxHandle::attached(base_url.clone(), self.inner.http_client.clone());
                if !handle.health().await {
                    return Err(RelayError::SandboxUnavailable {
                        message: format!("shared sandbox at {base_url} is not responding"),
                    });
                }
                handle
            }
            None => spawn_instance(&self.inner.config, &self.inner.http_client).await?,
        };

        let mut state = self.inner.state.lock().await;
        state.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Serialized execute across every session sharing this instance.
    pub async fn execute(&self, tool: &str, arguments: &Value) -> Result<ExecuteResult, RelayError> {
        let handle = self.ensure().await?;
        let _turn = self.inner.exec_lock.lock().await;
        handle.execute(tool, arguments).await
    }

    pub async fn health(&self) -> bool {
        match self.running_handle().await {
            Some(handle) => handle.health().await,
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        let _guard = self.inner.ensure_lock.lock().await;
        let handle = {
            let mut state = self.inner.state.lock().await;
            state.shutdown_requested = true;
            state.handle.take()
        };
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    async fn running_handle(&self) -> Option<SandboxHandle> {
        let handle = {
            let state = self.inner.state.lock().await;
            state.handle.clone()
        }?;

        if handle.is_alive() {
            return Some(handle);
        }

        warn!("shared sandbox instance died, will re-provision on next use");
        let mut state = self.inner.state.lock().await;
        state.handle = None;
        None
    }
}

/// What a session holds after provisioning: an exclusively owned instance,
/// or a reference into the shared one.
#[derive(Debug, Clone)]
pub enum SandboxRef {
    Owned(Arc<SandboxHandle>),
    Shared(SharedSandbox),
}

impl SandboxRef {
    pub async fn execute(&self, tool: &str, arguments: &Value) -> Result<ExecuteResult, RelayError> {
        match self {
            Self::Owned(handle) => handle.execute(tool, arguments).await,
            Self::Shared(shared) => shared.execute(tool, arguments).await,
        }
    }

    pub async fn health(&self) -> bool {
        match self {
            Self::Owned(handle) => handle.health().await,
            Self::Shared(shared) => shared.health().await,
        }
    }

    /// Session-scoped teardown. Owned instances die here; the shared
    /// instance outlives any one session.
    pub async fn stop(&self) {
        match self {
            Self::Owned(handle) => handle.stop().await,
            Self::Shared(_) => {}
        }
    }
}

/// Selects, once at startup, how sessions get their sandbox. The registry
/// only ever talks to this, never to a mode flag.
#[derive(Debug, Clone)]
pub enum SandboxProvisioner {
    /// Fresh instance per session, torn down with the session.
    PerSession {
        config: SandboxConfig,
        http_client: Client,
    },
    /// One process-wide instance shared by every session.
    Shared(SharedSandbox),
}

impl SandboxProvisioner {
    pub fn per_session(config: SandboxConfig) -> Self {
        Self::PerSession {
            config,
            http_client: Client::new(),
        }
    }

    pub fn shared(config: SandboxConfig) -> Self {
        Self::Shared(SharedSandbox::new(config))
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    pub async fn provision(&self) -> Result<SandboxRef, RelayError> {
        match self {
            Self::PerSession {
                config,
                http_client,
            } => {
                let handle = spawn_instance(config, http_client).await?;
                Ok(SandboxRef::Owned(Arc::new(handle)))
            }
            Self::Shared(shared) => {
                shared.ensure().await?;
                Ok(SandboxRef::Shared(shared.clone()))
            }
        }
    }

    /// Process-shutdown teardown of the shared instance, if any. Owned
    /// instances are stopped through their sessions.
    pub async fn shutdown(&self) {
        if let Self::Shared(shared) = self {
            shared.shutdown().await;
        }
    }
}

fn default_log_dir() -> PathBuf {
    let mut base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.push("agent-relay");
    base.push("sandbox-logs");
    base
}

fn open_runner_log(log_dir: &Path) -> Result<Stdio, String> {
    fs::create_dir_all(log_dir).map_err(|err| err.to_string())?;
    let path = log_dir.join("runner.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| err.to_string())?;
    Ok(file.into())
}

fn find_available_port() -> Result<u16, RelayError> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(|err| RelayError::Internal {
        message: format!("failed to probe for a free port: {err}"),
    })?;
    let port = listener
        .local_addr()
        .map_err(|err| RelayError::Internal {
            message: format!("failed to read probe port: {err}"),
        })?
        .port();
    drop(listener);
    Ok(port)
}

fn child_is_alive(child: &Arc<StdMutex<Option<Child>>>) -> bool {
    let mut guard = match child.lock() {
        Ok(guard) => guard,
        Err(_) => return false,
    };
    let Some(child) = guard.as_mut() else {
        return false;
    };
    match child.try_wait() {
        Ok(Some(_)) => {
            *guard = None;
            false
        }
        Ok(None) => true,
        Err(_) => false,
    }
}

fn kill_child(child: &Arc<StdMutex<Option<Child>>>) {
    if let Ok(mut guard) = child.lock() {
        if let Some(child) = guard.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        *guard = None;
    }
}
