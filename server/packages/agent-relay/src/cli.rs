use std::sync::Arc;
use std::time::Duration;

use agent_relay_error::RelayError;
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;

use crate::config::RelayConfig;
use crate::router::{build_router_with_state, shutdown, ApiDoc, AppState};

#[derive(Parser, Debug)]
#[command(name = "agent-relay", bin_name = "agent-relay")]
#[command(about = "Agent sessions, sandboxed tools, resumable event streams", version)]
#[command(arg_required_else_help = true)]
pub struct AgentRelayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the agent relay HTTP server.
    Server(ServerArgs),
    /// Print the OpenAPI document and exit.
    Spec,
}

/// Flags override `RELAY_*` environment variables, which override defaults.
#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Bind host.
    #[arg(long, short = 'H')]
    host: Option<String>,

    /// Bind port.
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Route every session through one shared sandbox.
    #[arg(long)]
    shared_sandbox: bool,

    /// Attach to an already running sandbox at this base URL
    /// (implies --shared-sandbox).
    #[arg(long)]
    sandbox_url: Option<String>,

    /// Sandbox runner command, whitespace-separated.
    #[arg(long)]
    sandbox_cmd: Option<String>,

    /// Concurrent sandbox cap in per-session mode.
    #[arg(long)]
    max_sandboxes: Option<usize>,

    /// Per-invocation tool timeout in seconds.
    #[arg(long)]
    tool_timeout_secs: Option<u64>,

    /// Idle seconds before a session is swept.
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    /// Events retained per session for replay.
    #[arg(long)]
    event_retention: Option<usize>,
}

impl ServerArgs {
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.shared_sandbox {
            config.shared_sandbox = true;
        }
        if let Some(url) = &self.sandbox_url {
            config.shared_sandbox = true;
            config.sandbox_base_url = Some(url.clone());
        }
        if let Some(cmd) = &self.sandbox_cmd {
            config.sandbox_cmd = cmd.split_whitespace().map(str::to_string).collect();
        }
        if let Some(max) = self.max_sandboxes {
            config.max_sandboxes = max;
        }
        if let Some(secs) = self.tool_timeout_secs {
            config.tool_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(retention) = self.event_retention {
            config.event_retention = retention;
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("config error: {0}")]
    Config(#[from] RelayError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_agent_relay() -> Result<(), CliError> {
    let cli = AgentRelayCli::parse();
    init_logging();
    run_command(&cli.command)
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Spec => print_spec(),
    }
}

fn run_server(args: &ServerArgs) -> Result<(), CliError> {
    let mut config = RelayConfig::from_env()?;
    args.apply(&mut config);

    let state = Arc::new(AppState::new(&config));
    let (router, state) = build_router_with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let idle_timeout = config.idle_timeout;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let sweeper = state.supervisor().spawn_idle_sweep(idle_timeout);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                sweeper.abort();
                shutdown(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn print_spec() -> Result<(), CliError> {
    let doc = ApiDoc::openapi();
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_flags_override_env_resolved_config() {
        let args = ServerArgs {
            host: Some("0.0.0.0".to_string()),
            port: Some(9100),
            shared_sandbox: false,
            sandbox_url: Some("http://127.0.0.1:4601".to_string()),
            sandbox_cmd: None,
            max_sandboxes: Some(2),
            tool_timeout_secs: Some(5),
            idle_timeout_secs: None,
            event_retention: None,
        };
        let mut config = RelayConfig::default();
        args.apply(&mut config);

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9100);
        assert!(config.shared_sandbox, "sandbox url implies shared mode");
        assert_eq!(
            config.sandbox_base_url.as_deref(),
            Some("http://127.0.0.1:4601")
        );
        assert_eq!(config.max_sandboxes, 2);
        assert_eq!(config.tool_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, RelayConfig::default().idle_timeout);
    }

    #[test]
    fn cli_parses_server_subcommand() {
        let cli = AgentRelayCli::try_parse_from([
            "agent-relay",
            "server",
            "--port",
            "9200",
            "--shared-sandbox",
        ])
        .unwrap();
        let Command::Server(args) = cli.command else {
            panic!("expected server subcommand");
        };
        assert_eq!(args.port, Some(9200));
        assert!(args.shared_sandbox);
    }
}
