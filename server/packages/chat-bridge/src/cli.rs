use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chat_bridge_agent_runtime::{AgentConfig, MockRuntime};

use crate::bridge::BridgeConfig;
use crate::client::{run_chat, ChatClientConfig, ClientError};
use crate::session::SessionConfig;
use crate::{run_server as serve_bridge, ServerConfig};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/ws";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "chat-bridge", bin_name = "chat-bridge")]
#[command(about = "WebSocket chat bridge for blocking agent loops", version)]
#[command(arg_required_else_help = true)]
pub struct ChatBridgeCli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the WebSocket chat server.
    Server(ServerArgs),
    /// Chat with a running server from the terminal.
    Chat(ChatArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', env = "CHAT_BRIDGE_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', env = "CHAT_BRIDGE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Seconds a disconnected session waits for its client to come back.
    #[arg(long, default_value_t = 300)]
    reconnect_timeout_secs: u64,

    #[arg(long, default_value_t = 300)]
    input_timeout_secs: u64,

    #[arg(long, default_value_t = 1024)]
    outbound_queue_depth: usize,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long)]
    agent_name: Option<String>,

    #[arg(long)]
    system_message: Option<String>,

    /// Delay between streamed words from the built-in agent.
    #[arg(long, default_value_t = 30)]
    stream_delay_ms: u64,

    #[arg(long)]
    no_cache: bool,
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    #[arg(long, env = "CHAT_BRIDGE_URL", default_value = DEFAULT_WS_URL)]
    url: String,

    /// Reuse a browser-session token to resume an existing conversation.
    #[arg(long)]
    browser_session_id: Option<String>,

    #[arg(long, default_value_t = 5)]
    max_reconnect_attempts: u32,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error(transparent)]
    Client(#[from] ClientError),
}

pub fn run_chat_bridge() -> Result<(), CliError> {
    let cli = ChatBridgeCli::parse();
    init_logging()?;
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Chat(args) => run_chat_client(args),
    }
}

impl ServerArgs {
    fn server_config(&self) -> Result<ServerConfig, CliError> {
        if self.outbound_queue_depth == 0 {
            return Err(CliError::InvalidArgument(
                "--outbound-queue-depth must be at least 1".to_string(),
            ));
        }
        let defaults = AgentConfig::default();
        Ok(ServerConfig {
            host: self.host.clone(),
            port: self.port,
            session: SessionConfig {
                reconnect_timeout: Duration::from_secs(self.reconnect_timeout_secs),
                bridge: BridgeConfig {
                    outbound_queue_depth: self.outbound_queue_depth,
                    input_timeout: Duration::from_secs(self.input_timeout_secs),
                },
                agent: AgentConfig {
                    name: self.agent_name.clone().unwrap_or(defaults.name),
                    system_message: self
                        .system_message
                        .clone()
                        .unwrap_or(defaults.system_message),
                    stream_delay: Duration::from_millis(self.stream_delay_ms),
                    use_cache: !self.no_cache,
                },
            },
            shutdown_grace: SHUTDOWN_GRACE,
        })
    }
}

fn run_server(args: &ServerArgs) -> Result<(), CliError> {
    let config = args.server_config()?;
    let cors = build_cors_layer(&args.cors_allow_origin)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    tracing::info!(
        agent = %config.session.agent.name,
        reconnect_timeout_secs = args.reconnect_timeout_secs,
        input_timeout_secs = args.input_timeout_secs,
        cache = !args.no_cache,
        "starting chat bridge"
    );
    runtime.block_on(async move {
        serve_bridge(config, Arc::new(MockRuntime::new()), cors)
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_chat_client(args: &ChatArgs) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;
    let config = ChatClientConfig {
        url: args.url.clone(),
        browser_session_id: args.browser_session_id.clone(),
        max_reconnect_attempts: args.max_reconnect_attempts,
    };
    runtime.block_on(run_chat(config)).map_err(CliError::from)
}

/// No origins means no cross-origin access.
pub fn build_cors_layer(origins: &[String]) -> Result<Option<CorsLayer>, CliError> {
    if origins.is_empty() {
        return Ok(None);
    }
    let mut allowed = Vec::new();
    for origin in origins {
        let value: HeaderValue = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        allowed.push(value);
    }
    Ok(Some(
        CorsLayer::new()
            .allow_origin(allowed)
            .allow_methods(Any)
            .allow_headers(Any),
    ))
}
