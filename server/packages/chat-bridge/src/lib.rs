use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chat_bridge_agent_runtime::AgentRuntime;
use tower_http::cors::CorsLayer;

use router::build_router;
use session::{SessionConfig, SessionManager};

pub mod bridge;
pub mod cli;
pub mod client;
pub mod protocol;
pub mod router;
pub mod session;
pub mod transcript;
pub mod ws;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub session: SessionConfig,
    pub shutdown_grace: Duration,
}

pub async fn run_server(
    config: ServerConfig,
    runtime: Arc<dyn AgentRuntime>,
    cors: Option<CorsLayer>,
) -> Result<(), BoxError> {
    let manager = SessionManager::new(runtime, config.session.clone());
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "chat-bridge listening");

    serve(listener, manager, cors, config.shutdown_grace, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    })
    .await
}

/// Serves the bridge on an already bound listener until `shutdown` resolves,
/// then closes every session.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    manager: Arc<SessionManager>,
    cors: Option<CorsLayer>,
    shutdown_grace: Duration,
    shutdown: F,
) -> Result<(), BoxError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let mut app = build_router(manager.clone());
    if let Some(cors) = cors {
        app = app.layer(cors);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            manager.shutdown_all(shutdown_grace).await;
        })
        .await?;
    Ok(())
}
