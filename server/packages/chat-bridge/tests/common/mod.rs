#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use chat_bridge::bridge::BridgeConfig;
use chat_bridge::protocol::ServerEnvelope;
use chat_bridge::session::{SessionConfig, SessionManager};
use chat_bridge::serve;
use chat_bridge_agent_runtime::{AgentConfig, AgentRuntime, MockRuntime};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub manager: Arc<SessionManager>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        reconnect_timeout: Duration::from_secs(30),
        bridge: BridgeConfig {
            outbound_queue_depth: 256,
            input_timeout: Duration::from_secs(60),
        },
        agent: AgentConfig {
            stream_delay: Duration::from_millis(1),
            ..AgentConfig::default()
        },
    }
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(Arc::new(MockRuntime::new()), fast_session_config()).await
    }

    pub async fn start_with(runtime: Arc<dyn AgentRuntime>, config: SessionConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let manager = SessionManager::new(runtime, config);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let serve_manager = manager.clone();
        let handle = tokio::spawn(async move {
            serve(listener, serve_manager, None, Duration::from_secs(2), async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("serve");
        });
        Self {
            addr,
            manager,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn ws_url(&self, browser_session_id: Option<&str>) -> String {
        match browser_session_id {
            Some(token) => format!("ws://{}/ws?browser_session_id={token}", self.addr),
            None => format!("ws://{}/ws", self.addr),
        }
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub async fn connect(&self, browser_session_id: Option<&str>) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(self.ws_url(browser_session_id))
            .await
            .expect("websocket connect");
        client
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .expect("send frame");
}

pub async fn send_raw(client: &mut Client, text: &str) {
    client
        .send(Message::Text(text.to_string()))
        .await
        .expect("send frame");
}

/// Next envelope from the server, or `None` once the socket is closed.
pub async fn recv(client: &mut Client) -> Option<ServerEnvelope> {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for server frame");
        match frame {
            Some(Ok(Message::Text(text))) => {
                return Some(serde_json::from_str(&text).expect("server envelope"));
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

pub async fn expect_envelope(client: &mut Client) -> ServerEnvelope {
    recv(client).await.expect("socket closed unexpectedly")
}

/// Reads envelopes up to and including the first one matching `done`.
pub async fn recv_until<F>(client: &mut Client, mut done: F) -> Vec<ServerEnvelope>
where
    F: FnMut(&ServerEnvelope) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let envelope = expect_envelope(client).await;
        let stop = done(&envelope);
        seen.push(envelope);
        if stop {
            return seen;
        }
    }
}

/// Reads the `connection` envelope that opens every attachment.
pub async fn expect_connection(client: &mut Client) -> (String, bool) {
    match expect_envelope(client).await {
        ServerEnvelope::Connection {
            session_id,
            resumed,
            ..
        } => (session_id, resumed),
        other => panic!("expected connection envelope, got {other:?}"),
    }
}

pub fn streamed_text(envelopes: &[ServerEnvelope]) -> String {
    envelopes
        .iter()
        .filter_map(|envelope| match envelope {
            ServerEnvelope::StreamToken { token, .. } => Some(token.as_str()),
            _ => None,
        })
        .collect()
}

pub fn kinds(envelopes: &[ServerEnvelope]) -> Vec<&'static str> {
    envelopes.iter().map(ServerEnvelope::kind).collect()
}

pub async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + RECV_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
