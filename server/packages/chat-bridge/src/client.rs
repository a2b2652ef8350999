//! Terminal chat client for `chat-bridge chat`.

use std::io::Write;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use chat_bridge_agent_runtime::Sender;

use crate::protocol::{ClientEnvelope, Command, ServerEnvelope};
use crate::transcript::{Transcript, TranscriptEvent};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("server url must use ws:// or wss://, got {0}")]
    UnsupportedScheme(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub url: String,
    pub browser_session_id: Option<String>,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LineAction {
    Send(ClientEnvelope),
    Quit,
    Skip,
}

enum SocketEnd {
    Quit,
    Lost,
}

/// Adds the browser token to the endpoint, replacing any existing one.
pub fn connect_url(base: &str, browser_session_id: &str) -> Result<Url, ClientError> {
    let mut url = Url::parse(base)?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ClientError::UnsupportedScheme(url.scheme().to_string()));
    }
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "browser_session_id")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair("browser_session_id", browser_session_id);
    Ok(url)
}

pub async fn run_chat(config: ChatClientConfig) -> Result<(), ClientError> {
    let token = config
        .browser_session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let url = connect_url(&config.url, &token)?;
    let mut transcript = Transcript::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut failures = 0u32;

    eprintln!("commands: /clear /reset /stop /ping /quit");
    loop {
        let socket = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                failures = 0;
                socket
            }
            Err(err) => {
                failures += 1;
                if failures > config.max_reconnect_attempts {
                    return Err(err.into());
                }
                tracing::warn!(error = %err, attempt = failures, "connect failed; retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        tracing::debug!(url = %url, "connected");

        match run_socket(socket, &mut transcript, &mut lines).await? {
            SocketEnd::Quit => return Ok(()),
            SocketEnd::Lost => {
                eprintln!("connection lost; reconnecting as {token}");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn run_socket<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
    transcript: &mut Transcript,
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<SocketEnd, ClientError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    let mut stopping = false;
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<ServerEnvelope>(&text) {
                        Ok(envelope) => {
                            if let Some(event) = transcript.apply(&envelope) {
                                print_fragment(&render(transcript, &event));
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "unrecognized server frame"),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Ok(if stopping { SocketEnd::Quit } else { SocketEnd::Lost });
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "websocket read failed");
                    return Ok(SocketEnd::Lost);
                }
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(SocketEnd::Quit);
                };
                match parse_line(&line, transcript.session_id()) {
                    LineAction::Skip => {}
                    LineAction::Quit => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return Ok(SocketEnd::Quit);
                    }
                    LineAction::Send(envelope) => {
                        match &envelope {
                            ClientEnvelope::Message { content, .. } => {
                                transcript.push_local(Sender::User, content);
                            }
                            ClientEnvelope::Command { command: Command::Stop } => stopping = true,
                            _ => {}
                        }
                        let text = serde_json::to_string(&envelope)?;
                        if let Err(err) = sink.send(WsMessage::Text(text)).await {
                            tracing::warn!(error = %err, "websocket write failed");
                            return Ok(SocketEnd::Lost);
                        }
                    }
                }
            }
        }
    }
}

fn parse_line(line: &str, session_id: Option<&str>) -> LineAction {
    let line = line.trim();
    let command = |command| LineAction::Send(ClientEnvelope::Command { command });
    match line {
        "" => LineAction::Skip,
        "/quit" | "/exit" => LineAction::Quit,
        "/clear" => command(Command::Clear),
        "/reset" => command(Command::Reset),
        "/stop" => command(Command::Stop),
        "/ping" => LineAction::Send(ClientEnvelope::Ping),
        text => LineAction::Send(ClientEnvelope::Message {
            content: text.to_string(),
            session_id: session_id.map(str::to_string),
        }),
    }
}

/// Terminal text for an event. Streamed bubbles get their label with the first token.
fn render(transcript: &Transcript, event: &TranscriptEvent) -> String {
    match event {
        TranscriptEvent::Connected {
            session_id,
            resumed,
        } => {
            let verb = if *resumed { "resumed" } else { "started" };
            format!("-- {verb} session {session_id}\n")
        }
        TranscriptEvent::Appended { id } => transcript
            .get(id)
            .map(|entry| format!("[{}] {}\n", entry.sender, entry.content))
            .unwrap_or_default(),
        TranscriptEvent::StreamStarted { .. } => String::new(),
        TranscriptEvent::Token { id, token } => match transcript.get(id) {
            Some(entry) if entry.content.len() == token.len() => {
                format!("[{}] {token}", entry.sender)
            }
            Some(_) => token.clone(),
            None => String::new(),
        },
        TranscriptEvent::StreamEnded { id } => match transcript.get(id) {
            Some(entry) if !entry.content.is_empty() => "\n".to_string(),
            _ => String::new(),
        },
        TranscriptEvent::Removed { entry } if !entry.content.is_empty() => {
            "   (previous message retracted)\n".to_string()
        }
        TranscriptEvent::Removed { .. } => String::new(),
        TranscriptEvent::ToolCall {
            tool_name,
            tool_args,
        } => format!("[tool] {tool_name} {tool_args}\n"),
        TranscriptEvent::ToolResult { tool_name, result } => {
            format!("[tool] {tool_name} -> {result}\n")
        }
        TranscriptEvent::InputRequested { prompt } => prompt
            .as_deref()
            .map(|prompt| format!("? {prompt}\n"))
            .unwrap_or_default(),
        TranscriptEvent::Error { error, details } => match details {
            Some(details) => format!("!! {error}: {details}\n"),
            None => format!("!! {error}\n"),
        },
        TranscriptEvent::Pong => "pong\n".to_string(),
    }
}

fn print_fragment(fragment: &str) {
    if fragment.is_empty() {
        return;
    }
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(fragment.as_bytes());
    let _ = stdout.flush();
}
