//! Per-connection WebSocket loop.
//!
//! Each accepted socket attaches to a session, then runs a writer task that
//! drains the session's outbound queue alongside a reader that dispatches
//! inbound frames. Only the connection holding the session's current ticket
//! may write; a newer connection for the same token displaces it.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};

use chat_bridge_agent_runtime::UserInput;
use chat_bridge_error::BridgeError;

use crate::protocol::{
    parse_client_envelope, ClientEnvelope, Command, ConnectionStatus, ServerEnvelope,
};
use crate::session::{Attachment, Session, SessionManager};

const DIRECT_QUEUE_DEPTH: usize = 32;
/// Upper bound for courtesy writes (close frames, final error replies) to a
/// peer that may have stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterExit {
    /// Outbound queue closed and drained: the agent is done or the session closed.
    Drained,
    /// A newer connection owns the session.
    Displaced,
    SocketFailed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderExit {
    ClientClosed,
    TransportError,
    Stop,
    Reset,
    WriterDone,
}

enum FrameAction {
    Continue,
    Exit(ReaderExit),
}

pub async fn serve_socket(
    socket: WebSocket,
    manager: Arc<SessionManager>,
    browser_session_id: Option<String>,
) {
    let (mut sink, mut stream) = socket.split();
    let mut attachment = match manager.attach(browser_session_id.as_deref()) {
        Ok(attachment) => attachment,
        Err(err) => {
            tracing::error!(error = %err, "failed to attach session");
            let _ = tokio::time::timeout(
                CLOSE_TIMEOUT,
                send_envelope(&mut sink, &ServerEnvelope::error(&err)),
            )
            .await;
            close_socket(&mut sink).await;
            return;
        }
    };

    loop {
        match run_connection(&manager, attachment, sink, &mut stream).await {
            Some((next, next_sink)) => {
                attachment = next;
                sink = next_sink;
            }
            None => break,
        }
    }
}

/// Runs one attachment. Returns the next attachment when the client asked for a reset.
async fn run_connection(
    manager: &Arc<SessionManager>,
    attachment: Attachment,
    mut sink: WsSink,
    stream: &mut WsStream,
) -> Option<(Attachment, WsSink)> {
    let Attachment {
        session,
        ticket,
        resumed,
    } = attachment;

    let greeting = ServerEnvelope::Connection {
        status: ConnectionStatus::Connected,
        session_id: session.id().to_string(),
        message: Some(if resumed {
            "Reconnected to chat session".to_string()
        } else {
            "Connected to chat server".to_string()
        }),
        resumed,
    };
    if let Err(err) = send_envelope(&mut sink, &greeting).await {
        tracing::warn!(session_id = %session.id(), error = %err, "failed to send connection envelope");
        manager.disconnect(&session, ticket);
        return None;
    }
    tracing::info!(session_id = %session.id(), ticket, resumed, "client connected");

    let (direct_tx, direct_rx) = mpsc::channel(DIRECT_QUEUE_DEPTH);
    let (stop_tx, stop_rx) = oneshot::channel();
    let mut writer = tokio::spawn(pump_outbound(
        sink,
        session.clone(),
        ticket,
        direct_rx,
        stop_rx,
    ));

    let (reader_exit, finished) = loop {
        tokio::select! {
            result = &mut writer => break (ReaderExit::WriterDone, Some(result)),
            frame = stream.next() => {
                let action = match frame {
                    Some(Ok(Message::Text(text))) => handle_frame(&session, &text, &direct_tx).await,
                    Some(Ok(Message::Binary(_))) => {
                        let err = BridgeError::InvalidEnvelope {
                            message: "binary frames are not supported".to_string(),
                        };
                        let _ = direct_tx.send(ServerEnvelope::error(&err)).await;
                        FrameAction::Continue
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => FrameAction::Continue,
                    Some(Ok(Message::Close(_))) | None => FrameAction::Exit(ReaderExit::ClientClosed),
                    Some(Err(err)) => {
                        tracing::warn!(session_id = %session.id(), error = %err, "websocket read failed");
                        FrameAction::Exit(ReaderExit::TransportError)
                    }
                };
                if let FrameAction::Exit(exit) = action {
                    break (exit, None);
                }
            }
        }
    };
    drop(direct_tx);

    let joined = match finished {
        Some(result) => result,
        None => {
            let _ = stop_tx.send(());
            writer.await
        }
    };
    let (mut sink, writer_exit) = match joined {
        Ok(done) => done,
        Err(err) => {
            tracing::error!(session_id = %session.id(), error = %err, "writer task failed");
            manager.disconnect(&session, ticket);
            return None;
        }
    };
    tracing::debug!(
        session_id = %session.id(),
        reader = ?reader_exit,
        writer = ?writer_exit,
        "connection loop ended"
    );

    match (reader_exit, writer_exit) {
        (_, WriterExit::Drained) => {
            close_socket(&mut sink).await;
            manager.close(&session).await;
            None
        }
        (_, WriterExit::Displaced) => {
            close_socket(&mut sink).await;
            None
        }
        (ReaderExit::Stop, _) => {
            manager.close(&session).await;
            close_socket(&mut sink).await;
            None
        }
        (ReaderExit::Reset, _) => match manager.reset(&session).await {
            Ok(next) => {
                tracing::info!(
                    previous_session_id = %session.id(),
                    session_id = %next.session.id(),
                    "session reset"
                );
                Some((next, sink))
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to reset session");
                let _ = tokio::time::timeout(
                    CLOSE_TIMEOUT,
                    send_envelope(&mut sink, &ServerEnvelope::error(&err)),
                )
                .await;
                close_socket(&mut sink).await;
                None
            }
        },
        (ReaderExit::TransportError, _) => {
            manager.disconnect(&session, ticket);
            close_socket(&mut sink).await;
            None
        }
        _ => {
            manager.disconnect(&session, ticket);
            None
        }
    }
}

async fn handle_frame(
    session: &Session,
    text: &str,
    direct_tx: &mpsc::Sender<ServerEnvelope>,
) -> FrameAction {
    let envelope = match parse_client_envelope(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(session_id = %session.id(), error = %err, "rejected inbound frame");
            let _ = direct_tx.send(ServerEnvelope::error(&err)).await;
            // Frames that are not JSON at all mean the peer is not speaking the protocol.
            if serde_json::from_str::<serde_json::Value>(text).is_err() {
                return FrameAction::Exit(ReaderExit::TransportError);
            }
            return FrameAction::Continue;
        }
    };

    let input = match envelope {
        ClientEnvelope::Ping => {
            let _ = direct_tx.send(ServerEnvelope::Pong).await;
            return FrameAction::Continue;
        }
        ClientEnvelope::Command { command } => match command {
            Command::Stop => return FrameAction::Exit(ReaderExit::Stop),
            Command::Reset => return FrameAction::Exit(ReaderExit::Reset),
            Command::Clear => UserInput::ClearHistory,
        },
        ClientEnvelope::Message {
            content,
            session_id,
        } => {
            if let Some(claimed) = session_id.as_deref() {
                if claimed != session.id() {
                    tracing::debug!(
                        session_id = %session.id(),
                        claimed_session_id = %claimed,
                        "inbound message names a different session"
                    );
                }
            }
            if content.trim().is_empty() {
                return FrameAction::Continue;
            }
            UserInput::Text(content)
        }
    };

    if let Err(err) = session.bridge().deliver_input(input) {
        tracing::warn!(session_id = %session.id(), error = %err, "input rejected");
        let _ = direct_tx.send(ServerEnvelope::error(&err)).await;
    }
    FrameAction::Continue
}

enum Outgoing {
    /// Reply to this connection only; lost if the connection goes away.
    Direct(ServerEnvelope),
    /// Head of the session queue; stays queued until the write succeeds.
    Session(ServerEnvelope),
}

enum WriteOutcome {
    Sent,
    Failed(BridgeError),
    Interrupted(WriterExit),
}

/// Writes envelopes to the socket until the connection is displaced, the
/// socket fails, the reader asks it to stop or the outbound queue is drained.
///
/// The outbound lock is only held while waiting for the next envelope, never
/// across a socket write, so a peer that stops reading cannot stall a newer
/// connection or session teardown.
async fn pump_outbound(
    mut sink: WsSink,
    session: Arc<Session>,
    ticket: u64,
    mut direct_rx: mpsc::Receiver<ServerEnvelope>,
    mut stop_rx: oneshot::Receiver<()>,
) -> (WsSink, WriterExit) {
    let mut generation = session.subscribe_generation();
    loop {
        if *generation.borrow_and_update() != ticket {
            return (sink, WriterExit::Displaced);
        }
        let outgoing = {
            let mut outbound = tokio::select! {
                biased;
                _ = generation.changed() => continue,
                guard = session.outbound().lock() => guard,
            };
            tokio::select! {
                biased;
                _ = generation.changed() => continue,
                _ = &mut stop_rx => {
                    drop(outbound);
                    while let Ok(envelope) = direct_rx.try_recv() {
                        let flushed =
                            tokio::time::timeout(CLOSE_TIMEOUT, send_envelope(&mut sink, &envelope)).await;
                        if !matches!(flushed, Ok(Ok(()))) {
                            return (sink, WriterExit::SocketFailed);
                        }
                    }
                    return (sink, WriterExit::Stopped);
                }
                Some(envelope) = direct_rx.recv() => Outgoing::Direct(envelope),
                next = outbound.peek() => match next {
                    Some(envelope) => Outgoing::Session(envelope),
                    None => return (sink, WriterExit::Drained),
                },
            }
        };

        let envelope = match &outgoing {
            Outgoing::Direct(envelope) | Outgoing::Session(envelope) => envelope,
        };
        let outcome = tokio::select! {
            biased;
            result = send_envelope(&mut sink, envelope) => match result {
                Ok(()) => WriteOutcome::Sent,
                Err(err) => WriteOutcome::Failed(err),
            },
            _ = generation.changed() => WriteOutcome::Interrupted(WriterExit::Displaced),
            _ = &mut stop_rx => WriteOutcome::Interrupted(WriterExit::Stopped),
        };

        match outcome {
            WriteOutcome::Sent => {
                if let Outgoing::Session(_) = outgoing {
                    if !commit_delivered(&session, ticket, &mut generation).await {
                        return (sink, WriterExit::Displaced);
                    }
                }
            }
            WriteOutcome::Failed(err) => {
                tracing::debug!(
                    session_id = %session.id(),
                    kind = envelope.kind(),
                    error = %err,
                    "socket write failed; keeping envelope for the next connection"
                );
                return (sink, WriterExit::SocketFailed);
            }
            WriteOutcome::Interrupted(exit) => {
                tracing::debug!(
                    session_id = %session.id(),
                    kind = envelope.kind(),
                    exit = ?exit,
                    "abandoned socket write"
                );
                return (sink, exit);
            }
        }
    }
}

/// Pops the envelope just written, unless a newer connection took over in the
/// meantime; that connection re-sends it instead.
async fn commit_delivered(
    session: &Session,
    ticket: u64,
    generation: &mut watch::Receiver<u64>,
) -> bool {
    let mut outbound = tokio::select! {
        biased;
        _ = generation.changed() => return false,
        guard = session.outbound().lock() => guard,
    };
    if session.current_generation() != ticket {
        return false;
    }
    outbound.commit();
    true
}

async fn close_socket(sink: &mut WsSink) {
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
}

async fn send_envelope(sink: &mut WsSink, envelope: &ServerEnvelope) -> Result<(), BridgeError> {
    let text = serde_json::to_string(envelope).map_err(|err| BridgeError::Transport {
        message: err.to_string(),
    })?;
    sink.send(Message::Text(text))
        .await
        .map_err(|err| BridgeError::Transport {
            message: err.to_string(),
        })
}
