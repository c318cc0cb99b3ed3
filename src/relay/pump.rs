//! Per-session tasks
//!
//! Each session runs two writers (one per leg), two pumps and a heartbeat.
//! Every task watches the session's close signal, so teardown requested by
//! any of them stops all of them.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use super::session::{Leg, VoiceSession};
use crate::protocol::{AudioFrame, CloseReason, ConnectionState, ControlMessage, close_code};
use crate::upstream::{InboundEvent, UpstreamBridge, UpstreamSink, UpstreamStream, WireMessage};

/// Liveness probing of the client leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

pub(crate) fn close_frame(reason: &CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code,
        reason: reason.reason.clone().into(),
    }))
}

/// `error` control frame sent ahead of a close that is not a normal ending
pub(crate) fn error_notice(reason: &CloseReason) -> Option<Message> {
    if matches!(reason.code, close_code::NORMAL | close_code::AWAY) {
        return None;
    }
    Some(control(&ControlMessage::Error {
        message: reason.reason.clone(),
    }))
}

fn control(message: &ControlMessage) -> Message {
    Message::Text(message.to_json().into())
}

/// Drain the client queue into the socket, then send the close frame
///
/// Frames queued before teardown are still delivered ahead of the close.
pub(crate) async fn client_writer(
    session: Arc<VoiceSession>,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    let reason = loop {
        tokio::select! {
            biased;
            reason = session.closed() => break reason,
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        tracing::debug!(session_id = %session.id, error = %e, "client write failed");
                        session.close(CloseReason::away("client connection lost"));
                    }
                }
                None => break session.closed().await,
            },
        }
    };

    let mut open = true;
    while let Ok(msg) = rx.try_recv() {
        if sink.send(msg).await.is_err() {
            open = false;
            break;
        }
    }

    if open {
        if let Some(notice) = error_notice(&reason) {
            open = sink.send(notice).await.is_ok();
        }
    }
    if open && sink.send(close_frame(&reason)).await.is_ok() {
        let _ = sink.close().await;
    }
    session.mark_leg(Leg::Client, ConnectionState::Closed);
}

/// Drain the upstream queue into the upstream sink, then close it
pub(crate) async fn upstream_writer(
    session: Arc<VoiceSession>,
    mut sink: UpstreamSink,
    mut rx: mpsc::Receiver<WireMessage>,
) {
    let reason = loop {
        tokio::select! {
            biased;
            reason = session.closed() => break reason,
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        tracing::warn!(session_id = %session.id, error = %e, "upstream write failed");
                        session.close(CloseReason::internal(e.to_string()));
                    }
                }
                None => break session.closed().await,
            },
        }
    };

    let mut open = true;
    while let Ok(msg) = rx.try_recv() {
        if sink.send(msg).await.is_err() {
            open = false;
            break;
        }
    }

    // The upstream may already have closed; a failed close frame is expected then
    if open && sink.send(WireMessage::Close(Some(reason))).await.is_ok() {
        let _ = sink.close().await;
    }
    session.mark_leg(Leg::Upstream, ConnectionState::Closed);
}

/// Upstream toward client
pub(crate) async fn upstream_to_client(
    session: Arc<VoiceSession>,
    bridge: UpstreamBridge,
    mut stream: UpstreamStream,
    client_tx: mpsc::Sender<Message>,
    upstream_tx: mpsc::Sender<WireMessage>,
) {
    let mut sequence: u64 = 0;
    loop {
        let item = tokio::select! {
            _ = session.closed() => return,
            item = stream.next() => item,
        };

        let raw: Bytes = match item {
            Some(Ok(WireMessage::Text(text))) => Bytes::from(text),
            Some(Ok(WireMessage::Binary(data))) => data,
            Some(Ok(WireMessage::Close(reason))) => {
                let reason = reason.unwrap_or_else(|| CloseReason::normal("upstream closed"));
                tracing::info!(session_id = %session.id, code = reason.code, "upstream closed the session");
                session.close(reason);
                return;
            }
            Some(Err(e)) => {
                tracing::warn!(session_id = %session.id, error = %e, "upstream read failed");
                session.close(CloseReason::internal(e.to_string()));
                return;
            }
            None => {
                session.close(CloseReason::normal("upstream disconnected"));
                return;
            }
        };

        let events = match bridge.decode_inbound_message(&raw) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "dropping malformed upstream message");
                continue;
            }
        };

        for event in events {
            let delivered = match event {
                InboundEvent::Audio(data) => {
                    let frame = AudioFrame::inbound(sequence, data);
                    sequence += 1;
                    tracing::trace!(session_id = %session.id, seq = frame.sequence, samples = frame.sample_count(), "speech chunk");
                    client_tx.send(Message::Binary(frame.data)).await.is_ok()
                }
                InboundEvent::Text(text) => client_tx
                    .send(control(&ControlMessage::TextUtterance { text }))
                    .await
                    .is_ok(),
                InboundEvent::TurnComplete => client_tx
                    .send(control(&ControlMessage::TurnComplete))
                    .await
                    .is_ok(),
                InboundEvent::SetupComplete => {
                    tracing::debug!(session_id = %session.id, "upstream setup complete");
                    client_tx.send(control(&ControlMessage::SetupAck)).await.is_ok()
                        && upstream_tx.send(bridge.greeting_turn()).await.is_ok()
                }
                InboundEvent::Unparsed(text) => {
                    client_tx.send(Message::Text(text.into())).await.is_ok()
                }
            };
            if !delivered {
                // Writer is gone, so the session is already tearing down
                return;
            }
        }
    }
}

/// Client toward upstream
pub(crate) async fn client_to_upstream(
    session: Arc<VoiceSession>,
    bridge: UpstreamBridge,
    mut stream: SplitStream<WebSocket>,
    upstream_tx: mpsc::Sender<WireMessage>,
    pongs: watch::Sender<u64>,
) {
    let mut sequence: u64 = 0;
    loop {
        let item = tokio::select! {
            _ = session.closed() => return,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(Message::Binary(data))) => {
                let frame = AudioFrame::outbound(sequence, data);
                sequence += 1;
                if upstream_tx.send(bridge.wrap_outbound_audio(&frame)).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Text(text))) => {
                if session.status().upstream != ConnectionState::Open {
                    tracing::debug!(session_id = %session.id, "upstream not ready, dropping client text");
                    continue;
                }
                if upstream_tx
                    .send(WireMessage::Text(text.as_str().to_owned()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(Ok(Message::Pong(_))) => {
                pongs.send_modify(|n| *n = n.wrapping_add(1));
            }
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map_or_else(
                    || CloseReason::normal("client closed"),
                    |f| CloseReason::new(f.code, f.reason.as_str()),
                );
                tracing::info!(session_id = %session.id, code = reason.code, "client closed the session");
                session.close(reason);
                return;
            }
            Some(Err(e)) => {
                tracing::debug!(session_id = %session.id, error = %e, "client read failed");
                session.close(CloseReason::away("client connection lost"));
                return;
            }
            None => {
                session.close(CloseReason::away("client disconnected"));
                return;
            }
        }
    }
}

/// Ping the client and close the session when a pong is overdue
///
/// Pongs are read by the client pump, which blocks while the upstream queue
/// is full. A missed pong with that queue full is charged to the upstream.
pub(crate) async fn heartbeat(
    session: Arc<VoiceSession>,
    config: HeartbeatConfig,
    client_tx: mpsc::Sender<Message>,
    upstream_tx: mpsc::Sender<WireMessage>,
    mut pongs: watch::Receiver<u64>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = session.closed() => return,
            _ = ticker.tick() => {}
        }

        pongs.mark_unchanged();
        if client_tx.send(Message::Ping(Bytes::new())).await.is_err() {
            return;
        }

        let answered = tokio::select! {
            _ = session.closed() => return,
            answered = tokio::time::timeout(config.timeout, pongs.changed()) => answered,
        };
        match answered {
            Ok(Ok(())) => tracing::trace!(session_id = %session.id, "pong"),
            // Pump exited; it already decided how the session ends
            Ok(Err(_)) => return,
            Err(_) if upstream_tx.capacity() == 0 => {
                tracing::warn!(session_id = %session.id, "upstream stalled, client pongs unread");
                session.close(CloseReason::internal("upstream stalled"));
                return;
            }
            Err(_) => {
                tracing::warn!(session_id = %session.id, "client heartbeat timed out");
                session.close(CloseReason::away("heartbeat timeout"));
                return;
            }
        }
    }
}
