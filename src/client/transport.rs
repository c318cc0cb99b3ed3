//! Client side of a live session
//!
//! One duplex connection to the relay. The transport counts as connected
//! only once the relay has sent something, since the relay accepts the
//! socket before its upstream leg is ready.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use url::Url;
use uuid::Uuid;

use crate::protocol::{AudioFrame, CloseReason, ConnectionState, ControlMessage};
use crate::{Error, Result};

/// Outbound frames buffered before new ones are dropped
const OUTBOUND_QUEUE: usize = 64;

/// Inbound events buffered before the reader waits
const INBOUND_QUEUE: usize = 256;

/// How long `close` waits for the relay's close frame
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Identifies the conversation being opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub recipe_id: Uuid,
    pub step_index: u32,
    pub version_id: Option<Uuid>,
}

/// Something received from the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Speech to play
    Audio(AudioFrame),
    Control(ControlMessage),
}

/// Build the `/live-cooking` endpoint for `params` under `base`
///
/// # Errors
///
/// Returns error if `base` is not a valid URL
pub fn live_cooking_url(base: &str, params: &SessionParams) -> Result<Url> {
    let mut url = Url::parse(base)
        .and_then(|b| b.join("/live-cooking"))
        .map_err(|e| Error::Config(format!("invalid relay url {base}: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("recipeId", &params.recipe_id.to_string());
        query.append_pair("stepIndex", &params.step_index.to_string());
        if let Some(version_id) = params.version_id {
            query.append_pair("versionId", &version_id.to_string());
        }
    }
    Ok(url)
}

/// Non-blocking handle for submitting audio, safe to use from the capture
/// callback
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Message>,
    state: watch::Receiver<ConnectionState>,
}

impl FrameSender {
    /// Queue a frame; returns false if it was dropped
    pub fn send(&self, frame: AudioFrame) -> bool {
        if *self.state.borrow() != ConnectionState::Open {
            tracing::warn!(seq = frame.sequence, "transport not open, dropping frame");
            return false;
        }
        match self.tx.try_send(Message::Binary(frame.data)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(seq = frame.sequence, "send queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// One persistent connection to the relay
pub struct ClientSessionTransport {
    state: watch::Sender<ConnectionState>,
    outbound: Option<mpsc::Sender<Message>>,
    close_tx: Option<mpsc::Sender<CloseReason>>,
    task: Option<JoinHandle<()>>,
}

impl Default for ClientSessionTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSessionTransport {
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            state,
            outbound: None,
            close_tx: None,
            task: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Follow state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Open the connection and start receiving
    ///
    /// A transport that ended in `Closed` or `Failed` may be connected again;
    /// it never reconnects on its own.
    ///
    /// # Errors
    ///
    /// Returns error if already connected or the handshake fails
    pub async fn connect(
        &mut self,
        endpoint: &Url,
        token: &SecretString,
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        let current = self.state();
        if current.is_terminal() {
            self.state.send_replace(ConnectionState::Idle);
        } else if current != ConnectionState::Idle {
            return Err(Error::Transport(format!("cannot connect while {current}")));
        }
        transition(&self.state, ConnectionState::Connecting);

        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| self.fail(format!("invalid endpoint: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|e| self.fail(format!("invalid token: {e}")))?;
        request.headers_mut().insert("authorization", bearer);

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| self.fail(format!("connect failed: {e}")))?;
        tracing::debug!(endpoint = %endpoint.path(), "relay socket accepted");

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (close_tx, close_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::channel(INBOUND_QUEUE);

        self.outbound = Some(outbound_tx);
        self.close_tx = Some(close_tx);
        self.task = Some(tokio::spawn(drive(
            ws,
            self.state.clone(),
            outbound_rx,
            close_rx,
            events_tx,
        )));

        Ok(events_rx)
    }

    /// Sender for outbound audio, `None` before `connect`
    #[must_use]
    pub fn sender(&self) -> Option<FrameSender> {
        self.outbound.as_ref().map(|tx| FrameSender {
            tx: tx.clone(),
            state: self.state.subscribe(),
        })
    }

    /// Close the connection without surfacing an error
    pub async fn close(&mut self, code: u16, reason: &str) {
        let current = self.state();
        if !matches!(current, ConnectionState::Connecting | ConnectionState::Open) {
            return;
        }
        transition(&self.state, ConnectionState::Closing);
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.try_send(CloseReason::new(code, reason));
        }

        let mut rx = self.state.subscribe();
        let closed = tokio::time::timeout(CLOSE_TIMEOUT, rx.wait_for(ConnectionState::is_terminal));
        if closed.await.is_err() {
            tracing::debug!("relay did not confirm close");
            if let Some(task) = self.task.take() {
                task.abort();
            }
            transition(&self.state, ConnectionState::Closed);
        }
        self.outbound = None;
    }

    fn fail(&self, reason: String) -> Error {
        tracing::warn!(%reason, "live connection failed");
        transition(&self.state, ConnectionState::Failed(reason.clone()));
        Error::Transport(reason)
    }
}

impl Drop for ClientSessionTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn transition(state: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
    state.send_if_modified(|current| {
        if current.can_transition_to(&next) {
            tracing::debug!(from = %current, to = %next, "transport state");
            *current = next.clone();
            true
        } else {
            false
        }
    })
}

type RelaySocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn drive(
    ws: RelaySocket,
    state: watch::Sender<ConnectionState>,
    mut outbound: mpsc::Receiver<Message>,
    mut close_rx: mpsc::Receiver<CloseReason>,
    events: mpsc::Sender<TransportEvent>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            Some(reason) = close_rx.recv() => {
                let frame = CloseFrame {
                    code: CloseCode::from(reason.code),
                    reason: reason.reason.into(),
                };
                if ws_tx.send(Message::Close(Some(frame))).await.is_err() {
                    transition(&state, ConnectionState::Closed);
                    return;
                }
            }
            Some(msg) = outbound.recv() => {
                if let Err(e) = ws_tx.send(msg).await {
                    tracing::warn!(error = %e, "send to relay failed");
                }
            }
            incoming = ws_rx.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        end(&state, format!("transport error: {e}"));
                        return;
                    }
                    None => {
                        end(&state, "connection lost".to_string());
                        return;
                    }
                };

                if *state.borrow() == ConnectionState::Connecting
                    && matches!(msg, Message::Text(_) | Message::Binary(_))
                {
                    transition(&state, ConnectionState::Open);
                }

                match msg {
                    Message::Binary(data) => {
                        let frame = AudioFrame::inbound(sequence, data);
                        sequence += 1;
                        if events.send(TransportEvent::Audio(frame)).await.is_err() {
                            tracing::debug!("event receiver dropped");
                        }
                    }
                    Message::Text(text) => match ControlMessage::parse(text.as_str()) {
                        Ok(control) => {
                            let _ = events.send(TransportEvent::Control(control)).await;
                        }
                        Err(e) => tracing::debug!(error = %e, "ignoring unrecognized text frame"),
                    },
                    Message::Close(frame) => {
                        let reason = frame.map_or_else(
                            || CloseReason::normal(""),
                            |f| CloseReason::new(u16::from(f.code), f.reason.as_str()),
                        );
                        end(&state, format!("closed by relay: {reason}"));
                        return;
                    }
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
        }
    }
}

/// Closed if we asked for it, Failed otherwise
fn end(state: &watch::Sender<ConnectionState>, reason: String) {
    if *state.borrow() == ConnectionState::Closing {
        transition(state, ConnectionState::Closed);
    } else {
        tracing::warn!(%reason, "live connection ended unexpectedly");
        transition(state, ConnectionState::Failed(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_carries_session_params() {
        let recipe_id = Uuid::new_v4();
        let version_id = Uuid::new_v4();
        let url = live_cooking_url(
            "wss://relay.example.com/",
            &SessionParams {
                recipe_id,
                step_index: 2,
                version_id: Some(version_id),
            },
        )
        .unwrap();

        assert_eq!(url.path(), "/live-cooking");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("recipeId".to_string(), recipe_id.to_string()),
                ("stepIndex".to_string(), "2".to_string()),
                ("versionId".to_string(), version_id.to_string()),
            ]
        );

        assert!(live_cooking_url("not a url", &SessionParams {
            recipe_id,
            step_index: 0,
            version_id: None,
        })
        .is_err());
    }

    #[test]
    fn new_transport_is_idle_without_sender() {
        let transport = ClientSessionTransport::new();
        assert_eq!(transport.state(), ConnectionState::Idle);
        assert!(transport.sender().is_none());
    }
}
