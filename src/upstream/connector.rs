//! WebSocket connector for the live upstream endpoint

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use secrecy::ExposeSecret;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use uuid::Uuid;

use super::credentials::{CredentialCache, CredentialKind};
use super::{UpstreamConnector, UpstreamLeg, WireMessage};
use crate::protocol::CloseReason;
use crate::{Error, Result};

/// Public live endpoint
pub const DEFAULT_UPSTREAM_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Connects to the upstream over `tokio-tungstenite`
pub struct GeminiConnector {
    url: Url,
    credentials: Option<Arc<CredentialCache>>,
}

impl GeminiConnector {
    #[must_use]
    pub const fn new(url: Url, credentials: Option<Arc<CredentialCache>>) -> Self {
        Self { url, credentials }
    }
}

#[async_trait]
impl UpstreamConnector for GeminiConnector {
    async fn connect(&self, session_id: Uuid) -> Result<UpstreamLeg> {
        let cache = self
            .credentials
            .as_ref()
            .ok_or_else(|| Error::Config("no upstream credentials configured".to_string()))?;
        let credential = cache.get().await?;

        let mut url = self.url.clone();
        if credential.kind == CredentialKind::ApiKey {
            url.query_pairs_mut()
                .append_pair("key", credential.secret.expose_secret());
        }

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Config(format!("invalid upstream url: {e}")))?;
        if credential.kind == CredentialKind::Bearer {
            let value = HeaderValue::from_str(&format!(
                "Bearer {}",
                credential.secret.expose_secret()
            ))
            .map_err(|e| Error::Config(format!("invalid bearer credential: {e}")))?;
            request.headers_mut().insert("authorization", value);
        }

        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;

        tracing::debug!(
            session_id = %session_id,
            host = self.url.host_str().unwrap_or_default(),
            status = %response.status(),
            "upstream connected"
        );

        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(|e| Error::Upstream(e.to_string()))
            .with(|msg: WireMessage| future::ready(Ok::<_, Error>(to_tungstenite(msg))));
        let stream = stream.filter_map(|item| {
            future::ready(match item {
                Ok(msg) => from_tungstenite(msg).map(Ok),
                Err(e) => Some(Err(Error::Upstream(e.to_string()))),
            })
        });

        Ok(UpstreamLeg {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }

    fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }
}

fn to_tungstenite(msg: WireMessage) -> Message {
    match msg {
        WireMessage::Text(text) => Message::Text(text.into()),
        WireMessage::Binary(data) => Message::Binary(data),
        WireMessage::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
            code: CloseCode::from(r.code),
            reason: r.reason.into(),
        })),
    }
}

/// Control frames are handled by tungstenite and not surfaced
fn from_tungstenite(msg: Message) -> Option<WireMessage> {
    match msg {
        Message::Text(text) => Some(WireMessage::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(WireMessage::Binary(data)),
        Message::Close(frame) => Some(WireMessage::Close(
            frame.map(|f| CloseReason::new(u16::from(f.code), f.reason.as_str())),
        )),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_credentials_fail_without_connecting() {
        let connector = GeminiConnector::new(Url::parse("ws://127.0.0.1:9/").unwrap(), None);
        assert!(!connector.is_configured());

        let err = connector.connect(Uuid::new_v4()).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn close_frames_round_trip_codes() {
        let msg = to_tungstenite(WireMessage::Close(Some(CloseReason::policy("bad recipe"))));
        let back = from_tungstenite(msg).unwrap();
        assert_eq!(back, WireMessage::Close(Some(CloseReason::policy("bad recipe"))));

        assert!(from_tungstenite(Message::Ping(Vec::new().into())).is_none());
    }
}
