//! Shared test utilities

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use sous_gateway::api::ApiServerBuilder;
use sous_gateway::auth::StaticTokenAuthenticator;
use sous_gateway::relay::HeartbeatConfig;
use sous_gateway::store::{MemoryRecipeStore, RecipeContext};
use sous_gateway::upstream::{
    UpstreamBridge, UpstreamConnector, UpstreamLeg, UpstreamSink, WireMessage,
};
use sous_gateway::{ControlMessage, Error, RelaySessionManager, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

pub const TOKEN: &str = "test-token";
pub const USER: &str = "user-1";

const WAIT: Duration = Duration::from_secs(5);

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Create a recipe with a few steps
pub fn recipe(title: &str) -> RecipeContext {
    RecipeContext {
        recipe_id: Uuid::new_v4(),
        title: title.to_string(),
        ingredients: vec!["tomatoes".to_string(), "onion".to_string(), "stock".to_string()],
        steps: vec![
            "Dice the onion".to_string(),
            "Soften the onion in oil".to_string(),
            "Add tomatoes and stock, then simmer".to_string(),
            "Blend until smooth".to_string(),
        ],
    }
}

/// Query string for a session on `recipe_id`
pub fn session_query(recipe_id: Uuid, step_index: u32) -> String {
    format!("recipeId={recipe_id}&stepIndex={step_index}")
}

/// The far end of one upstream leg
pub struct UpstreamPeer {
    sent: fmpsc::UnboundedReceiver<WireMessage>,
    inject: fmpsc::UnboundedSender<Result<WireMessage>>,
}

impl UpstreamPeer {
    /// Next message the relay sent upstream
    pub async fn next_sent(&mut self) -> WireMessage {
        tokio::time::timeout(WAIT, self.sent.next())
            .await
            .expect("upstream message in time")
            .expect("upstream leg still open")
    }

    /// Next message the relay sent upstream, parsed as JSON
    pub async fn next_json(&mut self) -> serde_json::Value {
        match self.next_sent().await {
            WireMessage::Text(text) => serde_json::from_str(&text).expect("upstream JSON"),
            other => panic!("expected a text envelope, got {other:?}"),
        }
    }

    /// Deliver a message as if the upstream sent it
    pub fn inject(&self, message: WireMessage) {
        self.inject
            .unbounded_send(Ok(message))
            .expect("relay still reading");
    }

    /// Break the upstream connection
    pub fn fail(&self, error: Error) {
        self.inject
            .unbounded_send(Err(error))
            .expect("relay still reading");
    }
}

/// Upstream connector backed by in-process channels
pub struct FakeConnector {
    configured: bool,
    /// Accept the setup envelope, then never finish another write
    stalls: bool,
    connects: AtomicUsize,
    peers: mpsc::UnboundedSender<UpstreamPeer>,
}

impl FakeConnector {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamConnector for FakeConnector {
    async fn connect(&self, _session_id: Uuid) -> Result<UpstreamLeg> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (sent_tx, sent_rx) = fmpsc::unbounded();
        let (inject_tx, inject_rx) = fmpsc::unbounded();
        let _ = self.peers.send(UpstreamPeer {
            sent: sent_rx,
            inject: inject_tx,
        });

        let sink: UpstreamSink = if self.stalls {
            Box::pin(futures::sink::unfold(
                (sent_tx, 0usize),
                |(tx, written), msg: WireMessage| async move {
                    let _ = tx.unbounded_send(msg);
                    if written > 0 {
                        futures::future::pending::<()>().await;
                    }
                    Ok::<_, Error>((tx, written + 1))
                },
            ))
        } else {
            Box::pin(sent_tx.sink_map_err(|e| Error::Upstream(e.to_string())))
        };

        Ok(UpstreamLeg {
            sink,
            stream: Box::pin(inject_rx),
        })
    }

    fn is_configured(&self) -> bool {
        self.configured
    }
}

/// A relay listening on a local port
pub struct TestRelay {
    pub addr: SocketAddr,
    pub manager: Arc<RelaySessionManager>,
    pub connector: Arc<FakeConnector>,
    peers: mpsc::UnboundedReceiver<UpstreamPeer>,
}

impl TestRelay {
    pub async fn start(store: MemoryRecipeStore) -> Self {
        Self::start_with(store, HeartbeatConfig::default(), true).await
    }

    pub async fn start_with(
        store: MemoryRecipeStore,
        heartbeat: HeartbeatConfig,
        configured: bool,
    ) -> Self {
        Self::launch(store, heartbeat, configured, false).await
    }

    /// Relay whose upstream stops accepting writes once primed
    pub async fn start_stalled(store: MemoryRecipeStore, heartbeat: HeartbeatConfig) -> Self {
        Self::launch(store, heartbeat, true, true).await
    }

    async fn launch(
        store: MemoryRecipeStore,
        heartbeat: HeartbeatConfig,
        configured: bool,
        stalls: bool,
    ) -> Self {
        let (peers_tx, peers) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector {
            configured,
            stalls,
            connects: AtomicUsize::new(0),
            peers: peers_tx,
        });
        let auth = StaticTokenAuthenticator::new(StaticTokenAuthenticator::parse_pairs(&format!(
            "{TOKEN}:{USER},other-token:user-2"
        )));

        let manager = Arc::new(RelaySessionManager::new(
            Arc::new(store),
            Arc::new(auth),
            Arc::clone(&connector) as Arc<dyn UpstreamConnector>,
            UpstreamBridge::default(),
            heartbeat,
        ));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        let server = ApiServerBuilder::new(Arc::clone(&manager)).build();
        tokio::spawn(server.run_on(listener));

        Self {
            addr,
            manager,
            connector,
            peers,
        }
    }

    /// Open a client connection to `/live-cooking`
    pub async fn connect(&self, query: &str, token: Option<&str>) -> Client {
        let mut request = format!("ws://{}/live-cooking?{query}", self.addr)
            .into_client_request()
            .expect("valid request");
        if let Some(token) = token {
            request.headers_mut().insert(
                "authorization",
                format!("Bearer {token}").parse().expect("valid header"),
            );
        }
        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .expect("websocket handshake");
        ws
    }

    /// The upstream leg opened for the next session
    pub async fn next_upstream(&mut self) -> UpstreamPeer {
        tokio::time::timeout(WAIT, self.peers.recv())
            .await
            .expect("upstream connect in time")
            .expect("connector alive")
    }

    /// Wait until exactly `n` sessions are registered
    pub async fn wait_for_sessions(&self, n: usize) {
        let registry = self.manager.registry();
        tokio::time::timeout(WAIT, async {
            while registry.len().await != n {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {n} live sessions"));
    }
}

/// Next text or binary message, skipping pings
pub async fn next_data(ws: &mut Client) -> Message {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => return msg,
                Some(Ok(Message::Close(frame))) => panic!("closed early: {frame:?}"),
                Some(Ok(_)) => {}
                Some(Err(e)) => panic!("socket error: {e}"),
                None => panic!("socket ended"),
            }
        }
    })
    .await
    .expect("message in time")
}

/// Next control message
pub async fn next_control(ws: &mut Client) -> ControlMessage {
    match next_data(ws).await {
        Message::Text(text) => ControlMessage::parse(text.as_str()).expect("control message"),
        other => panic!("expected a control message, got {other:?}"),
    }
}

/// Read until the close frame, returning its code and reason
pub async fn expect_close(ws: &mut Client) -> (u16, String) {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(Some(frame)))) => {
                    return (u16::from(frame.code), frame.reason.to_string());
                }
                Some(Ok(Message::Close(None))) => panic!("close frame without a code"),
                Some(Ok(_)) => {}
                Some(Err(e)) => panic!("socket error before close: {e}"),
                None => panic!("socket ended without a close frame"),
            }
        }
    })
    .await
    .expect("close frame in time")
}
