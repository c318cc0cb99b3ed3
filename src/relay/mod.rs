//! Voice session relay
//!
//! Accepts client WebSocket connections, validates and authenticates them,
//! opens an upstream leg and runs the per-session pumps until either side
//! ends the conversation.

mod pump;
mod registry;
mod session;

use std::sync::{Arc, LazyLock};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use regex::Regex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::protocol::ConnectionState;
use crate::store::{RecipeContext, RecipeStore};
use crate::upstream::{ConversationContext, UpstreamBridge, UpstreamConnector, UpstreamLeg};
use crate::{Error, Result};

pub use pump::HeartbeatConfig;
pub use registry::{SessionRegistry, SessionSummary};
pub use session::{Leg, SessionLifecycle, SessionStatus, VoiceSession};

/// Frames buffered toward the client before the pumps wait
const CLIENT_QUEUE: usize = 256;

/// Envelopes buffered toward the upstream before the pumps wait
const UPSTREAM_QUEUE: usize = 256;

static RESOURCE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("valid regex")
});

/// Parameters of a `/live-cooking` connection
#[derive(Debug, Clone, Default)]
pub struct LiveRequest {
    pub recipe_id: Option<String>,
    pub step_index: Option<String>,
    pub version_id: Option<String>,
    /// Bearer credential from the header or query
    pub token: Option<String>,
}

/// Parse a hyphenated resource id
///
/// # Errors
///
/// Returns `Error::InvalidRequest` if the value is missing or not a UUID
pub fn parse_resource_id(raw: Option<&str>, name: &str) -> Result<Uuid> {
    let raw = raw
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::InvalidRequest(format!("missing {name}")))?;
    if !RESOURCE_ID.is_match(raw) {
        return Err(Error::InvalidRequest(format!("malformed {name}")));
    }
    Uuid::parse_str(raw).map_err(|_| Error::InvalidRequest(format!("malformed {name}")))
}

/// Parse the step index, falling back to the first step
#[must_use]
pub fn parse_step_index(raw: Option<&str>) -> u32 {
    match raw.filter(|v| !v.is_empty()) {
        None => 0,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(step_index = raw, "unparseable stepIndex, using 0");
            0
        }),
    }
}

/// Load the recipe context a session is primed with
///
/// A requested version wins over the recipe id. A version that belongs to a
/// different recipe is still used.
///
/// # Errors
///
/// Returns `Error::NotFound` if neither the version nor the recipe exists
pub async fn resolve_context(
    store: &dyn RecipeStore,
    recipe_id: Uuid,
    version_id: Option<Uuid>,
) -> Result<RecipeContext> {
    let Some(version_id) = version_id else {
        return store
            .get_recipe(recipe_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("recipe {recipe_id}")));
    };

    let version = store
        .get_recipe_version(version_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("recipe version {version_id}")))?;
    if version.recipe_id != recipe_id {
        tracing::warn!(
            requested = %recipe_id,
            parent = %version.recipe_id,
            version = %version_id,
            "version belongs to a different recipe, using the version"
        );
    }
    Ok(version.context)
}

/// Owns the shared collaborators and runs sessions
pub struct RelaySessionManager {
    store: Arc<dyn RecipeStore>,
    auth: Arc<dyn Authenticator>,
    connector: Arc<dyn UpstreamConnector>,
    bridge: UpstreamBridge,
    registry: Arc<SessionRegistry>,
    heartbeat: HeartbeatConfig,
}

impl RelaySessionManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn RecipeStore>,
        auth: Arc<dyn Authenticator>,
        connector: Arc<dyn UpstreamConnector>,
        bridge: UpstreamBridge,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        Self {
            store,
            auth,
            connector,
            bridge,
            registry: Arc::new(SessionRegistry::new()),
            heartbeat,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn is_upstream_configured(&self) -> bool {
        self.connector.is_configured()
    }

    /// Run one client connection to completion
    ///
    /// Rejected connections are closed with the error's close code before
    /// any upstream connection is attempted.
    pub async fn handle_connection(&self, socket: WebSocket, request: LiveRequest) {
        let (mut client_sink, client_stream) = socket.split();

        let (session, leg) = match self.open_session(&request).await {
            Ok(opened) => opened,
            Err(e) => {
                match &e {
                    Error::Config(_) => tracing::error!(error = %e, "relay is misconfigured"),
                    Error::InvalidRequest(_) | Error::Unauthorized(_) | Error::NotFound(_) => {
                        tracing::warn!(error = %e, "rejecting live session");
                    }
                    _ => tracing::error!(error = %e, "failed to open live session"),
                }
                let reason = e.close_reason();
                if let Some(notice) = pump::error_notice(&reason) {
                    if client_sink.send(notice).await.is_err() {
                        return;
                    }
                }
                if client_sink.send(pump::close_frame(&reason)).await.is_ok() {
                    let _ = client_sink.close().await;
                }
                return;
            }
        };

        self.run_session(session, client_sink, client_stream, leg)
            .await;
    }

    async fn open_session(&self, request: &LiveRequest) -> Result<(Arc<VoiceSession>, UpstreamLeg)> {
        let recipe_id = parse_resource_id(request.recipe_id.as_deref(), "recipeId")?;
        let version_id = match request.version_id.as_deref().filter(|v| !v.is_empty()) {
            Some(raw) => Some(parse_resource_id(Some(raw), "versionId")?),
            None => None,
        };
        let step_index = parse_step_index(request.step_index.as_deref());

        let token = request
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Unauthorized("missing bearer credential".to_string()))?;
        let user = self.auth.validate_token(token).await?;

        if !self.connector.is_configured() {
            return Err(Error::Config("upstream credentials are not configured".to_string()));
        }

        let recipe = resolve_context(self.store.as_ref(), recipe_id, version_id).await?;

        let session = Arc::new(VoiceSession::new(
            user.user_id,
            recipe_id,
            version_id,
            step_index,
        ));
        if let Some(previous) = self.registry.register(Arc::clone(&session)).await {
            tracing::info!(
                user_id = %session.user_id,
                previous = %previous.id,
                "superseding existing session"
            );
            previous.close(crate::protocol::CloseReason::normal(
                "superseded by a new connection",
            ));
            if tokio::time::timeout(self.heartbeat.timeout, previous.released())
                .await
                .is_err()
            {
                tracing::warn!(previous = %previous.id, "superseded session slow to release");
            }
        }

        match self.connect_upstream(&session, recipe, step_index).await {
            Ok(leg) => Ok((session, leg)),
            Err(e) => {
                session.release();
                self.registry.remove(&session).await;
                Err(e)
            }
        }
    }

    async fn connect_upstream(
        &self,
        session: &VoiceSession,
        recipe: RecipeContext,
        step_index: u32,
    ) -> Result<UpstreamLeg> {
        let mut leg = self.connector.connect(session.id).await?;
        let context = ConversationContext { recipe, step_index };
        leg.sink
            .send(self.bridge.build_setup_envelope(&context))
            .await?;
        session.mark_leg(Leg::Upstream, ConnectionState::Open);
        Ok(leg)
    }

    async fn run_session(
        &self,
        session: Arc<VoiceSession>,
        client_sink: futures::stream::SplitSink<WebSocket, Message>,
        client_stream: futures::stream::SplitStream<WebSocket>,
        leg: UpstreamLeg,
    ) {
        let (client_tx, client_rx) = mpsc::channel(CLIENT_QUEUE);
        let (upstream_tx, upstream_rx) = mpsc::channel(UPSTREAM_QUEUE);
        let (pong_tx, pong_rx) = watch::channel(0u64);

        session.mark_leg(Leg::Client, ConnectionState::Open);
        tracing::info!(
            session_id = %session.id,
            user_id = %session.user_id,
            recipe_id = %session.recipe_id,
            version_id = ?session.version_id,
            step_index = session.step_index,
            "live session started"
        );

        let mut tasks = vec![
            tokio::spawn(pump::client_writer(
                Arc::clone(&session),
                client_sink,
                client_rx,
            )),
            tokio::spawn(pump::upstream_writer(
                Arc::clone(&session),
                leg.sink,
                upstream_rx,
            )),
            tokio::spawn(pump::upstream_to_client(
                Arc::clone(&session),
                self.bridge.clone(),
                leg.stream,
                client_tx.clone(),
                upstream_tx.clone(),
            )),
            tokio::spawn(pump::client_to_upstream(
                Arc::clone(&session),
                self.bridge.clone(),
                client_stream,
                upstream_tx.clone(),
                pong_tx,
            )),
            tokio::spawn(pump::heartbeat(
                Arc::clone(&session),
                self.heartbeat,
                client_tx,
                upstream_tx,
                pong_rx,
            )),
        ];

        let reason = session.closed().await;

        // Writers flush their close frames; bound how long that may take
        let drained = tokio::time::timeout(
            self.heartbeat.timeout,
            futures::future::join_all(tasks.iter_mut()),
        )
        .await;
        if drained.is_err() {
            tracing::warn!(session_id = %session.id, "session tasks did not stop in time");
        }
        for task in &tasks {
            task.abort();
        }

        session.release();
        self.registry.remove(&session).await;

        let duration = chrono::Utc::now() - session.created_at;
        tracing::info!(
            session_id = %session.id,
            code = reason.code,
            reason = %reason.reason,
            duration_ms = duration.num_milliseconds(),
            "live session ended"
        );
    }
}
