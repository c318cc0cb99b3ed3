//! `/live-cooking` WebSocket upgrade

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::HeaderMap,
    middleware,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;

use super::{ApiState, rate_limit};
use crate::auth::bearer_token;
use crate::relay::LiveRequest;

/// Query parameters; validation happens after the upgrade so failures can
/// be reported with a close code
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveQuery {
    recipe_id: Option<String>,
    step_index: Option<String>,
    version_id: Option<String>,
    /// For browser clients that cannot set headers
    token: Option<String>,
}

async fn live_upgrade(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<LiveQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = bearer_token(&headers).map(str::to_owned).or(query.token);
    let request = LiveRequest {
        recipe_id: query.recipe_id,
        step_index: query.step_index,
        version_id: query.version_id,
        token,
    };
    let manager = Arc::clone(&state.manager);
    ws.on_upgrade(move |socket| async move { manager.handle_connection(socket, request).await })
}

/// Build the live session router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/live-cooking", get(live_upgrade))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit::rate_limit_middleware,
        ))
        .with_state(state)
}
