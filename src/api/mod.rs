//! HTTP surface of the relay: the `/live-cooking` upgrade and health probes

pub mod health;
pub mod live;
pub mod rate_limit;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::relay::RelaySessionManager;
use crate::{Error, Result};
use rate_limit::SharedLimiter;

/// State handed to every route
pub struct ApiState {
    pub manager: Arc<RelaySessionManager>,
    pub rate_limiter: Option<SharedLimiter>,
}

/// Assembles an [`ApiServer`] around a session manager
pub struct ApiServerBuilder {
    manager: Arc<RelaySessionManager>,
    port: u16,
    upgrades_per_minute: u32,
}

impl ApiServerBuilder {
    #[must_use]
    pub const fn new(manager: Arc<RelaySessionManager>) -> Self {
        Self {
            manager,
            port: crate::config::DEFAULT_PORT,
            upgrades_per_minute: 0,
        }
    }

    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Limit live session upgrades per minute (0 disables)
    #[must_use]
    pub const fn rate_limit(mut self, per_minute: u32) -> Self {
        self.upgrades_per_minute = per_minute;
        self
    }

    #[must_use]
    pub fn build(self) -> ApiServer {
        let rate_limiter = rate_limit::create_limiter(self.upgrades_per_minute);
        if rate_limiter.is_some() {
            tracing::info!(per_minute = self.upgrades_per_minute, "live session rate limit active");
        }
        ApiServer {
            state: Arc::new(ApiState {
                manager: self.manager,
                rate_limiter,
            }),
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)),
        }
    }
}

/// The relay's HTTP server
pub struct ApiServer {
    state: Arc<ApiState>,
    addr: SocketAddr,
}

impl ApiServer {
    /// Live and health routes behind CORS and request tracing
    pub fn router(&self) -> Router {
        // Browser clients connect from arbitrary origins
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        live::router(Arc::clone(&self.state))
            .merge(health::router(Arc::clone(&self.state)))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind all interfaces on the configured port and serve
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound or serving fails
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| Error::Config(format!("cannot bind {}: {e}", self.addr)))?;
        self.run_on(listener).await
    }

    /// Serve on an already bound listener
    ///
    /// # Errors
    ///
    /// Returns error if serving fails
    pub async fn run_on(self, listener: TcpListener) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "relay listening");
        axum::serve(listener, self.router())
            .await
            .map_err(Error::Io)
    }
}
