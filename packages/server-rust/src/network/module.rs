//! Network module with deferred startup lifecycle.
//!
//! `new()` collects configuration and collaborators, `register()` adds
//! controller routes, `start()` binds the TCP listener, and `serve()`
//! starts accepting connections.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use keel_core::{Application, ConnectionPool, NullPool};
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::middleware::build_http_layers;
use crate::controller::Controller;
use crate::middleware::{ScopeConfig, Tracer};
use crate::traits::{Anonymous, IdentityProvider};

/// Manages the HTTP server lifecycle.
///
/// Follows the deferred startup pattern:
/// 1. `new()` -- takes the configuration and application
/// 2. `start()` -- binds TCP listener to the configured address
/// 3. `serve()` -- begins accepting connections until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    app: Arc<Application>,
    identity: Arc<dyn IdentityProvider>,
    pool: Arc<dyn ConnectionPool>,
    tracer: Tracer,
    routes: Router,
    controllers: Vec<&'static str>,
    listener: Option<TcpListener>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, app: Arc<Application>) -> Self {
        Self {
            config,
            app,
            identity: Arc::new(Anonymous),
            pool: Arc::new(NullPool),
            tracer: Tracer::default(),
            routes: Router::new(),
            controllers: Vec::new(),
            listener: None,
        }
    }

    #[must_use]
    pub fn with_identity(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity = provider;
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
        self.pool = pool;
        self
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    /// Adds a controller's routes. A controller key seen before is skipped.
    pub fn register(&mut self, controller: &dyn Controller) -> &mut Self {
        let key = controller.key();
        if self.controllers.contains(&key) {
            warn!(controller = key, "controller already registered, skipping");
            return self;
        }
        self.controllers.push(key);
        self.routes = controller.register(std::mem::take(&mut self.routes));
        self
    }

    /// Keys of the registered controllers, in registration order.
    #[must_use]
    pub fn controllers(&self) -> &[&'static str] {
        &self.controllers
    }

    /// Assembles the axum router with all controller routes and middleware.
    pub fn build_router(&self) -> Router {
        let scope = ScopeConfig::new(Arc::clone(&self.app))
            .identity(Arc::clone(&self.identity))
            .pool(Arc::clone(&self.pool));
        let layers = build_http_layers(&self.config, self.tracer.clone(), scope);
        self.routes.clone().layer(layers)
    }

    /// Checks the connection pool, then binds the TCP listener to the
    /// configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot hand out a connection, or if the
    /// address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let backend = self.pool.backend();
        self.pool
            .ping()
            .await
            .map_err(|err| err.context(format!("{backend} pool is unreachable")))?;
        info!(backend, "connection pool ready");

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Starts serving connections until the shutdown signal fires, then
    /// waits for in-flight requests to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first, or if the server
    /// encounters a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router();

        info!(controllers = ?self.controllers, "Serving HTTP connections");

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}
