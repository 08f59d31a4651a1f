pub mod authz;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod domain;
pub mod errors;
pub mod protocol;
pub mod ratelimit;
pub mod registry;
pub mod rest;
pub mod session;
pub mod storage;

use std::sync::Arc;

use authz::AuthorizationResolver;
use config::CoreConfig;
use connection::SubjectAuthenticator;
use ratelimit::ConnectionRateLimiter;
use registry::{CoreUpdateCoordinator, SessionRegistry};
use storage::SqliteStore;
use tokio::sync::Mutex;

/// Shared application state passed to the WebSocket and REST servers.
///
/// The core is parameterized over the durable backend only at this one
/// seam — everything downstream (`UpdateCoordinator`, `ConnectionHandler`,
/// REST handlers) is itself generic, so swapping `SqliteStore` for another
/// `Store` impl touches only this struct's construction.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<CoreConfig>,
    pub store: Arc<SqliteStore>,
    pub resolver: Arc<AuthorizationResolver<Arc<SqliteStore>>>,
    pub registry: Arc<SessionRegistry>,
    pub coordinator: Arc<CoreUpdateCoordinator<SqliteStore>>,
    pub authenticator: Arc<dyn SubjectAuthenticator>,
    /// Shared across every accept iteration of the WebSocket listener
    /// (spec §9 ambient concerns — not a per-connection resource).
    pub conn_limiter: Arc<Mutex<ConnectionRateLimiter>>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    pub async fn new(
        config: CoreConfig,
        authenticator: Arc<dyn SubjectAuthenticator>,
    ) -> Result<Self, errors::CoreError> {
        let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
        let resolver = Arc::new(AuthorizationResolver::new(store.clone()));
        let registry = SessionRegistry::new(config.outbound_queue_capacity, config.session_grace);
        let coordinator = registry::build_coordinator_with_retry_limit(
            store.clone(),
            registry.clone(),
            config.cas_retry_limit,
        );

        let conn_limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new(
            config.max_connections_per_min,
        )));

        Ok(Self {
            config: Arc::new(config),
            store,
            resolver,
            registry,
            coordinator,
            authenticator,
            conn_limiter,
            started_at: std::time::Instant::now(),
        })
    }

    pub fn connection_handler(&self) -> connection::ConnectionHandler<Arc<SqliteStore>> {
        connection::ConnectionHandler::new(
            self.resolver.clone(),
            self.registry.clone(),
            self.authenticator.clone(),
            self.config.outbound_queue_capacity,
            self.config.max_messages_per_sec,
        )
    }

    pub fn rest_state(&self) -> Arc<rest::RestState<SqliteStore>> {
        Arc::new(rest::RestState {
            coordinator: self.coordinator.clone(),
            authenticator: self.authenticator.clone(),
        })
    }
}
