use std::sync::Arc;

use deadpool_postgres::Pool;
use redis::aio::ConnectionManager;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::services::token::TokenService;
use crate::session::redis::RedisBackend;
use crate::session::store::{Session, Transport};

/// The engine: owns the two store connections and the configuration,
/// and hands out per-request session handles and the token service.
#[derive(Clone)]
pub struct Engine {
    /// The token-table connection pool. Public: callers bracket
    /// verify/consume in their own transaction from here.
    pub db: Pool,
    redis: ConnectionManager,
    config: Arc<Config>,
    tokens: TokenService,
}

impl Engine {
    /// Connects both stores.
    pub async fn new(config: Config) -> Result<Self> {
        let db = crate::db::create_pool(&config.database_url)?;
        tracing::info!("✅ PostgreSQL pool initialized");

        let redis_client =
            redis::Client::open(config.redis_url.as_str()).map_err(Error::from)?;
        let redis = ConnectionManager::new(redis_client)
            .await
            .map_err(Error::from)?;
        tracing::info!("✅ Redis connection manager initialized");

        let tokens = TokenService::new(config.token_ttl);

        Ok(Self {
            db,
            redis,
            config: Arc::new(config),
            tokens,
        })
    }

    /// A session handle for one request. The cookie value wins when both
    /// channels carried an identifier; the winning channel decides
    /// whether a cookie is written back.
    pub fn session(
        &self,
        cookie_value: Option<String>,
        token_value: Option<String>,
    ) -> Session<RedisBackend> {
        let (supplied, transport) = match cookie_value {
            Some(value) => (Some(value), Transport::Cookie),
            None => (token_value, Transport::Token),
        };
        let backend = RedisBackend::new(self.redis.clone(), self.config.clone());
        Session::new(backend, self.config.clone(), supplied, transport)
    }

    /// The one-time token service.
    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// The engine's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }
}
