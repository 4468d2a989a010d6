use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// The engine's configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// The URL of the PostgreSQL database holding the token table.
    pub database_url: String,
    /// The URL of the Redis server holding session records.
    pub redis_url: String,
    /// The namespace: cookie name and session key prefix.
    pub namespace: String,
    /// How long a session stays valid after its last create/rotate.
    pub session_ttl: Duration,
    /// Remaining validity below which a cookie-borne session is rotated
    /// proactively on the next save.
    pub refresh_threshold: Duration,
    /// Grace window after a rotation during which no further rotation is
    /// signaled.
    pub refresh_wait: Duration,
    /// How long an issued one-time token stays redeemable.
    pub token_ttl: Duration,
    /// Whether response cookies carry the `Secure` attribute.
    pub cookie_secure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            namespace: "LATCHKEY_SESSION".to_string(),
            session_ttl: Duration::from_secs(1024),
            refresh_threshold: Duration::from_secs(128),
            refresh_wait: Duration::from_secs(4),
            token_ttl: Duration::from_secs(600),
            cookie_secure: false,
        }
    }
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Config`.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or(defaults.redis_url),
            namespace: env::var("SESSION_NAMESPACE")
                .unwrap_or(defaults.namespace),
            session_ttl: env_secs("SESSION_TTL_SECS", defaults.session_ttl)?,
            refresh_threshold: env_secs(
                "SESSION_REFRESH_THRESHOLD_SECS",
                defaults.refresh_threshold,
            )?,
            refresh_wait: env_secs("SESSION_REFRESH_WAIT_SECS", defaults.refresh_wait)?,
            token_ttl: env_secs("TOKEN_TTL_SECS", defaults.token_ttl)?,
            cookie_secure: env::var("COOKIE_SECURE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.cookie_secure),
        })
    }
}

/// Reads a duration in whole seconds from the environment.
fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("Invalid {name}"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}
