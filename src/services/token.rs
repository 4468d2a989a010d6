//! One-time token issuance, verification, and consumption.

use std::time::Duration;

use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;

use crate::crypto::ident::Ident;
use crate::error::Result;
use crate::models::token::{Action, NewToken, TokenRecord};
use crate::retry::RetryPolicy;

/// The storage operations the token service needs. The Postgres
/// implementation lives on `deadpool_postgres::Transaction` so that
/// `verify` and `consume` share one row-lock scope; swapping the backing
/// engine means implementing these three methods elsewhere.
#[allow(async_fn_in_trait)]
pub trait TokenStore {
    /// Inserts a new row. Must fail with [`crate::Error::UniqueViolation`]
    /// when the selector is already taken.
    async fn create(&mut self, row: &NewToken) -> Result<()>;

    /// Fetches a row by selector under a row-level lock scoped to the
    /// enclosing transaction. Concurrent callers on the same selector
    /// serialize here.
    async fn find_for_update(&mut self, selector: &str) -> Result<Option<TokenRecord>>;

    /// Sets `used_at`. Must run in the same transaction as the
    /// preceding `find_for_update`.
    async fn mark_used(&mut self, id: i64, at: DateTime<Utc>) -> Result<()>;
}

/// Issues and redeems one-time action tokens.
#[derive(Debug, Clone)]
pub struct TokenService {
    ttl: Duration,
    retry: RetryPolicy,
}

impl Default for TokenService {
    /// Ten-minute tokens, selector collisions retried once.
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl TokenService {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            retry: RetryPolicy::default(),
        }
    }

    /// Issues a token bound to `action` and `payload`, returning the
    /// plaintext for delivery to the user. The plaintext is never
    /// persisted; the row keeps only the selector and the validator
    /// digest. A selector collision is retried with fresh randomness,
    /// bounded; exhaustion surfaces as the store's failure.
    pub async fn issue<S: TokenStore>(
        &self,
        store: &mut S,
        action: Action,
        payload: serde_json::Value,
    ) -> Result<String> {
        let mut budget = self.retry.budget();
        loop {
            let ident = Ident::generate();
            let now = Utc::now();
            let row = NewToken {
                selector: ident.selector_hex().to_string(),
                validator: hex::encode(ident.validator_digest()),
                created_at: now,
                expires_at: now + self.ttl,
                action,
                payload: payload.clone(),
            };
            match store.create(&row).await {
                Ok(()) => {
                    tracing::info!(action = action.as_str(), "🎫 One-time token issued");
                    return Ok(ident.as_str().to_string());
                }
                Err(e) if budget.permits(&e) => {
                    tracing::warn!("token selector collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Verifies a plaintext token. Returns the record only when every
    /// check passes; every rejection (malformed input, unknown
    /// selector, validator mismatch, already used, expired) is the
    /// same uniform `None`, so a caller cannot learn which check failed.
    pub async fn verify<S: TokenStore>(
        &self,
        store: &mut S,
        plaintext: &str,
    ) -> Result<Option<TokenRecord>> {
        let Some(ident) = Ident::sanitize(plaintext) else {
            return Ok(None);
        };
        let Some(record) = store.find_for_update(ident.selector_hex()).await? else {
            return Ok(None);
        };

        let expected = hex::encode(ident.validator_digest());
        let validator_ok: bool = record
            .validator
            .as_bytes()
            .ct_eq(expected.as_bytes())
            .into();
        if !validator_ok || record.used_at.is_some() || Utc::now() > record.expires_at {
            tracing::debug!(selector = %record.selector, "token rejected");
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Consumes a verified token: sets `used_at` now. Must run inside
    /// the same transaction as the `verify` that returned the record, so
    /// concurrent redemptions of the same token serialize on the row
    /// lock and at most one succeeds.
    pub async fn consume<S: TokenStore>(&self, store: &mut S, record: &TokenRecord) -> Result<()> {
        store.mark_used(record.id, Utc::now()).await?;
        tracing::info!(selector = %record.selector, "🎫 One-time token consumed");
        Ok(())
    }
}
