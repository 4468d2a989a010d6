//! The Postgres token store.
//!
//! Expected table:
//!
//! ```sql
//! CREATE TABLE tokens (
//!     id         BIGSERIAL PRIMARY KEY,
//!     selector   TEXT NOT NULL,
//!     validator  TEXT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     expires_at TIMESTAMPTZ NOT NULL,
//!     used_at    TIMESTAMPTZ,
//!     action     TEXT NOT NULL,
//!     payload    JSONB NOT NULL DEFAULT '{}'
//! );
//! CREATE UNIQUE INDEX ix_tokens_selector ON tokens (selector);
//! ```
//!
//! Implemented on the transaction, not the pool: `find_for_update` and
//! `mark_used` must share one transaction for the row lock to mean
//! anything, and the caller owns that bracket.

use chrono::{DateTime, Utc};
use deadpool_postgres::Transaction;
use tokio_postgres::Row;

use crate::error::{Error, Result};
use crate::models::token::{Action, NewToken, TokenRecord};
use crate::services::token::TokenStore;

/// A helper function to map a `tokio_postgres::Row` to a `TokenRecord`.
fn row_to_token(row: &Row) -> Result<TokenRecord> {
    let action_tag: String = row.try_get("action")?;
    let action = Action::parse(&action_tag)
        .ok_or_else(|| Error::Internal(format!("unknown token action: {action_tag}")))?;
    Ok(TokenRecord {
        id: row.try_get("id")?,
        selector: row.try_get("selector")?,
        validator: row.try_get("validator")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        used_at: row.try_get("used_at")?,
        action,
        payload: row.try_get("payload")?,
    })
}

impl TokenStore for Transaction<'_> {
    async fn create(&mut self, row: &NewToken) -> Result<()> {
        let action = row.action.as_str();
        self.execute(
            r#"
            INSERT INTO tokens (selector, validator, created_at, expires_at, action, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            &[
                &row.selector,
                &row.validator,
                &row.created_at,
                &row.expires_at,
                &action,
                &row.payload,
            ],
        )
        .await?;
        Ok(())
    }

    async fn find_for_update(&mut self, selector: &str) -> Result<Option<TokenRecord>> {
        let row = self
            .query_opt(
                r#"
                SELECT id, selector, validator, created_at, expires_at, used_at, action, payload
                FROM tokens
                WHERE selector = $1
                FOR UPDATE
                "#,
                &[&selector],
            )
            .await?;
        row.map(|r| row_to_token(&r)).transpose()
    }

    async fn mark_used(&mut self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.execute(
            r#"
            UPDATE tokens
            SET used_at = $2
            WHERE id = $1 AND used_at IS NULL
            "#,
            &[&id, &at],
        )
        .await?;
        Ok(())
    }
}
