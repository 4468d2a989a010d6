//! Behavioral laws of the one-time token service, exercised against an
//! in-memory store that reproduces the unique-selector and
//! consumed-at-most-once semantics of the token table.

use std::time::Duration;

use chrono::{DateTime, Utc};
use latchkey::{Action, Error, NewToken, Result, TokenRecord, TokenService, TokenStore};
use serde_json::json;

#[derive(Default)]
struct MemoryTokenStore {
    rows: Vec<TokenRecord>,
    next_id: i64,
    /// Injects a unique violation for the first N creates.
    forced_collisions: usize,
    creates: usize,
}

impl TokenStore for MemoryTokenStore {
    async fn create(&mut self, row: &NewToken) -> Result<()> {
        self.creates += 1;
        if self.creates <= self.forced_collisions {
            return Err(Error::UniqueViolation);
        }
        if self.rows.iter().any(|r| r.selector == row.selector) {
            return Err(Error::UniqueViolation);
        }
        self.next_id += 1;
        self.rows.push(TokenRecord {
            id: self.next_id,
            selector: row.selector.clone(),
            validator: row.validator.clone(),
            created_at: row.created_at,
            expires_at: row.expires_at,
            used_at: None,
            action: row.action,
            payload: row.payload.clone(),
        });
        Ok(())
    }

    async fn find_for_update(&mut self, selector: &str) -> Result<Option<TokenRecord>> {
        Ok(self.rows.iter().find(|r| r.selector == selector).cloned())
    }

    async fn mark_used(&mut self, id: i64, at: DateTime<Utc>) -> Result<()> {
        if let Some(row) = self.rows.iter_mut().find(|r| r.id == id) {
            // Set exactly once, never cleared.
            row.used_at.get_or_insert(at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_use_law() {
        let service = TokenService::new(Duration::from_secs(600));
        let mut store = MemoryTokenStore::default();

        let plaintext = service
            .issue(&mut store, Action::Login, json!({ "email": "a@b.com" }))
            .await
            .unwrap();
        assert_eq!(plaintext.len(), 64);
        assert!(plaintext.bytes().all(|b| b.is_ascii_hexdigit()));

        let record = service
            .verify(&mut store, &plaintext)
            .await
            .unwrap()
            .expect("fresh token verifies");
        assert_eq!(record.action, Action::Login);
        assert_eq!(record.email(), Some("a@b.com"));
        assert!(record.used_at.is_none());

        service.consume(&mut store, &record).await.unwrap();

        assert!(service.verify(&mut store, &plaintext).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn plaintext_is_never_persisted() {
        let service = TokenService::default();
        let mut store = MemoryTokenStore::default();

        let plaintext = service
            .issue(&mut store, Action::Login, json!({}))
            .await
            .unwrap();

        let row = &store.rows[0];
        assert_eq!(row.selector, plaintext[..32]);
        // The stored validator is a digest of the second half, not the
        // half itself.
        assert_ne!(row.validator, plaintext[32..]);
        assert_eq!(row.validator.len(), 32);
    }

    #[tokio::test]
    async fn malformed_tokens_verify_to_none_without_error() {
        let service = TokenService::default();
        let mut store = MemoryTokenStore::default();
        service
            .issue(&mut store, Action::Login, json!({}))
            .await
            .unwrap();

        for bad in ["", "deadbeef", &"z".repeat(64), &"a".repeat(65)] {
            assert!(service.verify(&mut store, bad).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn wrong_validator_rejected_uniformly() {
        let service = TokenService::default();
        let mut store = MemoryTokenStore::default();
        let plaintext = service
            .issue(&mut store, Action::Login, json!({}))
            .await
            .unwrap();

        // Right selector, wrong secret half.
        let forged = format!("{}{}", &plaintext[..32], "0".repeat(32));
        assert_ne!(forged, plaintext);
        assert!(service.verify(&mut store, &forged).await.unwrap().is_none());
        // The real token still verifies: the forgery attempt changed
        // nothing.
        assert!(service.verify(&mut store, &plaintext).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_selector_verifies_to_none() {
        let service = TokenService::default();
        let mut store = MemoryTokenStore::default();
        assert!(
            service
                .verify(&mut store, &"a".repeat(64))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn expired_token_verifies_to_none() {
        let service = TokenService::new(Duration::ZERO);
        let mut store = MemoryTokenStore::default();
        let plaintext = service
            .issue(&mut store, Action::Login, json!({}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(service.verify(&mut store, &plaintext).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn selector_collision_retried_once() {
        let service = TokenService::default();
        let mut store = MemoryTokenStore {
            forced_collisions: 1,
            ..MemoryTokenStore::default()
        };

        let plaintext = service
            .issue(&mut store, Action::Login, json!({}))
            .await
            .unwrap();
        assert_eq!(store.creates, 2);
        assert!(service.verify(&mut store, &plaintext).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn collision_budget_exhaustion_surfaces() {
        let service = TokenService::default();
        let mut store = MemoryTokenStore {
            forced_collisions: 2,
            ..MemoryTokenStore::default()
        };

        let err = service
            .issue(&mut store, Action::Login, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UniqueViolation));
        assert_eq!(store.creates, 2);
    }

    #[tokio::test]
    async fn login_scenario_end_to_end() {
        // new(ttl=10min, action=login, email=a@b.com) -> P;
        // verify(P) -> record; use; verify(P) -> none.
        let service = TokenService::new(Duration::from_secs(600));
        let mut store = MemoryTokenStore::default();

        let p = service
            .issue(&mut store, Action::Login, json!({ "email": "a@b.com" }))
            .await
            .unwrap();
        assert_eq!(p.len(), 64);

        let record = service.verify(&mut store, &p).await.unwrap().unwrap();
        assert_eq!(record.action, Action::Login);
        assert_eq!(record.email(), Some("a@b.com"));
        assert!(record.used_at.is_none());

        service.consume(&mut store, &record).await.unwrap();
        assert!(service.verify(&mut store, &p).await.unwrap().is_none());

        // The stored row kept its consumption timestamp.
        assert!(store.rows[0].used_at.is_some());
    }
}
