use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The action a one-time token authorizes. A closed set: the tag is
/// stored as text and anything unknown in storage is a corrupt row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// "Click to log in" email link.
    Login,
}

impl Action {
    /// The stored tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Login => "login",
        }
    }

    /// Parses a stored tag.
    pub fn parse(tag: &str) -> Option<Action> {
        match tag {
            "login" => Some(Action::Login),
            _ => None,
        }
    }
}

/// A persisted one-time token.
///
/// Only the selector and the validator *digest* are stored; the
/// plaintext handed to the user cannot be reconstructed from a row.
/// `used_at`, once set, is never cleared: a token is consumed at most
/// once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: i64,
    /// The lookup half: 32 lowercase hex characters, unique.
    pub selector: String,
    /// Hex digest of the secret half.
    pub validator: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set exactly once, at consumption.
    pub used_at: Option<DateTime<Utc>>,
    pub action: Action,
    /// Free-form payload bound at issuance (e.g. the email address the
    /// token was sent to).
    pub payload: serde_json::Value,
}

impl TokenRecord {
    /// The bound email address, if the payload carries one.
    pub fn email(&self) -> Option<&str> {
        self.payload.get("email").and_then(|v| v.as_str())
    }
}

/// The row an issuance inserts.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub selector: String,
    pub validator: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub action: Action,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_tags_round_trip() {
        assert_eq!(Action::parse(Action::Login.as_str()), Some(Action::Login));
        assert_eq!(Action::parse("reset_password"), None);
    }

    #[test]
    fn email_reads_from_payload() {
        let record = TokenRecord {
            id: 1,
            selector: "ab".repeat(16),
            validator: "cd".repeat(16),
            created_at: Utc::now(),
            expires_at: Utc::now(),
            used_at: None,
            action: Action::Login,
            payload: serde_json::json!({ "email": "a@b.com" }),
        };
        assert_eq!(record.email(), Some("a@b.com"));
    }
}
