//! Server-side session and one-time-token engine.
//!
//! Two tightly coupled subsystems:
//!
//! - a Redis-backed session store ([`Session`] over
//!   [`session::redis::RedisBackend`]) using atomic server-side scripts,
//!   optimistic concurrency via a per-mutation nonce, and identifier
//!   rotation;
//! - a Postgres-backed one-time token service ([`TokenService`]) with
//!   row-locked verification and collision-safe creation.
//!
//! HTTP routing, user profiles, email delivery, and migrations are the
//! caller's: this crate authenticates identifiers and stores values,
//! nothing more.

pub mod config;
pub mod db;
pub mod error;
pub mod retry;
pub mod state;

pub mod crypto {
    pub mod ident;
}

pub mod models {
    pub mod token;
}

pub mod repositories {
    pub mod token;
}

pub mod services {
    pub mod token;
}

pub mod session {
    pub mod codec;
    pub mod cookie;
    pub mod redis;
    pub mod script;
    pub mod store;
}

pub use config::Config;
pub use error::{Error, Result};
pub use models::token::{Action, NewToken, TokenRecord};
pub use services::token::{TokenService, TokenStore};
pub use session::codec::Value;
pub use session::store::{Session, SessionBackend, Transport};
pub use state::Engine;
