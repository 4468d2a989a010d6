//! The backend-agnostic session contract.
//!
//! A [`Session`] is a request-scoped handle: sanitize and load the
//! inbound identifier once (memoized), stage value changes in memory,
//! then persist them in one atomic backend operation on save.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tower_cookies::Cookies;

use crate::config::Config;
use crate::crypto::ident::Ident;
use crate::error::{Error, Result};
use crate::session::codec::Value;
use crate::session::cookie::{self, CookieUpdate};

/// How the inbound identifier reached the server. Whichever channel
/// supplied it governs whether a cookie is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// The session cookie.
    Cookie,
    /// An out-of-band channel (path segment, header) for cookie-less
    /// clients; no response cookie is emitted.
    Token,
}

/// A record as the backend loaded it.
pub struct LoadedSession {
    /// The decoded application values.
    pub values: HashMap<String, Value>,
    /// The stored nonce, to be presented on the next mutation.
    pub nonce: Vec<u8>,
    /// Whether the backend wants the identifier rotated on the next save.
    pub should_refresh: bool,
    /// Expired raw fields found in the record, slated for deletion on the
    /// next mutation.
    pub stale_fields: Vec<Vec<u8>>,
}

/// The staged changes one save applies.
#[derive(Default)]
pub struct Mutation {
    /// Changed application values.
    pub values: Vec<(String, Value)>,
    /// Popped application keys.
    pub deleted_keys: Vec<String>,
    /// Raw fields to delete alongside (expired validators from load).
    pub stale_fields: Vec<Vec<u8>>,
}

/// The outcome of a create or rotate: the new identity material.
pub struct Created {
    pub id: Ident,
    pub nonce: Vec<u8>,
    /// Absolute deadline, seconds since epoch.
    pub deadline: f64,
}

/// The storage operations a session backend provides. Every mutation is
/// a single atomic round trip; ordering between racing writers is
/// resolved by the nonce each one presents.
#[allow(async_fn_in_trait)]
pub trait SessionBackend {
    /// Loads a record. `None` on miss or past-deadline record.
    /// `arm_refresh` is set for cookie-borne identifiers and lets the
    /// backend signal a proactive rotation.
    async fn load(&self, id: &Ident, arm_refresh: bool) -> Result<Option<LoadedSession>>;

    /// Creates a record under a fresh identifier. Collisions with an
    /// existing key are retried internally with fresh randomness.
    async fn create(&self, mutation: &Mutation) -> Result<Created>;

    /// Applies staged changes in place. Fails with
    /// [`Error::ConcurrentUpdate`] if `nonce` no longer matches.
    async fn save(&self, id: &Ident, nonce: &[u8], mutation: &Mutation) -> Result<Vec<u8>>;

    /// Applies staged changes and replaces the validator half of the
    /// identifier, invalidating the old one. Same nonce gate as `save`.
    async fn rotate(&self, id: &Ident, nonce: &[u8], mutation: &Mutation) -> Result<Created>;

    /// Deletes the record. Same nonce gate as `save`.
    async fn destroy(&self, id: &Ident, nonce: &[u8]) -> Result<()>;
}

#[derive(Default)]
enum CookieState {
    #[default]
    Untouched,
    Clear,
    Set(f64),
}

#[derive(Default)]
struct State {
    id: Option<Ident>,
    values: HashMap<String, Value>,
    changed: HashSet<String>,
    to_del: HashSet<String>,
    stale_fields: Vec<Vec<u8>>,
    nonce: Option<Vec<u8>>,
    should_refresh: bool,
    cookie: CookieState,
}

/// A request-scoped session handle.
pub struct Session<B> {
    backend: B,
    config: Arc<Config>,
    supplied: Option<String>,
    transport: Transport,
    loaded: OnceCell<()>,
    state: Mutex<State>,
}

impl<B: SessionBackend> Session<B> {
    /// Creates an unloaded handle around the raw inbound identifier (or
    /// its absence) and the channel it arrived on.
    pub fn new(
        backend: B,
        config: Arc<Config>,
        supplied: Option<String>,
        transport: Transport,
    ) -> Self {
        Self {
            backend,
            config,
            supplied,
            transport,
            loaded: OnceCell::new(),
            state: Mutex::new(State::default()),
        }
    }

    /// Sanitizes and loads the inbound identifier. Idempotent: the first
    /// caller performs the load, concurrent and later callers await the
    /// same outcome. A malformed identifier or a backend miss yields an
    /// empty, unbound session and marks the response cookie for removal.
    pub async fn load(&self) -> Result<()> {
        self.loaded
            .get_or_try_init(|| async {
                let sanitized = self.supplied.as_deref().and_then(Ident::sanitize);
                let loaded = match &sanitized {
                    Some(id) => {
                        let arm = self.transport == Transport::Cookie;
                        self.backend.load(id, arm).await?
                    }
                    None => None,
                };

                let mut state = self.state.lock().await;
                match loaded {
                    Some(record) => {
                        state.id = sanitized;
                        state.values = record.values;
                        state.nonce = Some(record.nonce);
                        state.should_refresh = record.should_refresh;
                        state.stale_fields = record.stale_fields;
                    }
                    None => {
                        state.cookie = CookieState::Clear;
                    }
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.loaded.initialized() {
            Ok(())
        } else {
            Err(Error::NotLoaded)
        }
    }

    /// Whether the session is bound to a stored record.
    pub async fn is_bound(&self) -> bool {
        self.state.lock().await.id.is_some()
    }

    /// The current identifier, if any.
    pub async fn id(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.id.as_ref().map(|id| id.as_str().to_string())
    }

    /// Reads a value. Fails fast if the session was never loaded.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_loaded()?;
        let state = self.state.lock().await;
        Ok(state.values.get(key).cloned())
    }

    /// Stages a value for the next save.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        self.ensure_loaded()?;
        let key = key.into();
        let mut state = self.state.lock().await;
        state.values.insert(key.clone(), value.into());
        state.to_del.remove(&key);
        state.changed.insert(key);
        Ok(())
    }

    /// Removes a value, staging the deletion for the next save.
    pub async fn pop(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_loaded()?;
        let mut state = self.state.lock().await;
        let value = state.values.remove(key);
        state.changed.remove(key);
        state.to_del.insert(key.to_string());
        Ok(value)
    }

    /// Persists staged changes.
    ///
    /// No-op when nothing changed and no refresh was requested or
    /// signaled. A backend-armed refresh from `load` forces a rotation
    /// even when the caller passes `refresh = false`; that precedence is
    /// part of the contract. Returns the new identifier when one was
    /// minted (create or rotate), `None` otherwise.
    pub async fn save(&self, refresh: bool) -> Result<Option<String>> {
        if !self.loaded.initialized() {
            return Ok(None);
        }

        let (id, nonce, refresh, mutation) = {
            let state = self.state.lock().await;
            let refresh = refresh || state.should_refresh;
            if !refresh && state.changed.is_empty() && state.to_del.is_empty() {
                return Ok(None);
            }
            let mutation = Mutation {
                values: state
                    .changed
                    .iter()
                    .filter_map(|k| state.values.get(k).map(|v| (k.clone(), v.clone())))
                    .collect(),
                deleted_keys: state.to_del.iter().cloned().collect(),
                stale_fields: state.stale_fields.clone(),
            };
            (state.id.clone(), state.nonce.clone(), refresh, mutation)
        };

        match id {
            Some(id) => {
                let nonce = nonce
                    .ok_or_else(|| Error::Internal("bound session without a nonce".into()))?;
                if refresh {
                    let created = self.backend.rotate(&id, &nonce, &mutation).await?;
                    let new_id = created.id.as_str().to_string();
                    self.apply_created(created).await;
                    Ok(Some(new_id))
                } else {
                    let new_nonce = self.backend.save(&id, &nonce, &mutation).await?;
                    let mut state = self.state.lock().await;
                    state.nonce = Some(new_nonce);
                    Self::clear_staged(&mut state);
                    Ok(None)
                }
            }
            None => {
                let created = self.backend.create(&mutation).await?;
                let new_id = created.id.as_str().to_string();
                self.apply_created(created).await;
                Ok(Some(new_id))
            }
        }
    }

    async fn apply_created(&self, created: Created) {
        let mut state = self.state.lock().await;
        state.id = Some(created.id);
        state.nonce = Some(created.nonce);
        state.should_refresh = false;
        state.cookie = CookieState::Set(created.deadline);
        Self::clear_staged(&mut state);
    }

    fn clear_staged(state: &mut State) {
        state.changed.clear();
        state.to_del.clear();
        state.stale_fields.clear();
    }

    /// Deletes the backing record (if any), clears in-memory state, and
    /// marks the response cookie for removal.
    pub async fn destroy(&self) -> Result<()> {
        self.load().await?;
        let (id, nonce) = {
            let state = self.state.lock().await;
            (state.id.clone(), state.nonce.clone())
        };
        if let (Some(id), Some(nonce)) = (id, nonce) {
            self.backend.destroy(&id, &nonce).await?;
        }
        let mut state = self.state.lock().await;
        state.id = None;
        state.nonce = None;
        state.values.clear();
        state.should_refresh = false;
        Self::clear_staged(&mut state);
        state.cookie = CookieState::Clear;
        Ok(())
    }

    /// The pending response-cookie update, if the identifier arrived via
    /// the cookie transport. Consumed: a second call returns `None`.
    pub async fn take_cookie_update(&self) -> Option<CookieUpdate> {
        if self.transport != Transport::Cookie {
            return None;
        }
        let mut state = self.state.lock().await;
        let pending = std::mem::take(&mut state.cookie);
        match pending {
            CookieState::Untouched => None,
            CookieState::Clear => Some(CookieUpdate::Clear(cookie::removal_cookie(
                &self.config.namespace,
            ))),
            CookieState::Set(deadline) => {
                let id = state.id.as_ref()?;
                Some(CookieUpdate::Set(cookie::session_cookie(
                    &self.config.namespace,
                    id.as_str(),
                    deadline,
                    self.config.cookie_secure,
                )))
            }
        }
    }

    /// The response hook: always attempts a save, then emits or clears
    /// the cookie for cookie-borne sessions only.
    pub async fn on_response(&self, cookies: &Cookies) -> Result<()> {
        self.save(false).await?;
        if let Some(update) = self.take_cookie_update().await {
            update.apply(cookies);
        }
        Ok(())
    }
}
