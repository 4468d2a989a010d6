//! The Redis session backend.
//!
//! Each operation is one server-side script: a single round trip,
//! atomic on the server. Every mutating script starts with a nonce
//! compare against the stored record, so the loser of a write race gets
//! a `RACE` reply (surfaced as [`Error::ConcurrentUpdate`]) instead of
//! silently clobbering the winner. Scalar parameters ride in `KEYS`,
//! variable-length field lists in `ARGV`, split by a count parameter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use rand::RngCore;
use rand::rngs::OsRng;
use redis::aio::ConnectionManager;

use crate::config::Config;
use crate::crypto::ident::Ident;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::session::codec::{self, Value};
use crate::session::script::CompiledScript;
use crate::session::store::{Created, LoadedSession, Mutation, SessionBackend};

/// The length of the optimistic-concurrency nonce.
const NONCE_LEN: usize = 8;

/// Guarded create: refuses to overwrite an existing record.
/// KEYS: record key, expiry (ms since epoch). ARGV: field/value pairs.
static CREATE: Lazy<CompiledScript> = Lazy::new(|| {
    CompiledScript::new(
        "\
local rv
if (redis.call('EXISTS', KEYS[1]) == 0)
then
    rv = redis.call('HSET', KEYS[1], unpack(ARGV))
    redis.call('PEXPIREAT', KEYS[1], KEYS[2])
else
    rv = {err = 'RETRY hash collision'}
end
return rv
",
    )
});

/// Nonce-gated rotate: reserves the new validator field without
/// overwrite, then applies deletions and writes and resets expiry.
/// KEYS: record key, new validator field, deadline (seconds string),
/// expiry (ms), deletion count, expected nonce.
/// ARGV: deletions, then field/value pairs.
static ROTATE: Lazy<CompiledScript> = Lazy::new(|| {
    CompiledScript::new(
        "\
local rv
if (redis.call('HGET', KEYS[1], string.char(0x02)) ~= KEYS[6])
then
    rv = {err = 'RACE concurrent update'}
elseif (redis.call('HSETNX', KEYS[1], KEYS[2], KEYS[3]) == 0)
then
    rv = {err = 'RETRY hash collision'}
else
    rv = redis.call('HSET', KEYS[1], unpack(ARGV, KEYS[5] + 1))
    if (KEYS[5] ~= '0')
    then
        redis.call('HDEL', KEYS[1], unpack(ARGV, 1, KEYS[5]))
    end
    redis.call('PEXPIREAT', KEYS[1], KEYS[4])
end
return rv
",
    )
});

/// Nonce-gated in-place save: deletions and writes, validator and
/// expiry untouched.
/// KEYS: record key, expected nonce, deletion count.
/// ARGV: deletions, then field/value pairs.
static SAVE: Lazy<CompiledScript> = Lazy::new(|| {
    CompiledScript::new(
        "\
local rv
if (redis.call('HGET', KEYS[1], string.char(0x02)) ~= KEYS[2])
then
    rv = {err = 'RACE concurrent update'}
else
    rv = redis.call('HSET', KEYS[1], unpack(ARGV, KEYS[3] + 1))
    if (KEYS[3] ~= '0')
    then
        redis.call('HDEL', KEYS[1], unpack(ARGV, 1, KEYS[3]))
    end
end
return rv
",
    )
});

/// Nonce-gated destroy: deletes the whole record.
/// KEYS: record key, expected nonce.
static DESTROY: Lazy<CompiledScript> = Lazy::new(|| {
    CompiledScript::new(
        "\
local rv
if (redis.call('HGET', KEYS[1], string.char(0x02)) ~= KEYS[2])
then
    rv = {err = 'RACE concurrent update'}
else
    rv = redis.call('DEL', KEYS[1])
end
return rv
",
    )
});

/// The Redis implementation of [`SessionBackend`].
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    config: Arc<Config>,
    retry: RetryPolicy,
}

impl RedisBackend {
    pub fn new(conn: ConnectionManager, config: Arc<Config>) -> Self {
        Self {
            conn,
            config,
            retry: RetryPolicy::default(),
        }
    }

    fn record_key(&self, id: &Ident) -> Vec<u8> {
        record_key(&self.config.namespace, id)
    }

    fn fresh_nonce() -> Vec<u8> {
        let mut nonce = vec![0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    fn deadline(&self) -> f64 {
        now_secs() + self.config.session_ttl.as_secs_f64()
    }

    /// Flattens the mutation's writes plus extra raw fields into the
    /// field/value pair list the scripts expect.
    fn encode_writes(mutation: &Mutation, extra: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<Vec<u8>> {
        let mut flat = Vec::with_capacity(2 * (mutation.values.len() + extra.len()));
        for (key, value) in &mutation.values {
            flat.push(codec::data_field(key));
            flat.push(value.encode());
        }
        for (field, value) in extra {
            flat.push(field);
            flat.push(value);
        }
        flat
    }

    fn deletions(mutation: &Mutation) -> Vec<Vec<u8>> {
        let mut fields: Vec<Vec<u8>> = mutation
            .deleted_keys
            .iter()
            .map(|key| codec::data_field(key))
            .collect();
        fields.extend(mutation.stale_fields.iter().cloned());
        fields
    }
}

impl SessionBackend for RedisBackend {
    async fn load(&self, id: &Ident, arm_refresh: bool) -> Result<Option<LoadedSession>> {
        let mut conn = self.conn.clone();
        let record: HashMap<Vec<u8>, Vec<u8>> = redis::cmd("HGETALL")
            .arg(self.record_key(id).as_slice())
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;

        let current_validator = codec::validator_field(&id.validator_digest());
        Ok(interpret_record(
            record,
            &current_validator,
            arm_refresh,
            now_secs(),
            &self.config,
        ))
    }

    async fn create(&self, mutation: &Mutation) -> Result<Created> {
        let mut conn = self.conn.clone();
        let mut budget = self.retry.budget();
        loop {
            let id = Ident::generate();
            let nonce = Self::fresh_nonce();
            let deadline = self.deadline();
            let keys = vec![
                self.record_key(&id),
                millis(deadline).to_string().into_bytes(),
            ];
            let args = Self::encode_writes(
                mutation,
                vec![
                    (
                        codec::validator_field(&id.validator_digest()),
                        deadline.to_string().into_bytes(),
                    ),
                    (codec::nonce_field(), nonce.clone()),
                ],
            );

            match CREATE.invoke(&mut conn, &keys, &args).await {
                Ok(_) => {
                    tracing::debug!(selector = id.selector_hex(), "session created");
                    return Ok(Created {
                        id,
                        nonce,
                        deadline,
                    });
                }
                Err(e) if budget.permits(&e) => {
                    tracing::warn!("selector collision on create, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn save(&self, id: &Ident, nonce: &[u8], mutation: &Mutation) -> Result<Vec<u8>> {
        let mut conn = self.conn.clone();
        let new_nonce = Self::fresh_nonce();
        let deletions = Self::deletions(mutation);
        let keys = vec![
            self.record_key(id),
            nonce.to_vec(),
            deletions.len().to_string().into_bytes(),
        ];
        let mut args = deletions;
        args.extend(Self::encode_writes(
            mutation,
            vec![(codec::nonce_field(), new_nonce.clone())],
        ));

        SAVE.invoke(&mut conn, &keys, &args).await?;
        Ok(new_nonce)
    }

    async fn rotate(&self, id: &Ident, nonce: &[u8], mutation: &Mutation) -> Result<Created> {
        let mut conn = self.conn.clone();
        let mut budget = self.retry.budget();
        loop {
            let next = id.rotated();
            let new_nonce = Self::fresh_nonce();
            let deadline = self.deadline();

            // The old validator goes into the deletion list: the previous
            // identifier stops resolving the moment the rotation lands.
            let mut deletions = Self::deletions(mutation);
            deletions.push(codec::validator_field(&id.validator_digest()));

            let keys = vec![
                self.record_key(id),
                codec::validator_field(&next.validator_digest()),
                deadline.to_string().into_bytes(),
                millis(deadline).to_string().into_bytes(),
                deletions.len().to_string().into_bytes(),
                nonce.to_vec(),
            ];
            let mut args = deletions;
            args.extend(Self::encode_writes(
                mutation,
                vec![(codec::nonce_field(), new_nonce.clone())],
            ));

            match ROTATE.invoke(&mut conn, &keys, &args).await {
                Ok(_) => {
                    tracing::debug!(selector = next.selector_hex(), "session rotated");
                    return Ok(Created {
                        id: next,
                        nonce: new_nonce,
                        deadline,
                    });
                }
                Err(e) if budget.permits(&e) => {
                    tracing::warn!("validator collision on rotate, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn destroy(&self, id: &Ident, nonce: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        let keys = vec![self.record_key(id), nonce.to_vec()];
        DESTROY.invoke(&mut conn, &keys, &[]).await?;
        tracing::debug!(selector = id.selector_hex(), "session destroyed");
        Ok(())
    }
}

/// Turns a raw fetched record into a [`LoadedSession`], or a miss.
///
/// The deadline of the presented validator decides liveness. Sibling
/// validator fields past their own deadline are collected for deletion
/// on the next mutation; a sibling minted less than `refresh_wait` ago
/// means another worker just rotated, so the refresh signal is dropped
/// to avoid rotating twice back to back.
fn interpret_record(
    record: HashMap<Vec<u8>, Vec<u8>>,
    current_validator: &[u8],
    arm_refresh: bool,
    now: f64,
    config: &Config,
) -> Option<LoadedSession> {
    let deadline = record
        .get(current_validator)
        .and_then(|raw| parse_deadline(raw))
        .unwrap_or(0.0);
    if now >= deadline {
        return None;
    }

    let ttl = config.session_ttl.as_secs_f64();
    let mut should_refresh =
        arm_refresh && deadline - now < config.refresh_threshold.as_secs_f64();
    let mut values = HashMap::new();
    let mut nonce = Vec::new();
    let mut stale_fields = Vec::new();

    for (field, raw) in &record {
        match field.split_first() {
            Some((&codec::DATA, name)) => {
                let Ok(key) = std::str::from_utf8(name) else {
                    continue;
                };
                match Value::decode(raw) {
                    Some(value) => {
                        values.insert(key.to_string(), value);
                    }
                    None => {
                        tracing::warn!(key, "undecodable session value, skipping");
                    }
                }
            }
            Some((&codec::VALIDATOR, _)) => {
                let field_deadline = parse_deadline(raw).unwrap_or(0.0);
                if now > field_deadline {
                    stale_fields.push(field.clone());
                } else if now + ttl - field_deadline < config.refresh_wait.as_secs_f64() {
                    // Minted moments ago; do not rotate again yet.
                    should_refresh = false;
                }
            }
            Some((&codec::NONCE, _)) => {
                nonce = raw.clone();
            }
            _ => {}
        }
    }

    if nonce.is_empty() {
        tracing::warn!("session record has no nonce, treating as a miss");
        return None;
    }

    Some(LoadedSession {
        values,
        nonce,
        should_refresh,
        stale_fields,
    })
}

/// The record key: `{namespace}:{16 raw selector bytes}`.
fn record_key(namespace: &str, id: &Ident) -> Vec<u8> {
    let prefix = namespace.as_bytes();
    let mut key = Vec::with_capacity(prefix.len() + 1 + id.selector_bytes().len());
    key.extend_from_slice(prefix);
    key.push(b':');
    key.extend_from_slice(id.selector_bytes());
    key
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn millis(deadline_secs: f64) -> i64 {
    (deadline_secs * 1000.0) as i64
}

fn parse_deadline(raw: &[u8]) -> Option<f64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}
