//! Compiled server-side scripts, invoked by content hash.

use redis::aio::ConnectionManager;

use crate::error::{Error, Result};

/// A server-side script with its precomputed content hash.
///
/// `invoke` runs the script by hash (`EVALSHA`) and, when the server
/// reports the script is not cached, transparently resubmits the full
/// source once. Callers never see the cache miss.
pub struct CompiledScript {
    source: &'static str,
    hash: String,
}

impl CompiledScript {
    /// Compiles the script: records the source and its SHA-1 hash, the
    /// digest the server caches scripts under.
    pub fn new(source: &'static str) -> Self {
        let mut sha = sha1_smol::Sha1::new();
        sha.update(source.as_bytes());
        Self {
            source,
            hash: sha.digest().to_string(),
        }
    }

    /// The content hash the script is cached under.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Executes the script atomically on the server.
    ///
    /// `keys` carries the record key plus per-call parameters (the
    /// scripts read them positionally from `KEYS`); `args` carries the
    /// variable-length field lists.
    pub async fn invoke(
        &self,
        conn: &mut ConnectionManager,
        keys: &[Vec<u8>],
        args: &[Vec<u8>],
    ) -> Result<redis::Value> {
        match self.run(conn, "EVALSHA", None, keys, args).await {
            Err(e) if e.kind() == redis::ErrorKind::NoScriptError => {
                tracing::debug!(hash = %self.hash, "script not cached, resubmitting source");
                self.run(conn, "EVAL", Some(self.source), keys, args)
                    .await
                    .map_err(Error::from)
            }
            other => other.map_err(Error::from),
        }
    }

    async fn run(
        &self,
        conn: &mut ConnectionManager,
        name: &str,
        source: Option<&str>,
        keys: &[Vec<u8>],
        args: &[Vec<u8>],
    ) -> std::result::Result<redis::Value, redis::RedisError> {
        let mut cmd = redis::cmd(name);
        match source {
            Some(text) => cmd.arg(text),
            None => cmd.arg(&self.hash),
        };
        cmd.arg(keys.len());
        for key in keys {
            cmd.arg(key.as_slice());
        }
        for arg in args {
            cmd.arg(arg.as_slice());
        }
        cmd.query_async(conn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_sha1_of_source() {
        let script = CompiledScript::new("return 1");
        assert_eq!(script.hash(), "e0e1f9fabfc9d4800c877a703b823ac0578ff8db");
    }

    #[test]
    fn hash_is_stable_per_source() {
        assert_eq!(
            CompiledScript::new("return 1").hash(),
            CompiledScript::new("return 1").hash()
        );
        assert_ne!(
            CompiledScript::new("return 1").hash(),
            CompiledScript::new("return 2").hash()
        );
    }
}
