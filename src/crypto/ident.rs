use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// The length of an identifier in hex characters.
pub const ID_LEN: usize = 64;
/// The decoded length of each identifier half, in bytes.
pub const HALF_LEN: usize = 16;
/// The length of the fixed-output validator digest, in bytes.
pub const DIGEST_LEN: usize = 16;

/// A 64-character lowercase hex identifier, shared by sessions and
/// one-time tokens.
///
/// The first 32 characters are the *selector*, used verbatim for lookup.
/// The last 32 are *validator source* material: only its 16-byte digest
/// is ever stored server-side, so a leaked selector cannot be turned back
/// into a valid identifier.
#[derive(Clone, PartialEq, Eq)]
pub struct Ident {
    hex: String,
    selector: [u8; HALF_LEN],
    validator_source: [u8; HALF_LEN],
}

impl Ident {
    /// Generates a fresh high-entropy identifier.
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *seed);
        let digest: [u8; 32] = Sha256::digest(&*seed).into();
        Self::from_bytes(digest)
    }

    /// Sanitizes an inbound identifier: exactly 64 ASCII hex characters,
    /// case-folded to lowercase. Anything else is treated as absent.
    pub fn sanitize(raw: &str) -> Option<Self> {
        if raw.len() != ID_LEN || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let hex_lower = raw.to_ascii_lowercase();
        let decoded = hex::decode(&hex_lower).ok()?;
        let mut bytes = [0u8; 2 * HALF_LEN];
        bytes.copy_from_slice(&decoded);
        Some(Self::from_bytes(bytes))
    }

    fn from_bytes(bytes: [u8; 2 * HALF_LEN]) -> Self {
        let mut selector = [0u8; HALF_LEN];
        let mut validator_source = [0u8; HALF_LEN];
        selector.copy_from_slice(&bytes[..HALF_LEN]);
        validator_source.copy_from_slice(&bytes[HALF_LEN..]);
        Self {
            hex: hex::encode(bytes),
            selector,
            validator_source,
        }
    }

    /// The full 64-hex identifier.
    pub fn as_str(&self) -> &str {
        &self.hex
    }

    /// The selector half, as the 32 hex characters it arrived in.
    pub fn selector_hex(&self) -> &str {
        &self.hex[..2 * HALF_LEN]
    }

    /// The selector half, decoded to its 16 raw bytes.
    pub fn selector_bytes(&self) -> &[u8; HALF_LEN] {
        &self.selector
    }

    /// The fixed-output digest of the validator source. This, never the
    /// source itself, is what gets stored.
    pub fn validator_digest(&self) -> [u8; DIGEST_LEN] {
        xof_digest(&self.validator_source)
    }

    /// A rotated identifier: same selector, fresh validator source.
    pub fn rotated(&self) -> Self {
        let mut fresh = Zeroizing::new([0u8; HALF_LEN]);
        OsRng.fill_bytes(&mut *fresh);
        let mut bytes = [0u8; 2 * HALF_LEN];
        bytes[..HALF_LEN].copy_from_slice(&self.selector);
        bytes[HALF_LEN..].copy_from_slice(&xof_digest(&*fresh));
        Self::from_bytes(bytes)
    }
}

impl std::fmt::Debug for Ident {
    /// Only the selector half is ever printed.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ident({}..)", self.selector_hex())
    }
}

/// 16-byte extendable-output digest.
fn xof_digest(data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    let mut out = [0u8; DIGEST_LEN];
    hasher.finalize_xof().fill(&mut out);
    out
}
