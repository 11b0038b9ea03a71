use std::fmt;

use sha2::{Digest, Sha256};

/// Number of digest bytes kept in a key.
const KEY_LEN: usize = 16;

/// Stable digest of a target URL, used as the cache file name.
///
/// The key is the first 16 bytes of the SHA-256 of the URL string, so equal
/// strings always map to the same key and distinct strings collide only with
/// hash-function probability.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; KEY_LEN]);

impl CacheKey {
    pub fn for_url(url: &str) -> Self {
        let digest = Sha256::digest(url.as_bytes());
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&digest[..KEY_LEN]);
        Self(bytes)
    }

    /// Lower-case hex form, 32 characters long.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}
