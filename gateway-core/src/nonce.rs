use std::sync::atomic::{AtomicU64, Ordering};

use data_encoding::HEXLOWER;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use gateway_common::helpers::rng::get_crypto_rng;
use rand::RngCore;

type HmacSha256 = Hmac<Sha256>;

/// A process-wide source of unguessable identifiers: pending-auth ids and
/// CSRF tokens. Each nonce is `HMAC-SHA-256(key, counter)`, hex-encoded, so
/// nonces are unique for the process lifetime without needing a fresh random
/// draw (and hence without risking entropy exhaustion) on every login.
pub struct NonceSource {
    key: NonceKey,
    counter: AtomicU64,
}

struct NonceKey(Vec<u8>);

impl Zeroize for NonceKey {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl Drop for NonceKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl NonceSource {
    pub fn new() -> Self {
        let mut key = vec![0u8; 128];
        get_crypto_rng().fill_bytes(&mut key);
        Self {
            key: NonceKey(key),
            counter: AtomicU64::new(0),
        }
    }

    /// Derive the next nonce in the sequence. Never repeats within a
    /// process's lifetime (barring a `u64` wraparound).
    pub fn next(&self) -> String {
        let seed = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut mac = HmacSha256::new_from_slice(&self.key.0).expect("HMAC accepts any key length");
        mac.update(&seed.to_ne_bytes());
        HEXLOWER.encode(&mac.finalize().into_bytes())
    }
}

impl Default for NonceSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successive_nonces_differ() {
        let src = NonceSource::new();
        let a = src.next();
        let b = src.next();
        assert_ne!(a, b);
    }

    #[test]
    fn nonce_is_lowercase_hex_sha256_length() {
        let src = NonceSource::new();
        let n = src.next();
        assert_eq!(n.len(), 64);
        assert!(n.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn two_sources_produce_different_sequences() {
        let a = NonceSource::new();
        let b = NonceSource::new();
        assert_ne!(a.next(), b.next());
    }
}
