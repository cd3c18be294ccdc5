//! WireGuard key material and pre-shared key derivation
//!
//! Keys travel through the system base64-encoded, the same form `wg`
//! consumes. PSK derivation is a pluggable strategy defined over the
//! unordered peer-name pair.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::KeyError;

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// Domain separator for the deterministic PSK derivation.
const PSK_DOMAIN: &str = "wg-mesh-psk::";

/// Generate a new X25519 keypair, base64-encoded.
///
/// Returns (private_key, public_key).
pub fn generate_keypair() -> (String, String) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (BASE64.encode(secret.to_bytes()), BASE64.encode(public.to_bytes()))
}

/// Derive the base64 public key from a base64 private key.
pub fn derive_public(private_b64: &str) -> Result<String, KeyError> {
    let bytes = decode_key(private_b64)?;
    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);
    Ok(BASE64.encode(public.to_bytes()))
}

/// Decode a base64 key, enforcing the 32-byte length.
pub fn decode_key(key_b64: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = BASE64
        .decode(key_b64)
        .map_err(|e| KeyError::InvalidEncoding(e.to_string()))?;
    if bytes.len() != KEY_LEN {
        return Err(KeyError::InvalidLength {
            expected: KEY_LEN,
            got: bytes.len(),
        });
    }
    let mut arr = [0u8; KEY_LEN];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Checks that a base64 string decodes to a 32-byte key.
pub fn validate_key(key_b64: &str) -> Result<(), KeyError> {
    decode_key(key_b64).map(|_| ())
}

/// Strategy for producing the pre-shared key of one peer pair.
///
/// The pair is unordered: callers must receive the same value for
/// `(a, b)` and `(b, a)`. `PskCache` canonicalizes the pair before the
/// strategy runs, so implementations only see sorted names.
pub trait PskStrategy: Send + Sync {
    fn derive(&self, first: &str, second: &str) -> String;
}

/// Deterministic PSK: `base64(SHA-256("wg-mesh-psk::" + a + "::" + b))`
/// over the sorted pair. Kept as the synthesis default so re-exports of
/// an existing mesh stay byte-identical.
///
/// Anyone who knows two peer names can reconstruct their PSK; meshes
/// that need secrecy should synthesize with [`RandomPsk`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DeterministicPsk;

impl PskStrategy for DeterministicPsk {
    fn derive(&self, first: &str, second: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(PSK_DOMAIN.as_bytes());
        hasher.update(first.as_bytes());
        hasher.update(b"::");
        hasher.update(second.as_bytes());
        BASE64.encode(hasher.finalize())
    }
}

/// CSPRNG PSK: 32 fresh random bytes per pair.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPsk;

impl PskStrategy for RandomPsk {
    fn derive(&self, _first: &str, _second: &str) -> String {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        BASE64.encode(bytes)
    }
}

/// Per-synthesis PSK cache: each unordered pair is derived exactly once,
/// so both sides of a tunnel render the same value even under the random
/// strategy.
pub struct PskCache<'a> {
    strategy: &'a dyn PskStrategy,
    cache: HashMap<(String, String), String>,
}

impl<'a> PskCache<'a> {
    pub fn new(strategy: &'a dyn PskStrategy) -> Self {
        Self {
            strategy,
            cache: HashMap::new(),
        }
    }

    /// PSK for the unordered pair `{a, b}`.
    pub fn get(&mut self, a: &str, b: &str) -> String {
        let key = pair_key(a, b);
        if let Some(psk) = self.cache.get(&key) {
            return psk.clone();
        }
        let psk = self.strategy.derive(&key.0, &key.1);
        self.cache.insert(key, psk.clone());
        psk
    }

    /// All cached pairs as `"a::b"` manifest keys, sorted.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self
            .cache
            .iter()
            .map(|((a, b), psk)| (format!("{a}::{b}"), psk.clone()))
            .collect();
        pairs.sort();
        pairs
    }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_generation_is_valid() {
        let (private, public) = generate_keypair();
        assert_eq!(decode_key(&private).unwrap().len(), KEY_LEN);
        assert_eq!(derive_public(&private).unwrap(), public);
    }

    #[test]
    fn derive_public_rejects_short_keys() {
        let short = BASE64.encode([0u8; 16]);
        match derive_public(&short) {
            Err(KeyError::InvalidLength { expected: 32, got: 16 }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn derive_public_rejects_bad_base64() {
        assert!(matches!(
            derive_public("not base64!!!"),
            Err(KeyError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn derive_public_matches_rfc7748_vector() {
        let private = [
            0x77, 0x07, 0x6d, 0x0a, 0x73, 0x18, 0xa5, 0x7d, 0x3c, 0x16, 0xc1, 0x72, 0x51, 0xb2,
            0x66, 0x45, 0xdf, 0x4c, 0x2f, 0x87, 0xeb, 0xc0, 0x99, 0x2a, 0xb1, 0x77, 0xfb, 0xa5,
            0x1d, 0xb9, 0x2c, 0x2a,
        ];
        let expected_public = [
            0x85, 0x20, 0xf0, 0x09, 0x89, 0x30, 0xa7, 0x54, 0x74, 0x8b, 0x7d, 0xdc, 0xb4, 0x3e,
            0xf7, 0x5a, 0x0d, 0xbf, 0x3a, 0x0d, 0x26, 0x38, 0x1a, 0xf4, 0xeb, 0xa4, 0xa9, 0x8e,
            0xaa, 0x9b, 0x4e, 0x6a,
        ];
        let derived = derive_public(&BASE64.encode(private)).unwrap();
        assert_eq!(derived, BASE64.encode(expected_public));
    }

    #[test]
    fn deterministic_psk_is_commutative() {
        let strategy = DeterministicPsk;
        let mut cache_ab = PskCache::new(&strategy);
        let mut cache_ba = PskCache::new(&strategy);
        assert_eq!(cache_ab.get("N1", "C1"), cache_ba.get("C1", "N1"));
    }

    #[test]
    fn deterministic_psk_is_stable_across_caches() {
        let strategy = DeterministicPsk;
        let a = PskCache::new(&strategy).get("alpha", "beta");
        let b = PskCache::new(&strategy).get("beta", "alpha");
        assert_eq!(a, b);
        assert_eq!(decode_key(&a).unwrap().len(), KEY_LEN);
    }

    #[test]
    fn random_psk_cached_per_pair_within_synthesis() {
        let strategy = RandomPsk;
        let mut cache = PskCache::new(&strategy);
        let first = cache.get("N1", "N2");
        let second = cache.get("N2", "N1");
        assert_eq!(first, second);

        // A fresh synthesis run draws a new value.
        let mut other = PskCache::new(&strategy);
        assert_ne!(first, other.get("N1", "N2"));
    }

    #[test]
    fn psk_pairs_are_sorted_manifest_keys() {
        let strategy = DeterministicPsk;
        let mut cache = PskCache::new(&strategy);
        cache.get("zeta", "alpha");
        cache.get("beta", "alpha");
        let pairs = cache.pairs();
        assert_eq!(pairs[0].0, "alpha::beta");
        assert_eq!(pairs[1].0, "alpha::zeta");
    }
}
