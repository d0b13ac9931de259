//! Detached signatures over pack checksum manifests.
//!
//! A pack signature is the base64 encoding of a 64-byte ed25519 signature
//! over the raw bytes of `checksums/assets.sha256`.

use crate::error::{SignerError, SignerResult};
use crate::key::{KeyPair, PublicKey};
use base64::Engine;
use ed25519_dalek::Signer as _;
use ed25519_dalek::Verifier;
use std::collections::BTreeMap;

/// Produces detached pack signatures.
pub struct PackSigner {
    keypair: KeyPair,
}

impl PackSigner {
    /// Create a new signer from a key pair.
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    /// Create from a keyed secret key string.
    pub fn from_secret_key(s: &str) -> SignerResult<Self> {
        Ok(Self::new(KeyPair::from_secret_key(s)?))
    }

    /// Generate a new signer with a random key.
    pub fn generate(key_id: impl Into<String>) -> Self {
        Self::new(KeyPair::generate(key_id))
    }

    pub fn key_id(&self) -> &str {
        &self.keypair.key_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    /// Sign `payload`, returning the text-encoded signature.
    pub fn sign(&self, payload: &[u8]) -> String {
        let sig = self.keypair.secret.signing_key().sign(payload);
        base64::engine::general_purpose::STANDARD.encode(sig.to_bytes())
    }
}

/// Verify a text-encoded detached signature.
pub fn verify_detached(
    payload: &[u8],
    signature: &str,
    public_key: &PublicKey,
) -> SignerResult<()> {
    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(signature.trim())
        .map_err(|e| SignerError::InvalidSignature(format!("invalid base64: {e}")))?;

    let sig_array: [u8; 64] = sig_bytes.try_into().map_err(|bytes: Vec<u8>| {
        SignerError::InvalidSignature(format!("expected 64 bytes, got {}", bytes.len()))
    })?;

    let signature = ed25519_dalek::Signature::from_bytes(&sig_array);

    public_key
        .verifying_key()
        .verify(payload, &signature)
        .map_err(|_| SignerError::VerificationFailed)
}

/// Trusted public keys, addressed by key id.
#[derive(Clone, Debug, Default)]
pub struct KeyRing {
    keys: BTreeMap<String, PublicKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a configuration map of key id → base64 public key.
    pub fn from_base64_map<'a, I>(entries: I) -> SignerResult<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut ring = Self::new();
        for (key_id, encoded) in entries {
            let key = PublicKey::from_base64(encoded)
                .map_err(|e| SignerError::KeyParsing(format!("key '{key_id}': {e}")))?;
            ring.insert(key_id.clone(), key);
        }
        Ok(ring)
    }

    pub fn insert(&mut self, key_id: impl Into<String>, key: PublicKey) {
        self.keys.insert(key_id.into(), key);
    }

    pub fn get(&self, key_id: &str) -> Option<&PublicKey> {
        self.keys.get(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Verify `signature` over `payload` with the key registered as `key_id`.
    pub fn verify(&self, key_id: &str, payload: &[u8], signature: &str) -> SignerResult<()> {
        let key = self
            .get(key_id)
            .ok_or_else(|| SignerError::UnknownKey(key_id.to_string()))?;
        verify_detached(payload, signature, key)
    }
}
