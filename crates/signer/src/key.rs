//! Ed25519 key types and operations.
//!
//! Secret keys are exchanged as `key-id:base64(secret || public)`; public keys
//! as bare base64 (in configuration) or `key-id:base64(public)`.

use crate::error::{SignerError, SignerResult};
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;

/// A secret (private) key for signing.
pub struct SecretKey {
    inner: SigningKey,
}

impl SecretKey {
    /// Generate a new random secret key.
    pub fn generate() -> Self {
        let mut rng = rand_core::OsRng;
        Self {
            inner: SigningKey::generate(&mut rng),
        }
    }

    /// Parse from `key-id:base64(secret || public)`.
    pub fn from_keyed_format(s: &str) -> SignerResult<(String, Self)> {
        let (name, b64) = split_keyed(s)?;
        let bytes = decode_b64(b64)?;

        if bytes.len() != 64 {
            return Err(SignerError::KeyParsing(format!(
                "expected 64 bytes, got {}",
                bytes.len()
            )));
        }

        let secret_bytes: [u8; 32] = bytes[..32]
            .try_into()
            .map_err(|_| SignerError::KeyParsing("invalid secret key bytes".to_string()))?;
        let inner = SigningKey::from_bytes(&secret_bytes);

        if inner.verifying_key().as_bytes() != &bytes[32..] {
            return Err(SignerError::KeyParsing(
                "embedded public key does not match secret key".to_string(),
            ));
        }

        Ok((name.to_string(), Self { inner }))
    }

    /// Encode as `key-id:base64(secret || public)`.
    pub fn to_keyed_format(&self, key_id: &str) -> String {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(self.inner.as_bytes());
        bytes.extend_from_slice(self.inner.verifying_key().as_bytes());
        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        format!("{key_id}:{b64}")
    }

    /// Get the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.inner
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// A public key for verification.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Parse from bare base64 (32 bytes).
    pub fn from_base64(s: &str) -> SignerResult<Self> {
        let bytes = decode_b64(s.trim())?;
        if bytes.len() != 32 {
            return Err(SignerError::KeyParsing(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let key_bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignerError::KeyParsing("invalid public key bytes".to_string()))?;
        let inner = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| SignerError::KeyParsing(format!("invalid public key: {e}")))?;
        Ok(Self { inner })
    }

    /// Parse from `key-id:base64(public)`.
    pub fn from_keyed_format(s: &str) -> SignerResult<(String, Self)> {
        let (name, b64) = split_keyed(s)?;
        Ok((name.to_string(), Self::from_base64(b64)?))
    }

    /// Encode as bare base64.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.inner.as_bytes())
    }

    /// Encode as `key-id:base64(public)`.
    pub fn to_keyed_format(&self, key_id: &str) -> String {
        format!("{key_id}:{}", self.to_base64())
    }

    pub(crate) fn verifying_key(&self) -> &VerifyingKey {
        &self.inner
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

/// A key pair containing both secret and public keys.
pub struct KeyPair {
    /// The key id packs refer to in `signing.public_key_id`.
    pub key_id: String,
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new key pair with the given id.
    pub fn generate(key_id: impl Into<String>) -> Self {
        let secret = SecretKey::generate();
        let public = secret.public_key();
        Self {
            key_id: key_id.into(),
            secret,
            public,
        }
    }

    /// Parse from the keyed secret key format.
    pub fn from_secret_key(s: &str) -> SignerResult<Self> {
        let (key_id, secret) = SecretKey::from_keyed_format(s.trim())?;
        let public = secret.public_key();
        Ok(Self {
            key_id,
            secret,
            public,
        })
    }

    pub fn to_secret_key(&self) -> String {
        self.secret.to_keyed_format(&self.key_id)
    }

    pub fn to_public_key(&self) -> String {
        self.public.to_keyed_format(&self.key_id)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id)
            .field("public", &self.public)
            .finish()
    }
}

fn split_keyed(s: &str) -> SignerResult<(&str, &str)> {
    let (name, b64) = s
        .split_once(':')
        .ok_or_else(|| SignerError::KeyParsing("expected 'key-id:base64' format".to_string()))?;
    if name.is_empty() {
        return Err(SignerError::KeyParsing("key id must not be empty".to_string()));
    }
    Ok((name, b64))
}

fn decode_b64(s: &str) -> SignerResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| SignerError::KeyParsing(format!("invalid base64: {e}")))
}
