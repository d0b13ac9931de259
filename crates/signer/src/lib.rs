//! Pack signing for packyard.
//!
//! This crate provides:
//! - Ed25519 key generation and management
//! - Detached signatures over checksum manifests
//! - A key ring resolving signing key ids to trusted public keys

pub mod error;
pub mod key;
pub mod signer;

pub use error::{SignerError, SignerResult};
pub use key::{KeyPair, PublicKey, SecretKey};
pub use signer::{KeyRing, PackSigner, verify_detached};
