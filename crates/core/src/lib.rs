//! Core domain types shared across the packyard crates.
//!
//! This crate defines the canonical data model for pack releases:
//! - Pack manifests and their validation rules
//! - Release identifiers and their ordering
//! - Content hashes and the checksum manifest format
//! - Configuration consumed by the installer

pub mod checksum;
pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod release;

pub use checksum::ChecksumFile;
pub use error::{Error, Result};
pub use hash::ContentHash;
pub use manifest::{AssetEntry, DependencyEntry, InstallSection, PackManifest, SigningSection};
pub use release::{ReleaseId, compare_release_ids};

/// Asset types shipped by the platform, in their conventional apply order.
pub const STANDARD_ASSET_TYPES: [&str; 11] = [
    "metadata",
    "views",
    "navigation",
    "automation",
    "workflows",
    "access",
    "search",
    "localization",
    "ava",
    "insights",
    "connectors",
];

/// Maximum number of release records returned by a single listing.
pub const MAX_RELEASE_LIST_LIMIT: u32 = 200;

/// Listing size used when the caller does not ask for one.
pub const DEFAULT_RELEASE_LIST_LIMIT: u32 = 50;

/// Clamp a requested listing size into `1..=MAX_RELEASE_LIST_LIMIT`.
/// Zero selects [`DEFAULT_RELEASE_LIST_LIMIT`].
pub fn effective_list_limit(requested: u32) -> u32 {
    match requested {
        0 => DEFAULT_RELEASE_LIST_LIMIT,
        n => n.min(MAX_RELEASE_LIST_LIMIT),
    }
}
