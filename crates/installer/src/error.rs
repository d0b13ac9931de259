//! Install engine error types.

use crate::applier::ApplierError;
use packyard_metadata::MetadataError;
use thiserror::Error;
use time::OffsetDateTime;

/// How a caller should react to a failed install or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Safe to retry later without changes (contention, transient fetch failure).
    Retryable,
    /// The release or the tenant's state needs an operator.
    NeedsIntervention,
    /// The request itself was rejected; retrying it unchanged will fail again.
    Rejected,
}

/// Install and rollback errors.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("artifact fetch failed: {0}")]
    ArtifactFetch(String),

    #[error("artifact format error: {0}")]
    ArtifactFormat(String),

    #[error("manifest validation failed: {0}")]
    ManifestValidation(String),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("incompatible platform: {0}")]
    IncompatiblePlatform(String),

    #[error("missing dependency: pack {code} has no applied release")]
    MissingDependency { code: String },

    #[error("dependency {code} requires release {required}, latest applied is {applied}")]
    UnsatisfiedDependencyVersion {
        code: String,
        required: String,
        applied: String,
    },

    #[error("install lock {lock_key} is {}", describe_holder(.holder, .expires_at))]
    LockContention {
        lock_key: String,
        /// Unknown when another process was mid-transaction on the store.
        holder: Option<String>,
        expires_at: Option<OffsetDateTime>,
    },

    #[error("object {object_key} is owned by pack {owner}")]
    OwnershipConflict { object_key: String, owner: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unsupported asset type: {0}")]
    UnsupportedAssetType(String),

    #[error("payload format error in {path}: {message}")]
    PayloadFormat { path: String, message: String },

    #[error("install lease lost: {0}")]
    LeaseLost(String),

    #[error("asset applier failed for {object_key}: {source}")]
    Applier {
        object_key: String,
        #[source]
        source: ApplierError,
    },

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

impl InstallError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ArtifactFetch(_) => "artifact_fetch",
            Self::ArtifactFormat(_) => "artifact_format",
            Self::ManifestValidation(_) => "manifest_validation",
            Self::ChecksumMismatch(_) => "checksum_mismatch",
            Self::SignatureVerification(_) => "signature_verification",
            Self::IncompatiblePlatform(_) => "incompatible_platform",
            Self::MissingDependency { .. } => "missing_dependency",
            Self::UnsatisfiedDependencyVersion { .. } => "unsatisfied_dependency_version",
            Self::LockContention { .. } => "lock_contention",
            Self::OwnershipConflict { .. } => "ownership_conflict",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnsupportedAssetType(_) => "unsupported_asset_type",
            Self::PayloadFormat { .. } => "payload_format",
            Self::LeaseLost(_) => "lease_lost",
            Self::Applier { .. } => "applier_error",
            Self::Metadata(_) => "metadata_error",
        }
    }

    /// Classify the error for retry decisions.
    pub fn disposition(&self) -> ErrorDisposition {
        match self {
            Self::ArtifactFetch(_) | Self::LockContention { .. } | Self::LeaseLost(_) => {
                ErrorDisposition::Retryable
            }
            Self::ChecksumMismatch(_)
            | Self::SignatureVerification(_)
            | Self::OwnershipConflict { .. }
            | Self::Applier { .. }
            | Self::Metadata(_) => ErrorDisposition::NeedsIntervention,
            Self::ArtifactFormat(_)
            | Self::ManifestValidation(_)
            | Self::IncompatiblePlatform(_)
            | Self::MissingDependency { .. }
            | Self::UnsatisfiedDependencyVersion { .. }
            | Self::NotFound(_)
            | Self::Conflict(_)
            | Self::InvalidRequest(_)
            | Self::UnsupportedAssetType(_)
            | Self::PayloadFormat { .. } => ErrorDisposition::Rejected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == ErrorDisposition::Retryable
    }
}

fn describe_holder(holder: &Option<String>, expires_at: &Option<OffsetDateTime>) -> String {
    match (holder, expires_at) {
        (Some(holder), Some(expires_at)) => format!("held by {holder} until {expires_at}"),
        (Some(holder), None) => format!("held by {holder}"),
        _ => "busy: another install or rollback is writing to the store".to_string(),
    }
}

/// Result type for install operations.
pub type InstallResult<T> = std::result::Result<T, InstallError>;
