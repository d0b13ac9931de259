//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path (`:memory:` for an ephemeral store).
        path: PathBuf,
        /// Query timeout in seconds (advisory only - SQLite cannot force-cancel queries).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
        /// How long a write waits for another connection's writer lock, in milliseconds.
        #[serde(default)]
        busy_timeout_ms: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600)
}

/// Busy timeout used when `busy_timeout_ms` is unset.
pub const DEFAULT_SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/packyard.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
            busy_timeout_ms: None,
        }
    }
}

/// The platform this instance runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Current platform release id, checked against pack compatibility ranges.
    pub release_id: String,
}

/// Pack signature verification keys.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SigningKeysConfig {
    /// Key id → base64-encoded ed25519 public key.
    #[serde(default)]
    pub public_keys: BTreeMap<String, String>,
}

/// Install/rollback engine tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Install lock lease duration in seconds.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Artifact download timeout in milliseconds.
    #[serde(default = "default_artifact_timeout_ms")]
    pub artifact_timeout_ms: u64,
    /// Upper bound on one apply/rollback transaction, in seconds.
    /// Defaults to half the lock TTL and must stay below it so the lease
    /// cannot expire while a transaction is still running.
    #[serde(default)]
    pub max_apply_secs: Option<u64>,
    /// Total uncompressed bytes one bundle may expand to.
    #[serde(default = "default_max_extracted_bytes")]
    pub max_extracted_bytes: u64,
}

fn default_lock_ttl_secs() -> u64 {
    600
}

fn default_artifact_timeout_ms() -> u64 {
    60_000
}

fn default_max_extracted_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl_secs(),
            artifact_timeout_ms: default_artifact_timeout_ms(),
            max_apply_secs: None,
            max_extracted_bytes: default_max_extracted_bytes(),
        }
    }
}

impl InstallConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn artifact_timeout(&self) -> Duration {
        Duration::from_millis(self.artifact_timeout_ms)
    }

    /// Effective apply deadline.
    pub fn max_apply_duration(&self) -> Duration {
        match self.max_apply_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_millis(self.lock_ttl_secs.saturating_mul(1000) / 2),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.lock_ttl_secs == 0 {
            return Err("install.lock_ttl_secs must be greater than zero".to_string());
        }
        if self.artifact_timeout_ms == 0 {
            return Err("install.artifact_timeout_ms must be greater than zero".to_string());
        }
        if self.max_extracted_bytes == 0 {
            return Err("install.max_extracted_bytes must be greater than zero".to_string());
        }
        if let Some(max) = self.max_apply_secs {
            if max == 0 || max >= self.lock_ttl_secs {
                return Err(format!(
                    "install.max_apply_secs ({max}) must be between 1 and \
                     lock_ttl_secs ({}) exclusive",
                    self.lock_ttl_secs
                ));
            }
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Platform identity (required).
    pub platform: PlatformConfig,
    /// Signature verification keys (required).
    #[serde(default)]
    pub signing: SigningKeysConfig,
    /// Install engine configuration.
    #[serde(default)]
    pub install: InstallConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses an in-memory SQLite store and no keys.
    pub fn for_testing() -> Self {
        Self {
            metadata: MetadataConfig::Sqlite {
                path: PathBuf::from(":memory:"),
                query_timeout_secs: None,
                busy_timeout_ms: None,
            },
            platform: PlatformConfig {
                release_id: "20240601.001".to_string(),
            },
            signing: SigningKeysConfig::default(),
            install: InstallConfig::default(),
        }
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> crate::Result<()> {
        if self.platform.release_id.trim().is_empty() {
            return Err(crate::Error::Config(
                "platform.release_id must be set".to_string(),
            ));
        }
        if self.signing.public_keys.is_empty() {
            return Err(crate::Error::Config(
                "signing.public_keys must contain at least one key".to_string(),
            ));
        }
        self.install.validate().map_err(crate::Error::Config)?;
        Ok(())
    }
}
