//! Pack install and rollback engine.
//!
//! A pack release travels through:
//! - [`artifact`]: fetch the bundle and verify checksums and signature
//! - [`compat`]: platform range and dependency checks
//! - [`plan`]: decode every asset into an ordered apply plan
//! - [`lock`]: take the lease for the manifest's lock key
//! - [`installer`]: apply the plan in one transaction
//!
//! [`rollback`] undoes the most recent applied release of a pack by
//! restoring each object's previous live revision.

pub mod applier;
pub mod artifact;
pub mod bundle;
pub mod compat;
pub mod document;
pub mod error;
pub mod installer;
pub mod lock;
pub mod payload;
pub mod plan;
pub mod request;
pub mod rollback;
pub mod summary;

pub use applier::{ApplierError, ApplierRegistry, ApplyContext, AssetApplier};
pub use artifact::{
    ArtifactLoader, ArtifactSource, HttpArtifactSource, MemoryArtifactSource, PackArtifact,
};
pub use bundle::{BundleBuilder, BundleFiles};
pub use document::DocumentApplier;
pub use error::{ErrorDisposition, InstallError, InstallResult};
pub use installer::{InstallSettings, PackInstaller};
pub use lock::{InstallLock, LockLease};
pub use request::{Actor, ActorKind, InstallRequest, RollbackRequest, RollbackTarget};
pub use summary::{
    InstallOutcome, InstallSummary, ReleaseReport, RollbackOutcome, RollbackSummary, TypeCounts,
};
