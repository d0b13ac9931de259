//! Repository traits for metadata operations.

pub mod config_objects;
pub mod locks;
pub mod objects;
pub mod releases;

pub use config_objects::ConfigObjectRepo;
pub use locks::{LockAcquisition, LockRepo};
pub use objects::ObjectRepo;
pub use releases::{ReleaseCompletion, ReleaseFilter, ReleaseRepo, ReleaseStatus};
