//! Platform compatibility and dependency checks.

use crate::error::{InstallError, InstallResult};
use packyard_core::release::release_in_range;
use packyard_core::{PackManifest, compare_release_ids};
use packyard_metadata::repos::ReleaseRepo;
use std::cmp::Ordering;

/// Fail if `platform_release_id` is outside the manifest's supported range.
pub fn assert_compatibility(
    manifest: &PackManifest,
    platform_release_id: &str,
) -> InstallResult<()> {
    let min = manifest.platform_min_release_id.as_deref();
    let max = manifest.platform_max_release_id.as_deref();
    if release_in_range(platform_release_id, min, max) {
        return Ok(());
    }
    Err(InstallError::IncompatiblePlatform(format!(
        "pack {} release {} supports platform releases [{}, {}], current platform is {}",
        manifest.code,
        manifest.release_id,
        min.unwrap_or("*"),
        max.unwrap_or("*"),
        platform_release_id
    )))
}

/// Fail unless the most recently applied release of every declared
/// dependency is at or above its minimum release id.
pub async fn assert_dependencies<R>(releases: &R, manifest: &PackManifest) -> InstallResult<()>
where
    R: ReleaseRepo + ?Sized,
{
    for dependency in &manifest.dependencies {
        let latest = releases
            .latest_applied_release(&dependency.code)
            .await?
            .ok_or_else(|| InstallError::MissingDependency {
                code: dependency.code.clone(),
            })?;
        let applied = latest.pack_release_id.as_str();

        if compare_release_ids(applied, &dependency.min_release_id) == Ordering::Less {
            return Err(InstallError::UnsatisfiedDependencyVersion {
                code: dependency.code.clone(),
                required: dependency.min_release_id.clone(),
                applied: latest.pack_release_id.clone(),
            });
        }
        tracing::debug!(
            dependency = %dependency.code,
            applied = %applied,
            required = %dependency.min_release_id,
            "Dependency satisfied"
        );
    }
    Ok(())
}
