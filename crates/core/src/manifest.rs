//! Pack manifest (`manifest.yaml`) types and validation.

use crate::hash::is_sha256_hex;
use crate::release::{compare_release_ids, validate_release_id};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Declarative descriptor of one pack release.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackManifest {
    /// Pack identity.
    pub code: String,
    /// Release identifier, normally `YYYYMMDD.SEQ`.
    pub release_id: String,
    /// Lowest platform release this pack supports (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_min_release_id: Option<String>,
    /// Highest platform release this pack supports (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_max_release_id: Option<String>,
    /// Packs that must already be applied.
    #[serde(default)]
    pub dependencies: Vec<DependencyEntry>,
    pub signing: SigningSection,
    pub install: InstallSection,
    #[serde(default)]
    pub assets: Vec<AssetEntry>,
}

/// A required pack and its minimum release.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEntry {
    pub code: String,
    pub min_release_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningSection {
    /// Id of the public key the signature must verify against.
    pub public_key_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSection {
    /// Install lock key; defaults to `pack:{code}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_key: Option<String>,
    /// Asset types in the order they must be applied.
    pub apply_order: Vec<String>,
}

/// One typed, checksummed file within the bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    #[serde(rename = "type")]
    pub asset_type: String,
    /// Path relative to the bundle's `pack/` directory.
    pub path: String,
    /// May be left empty in source manifests; bundle builders fill it in.
    #[serde(default)]
    pub sha256: String,
}

impl AssetEntry {
    /// Stable identity of the configuration object this asset defines.
    pub fn object_key(&self) -> String {
        format!("{}:{}", self.asset_type, self.path)
    }
}

impl PackManifest {
    /// Parse and validate manifest YAML.
    pub fn from_yaml_str(input: &str) -> crate::Result<Self> {
        let manifest: Self = serde_yaml::from_str(input)
            .map_err(|e| crate::Error::ManifestValidation(format!("invalid manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Serialize to YAML.
    pub fn to_yaml_string(&self) -> crate::Result<String> {
        serde_yaml::to_string(self).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    /// Effective install lock key.
    pub fn lock_key(&self) -> String {
        match &self.install.lock_key {
            Some(key) => key.clone(),
            None => format!("pack:{}", self.code),
        }
    }

    /// Assets grouped in apply order, preserving manifest order within a type.
    pub fn assets_in_apply_order(&self) -> Vec<&AssetEntry> {
        self.install
            .apply_order
            .iter()
            .flat_map(|ty| self.assets.iter().filter(move |a| &a.asset_type == ty))
            .collect()
    }

    /// Check structural invariants.
    pub fn validate(&self) -> crate::Result<()> {
        validate_pack_code(&self.code)?;
        validate_release_id(&self.release_id)
            .map_err(|e| crate::Error::ManifestValidation(e.to_string()))?;

        for bound in [&self.platform_min_release_id, &self.platform_max_release_id]
            .into_iter()
            .flatten()
        {
            validate_release_id(bound)
                .map_err(|e| crate::Error::ManifestValidation(format!("platform bound: {e}")))?;
        }
        if let (Some(min), Some(max)) = (
            &self.platform_min_release_id,
            &self.platform_max_release_id,
        ) {
            if compare_release_ids(min, max) == Ordering::Greater {
                return Err(invalid(format!(
                    "platform_min_release_id {min} is greater than platform_max_release_id {max}"
                )));
            }
        }

        let mut dep_codes = HashSet::new();
        for dep in &self.dependencies {
            validate_pack_code(&dep.code)?;
            if dep.code == self.code {
                return Err(invalid(format!("pack '{}' depends on itself", self.code)));
            }
            if !dep_codes.insert(dep.code.as_str()) {
                return Err(invalid(format!("duplicate dependency '{}'", dep.code)));
            }
            validate_release_id(&dep.min_release_id)
                .map_err(|e| invalid(format!("dependency '{}': {e}", dep.code)))?;
        }

        if self.signing.public_key_id.trim().is_empty() {
            return Err(invalid("signing.public_key_id must not be empty"));
        }
        if let Some(key) = &self.install.lock_key {
            if key.trim().is_empty() {
                return Err(invalid("install.lock_key must not be empty when set"));
            }
        }

        if self.install.apply_order.is_empty() {
            return Err(invalid("install.apply_order must not be empty"));
        }
        let mut ordered = HashSet::new();
        for ty in &self.install.apply_order {
            if ty.trim().is_empty() {
                return Err(invalid("install.apply_order contains an empty type"));
            }
            if !ordered.insert(ty.as_str()) {
                return Err(invalid(format!("duplicate apply_order entry '{ty}'")));
            }
        }

        let mut paths = HashSet::new();
        for asset in &self.assets {
            if !ordered.contains(asset.asset_type.as_str()) {
                return Err(invalid(format!(
                    "asset {} has type '{}' which is not listed in install.apply_order",
                    asset.path, asset.asset_type
                )));
            }
            validate_asset_path(&asset.path)?;
            if !paths.insert(asset.path.as_str()) {
                return Err(invalid(format!("duplicate asset path {}", asset.path)));
            }
            if !is_sha256_hex(&asset.sha256) {
                return Err(invalid(format!(
                    "asset {} has invalid sha256 (expected 64 lowercase hex chars)",
                    asset.path
                )));
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> crate::Error {
    crate::Error::ManifestValidation(msg.into())
}

/// Validate a pack code: `[a-z0-9][a-z0-9._-]*`, at most 128 chars.
pub fn validate_pack_code(code: &str) -> crate::Result<()> {
    let mut chars = code.chars();
    let Some(first) = chars.next() else {
        return Err(invalid("pack code must not be empty"));
    };
    if code.len() > 128 {
        return Err(invalid(format!("pack code too long: {code}")));
    }
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return Err(invalid(format!(
            "pack code must start with a lowercase letter or digit: {code}"
        )));
    }
    let allowed =
        |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-');
    if !chars.all(allowed) {
        return Err(invalid(format!("pack code contains invalid characters: {code}")));
    }
    Ok(())
}

/// Validate a bundle-relative asset path.
pub fn validate_asset_path(path: &str) -> crate::Result<()> {
    if path.is_empty() {
        return Err(invalid("asset path must not be empty"));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(invalid(format!("asset path must be relative: {path}")));
    }
    if path
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(invalid(format!("asset path is not normalized: {path}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn sample_yaml() -> String {
        format!(
            r#"
code: crm-core
release_id: "20240115.001"
platform_min_release_id: "20240101.001"
dependencies:
  - code: base
    min_release_id: "20231201.001"
signing:
  public_key_id: release-key-1
install:
  apply_order: [metadata, views]
assets:
  - type: views
    path: assets/views/list.yaml
    sha256: {DIGEST}
  - type: metadata
    path: assets/metadata/accounts.yaml
    sha256: {DIGEST}
  - type: metadata
    path: assets/metadata/contacts.yaml
    sha256: {DIGEST}
"#
        )
    }

    #[test]
    fn test_parse_valid_manifest() {
        let manifest = PackManifest::from_yaml_str(&sample_yaml()).unwrap();
        assert_eq!(manifest.code, "crm-core");
        assert_eq!(manifest.release_id, "20240115.001");
        assert_eq!(manifest.dependencies.len(), 1);
        assert_eq!(manifest.lock_key(), "pack:crm-core");
        assert_eq!(manifest.platform_max_release_id, None);
    }

    #[test]
    fn test_apply_order_grouping() {
        let manifest = PackManifest::from_yaml_str(&sample_yaml()).unwrap();
        let paths: Vec<_> = manifest
            .assets_in_apply_order()
            .into_iter()
            .map(|a| a.path.as_str())
            .collect();
        assert_eq!(
            paths,
            vec![
                "assets/metadata/accounts.yaml",
                "assets/metadata/contacts.yaml",
                "assets/views/list.yaml"
            ]
        );
        assert_eq!(
            manifest.assets[0].object_key(),
            "views:assets/views/list.yaml"
        );
    }

    #[test]
    fn test_rejects_type_missing_from_apply_order() {
        let yaml =
            sample_yaml().replace("apply_order: [metadata, views]", "apply_order: [metadata]");
        let err = PackManifest::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("not listed in install.apply_order"));
    }

    #[test]
    fn test_rejects_duplicate_paths_and_bad_digest() {
        let yaml = sample_yaml().replace(
            "assets/metadata/contacts.yaml",
            "assets/metadata/accounts.yaml",
        );
        assert!(PackManifest::from_yaml_str(&yaml).is_err());

        let yaml = sample_yaml().replacen(DIGEST, "not-a-digest", 1);
        assert!(PackManifest::from_yaml_str(&yaml).is_err());
    }

    #[test]
    fn test_rejects_missing_required_sections() {
        let err = PackManifest::from_yaml_str("code: x\nrelease_id: \"1\"\n").unwrap_err();
        assert!(matches!(err, crate::Error::ManifestValidation(_)));
    }

    #[test]
    fn test_rejects_inverted_platform_range() {
        let yaml = sample_yaml().replace(
            "platform_min_release_id: \"20240101.001\"",
            "platform_min_release_id: \"20250101.001\"\nplatform_max_release_id: \"20240101.001\"",
        );
        let err = PackManifest::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("greater than"));
    }

    #[test]
    fn test_pack_code_and_path_rules() {
        assert!(validate_pack_code("crm-core.v2_x").is_ok());
        assert!(validate_pack_code("").is_err());
        assert!(validate_pack_code("-crm").is_err());
        assert!(validate_pack_code("CRM").is_err());

        assert!(validate_asset_path("assets/a.yaml").is_ok());
        assert!(validate_asset_path("/etc/passwd").is_err());
        assert!(validate_asset_path("assets/../secret").is_err());
        assert!(validate_asset_path("assets//a.yaml").is_err());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let yaml = sample_yaml().replace("code: base", "code: crm-core");
        assert!(PackManifest::from_yaml_str(&yaml).is_err());
    }
}
