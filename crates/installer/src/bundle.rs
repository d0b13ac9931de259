//! Pack bundle builder.

use crate::artifact::{BUNDLE_ROOT, CHECKSUMS_PATH, MANIFEST_PATH, SIGNATURE_PATH};
use crate::error::{InstallError, InstallResult};
use packyard_core::{ChecksumFile, ContentHash, PackManifest};
use packyard_signer::PackSigner;
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;

/// Assembles a signed bundle from a manifest and asset bytes.
///
/// Asset digests in the manifest are (re)computed from the supplied bytes,
/// the checksum file is rendered from them and signed.
#[derive(Debug, Clone)]
pub struct BundleBuilder {
    manifest: PackManifest,
    assets: BTreeMap<String, Vec<u8>>,
}

impl BundleBuilder {
    pub fn new(manifest: PackManifest) -> Self {
        Self {
            manifest,
            assets: BTreeMap::new(),
        }
    }

    /// Load `<dir>/manifest.yaml` and every asset it declares, relative to `dir`.
    pub fn from_dir(dir: &Path) -> InstallResult<Self> {
        let manifest_path = dir.join(MANIFEST_PATH);
        let text = std::fs::read_to_string(&manifest_path).map_err(|e| {
            InstallError::InvalidRequest(format!("reading {}: {e}", manifest_path.display()))
        })?;
        // Digests may be blank in a source manifest, so validation waits for build().
        let manifest: PackManifest = serde_yaml::from_str(&text)
            .map_err(|e| InstallError::ManifestValidation(format!("invalid manifest: {e}")))?;

        let mut builder = Self::new(manifest);
        let paths: Vec<String> = builder.manifest.assets.iter().map(|a| a.path.clone()).collect();
        for path in paths {
            packyard_core::manifest::validate_asset_path(&path)
                .map_err(|e| InstallError::ManifestValidation(e.to_string()))?;
            let bytes = std::fs::read(dir.join(&path)).map_err(|e| {
                InstallError::InvalidRequest(format!("reading asset {path}: {e}"))
            })?;
            builder.assets.insert(path, bytes);
        }
        Ok(builder)
    }

    /// Set the bytes for a declared asset path.
    pub fn asset(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.assets.insert(path.into(), bytes.into());
        self
    }

    pub fn manifest(&self) -> &PackManifest {
        &self.manifest
    }

    /// Produce the bundle's files (paths relative to `pack/`) without zipping.
    pub fn build_files(&self, signer: &PackSigner) -> InstallResult<BundleFiles> {
        let mut manifest = self.manifest.clone();
        if manifest.signing.public_key_id != signer.key_id() {
            return Err(InstallError::InvalidRequest(format!(
                "manifest names signing key {} but the signer is {}",
                manifest.signing.public_key_id,
                signer.key_id()
            )));
        }

        let mut files = BTreeMap::new();
        for asset in &mut manifest.assets {
            let bytes = self.assets.get(&asset.path).ok_or_else(|| {
                InstallError::InvalidRequest(format!("no bytes supplied for asset {}", asset.path))
            })?;
            asset.sha256 = ContentHash::compute(bytes).to_hex();
            files.insert(asset.path.clone(), bytes.clone());
        }
        manifest
            .validate()
            .map_err(|e| InstallError::ManifestValidation(e.to_string()))?;

        let checksums = ChecksumFile::from_entries(
            manifest
                .assets
                .iter()
                .map(|a| (a.path.clone(), a.sha256.clone())),
        )
        .render();
        let signature = signer.sign(checksums.as_bytes());
        let manifest_yaml = manifest
            .to_yaml_string()
            .map_err(|e| InstallError::ManifestValidation(e.to_string()))?;

        files.insert(MANIFEST_PATH.to_string(), manifest_yaml.into_bytes());
        files.insert(CHECKSUMS_PATH.to_string(), checksums.into_bytes());
        files.insert(SIGNATURE_PATH.to_string(), format!("{signature}\n").into_bytes());
        Ok(BundleFiles { files })
    }

    /// Build the signed zip bundle.
    pub fn build(&self, signer: &PackSigner) -> InstallResult<Vec<u8>> {
        self.build_files(signer)?.to_zip()
    }
}

/// Bundle contents keyed by path relative to `pack/`.
#[derive(Debug, Clone, Default)]
pub struct BundleFiles {
    pub files: BTreeMap<String, Vec<u8>>,
}

impl BundleFiles {
    pub fn get_mut(&mut self, path: &str) -> Option<&mut Vec<u8>> {
        self.files.get_mut(path)
    }

    pub fn insert(&mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), bytes.into());
    }

    pub fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        self.files.remove(path)
    }

    /// Zip the files under `pack/`.
    pub fn to_zip(&self) -> InstallResult<Vec<u8>> {
        write_zip(
            self.files
                .iter()
                .map(|(path, bytes)| (format!("{BUNDLE_ROOT}{path}"), bytes.as_slice())),
        )
    }
}

/// Write entries verbatim into a deflated zip archive.
pub fn write_zip<'a, I, N>(entries: I) -> InstallResult<Vec<u8>>
where
    I: IntoIterator<Item = (N, &'a [u8])>,
    N: Into<String>,
{
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, bytes) in entries {
        let name: String = name.into();
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| InstallError::ArtifactFormat(format!("zip entry {name}: {e}")))?;
        writer
            .write_all(bytes)
            .map_err(|e| InstallError::ArtifactFormat(format!("zip entry {name}: {e}")))?;
    }
    let cursor = writer
        .finish()
        .map_err(|e| InstallError::ArtifactFormat(format!("finishing zip: {e}")))?;
    Ok(cursor.into_inner())
}
