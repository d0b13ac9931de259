//! Artifact loading: fetch, extract and verify a pack bundle.
//!
//! A bundle is a zip archive whose entries live under `pack/`:
//! - `pack/manifest.yaml`
//! - `pack/checksums/assets.sha256`
//! - `pack/signatures/pack.sig` (detached signature over the checksum file)
//! - `pack/<asset.path>` for every declared asset
//!
//! Nothing in a bundle is trusted until [`ArtifactLoader::verify`] succeeds.

use crate::error::{InstallError, InstallResult};
use async_trait::async_trait;
use packyard_core::{ChecksumFile, ContentHash, PackManifest};
use packyard_signer::KeyRing;
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Prefix every bundle entry lives under.
pub const BUNDLE_ROOT: &str = "pack/";
pub const MANIFEST_PATH: &str = "manifest.yaml";
pub const CHECKSUMS_PATH: &str = "checksums/assets.sha256";
pub const SIGNATURE_PATH: &str = "signatures/pack.sig";

/// Default cap on the total uncompressed size of one bundle.
pub const DEFAULT_MAX_EXTRACTED_BYTES: u64 = 256 * 1024 * 1024;

/// A source of bundle bytes addressed by URL.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Fetch the raw bundle bytes.
    async fn fetch(&self, url: &str) -> InstallResult<Vec<u8>>;
}

/// Fetches bundles over HTTP(S), or from disk for `file://` URLs.
pub struct HttpArtifactSource {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpArtifactSource {
    /// Create a source that aborts any fetch running longer than `timeout`.
    pub fn new(timeout: Duration) -> InstallResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InstallError::ArtifactFetch(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }

    async fn fetch_http(&self, url: &str) -> InstallResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| InstallError::ArtifactFetch(format!("request to {url} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(InstallError::ArtifactFetch(format!(
                "{url} returned HTTP {status}"
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| InstallError::ArtifactFetch(format!("reading {url} failed: {e}")))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn fetch(&self, url: &str) -> InstallResult<Vec<u8>> {
        let fetch = async {
            match url.strip_prefix("file://") {
                Some(path) => tokio::fs::read(path).await.map_err(|e| {
                    InstallError::ArtifactFetch(format!("reading {path} failed: {e}"))
                }),
                None => self.fetch_http(url).await,
            }
        };

        match tokio::time::timeout(self.timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(InstallError::ArtifactFetch(format!(
                "fetching {url} timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

/// In-memory bundle source keyed by URL.
#[derive(Default)]
pub struct MemoryArtifactSource {
    bundles: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish (or replace) the bytes served for `url`.
    pub async fn insert(&self, url: impl Into<String>, bytes: Vec<u8>) {
        self.bundles.write().await.insert(url.into(), bytes);
    }
}

#[async_trait]
impl ArtifactSource for MemoryArtifactSource {
    async fn fetch(&self, url: &str) -> InstallResult<Vec<u8>> {
        self.bundles
            .read()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| {
                InstallError::ArtifactFetch(format!("{url} returned HTTP 404 Not Found"))
            })
    }
}

/// A downloaded and fully verified bundle.
#[derive(Debug, Clone)]
pub struct PackArtifact {
    pub manifest: PackManifest,
    /// Extracted files keyed by path relative to `pack/`.
    pub files: BTreeMap<String, Vec<u8>>,
    pub checksums: ChecksumFile,
    /// Detached signature text as shipped in the bundle.
    pub signature: String,
    /// sha256 of the raw bundle bytes.
    pub artifact_sha256: String,
}

impl PackArtifact {
    /// Bytes of a declared asset.
    pub fn asset_bytes(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }
}

/// Fetches bundles and checks them against the trusted key ring.
#[derive(Clone)]
pub struct ArtifactLoader {
    source: Arc<dyn ArtifactSource>,
    keys: KeyRing,
    max_extracted_bytes: u64,
}

impl ArtifactLoader {
    pub fn new(source: Arc<dyn ArtifactSource>, keys: KeyRing) -> Self {
        Self {
            source,
            keys,
            max_extracted_bytes: DEFAULT_MAX_EXTRACTED_BYTES,
        }
    }

    /// Cap the total uncompressed size a bundle may expand to.
    pub fn with_max_extracted_bytes(mut self, limit: u64) -> Self {
        self.max_extracted_bytes = limit;
        self
    }

    /// Fetch and verify the bundle at `url`.
    pub async fn load(&self, url: &str) -> InstallResult<PackArtifact> {
        let bytes = self.source.fetch(url).await?;
        tracing::debug!(url = %url, size = bytes.len(), "Fetched pack artifact");
        self.verify(&bytes)
    }

    /// Verify raw bundle bytes.
    pub fn verify(&self, bytes: &[u8]) -> InstallResult<PackArtifact> {
        let artifact_sha256 = ContentHash::compute(bytes).to_hex();
        let mut files = extract_bundle(bytes, self.max_extracted_bytes)?;

        let manifest_bytes = take_required(&mut files, MANIFEST_PATH)?;
        let checksum_bytes = take_required(&mut files, CHECKSUMS_PATH)?;
        let signature_bytes = take_required(&mut files, SIGNATURE_PATH)?;

        let manifest_text = utf8(MANIFEST_PATH, &manifest_bytes)?;
        let manifest = PackManifest::from_yaml_str(manifest_text)
            .map_err(|e| InstallError::ManifestValidation(e.to_string()))?;

        let checksum_text = utf8(CHECKSUMS_PATH, &checksum_bytes)?;
        let checksums = ChecksumFile::parse(checksum_text)
            .map_err(|e| InstallError::ArtifactFormat(format!("{CHECKSUMS_PATH}: {e}")))?;

        verify_checksums(&manifest, &checksums, &files)?;

        let signature = utf8(SIGNATURE_PATH, &signature_bytes)?.trim().to_string();
        self.keys
            .verify(&manifest.signing.public_key_id, &checksum_bytes, &signature)
            .map_err(|e| InstallError::SignatureVerification(e.to_string()))?;

        tracing::info!(
            pack = %manifest.code,
            release = %manifest.release_id,
            assets = manifest.assets.len(),
            artifact_sha256 = %artifact_sha256,
            "Verified pack artifact"
        );

        Ok(PackArtifact {
            manifest,
            files,
            checksums,
            signature,
            artifact_sha256,
        })
    }
}

/// Every declared asset must be present and hash to both the manifest's and
/// the checksum file's digest; every checksum entry must name a declared asset.
fn verify_checksums(
    manifest: &PackManifest,
    checksums: &ChecksumFile,
    files: &BTreeMap<String, Vec<u8>>,
) -> InstallResult<()> {
    for asset in &manifest.assets {
        let bytes = files.get(&asset.path).ok_or_else(|| {
            InstallError::ChecksumMismatch(format!(
                "asset {} is missing from the bundle",
                asset.path
            ))
        })?;
        let listed = checksums.get(&asset.path).ok_or_else(|| {
            InstallError::ChecksumMismatch(format!(
                "asset {} has no entry in {CHECKSUMS_PATH}",
                asset.path
            ))
        })?;

        let actual = ContentHash::compute(bytes);
        actual.verify_hex(&asset.sha256).map_err(|e| {
            InstallError::ChecksumMismatch(format!("{} (manifest): {e}", asset.path))
        })?;
        actual.verify_hex(listed).map_err(|e| {
            InstallError::ChecksumMismatch(format!("{} ({CHECKSUMS_PATH}): {e}", asset.path))
        })?;
    }

    for (path, _) in checksums.iter() {
        if !manifest.assets.iter().any(|a| a.path == path) {
            return Err(InstallError::ChecksumMismatch(format!(
                "{CHECKSUMS_PATH} lists {path}, which the manifest does not declare"
            )));
        }
    }
    Ok(())
}

/// Extract all `pack/` entries into memory, keyed by path relative to `pack/`.
///
/// Entries with absolute paths or `..` components are rejected; entries
/// outside `pack/` are ignored. The extracted `pack/` entries may total at
/// most `max_bytes`, measured both by the sizes the archive declares and by
/// the bytes actually inflated.
pub fn extract_bundle(bytes: &[u8], max_bytes: u64) -> InstallResult<BTreeMap<String, Vec<u8>>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| InstallError::ArtifactFormat(format!("not a valid zip archive: {e}")))?;

    let mut remaining = max_bytes;
    let mut files = BTreeMap::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| InstallError::ArtifactFormat(format!("unreadable entry #{index}: {e}")))?;
        let name = entry.name().to_string();
        if !is_safe_entry_name(&name) {
            return Err(InstallError::ArtifactFormat(format!(
                "unsafe archive entry path: {name}"
            )));
        }
        if entry.is_dir() {
            continue;
        }
        let Some(relative) = name.strip_prefix(BUNDLE_ROOT) else {
            tracing::debug!(entry = %name, "Ignoring archive entry outside pack/");
            continue;
        };

        if entry.size() > remaining {
            return Err(too_large(&name, entry.size(), max_bytes));
        }
        let mut contents = Vec::new();
        entry
            .by_ref()
            .take(remaining.saturating_add(1))
            .read_to_end(&mut contents)
            .map_err(|e| InstallError::ArtifactFormat(format!("failed to read {name}: {e}")))?;
        let read = contents.len() as u64;
        if read > remaining {
            return Err(too_large(&name, read, max_bytes));
        }
        remaining -= read;

        if files.insert(relative.to_string(), contents).is_some() {
            return Err(InstallError::ArtifactFormat(format!(
                "duplicate archive entry: {name}"
            )));
        }
    }
    Ok(files)
}

fn too_large(name: &str, size: u64, max_bytes: u64) -> InstallError {
    InstallError::ArtifactFormat(format!(
        "{name} expands to {size} bytes, over the bundle limit of {max_bytes} bytes in total"
    ))
}

fn is_safe_entry_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('/') || name.starts_with('\\') || name.contains(':') {
        return false;
    }
    Path::new(name)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        && !name.split(['/', '\\']).any(|part| part == "..")
}

fn take_required(files: &mut BTreeMap<String, Vec<u8>>, path: &str) -> InstallResult<Vec<u8>> {
    files.remove(path).ok_or_else(|| {
        InstallError::ArtifactFormat(format!("missing required file {BUNDLE_ROOT}{path}"))
    })
}

fn utf8<'a>(path: &str, bytes: &'a [u8]) -> InstallResult<&'a str> {
    std::str::from_utf8(bytes).map_err(|_| {
        InstallError::ArtifactFormat(format!("{BUNDLE_ROOT}{path} is not valid UTF-8"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_entry_names() {
        assert!(is_safe_entry_name("pack/manifest.yaml"));
        assert!(is_safe_entry_name("pack/assets/views/home.yaml"));
        assert!(!is_safe_entry_name("/etc/passwd"));
        assert!(!is_safe_entry_name("pack/../../evil"));
        assert!(!is_safe_entry_name("..\\evil"));
        assert!(!is_safe_entry_name("C:/windows"));
    }

    #[test]
    fn test_extract_rejects_garbage() {
        let err =
            extract_bundle(b"definitely not a zip", DEFAULT_MAX_EXTRACTED_BYTES).unwrap_err();
        assert!(matches!(err, InstallError::ArtifactFormat(_)));
    }

    fn stored_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        use std::io::Write;
        use zip::write::SimpleFileOptions;

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, bytes) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extract_rejects_inflated_size_header() {
        let mut bytes = stored_zip(&[("pack/manifest.yaml", &b"code: crm\n"[..])]);

        // Claim a multi-gigabyte uncompressed size in the central directory.
        let central = bytes
            .windows(4)
            .position(|w| w == [0x50, 0x4b, 0x01, 0x02])
            .unwrap();
        bytes[central + 24..central + 28].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());

        let err = extract_bundle(&bytes, DEFAULT_MAX_EXTRACTED_BYTES).unwrap_err();
        assert!(matches!(err, InstallError::ArtifactFormat(_)), "{err}");
    }

    #[test]
    fn test_extract_enforces_total_limit() {
        let bytes = stored_zip(&[
            ("pack/a.yaml", &[b'a'; 600][..]),
            ("pack/b.yaml", &[b'b'; 600][..]),
            ("outside/c.yaml", &[b'c'; 4096][..]),
        ]);

        let files = extract_bundle(&bytes, 1200).unwrap();
        assert_eq!(files.len(), 2);

        let err = extract_bundle(&bytes, 1000).unwrap_err();
        match err {
            InstallError::ArtifactFormat(message) => {
                assert!(message.contains("pack/b.yaml"), "{message}")
            }
            other => panic!("expected artifact format error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_memory_source_missing_url() {
        let source = MemoryArtifactSource::new();
        source.insert("mem://a", vec![1, 2, 3]).await;
        assert_eq!(source.fetch("mem://a").await.unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            source.fetch("mem://b").await,
            Err(InstallError::ArtifactFetch(_))
        ));
    }
}
