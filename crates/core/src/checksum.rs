//! The checksum manifest (`checksums/assets.sha256`) carried by every bundle.
//!
//! Each non-blank line is `<64-hex-sha256> <relative-path>`. The raw bytes of
//! this file are what the pack signature covers.

use crate::hash::is_sha256_hex;
use std::collections::BTreeMap;

/// Parsed checksum manifest: relative path → lowercase sha256 hex.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChecksumFile {
    entries: BTreeMap<String, String>,
}

impl ChecksumFile {
    /// Parse checksum file contents.
    pub fn parse(input: &str) -> crate::Result<Self> {
        let mut entries = BTreeMap::new();
        for (idx, raw) in input.lines().enumerate() {
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            let line_no = idx + 1;
            let (digest, path) = line.split_once(char::is_whitespace).ok_or_else(|| {
                crate::Error::ChecksumFormat(format!("line {line_no}: expected '<sha256> <path>'"))
            })?;
            let digest = digest.to_ascii_lowercase();
            if !is_sha256_hex(&digest) {
                return Err(crate::Error::ChecksumFormat(format!(
                    "line {line_no}: invalid sha256 digest"
                )));
            }
            let path = path.trim();
            if path.is_empty() {
                return Err(crate::Error::ChecksumFormat(format!(
                    "line {line_no}: missing path"
                )));
            }
            if entries.insert(path.to_string(), digest).is_some() {
                return Err(crate::Error::ChecksumFormat(format!(
                    "line {line_no}: duplicate entry for {path}"
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Build from `(path, digest)` pairs.
    pub fn from_entries<I, P, D>(entries: I) -> Self
    where
        I: IntoIterator<Item = (P, D)>,
        P: Into<String>,
        D: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(p, d)| (p.into(), d.into().to_ascii_lowercase()))
                .collect(),
        }
    }

    /// Declared digest for a path.
    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    /// Iterate over `(path, digest)` pairs in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, d)| (p.as_str(), d.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render in canonical form (sorted by path, one entry per line).
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (path, digest) in &self.entries {
            out.push_str(digest);
            out.push(' ');
            out.push_str(path);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST_A: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    const DIGEST_B: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_lines() {
        let input = format!("{DIGEST_A} assets/a.yaml\n\n{DIGEST_B}  assets/b.json\r\n");
        let file = ChecksumFile::parse(&input).unwrap();
        assert_eq!(file.len(), 2);
        assert_eq!(file.get("assets/a.yaml"), Some(DIGEST_A));
        assert_eq!(file.get("assets/b.json"), Some(DIGEST_B));
    }

    #[test]
    fn test_parse_rejects_bad_digest() {
        let err = ChecksumFile::parse("abc assets/a.yaml\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_parse_rejects_missing_path_and_duplicates() {
        assert!(ChecksumFile::parse(DIGEST_A).is_err());
        let dup = format!("{DIGEST_A} a.yaml\n{DIGEST_B} a.yaml\n");
        assert!(ChecksumFile::parse(&dup).is_err());
    }

    #[test]
    fn test_render_parses_back() {
        let file = ChecksumFile::from_entries([("b.yaml", DIGEST_B), ("a.yaml", DIGEST_A)]);
        let rendered = file.render();
        assert!(rendered.starts_with(DIGEST_A));
        assert_eq!(ChecksumFile::parse(&rendered).unwrap(), file);
    }
}
