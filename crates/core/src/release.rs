//! Release identifiers and their ordering.
//!
//! Pack releases are named `YYYYMMDD.SEQ` (for example `20240115.001`).
//! Conforming ids compare as `(date, sequence)` tuples so that `20240115.10`
//! sorts after `20240115.9`. Any comparison involving a non-conforming id falls
//! back to plain lexicographic ordering of the raw strings.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A parsed `YYYYMMDD.SEQ` release identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReleaseId {
    date: u32,
    seq: u64,
}

impl ReleaseId {
    /// Parse a release id, returning `None` when it is not of form `YYYYMMDD.SEQ`.
    pub fn parse(s: &str) -> Option<Self> {
        let (date, seq) = s.split_once('.')?;
        if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            date: date.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }

    /// Date component as `YYYYMMDD`.
    pub fn date(&self) -> u32 {
        self.date
    }

    /// Sequence component.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}.{:03}", self.date, self.seq)
    }
}

/// Compare two release id strings.
pub fn compare_release_ids(a: &str, b: &str) -> Ordering {
    match (ReleaseId::parse(a), ReleaseId::parse(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Returns true when `id` lies within the optional inclusive bounds.
pub fn release_in_range(id: &str, min: Option<&str>, max: Option<&str>) -> bool {
    if let Some(min) = min {
        if compare_release_ids(id, min) == Ordering::Less {
            return false;
        }
    }
    if let Some(max) = max {
        if compare_release_ids(id, max) == Ordering::Greater {
            return false;
        }
    }
    true
}

/// Validate the characters of a release id string.
///
/// Non-conforming ids are accepted (they order lexicographically) as long as
/// they are non-empty printable ASCII without whitespace.
pub fn validate_release_id(s: &str) -> crate::Result<()> {
    if s.is_empty() {
        return Err(crate::Error::InvalidReleaseId(
            "release id must not be empty".to_string(),
        ));
    }
    if s.len() > 64 {
        return Err(crate::Error::InvalidReleaseId(format!(
            "release id too long ({} chars)",
            s.len()
        )));
    }
    if !s.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(crate::Error::InvalidReleaseId(format!(
            "release id contains invalid characters: {s:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_and_date_ordering() {
        assert_eq!(
            compare_release_ids("20240115.001", "20240115.002"),
            Ordering::Less
        );
        assert_eq!(
            compare_release_ids("20240115.002", "20240116.001"),
            Ordering::Less
        );
        assert_eq!(
            compare_release_ids("20240116.001", "20240115.999"),
            Ordering::Greater
        );
    }

    #[test]
    fn test_sequence_compares_numerically() {
        assert_eq!(
            compare_release_ids("20240115.10", "20240115.9"),
            Ordering::Greater
        );
        assert_eq!(
            compare_release_ids("20240115.001", "20240115.1"),
            Ordering::Equal
        );
    }

    #[test]
    fn test_non_conforming_falls_back_to_lexicographic() {
        assert_eq!(compare_release_ids("beta", "alpha"), Ordering::Greater);
        assert_eq!(compare_release_ids("v10", "v9"), Ordering::Less);
        // One conforming side is not enough for tuple comparison.
        assert_eq!(
            compare_release_ids("20240115.001", "2024-01-15"),
            "20240115.001".cmp("2024-01-15")
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ReleaseId::parse("20240115").is_none());
        assert!(ReleaseId::parse("2024011.001").is_none());
        assert!(ReleaseId::parse("20240115.").is_none());
        assert!(ReleaseId::parse("20240115.0a1").is_none());
        let id = ReleaseId::parse("20240115.007").unwrap();
        assert_eq!(id.date(), 20240115);
        assert_eq!(id.seq(), 7);
        assert_eq!(id.to_string(), "20240115.007");
    }

    #[test]
    fn test_release_in_range() {
        assert!(release_in_range("20240115.001", None, None));
        assert!(release_in_range(
            "20240115.001",
            Some("20240115.001"),
            Some("20240115.001")
        ));
        assert!(!release_in_range("20240114.999", Some("20240115.001"), None));
        assert!(!release_in_range("20240201.001", None, Some("20240131.999")));
    }

    #[test]
    fn test_validate_release_id() {
        assert!(validate_release_id("20240115.001").is_ok());
        assert!(validate_release_id("").is_err());
        assert!(validate_release_id("has space").is_err());
    }
}
