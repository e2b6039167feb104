//! Data types for the artifacts crate

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};

/// Rendered file set: relative path → content
pub type FileSet = BTreeMap<String, Vec<u8>>;

/// Everything that identifies one rendering of an adapter's templates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInputs {
    /// Adapter identifier
    pub adapter_id: String,
    /// Adapter version
    pub adapter_version: String,
    /// Canonical JSON of the adapter's context snapshot
    pub context: String,
    /// Digest of the template set (names, output paths and sources)
    pub template_set_version: String,
}

/// Length of a key in hex characters
pub(crate) const KEY_HEX_LEN: usize = blake3::OUT_LEN * 2;

/// Content-addressed key of a cache entry (hex BLAKE3)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactKey(String);

impl ArtifactKey {
    /// Compute the key for a set of inputs
    ///
    /// Each field is length-prefixed so that no two distinct input tuples
    /// can produce the same byte stream.
    pub fn compute(inputs: &KeyInputs) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in [
            inputs.adapter_id.as_str(),
            inputs.adapter_version.as_str(),
            inputs.context.as_str(),
            inputs.template_set_version.as_str(),
        ] {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    /// Parse a key read back from disk (e.g. an entry directory name)
    ///
    /// Only a full-length lowercase hex digest is accepted.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let valid = hex.len() == KEY_HEX_LEN
            && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(hex.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for display
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached rendering, as returned by the store
#[derive(Debug, Clone)]
pub struct ArtifactEntry {
    pub key: ArtifactKey,
    pub inputs: KeyInputs,
    pub files: FileSet,
    pub created_at: DateTime<Utc>,
}

impl ArtifactEntry {
    /// Total size of all files in bytes
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|c| c.len() as u64).sum()
    }
}

/// On-disk metadata stored next to the files of an entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EntryMeta {
    pub key: ArtifactKey,
    pub inputs: KeyInputs,
    /// Relative path → BLAKE3 hex digest of content
    pub files: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Result of verifying every entry in the store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Entries that verified cleanly
    pub valid: u64,
    /// Entries that failed verification (key, reason)
    pub corrupt: Vec<(String, String)>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty()
    }
}

/// Hash file content the same way entries record it
pub fn digest(content: &[u8]) -> String {
    blake3::hash(content).to_hex().to_string()
}

/// Ensure `path` is a non-empty relative path made only of normal components
pub fn check_relative_path(path: &str) -> Result<()> {
    let p = Path::new(path);
    let safe = !path.is_empty()
        && p.components().count() > 0
        && p.components().all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(Error::UnsafePath(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> KeyInputs {
        KeyInputs {
            adapter_id: "cilium".to_string(),
            adapter_version: "1.16.0".to_string(),
            context: r#"{"cluster":"lab"}"#.to_string(),
            template_set_version: "abc".to_string(),
        }
    }

    #[test]
    fn test_key_is_stable() {
        assert_eq!(ArtifactKey::compute(&inputs()), ArtifactKey::compute(&inputs()));
        assert_eq!(ArtifactKey::compute(&inputs()).as_str().len(), 64);
    }

    #[test]
    fn test_key_changes_with_each_component() {
        let base = ArtifactKey::compute(&inputs());

        let mut changed = inputs();
        changed.adapter_version = "1.16.1".to_string();
        assert_ne!(ArtifactKey::compute(&changed), base);

        let mut changed = inputs();
        changed.context = r#"{"cluster":"prod"}"#.to_string();
        assert_ne!(ArtifactKey::compute(&changed), base);

        let mut changed = inputs();
        changed.template_set_version = "abd".to_string();
        assert_ne!(ArtifactKey::compute(&changed), base);
    }

    #[test]
    fn test_key_fields_are_length_prefixed() {
        let a = KeyInputs {
            adapter_id: "ab".to_string(),
            adapter_version: "c".to_string(),
            ..inputs()
        };
        let b = KeyInputs {
            adapter_id: "a".to_string(),
            adapter_version: "bc".to_string(),
            ..inputs()
        };
        assert_ne!(ArtifactKey::compute(&a), ArtifactKey::compute(&b));
    }

    #[test]
    fn test_from_hex_accepts_only_full_lowercase_digests() {
        let key = ArtifactKey::compute(&inputs());
        assert_eq!(ArtifactKey::from_hex(key.as_str()), Some(key.clone()));

        assert!(ArtifactKey::from_hex("").is_none());
        assert!(ArtifactKey::from_hex("zz").is_none());
        assert!(ArtifactKey::from_hex("日本").is_none());
        assert!(ArtifactKey::from_hex(&key.as_str()[..63]).is_none());
        assert!(ArtifactKey::from_hex(&key.as_str().to_uppercase()).is_none());
        assert!(ArtifactKey::from_hex(&format!("{}0", key.as_str())).is_none());
    }

    #[test]
    fn test_short_form() {
        let key = ArtifactKey::compute(&inputs());
        assert_eq!(key.short().len(), 12);
        assert!(key.as_str().starts_with(key.short()));
    }

    #[test]
    fn test_check_relative_path() {
        assert!(check_relative_path("values.yaml").is_ok());
        assert!(check_relative_path("manifests/cni.yaml").is_ok());
        assert!(check_relative_path("").is_err());
        assert!(check_relative_path("/etc/passwd").is_err());
        assert!(check_relative_path("../escape.yaml").is_err());
        assert!(check_relative_path("a/../../b").is_err());
    }
}
