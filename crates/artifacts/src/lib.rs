//! # Artifacts
//!
//! Content-addressed cache of rendered adapter templates.
//!
//! Each entry is filed under a BLAKE3 key computed from the adapter id, the
//! adapter version, the canonical context snapshot and the template set
//! version. Entries record their own key inputs and per-file digests, so a
//! read can detect an entry that was tampered with or partially written.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!   ab/
//!     ab12…/
//!       entry.json        key inputs, file digests, timestamp
//!       files/<relative>  rendered content
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use artifacts::{ArtifactStore, FileSet, KeyInputs};
//! use std::path::Path;
//!
//! let store = ArtifactStore::open(Path::new("/var/cache/keel/artifacts"))?;
//! let inputs = KeyInputs {
//!     adapter_id: "cilium".into(),
//!     adapter_version: "1.16.0".into(),
//!     context: "{}".into(),
//!     template_set_version: "0".into(),
//! };
//!
//! let mut files = FileSet::new();
//! files.insert("values.yaml".into(), b"ipam: kubernetes\n".to_vec());
//! let entry = store.put(&inputs, &files)?;
//!
//! assert!(store.get(&entry.key)?.is_some());
//! # Ok::<(), artifacts::Error>(())
//! ```

mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
    ArtifactEntry, ArtifactKey, FileSet, KeyInputs, VerifyReport, check_relative_path, digest,
};

use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use types::EntryMeta;
use walkdir::WalkDir;

const META_FILE: &str = "entry.json";
const FILES_DIR: &str = "files";

/// A content-addressed artifact cache rooted at a directory
///
/// Reads take no lock. Writes to the same key are serialized through a
/// per-key mutex, so two stages rendering identical inputs never interleave
/// their staging directories.
pub struct ArtifactStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<ArtifactKey, Arc<Mutex<()>>>>,
}

impl ArtifactStore {
    /// Open or create a store at the given directory
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| Error::io(root, e))?;
        Ok(Self {
            root: root.to_path_buf(),
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &ArtifactKey) -> PathBuf {
        let hex = key.as_str();
        self.root.join(hex.get(..2).unwrap_or(hex)).join(hex)
    }

    fn key_lock(&self, key: &ArtifactKey) -> Arc<Mutex<()>> {
        let mut locks = match self.write_locks.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Whether an entry is filed under `key` (without verifying it)
    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.entry_dir(key).join(META_FILE).is_file()
    }

    /// Look up an entry
    ///
    /// Returns `Ok(None)` on a miss and [`Error::CacheCorruption`] when the
    /// stored entry does not hash back to `key`.
    pub fn get(&self, key: &ArtifactKey) -> Result<Option<ArtifactEntry>> {
        let dir = self.entry_dir(key);
        let meta_path = dir.join(META_FILE);
        if !meta_path.is_file() {
            return Ok(None);
        }

        let raw = fs::read(&meta_path).map_err(|e| Error::io(&meta_path, e))?;
        let meta: EntryMeta =
            serde_json::from_slice(&raw).map_err(|e| corrupt(key, format!("metadata: {e}")))?;

        if &meta.key != key {
            return Err(corrupt(key, format!("filed entry claims key {}", meta.key)));
        }
        let recomputed = ArtifactKey::compute(&meta.inputs);
        if &recomputed != key {
            return Err(corrupt(key, format!("inputs hash to {recomputed}")));
        }

        let mut files = FileSet::new();
        for (rel, expected) in &meta.files {
            check_relative_path(rel).map_err(|_| corrupt(key, format!("unsafe path {rel}")))?;
            let path = dir.join(FILES_DIR).join(rel);
            let content =
                fs::read(&path).map_err(|e| corrupt(key, format!("missing file {rel}: {e}")))?;
            if &digest(&content) != expected {
                return Err(corrupt(key, format!("content of {rel} does not match its digest")));
            }
            files.insert(rel.clone(), content);
        }

        log::debug!("Artifact cache hit {}", key.short());
        Ok(Some(ArtifactEntry {
            key: meta.key,
            inputs: meta.inputs,
            files,
            created_at: meta.created_at,
        }))
    }

    /// Store a rendered file set atomically
    ///
    /// Files are staged in a temporary directory inside the store and
    /// renamed into place, replacing any previous entry for the same key.
    pub fn put(&self, inputs: &KeyInputs, files: &FileSet) -> Result<ArtifactEntry> {
        for rel in files.keys() {
            check_relative_path(rel)?;
        }

        let key = ArtifactKey::compute(inputs);
        let lock = self.key_lock(&key);
        let _guard = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.root)
            .map_err(|e| Error::io(&self.root, e))?;

        let mut digests = std::collections::BTreeMap::new();
        for (rel, content) in files {
            let path = staging.path().join(FILES_DIR).join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            fs::write(&path, content).map_err(|e| Error::io(&path, e))?;
            digests.insert(rel.clone(), digest(content));
        }

        let meta = EntryMeta {
            key: key.clone(),
            inputs: inputs.clone(),
            files: digests,
            created_at: chrono::Utc::now(),
        };
        let meta_path = staging.path().join(META_FILE);
        fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)
            .map_err(|e| Error::io(&meta_path, e))?;

        let final_dir = self.entry_dir(&key);
        if let Some(shard) = final_dir.parent() {
            fs::create_dir_all(shard).map_err(|e| Error::io(shard, e))?;
        }
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir).map_err(|e| Error::io(&final_dir, e))?;
        }
        // The TempDir guard ignores the now-missing path on drop.
        fs::rename(staging.path(), &final_dir).map_err(|e| Error::io(&final_dir, e))?;

        log::debug!(
            "Stored {} file(s) for {} under {}",
            files.len(),
            inputs.adapter_id,
            key.short()
        );

        Ok(ArtifactEntry {
            key,
            inputs: meta.inputs,
            files: files.clone(),
            created_at: meta.created_at,
        })
    }

    /// Remove an entry; returns whether anything was removed
    pub fn invalidate(&self, key: &ArtifactKey) -> Result<bool> {
        let lock = self.key_lock(key);
        let _guard = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let dir = self.entry_dir(key);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        log::debug!("Invalidated artifact entry {}", key.short());
        Ok(true)
    }

    /// Write an entry's files below `dest`, returning the paths written
    pub fn materialize(&self, entry: &ArtifactEntry, dest: &Path) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(entry.files.len());
        for (rel, content) in &entry.files {
            check_relative_path(rel)?;
            let path = dest.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            fs::write(&path, content).map_err(|e| Error::io(&path, e))?;
            written.push(path);
        }
        Ok(written)
    }

    /// List the keys of all entries in the store
    ///
    /// Directories whose name is not a key are left alone.
    pub fn keys(&self) -> Result<Vec<ArtifactKey>> {
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.root).to_path_buf();
                Error::io(path, e.into())
            })?;
            if !entry.file_type().is_dir() || !entry.path().join(META_FILE).is_file() {
                continue;
            }
            match entry.file_name().to_str().and_then(ArtifactKey::from_hex) {
                Some(key) => keys.push(key),
                None => log::debug!("Ignoring stray directory {}", entry.path().display()),
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Verify every entry in parallel
    pub fn verify_all(&self) -> Result<VerifyReport> {
        let outcomes: Vec<(ArtifactKey, Result<Option<ArtifactEntry>>)> = self
            .keys()?
            .into_par_iter()
            .map(|key| {
                let outcome = self.get(&key);
                (key, outcome)
            })
            .collect();

        let mut report = VerifyReport::default();
        for (key, outcome) in outcomes {
            match outcome {
                Ok(Some(_)) => report.valid += 1,
                Ok(None) => {}
                Err(e) => report.corrupt.push((key.to_string(), e.to_string())),
            }
        }
        Ok(report)
    }

    /// Remove every entry; returns how many were removed
    pub fn clear(&self) -> Result<usize> {
        let keys = self.keys()?;
        for key in &keys {
            self.invalidate(key)?;
        }
        Ok(keys.len())
    }
}

fn corrupt(key: &ArtifactKey, detail: String) -> Error {
    Error::CacheCorruption {
        key: key.to_string(),
        detail,
    }
}

// ============================================================================
// Tests
// ============================================================================
