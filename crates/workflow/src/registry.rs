//! Adapter registry - loads descriptors and answers lookups

use crate::adapter::Adapter;
use crate::error::{Error, Result};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// File name of an adapter descriptor inside its adapter directory
pub const DESCRIPTOR_FILE: &str = "adapter.toml";

/// The set of adapters from one load
///
/// A registry is built once and shared by reference across runs; it holds
/// no mutable state.
#[derive(Debug, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<Adapter>>,
}

impl AdapterRegistry {
    /// Build a registry from already-parsed adapters
    ///
    /// Rejects the whole set if two adapters share an id.
    pub fn from_adapters(adapters: Vec<Adapter>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for adapter in adapters {
            if map.contains_key(&adapter.id) {
                return Err(Error::config(
                    adapter.id.clone(),
                    "id",
                    format!("duplicate adapter id (second definition in {})", adapter.root.display()),
                ));
            }
            map.insert(adapter.id.clone(), Arc::new(adapter));
        }
        Ok(Self { adapters: map })
    }

    /// Parse descriptors given as `(adapter root, descriptor text)` pairs
    pub fn from_descriptors(descriptors: &[(PathBuf, String)]) -> Result<Self> {
        let adapters = descriptors
            .par_iter()
            .map(|(root, text)| {
                let source = root.join(DESCRIPTOR_FILE);
                Adapter::parse(text, root, &source.display().to_string())
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_adapters(adapters)
    }

    /// Load every `<root>/<name>/adapter.toml`
    pub fn load_dir(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::io(
                root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "adapter directory not found"),
            ));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                Error::io(path, e.into())
            })?;
            if entry.file_type().is_file() && entry.file_name() == DESCRIPTOR_FILE {
                files.push(entry.into_path());
            }
        }
        files.sort();

        let descriptors = files
            .iter()
            .map(|file| {
                let text = std::fs::read_to_string(file).map_err(|e| Error::io(file, e))?;
                let dir = file.parent().unwrap_or(root).to_path_buf();
                Ok((dir, text))
            })
            .collect::<Result<Vec<_>>>()?;

        let registry = Self::from_descriptors(&descriptors)?;
        log::debug!(
            "Loaded {} adapter(s) from {}",
            registry.len(),
            root.display()
        );
        Ok(registry)
    }

    /// Look up an adapter by id
    pub fn get(&self, id: &str) -> Option<&Arc<Adapter>> {
        self.adapters.get(id)
    }

    /// All adapters in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Adapter>> {
        self.adapters.values()
    }

    /// All ids in ascending order
    pub fn ids(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Requested adapters plus everything they transitively depend on
    ///
    /// An empty request selects every adapter. Results are in ascending id
    /// order.
    pub fn select(&self, requested: &[String]) -> Result<Vec<Arc<Adapter>>> {
        if requested.is_empty() {
            return Ok(self.iter().cloned().collect());
        }

        let mut selected: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        for id in requested {
            let adapter = self
                .get(id)
                .ok_or_else(|| Error::config(id.clone(), "selection", "no such adapter"))?;
            queue.push_back(&adapter.id);
        }

        while let Some(id) = queue.pop_front() {
            if !selected.insert(id) {
                continue;
            }
            let Some(adapter) = self.get(id) else {
                continue;
            };
            for dep in adapter.dependency_ids() {
                if self.get(dep).is_none() {
                    return Err(Error::MissingDependency {
                        adapter: id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
                queue.push_back(dep);
            }
        }

        Ok(selected
            .into_iter()
            .filter_map(|id| self.get(id).cloned())
            .collect())
    }
}
