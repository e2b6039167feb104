pub mod cache;
pub mod plan;
pub mod run;
pub mod status;
pub mod validate;

use anyhow::{Context as _, Result};
use artifacts::ArtifactStore;
use workflow::{AdapterRegistry, EngineSettings, RunRequest};

use crate::Context;
use crate::config::LoadedConfig;

/// Config, adapters and artifact store, as every command needs them
pub struct Workspace {
    pub loaded: LoadedConfig,
    pub registry: AdapterRegistry,
    pub store: ArtifactStore,
}

impl Workspace {
    pub fn open(ctx: &Context) -> Result<Self> {
        let loaded = LoadedConfig::load(ctx.config.as_deref())?;
        let registry = load_registry(&loaded)?;
        let store = open_store(&loaded)?;
        Ok(Self {
            loaded,
            registry,
            store,
        })
    }

    pub fn settings(&self) -> EngineSettings {
        self.loaded.config.engine.clone()
    }

    /// Request for `adapters` (all when empty) under the loaded config
    pub fn request(&self, adapters: Vec<String>, force_render: bool) -> RunRequest {
        RunRequest {
            adapters,
            platform: self.loaded.config.platform.clone(),
            overrides: self.loaded.config.overrides.clone(),
            force_render,
            output_root: self.loaded.output_dir(),
        }
    }
}

pub fn load_registry(loaded: &LoadedConfig) -> Result<AdapterRegistry> {
    let dir = loaded.adapters_dir();
    let registry = AdapterRegistry::load_dir(&dir)
        .with_context(|| format!("Failed to load adapters from {}", dir.display()))?;
    log::info!("Loaded {} adapter(s) from {}", registry.len(), dir.display());
    Ok(registry)
}

pub fn open_store(loaded: &LoadedConfig) -> Result<ArtifactStore> {
    let dir = loaded.cache_dir()?;
    ArtifactStore::open(&dir).with_context(|| format!("Failed to open artifact store at {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_workspace_from_config() {
        let tmp = TempDir::new().unwrap();
        let adapter = tmp.path().join("adapters/talos");
        fs::create_dir_all(&adapter).unwrap();
        fs::write(adapter.join("adapter.toml"), "id = \"talos\"\nversion = \"1.8.0\"\n").unwrap();
        let config = tmp.path().join("keel.toml");
        fs::write(
            &config,
            r#"
            cache_dir = "cache"
            [platform]
            endpoint = "https://10.0.0.1:6443"
            [engine]
            max_parallelism = 2
            "#,
        )
        .unwrap();

        let ctx = Context {
            verbose: 0,
            quiet: true,
            config: Some(config),
        };
        let ws = Workspace::open(&ctx).unwrap();
        assert_eq!(ws.registry.ids(), vec!["talos"]);
        assert_eq!(ws.store.root(), tmp.path().join("cache"));
        assert_eq!(ws.settings().max_parallelism, 2);

        let request = ws.request(vec!["talos".into()], true);
        assert_eq!(request.output_root, tmp.path().join("out"));
        assert_eq!(request.platform["endpoint"], "https://10.0.0.1:6443");
        assert!(request.force_render);
    }

    #[test]
    fn test_missing_adapters_dir() {
        let tmp = TempDir::new().unwrap();
        let config = tmp.path().join("keel.toml");
        fs::write(&config, "adapters_dir = \"nowhere\"\ncache_dir = \"cache\"\n").unwrap();
        let ctx = Context {
            verbose: 0,
            quiet: true,
            config: Some(config),
        };
        let err = Workspace::open(&ctx).err().unwrap();
        assert!(format!("{err:#}").contains("Failed to load adapters"));
    }
}
