//! Per-adapter context snapshots
//!
//! A context is built from four layers, later layers winning on collision:
//!
//! 1. platform configuration
//! 2. the adapter's `[defaults]`
//! 3. caller overrides (global, then per-adapter)
//! 4. runtime values computed by the engine
//!
//! When both sides of a collision are objects their top-level keys are
//! merged; anything deeper is replaced wholesale.

use crate::adapter::Adapter;
use crate::resolver::ResolvedOrder;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Runtime keys the engine always sets
pub const KEY_ADAPTER_ID: &str = "adapter_id";
pub const KEY_VERSION: &str = "version";
pub const KEY_OUTPUT_DIR: &str = "output_dir";
pub const KEY_TARGET: &str = "target";
pub const KEY_DEPENDENCY_VERSIONS: &str = "dependency_versions";

/// Caller-supplied context overrides
///
/// In TOML, global keys sit directly in the table and per-adapter keys live
/// under `adapters.<id>`:
///
/// ```toml
/// [overrides]
/// cluster_name = "lab"
///
/// [overrides.adapters.cilium]
/// ipam_mode = "cluster-pool"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overrides {
    /// Per-adapter overrides, applied after the global ones
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub adapters: BTreeMap<String, IndexMap<String, Value>>,
    /// Overrides applied to every adapter
    #[serde(flatten)]
    pub global: IndexMap<String, Value>,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.adapters.values().all(IndexMap::is_empty)
    }
}

/// An immutable key/value snapshot handed to one adapter's stages
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Context {
    values: IndexMap<String, Value>,
}

impl Context {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Keys in layer insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The directory this adapter's rendered files land in
    pub fn output_dir(&self) -> Option<PathBuf> {
        self.get(KEY_OUTPUT_DIR)
            .and_then(Value::as_str)
            .map(PathBuf::from)
    }

    /// The context as a JSON object
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Pretty JSON document handed to scripts
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.values)
    }

    /// Compact JSON with keys sorted at every level
    pub fn canonical_json(&self) -> String {
        canonicalize(&self.to_value()).to_string()
    }

    /// BLAKE3 of [`Context::canonical_json`]
    pub fn digest(&self) -> String {
        blake3::hash(self.canonical_json().as_bytes())
            .to_hex()
            .to_string()
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Merge one layer into `base`
fn merge_layer<'a>(base: &mut IndexMap<String, Value>, layer: impl IntoIterator<Item = (&'a String, &'a Value)>) {
    for (key, value) in layer {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                for (k, v) in incoming {
                    existing.insert(k.clone(), v.clone());
                }
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Builds context snapshots for the adapters of one run
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    platform: IndexMap<String, Value>,
    overrides: Overrides,
    output_root: PathBuf,
    default_target: Option<String>,
}

impl ContextBuilder {
    pub fn new(output_root: &Path) -> Self {
        Self {
            platform: IndexMap::new(),
            overrides: Overrides::default(),
            output_root: output_root.to_path_buf(),
            default_target: None,
        }
    }

    pub fn platform(mut self, platform: IndexMap<String, Value>) -> Self {
        self.platform = platform;
        self
    }

    pub fn overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Target used for adapters that declare none
    pub fn default_target(mut self, target: Option<String>) -> Self {
        self.default_target = target;
        self
    }

    /// Effective target of an adapter
    pub fn target_for<'a>(&'a self, adapter: &'a Adapter) -> Option<&'a str> {
        adapter
            .target
            .as_deref()
            .or(self.default_target.as_deref())
    }

    /// `<output_root>/<adapter>[/<target>]`
    pub fn output_dir(&self, adapter: &Adapter) -> PathBuf {
        let dir = self.output_root.join(&adapter.id);
        match self.target_for(adapter) {
            Some(target) => dir.join(target),
            None => dir,
        }
    }

    /// Snapshot the context of one adapter
    pub fn build(&self, adapter: &Adapter, order: &ResolvedOrder) -> Arc<Context> {
        let mut values = IndexMap::new();
        merge_layer(&mut values, &self.platform);
        merge_layer(&mut values, &adapter.defaults);
        merge_layer(&mut values, &self.overrides.global);
        if let Some(per_adapter) = self.overrides.adapters.get(&adapter.id) {
            merge_layer(&mut values, per_adapter);
        }

        let mut runtime: IndexMap<String, Value> = IndexMap::new();
        runtime.insert(KEY_ADAPTER_ID.into(), Value::String(adapter.id.clone()));
        runtime.insert(KEY_VERSION.into(), Value::String(adapter.version.clone()));
        runtime.insert(
            KEY_OUTPUT_DIR.into(),
            Value::String(self.output_dir(adapter).to_string_lossy().into_owned()),
        );
        if let Some(target) = self.target_for(adapter) {
            runtime.insert(KEY_TARGET.into(), Value::String(target.to_string()));
        }
        let versions: Map<String, Value> = order
            .ancestors(&adapter.id)
            .into_iter()
            .flatten()
            .filter_map(|id| {
                order
                    .adapters()
                    .iter()
                    .find(|a| &a.id == id)
                    .map(|a| (id.clone(), Value::String(a.version.clone())))
            })
            .collect();
        runtime.insert(KEY_DEPENDENCY_VERSIONS.into(), Value::Object(versions));

        // Runtime values are authoritative; replace rather than merge.
        for (key, value) in runtime {
            values.insert(key, value);
        }

        Arc::new(Context { values })
    }

    /// Snapshot every adapter in the order
    pub fn build_all(&self, order: &ResolvedOrder) -> BTreeMap<String, Arc<Context>> {
        order
            .adapters()
            .iter()
            .map(|adapter| (adapter.id.clone(), self.build(adapter, order)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::resolve;
    use crate::testing::adapter;
    use serde_json::json;

    fn map(value: Value) -> IndexMap<String, Value> {
        match value {
            Value::Object(m) => m.into_iter().collect(),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_layer_priority() {
        let mut cilium = adapter("cilium", &["talos"]);
        cilium.defaults = map(json!({"ipam_mode": "kubernetes", "region": "default"}));
        let adapters = vec![Arc::new(adapter("talos", &[])), Arc::new(cilium)];
        let order = resolve(&adapters).unwrap();

        let mut overrides = Overrides::default();
        overrides.global = map(json!({"region": "eu-west"}));
        overrides
            .adapters
            .insert("cilium".into(), map(json!({"ipam_mode": "cluster-pool"})));

        let builder = ContextBuilder::new(Path::new("/out"))
            .platform(map(json!({"region": "us-east", "cluster_name": "lab"})))
            .overrides(overrides);
        let ctx = builder.build(&adapters[1], &order);

        assert_eq!(ctx.get("cluster_name"), Some(&json!("lab")));
        assert_eq!(ctx.get("region"), Some(&json!("eu-west")));
        assert_eq!(ctx.get("ipam_mode"), Some(&json!("cluster-pool")));
        assert_eq!(ctx.get(KEY_ADAPTER_ID), Some(&json!("cilium")));
        assert_eq!(ctx.get(KEY_VERSION), Some(&json!("1.0.0")));
        assert_eq!(
            ctx.get(KEY_DEPENDENCY_VERSIONS),
            Some(&json!({"talos": "1.0.0"}))
        );
        assert_eq!(ctx.output_dir(), Some(PathBuf::from("/out/cilium")));
    }

    #[test]
    fn test_runtime_values_win() {
        let mut talos = adapter("talos", &[]);
        talos.defaults = map(json!({"adapter_id": "spoofed", "version": "0"}));
        let adapters = vec![Arc::new(talos)];
        let order = resolve(&adapters).unwrap();

        let ctx = ContextBuilder::new(Path::new("/out")).build(&adapters[0], &order);
        assert_eq!(ctx.get(KEY_ADAPTER_ID), Some(&json!("talos")));
        assert_eq!(ctx.get(KEY_VERSION), Some(&json!("1.0.0")));
    }

    #[test]
    fn test_objects_merge_one_level() {
        let mut cilium = adapter("cilium", &[]);
        cilium.defaults = map(json!({
            "hubble": {"enabled": true, "relay": {"replicas": 1, "tls": true}}
        }));
        let adapters = vec![Arc::new(cilium)];
        let order = resolve(&adapters).unwrap();

        let mut overrides = Overrides::default();
        overrides.global = map(json!({"hubble": {"relay": {"replicas": 3}}}));
        let ctx = ContextBuilder::new(Path::new("/out"))
            .overrides(overrides)
            .build(&adapters[0], &order);

        // Top-level keys of `hubble` merge; `relay` itself is replaced.
        assert_eq!(
            ctx.get("hubble"),
            Some(&json!({"enabled": true, "relay": {"replicas": 3}}))
        );
    }

    #[test]
    fn test_scalar_replaces_object() {
        let mut a = adapter("a", &[]);
        a.defaults = map(json!({"net": {"mtu": 1500}}));
        let adapters = vec![Arc::new(a)];
        let order = resolve(&adapters).unwrap();

        let mut overrides = Overrides::default();
        overrides.global = map(json!({"net": "host"}));
        let ctx = ContextBuilder::new(Path::new("/out"))
            .overrides(overrides)
            .build(&adapters[0], &order);
        assert_eq!(ctx.get("net"), Some(&json!("host")));
    }

    #[test]
    fn test_target_in_output_dir() {
        let mut talos = adapter("talos", &[]);
        talos.target = Some("cp-1".into());
        let adapters = vec![Arc::new(talos), Arc::new(adapter("other", &[]))];
        let order = resolve(&adapters).unwrap();

        let builder = ContextBuilder::new(Path::new("/out")).default_target(Some("node".into()));
        let ctx = builder.build(&adapters[0], &order);
        assert_eq!(ctx.get(KEY_TARGET), Some(&json!("cp-1")));
        assert_eq!(ctx.output_dir(), Some(PathBuf::from("/out/talos/cp-1")));

        let ctx = builder.build(&adapters[1], &order);
        assert_eq!(ctx.output_dir(), Some(PathBuf::from("/out/other/node")));
    }

    #[test]
    fn test_digest_ignores_insertion_order() {
        let mut a = adapter("a", &[]);
        a.defaults = map(json!({"x": 1, "y": {"b": 2, "a": 1}}));
        let mut b = adapter("a", &[]);
        let mut defaults = IndexMap::new();
        defaults.insert("y".to_string(), json!({"a": 1, "b": 2}));
        defaults.insert("x".to_string(), json!(1));
        b.defaults = defaults;

        let order_a = resolve(&[Arc::new(a.clone())]).unwrap();
        let order_b = resolve(&[Arc::new(b.clone())]).unwrap();
        let builder = ContextBuilder::new(Path::new("/out"));
        let ctx_a = builder.build(&a, &order_a);
        let ctx_b = builder.build(&b, &order_b);

        assert_eq!(ctx_a.digest(), ctx_b.digest());
        assert!(ctx_a.canonical_json().starts_with(r#"{"adapter_id":"a""#));
    }

    #[test]
    fn test_digest_changes_with_values() {
        let a = adapter("a", &[]);
        let order = resolve(&[Arc::new(a.clone())]).unwrap();
        let one = ContextBuilder::new(Path::new("/out")).build(&a, &order);
        let two = ContextBuilder::new(Path::new("/elsewhere")).build(&a, &order);
        assert_ne!(one.digest(), two.digest());
    }

    #[test]
    fn test_overrides_from_toml() {
        let overrides: Overrides = toml::from_str(
            r#"
            cluster_name = "lab"
            [adapters.cilium]
            ipam_mode = "cluster-pool"
            "#,
        )
        .unwrap();
        assert_eq!(overrides.global.get("cluster_name"), Some(&json!("lab")));
        assert_eq!(
            overrides.adapters["cilium"].get("ipam_mode"),
            Some(&json!("cluster-pool"))
        );
        assert!(!overrides.is_empty());
    }
}
