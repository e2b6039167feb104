//! Engine facade: plan and run adapter workflows
//!
//! Ties the registry, resolver, context builder, pipeline generator and
//! executor together. Configuration and graph errors surface from
//! [`Engine::plan`] / [`Engine::run`] as `Err` before any stage starts;
//! stage failures are reported in the [`RunReport`].

use crate::cancel::CancelToken;
use crate::command::CommandRunner;
use crate::context::{Context, ContextBuilder, Overrides};
use crate::error::{Error, Result};
use crate::executor::BootstrapExecutor;
use crate::pipeline::{CacheReport, Pipeline, PipelineGenerator};
use crate::progress::ProgressCallback;
use crate::registry::AdapterRegistry;
use crate::resolver::{ResolvedOrder, resolve};
use crate::results::{ExecutionLog, ExecutionResult};
use crate::types::{EngineSettings, RunSummary};
use artifacts::ArtifactStore;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Inputs of one plan or run
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Adapters to provision; their dependencies are pulled in. Empty = all.
    pub adapters: Vec<String>,
    /// Platform configuration, the base context layer
    pub platform: IndexMap<String, Value>,
    pub overrides: Overrides,
    /// Render even when the artifact store already holds the output
    pub force_render: bool,
    /// Root of the rendered file layout
    pub output_root: PathBuf,
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Adapter ids in execution order
    pub order: Vec<String>,
    /// One record per stage, in pipeline order
    pub results: Vec<ExecutionResult>,
    pub cache_reports: Vec<CacheReport>,
    pub summary: RunSummary,
}

impl RunReport {
    /// Every stage succeeded or was skipped for a non-failure reason
    pub fn is_success(&self) -> bool {
        self.summary.is_success()
    }

    /// Records of stages that failed
    pub fn failures(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.status, crate::types::StageStatus::Failed))
    }
}

/// Plans and runs workflows over a registry and an artifact store
pub struct Engine<'a> {
    registry: &'a AdapterRegistry,
    store: &'a ArtifactStore,
    settings: EngineSettings,
}

impl<'a> Engine<'a> {
    pub fn new(registry: &'a AdapterRegistry, store: &'a ArtifactStore, settings: EngineSettings) -> Self {
        Self {
            registry,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Select and order the requested adapters
    pub fn resolve(&self, request: &RunRequest) -> Result<ResolvedOrder> {
        self.check_overrides(&request.overrides)?;
        let selected = self.registry.select(&request.adapters)?;
        resolve(&selected)
    }

    /// Context snapshots for every adapter in `order`
    pub fn contexts(&self, request: &RunRequest, order: &ResolvedOrder) -> BTreeMap<String, Arc<Context>> {
        ContextBuilder::new(&request.output_root)
            .platform(request.platform.clone())
            .overrides(request.overrides.clone())
            .default_target(self.settings.default_target.clone())
            .build_all(order)
    }

    /// Build the stage plan without running anything
    ///
    /// Reads the artifact store and invalidates corrupt entries; has no
    /// other side effects.
    pub fn plan(&self, request: &RunRequest) -> Result<Pipeline> {
        let order = self.resolve(request)?;
        self.plan_order(request, &order)
    }

    fn plan_order(&self, request: &RunRequest, order: &ResolvedOrder) -> Result<Pipeline> {
        let contexts = self.contexts(request, order);
        PipelineGenerator::new(self.store)
            .force_render(request.force_render)
            .default_target(self.settings.default_target.clone())
            .generate(order, &contexts)
    }

    /// Plan, then execute every stage to a terminal status
    pub fn run(
        &self,
        request: &RunRequest,
        runner: &dyn CommandRunner,
        cancel: &CancelToken,
        progress: &mut dyn ProgressCallback,
    ) -> Result<RunReport> {
        let order = self.resolve(request)?;
        let mut pipeline = self.plan_order(request, &order)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        log::info!(
            "Run {run_id}: {} adapter(s): {}",
            order.len(),
            order.ids().join(", ")
        );

        let log = ExecutionLog::new(run_id, &pipeline);
        BootstrapExecutor::new(self.store, runner, &self.settings, cancel).execute(&mut pipeline, &log, progress)?;

        let summary = log.summary();
        log::info!(
            "Run {run_id} finished: {} succeeded, {} failed, {} skipped, {} cancelled",
            summary.succeeded,
            summary.failed,
            summary.skipped,
            summary.cancelled
        );

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            order: order.ids().into_iter().map(str::to_string).collect(),
            results: log.snapshot(),
            cache_reports: pipeline.cache_reports().to_vec(),
            summary,
        })
    }

    /// Per-adapter overrides must name loaded adapters
    fn check_overrides(&self, overrides: &Overrides) -> Result<()> {
        match overrides.adapters.keys().find(|id| self.registry.get(id).is_none()) {
            Some(id) => Err(Error::config(
                id.clone(),
                format!("overrides.adapters.{id}"),
                "override for an adapter that is not loaded",
            )),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutcome, CommandSpec, OutputSink};
    use crate::pipeline::{CacheLookup, StageId};
    use crate::progress::NoProgress;
    use crate::types::{Phase, SkipReason, StageStatus};
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Succeeds every command and remembers program paths
    #[derive(Default)]
    struct Succeed(Mutex<Vec<PathBuf>>);

    impl CommandRunner for Succeed {
        fn run(&self, spec: &CommandSpec, _sink: &dyn OutputSink, _cancel: &CancelToken) -> Result<CommandOutcome> {
            self.0.lock().unwrap().push(spec.program.clone());
            Ok(CommandOutcome {
                exit_code: Some(0),
                ..Default::default()
            })
        }
    }

    fn write(root: &Path, rel: &str, text: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    fn cluster(root: &Path) -> AdapterRegistry {
        write(
            root,
            "talos/adapter.toml",
            r#"
            id = "talos"
            version = "1.8.0"
            [defaults]
            cluster_name = "lab"
            [[templates]]
            name = "controlplane.yaml"
            path = "templates/controlplane.yaml.j2"
            [[scripts]]
            phase = "bootstrap"
            path = "scripts/bootstrap.sh"
            "#,
        );
        write(
            root,
            "talos/templates/controlplane.yaml.j2",
            "cluster: {{ cluster_name }}\nendpoint: {{ endpoint }}\n",
        );
        write(
            root,
            "cilium/adapter.toml",
            r#"
            id = "cilium"
            version = "1.16.0"
            dependencies = ["talos@1.8.0"]
            [[scripts]]
            phase = "pre_work"
            path = "scripts/prepare.sh"
            [[scripts]]
            phase = "bootstrap"
            path = "scripts/install.sh"
            "#,
        );
        write(
            root,
            "crossplane/adapter.toml",
            r#"
            id = "crossplane"
            version = "1.17.0"
            dependencies = ["cilium"]
            [[scripts]]
            phase = "bootstrap"
            path = "scripts/install.sh"
            "#,
        );
        AdapterRegistry::load_dir(root).unwrap()
    }

    fn request(tmp: &TempDir) -> RunRequest {
        let mut platform = IndexMap::new();
        platform.insert("endpoint".to_string(), Value::from("https://10.0.0.1:6443"));
        RunRequest {
            adapters: vec!["crossplane".to_string()],
            platform,
            output_root: tmp.path().join("out"),
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_pulls_in_dependencies() {
        let tmp = TempDir::new().unwrap();
        let registry = cluster(&tmp.path().join("adapters"));
        let store = ArtifactStore::open(&tmp.path().join("cache")).unwrap();
        let engine = Engine::new(&registry, &store, EngineSettings::default());

        let pipeline = engine.plan(&request(&tmp)).unwrap();
        let ids: Vec<&str> = pipeline.stages().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "talos/render",
                "talos/bootstrap/0",
                "cilium/pre_work/0",
                "cilium/bootstrap/0",
                "crossplane/bootstrap/0",
            ]
        );
        assert_eq!(pipeline.cache_reports()[0].lookup, CacheLookup::Miss);
        // Planning writes nothing
        assert!(!tmp.path().join("out").exists());
    }

    #[test]
    fn test_run_end_to_end() {
        let tmp = TempDir::new().unwrap();
        let registry = cluster(&tmp.path().join("adapters"));
        let store = ArtifactStore::open(&tmp.path().join("cache")).unwrap();
        let engine = Engine::new(&registry, &store, EngineSettings::default());
        let runner = Succeed::default();

        let report = engine
            .run(&request(&tmp), &runner, &CancelToken::new(), &mut NoProgress)
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.order, vec!["talos", "cilium", "crossplane"]);
        assert_eq!(report.summary.succeeded, 5);
        assert_eq!(runner.0.lock().unwrap().len(), 4);

        let rendered = tmp.path().join("out/talos/controlplane.yaml");
        assert_eq!(
            std::fs::read_to_string(rendered).unwrap(),
            "cluster: lab\nendpoint: https://10.0.0.1:6443\n"
        );

        // Same inputs again: the render is served from the store
        let again = engine
            .run(&request(&tmp), &runner, &CancelToken::new(), &mut NoProgress)
            .unwrap();
        assert!(again.is_success());
        assert_eq!(again.cache_reports[0].lookup, CacheLookup::Hit);
        let render = again
            .results
            .iter()
            .find(|r| r.stage_id == StageId::render("talos"))
            .unwrap();
        assert_eq!(
            render.status,
            StageStatus::Skipped {
                reason: SkipReason::CacheHit
            }
        );
        assert_ne!(report.run_id, again.run_id);
    }

    #[test]
    fn test_force_render_ignores_cache() {
        let tmp = TempDir::new().unwrap();
        let registry = cluster(&tmp.path().join("adapters"));
        let store = ArtifactStore::open(&tmp.path().join("cache")).unwrap();
        let engine = Engine::new(&registry, &store, EngineSettings::default());
        engine
            .run(&request(&tmp), &Succeed::default(), &CancelToken::new(), &mut NoProgress)
            .unwrap();

        let mut forced = request(&tmp);
        forced.force_render = true;
        let pipeline = engine.plan(&forced).unwrap();
        assert_eq!(pipeline.cache_reports()[0].lookup, CacheLookup::Forced);
        assert_eq!(
            pipeline.stage(&StageId::render("talos")).unwrap().status(),
            &StageStatus::Pending
        );
    }

    #[test]
    fn test_graph_errors_before_any_stage() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("adapters");
        write(&root, "a/adapter.toml", "id = \"a\"\nversion = \"1\"\ndependencies = [\"b\"]\n");
        write(&root, "b/adapter.toml", "id = \"b\"\nversion = \"1\"\ndependencies = [\"a\"]\n");
        let registry = AdapterRegistry::load_dir(&root).unwrap();
        let store = ArtifactStore::open(&tmp.path().join("cache")).unwrap();
        let engine = Engine::new(&registry, &store, EngineSettings::default());
        let runner = Succeed::default();

        let err = engine
            .run(&RunRequest::default(), &runner, &CancelToken::new(), &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, Error::Cycle { .. }));
        assert!(runner.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_override_for_unknown_adapter() {
        let tmp = TempDir::new().unwrap();
        let registry = cluster(&tmp.path().join("adapters"));
        let store = ArtifactStore::open(&tmp.path().join("cache")).unwrap();
        let engine = Engine::new(&registry, &store, EngineSettings::default());

        let mut req = request(&tmp);
        req.overrides.adapters.insert("flannel".into(), IndexMap::new());
        match engine.plan(&req) {
            Err(Error::Configuration { adapter, field, .. }) => {
                assert_eq!(adapter, "flannel");
                assert_eq!(field, "overrides.adapters.flannel");
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_selection() {
        let tmp = TempDir::new().unwrap();
        let registry = cluster(&tmp.path().join("adapters"));
        let store = ArtifactStore::open(&tmp.path().join("cache")).unwrap();
        let engine = Engine::new(&registry, &store, EngineSettings::default());

        let mut req = request(&tmp);
        req.adapters = vec!["flannel".into()];
        assert!(engine.plan(&req).unwrap_err().is_planning_error());
    }

    #[test]
    fn test_report_serializes() {
        let tmp = TempDir::new().unwrap();
        let registry = cluster(&tmp.path().join("adapters"));
        let store = ArtifactStore::open(&tmp.path().join("cache")).unwrap();
        let engine = Engine::new(&registry, &store, EngineSettings::default());
        let report = engine
            .run(&request(&tmp), &Succeed::default(), &CancelToken::new(), &mut NoProgress)
            .unwrap();

        let json = serde_json::to_string(&report).unwrap();
        let back: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, report.run_id);
        assert_eq!(back.results, report.results);
        assert_eq!(back.results[2].phase, Phase::PreWork);
        assert!(back.is_success());
    }
}
