//! Pipeline generation
//!
//! Turns a resolved adapter order and its context snapshots into a flat list
//! of stages plus the prerequisite relation the scheduler consumes. Each
//! adapter contributes an optional render stage followed by its scripts in
//! phase order. An adapter's first stage waits for the last stage of every
//! transitive ancestor; later stages wait for their predecessor.

use crate::adapter::{Adapter, ScriptRef};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::render::TemplateSet;
use crate::resolver::ResolvedOrder;
use crate::types::{Phase, StageStatus};
use artifacts::{ArtifactKey, ArtifactStore, KeyInputs};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Stable stage identifier: `<adapter>/render` or `<adapter>/<phase>/<n>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    pub fn render(adapter: &str) -> Self {
        Self(format!("{adapter}/{}", Phase::Render))
    }

    /// `n` counts scripts within the phase, from zero
    pub fn script(adapter: &str, phase: Phase, n: usize) -> Self {
        Self(format!("{adapter}/{phase}/{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a stage does when it runs
#[derive(Debug, Clone)]
pub enum StageWork {
    /// Expand the adapter's templates into the artifact store
    Render {
        templates: Arc<TemplateSet>,
        inputs: KeyInputs,
        key: ArtifactKey,
        /// The store held a verified entry at generation time
        cached: bool,
    },
    /// Run one adapter script
    Script(ScriptRef),
}

/// A unit of work in a pipeline
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: StageId,
    pub adapter: Arc<Adapter>,
    pub phase: Phase,
    pub work: StageWork,
    /// Shared with every other stage of the same adapter
    pub context: Arc<Context>,
    /// Script stages sharing a key never overlap; render stages have none
    pub resource_key: Option<String>,
    status: StageStatus,
}

impl Stage {
    pub fn status(&self) -> &StageStatus {
        &self.status
    }

    pub fn adapter_id(&self) -> &str {
        &self.adapter.id
    }

    /// A render stage whose output will be restored from the store
    pub fn is_cached(&self) -> bool {
        matches!(self.work, StageWork::Render { cached: true, .. })
    }

    /// Move the stage to a new status
    ///
    /// Terminal states are final. `pending` may go to `running`,
    /// `skipped` or `cancelled`; `running` may go to any terminal state.
    pub fn transition(&mut self, to: StageStatus) -> Result<()> {
        let allowed = match (&self.status, &to) {
            (StageStatus::Pending, StageStatus::Running)
            | (StageStatus::Pending, StageStatus::Skipped { .. })
            | (StageStatus::Pending, StageStatus::Cancelled) => true,
            (StageStatus::Running, next) => next.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(Error::InvalidTransition {
                stage: self.id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Outcome of one artifact store lookup during generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CacheLookup {
    Hit,
    Miss,
    /// Hit ignored because rendering was forced
    Forced,
    /// Entry failed verification and was invalidated
    Corrupted { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheReport {
    pub adapter_id: String,
    pub key: ArtifactKey,
    #[serde(flatten)]
    pub lookup: CacheLookup,
}

/// An ordered stage plan
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    prerequisites: Vec<Vec<usize>>,
    index: HashMap<StageId, usize>,
    cache_reports: Vec<CacheReport>,
}

impl Pipeline {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, id: &StageId) -> Option<&Stage> {
        self.index_of(id).map(|i| &self.stages[i])
    }

    pub fn index_of(&self, id: &StageId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Indices of the stages that must be terminal before `index` may start
    pub fn prerequisites(&self, index: usize) -> &[usize] {
        self.prerequisites.get(index).map_or(&[], Vec::as_slice)
    }

    /// Ids of the prerequisites of a stage
    pub fn prerequisite_ids(&self, id: &StageId) -> Vec<&StageId> {
        self.index_of(id)
            .map(|i| {
                self.prerequisites(i)
                    .iter()
                    .map(|p| &self.stages[*p].id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every stage that transitively waits on `index`
    pub fn descendants(&self, index: usize) -> BTreeSet<usize> {
        let mut found = BTreeSet::new();
        let mut frontier = vec![index];
        while let Some(current) = frontier.pop() {
            for (i, prereqs) in self.prerequisites.iter().enumerate() {
                if prereqs.contains(&current) && found.insert(i) {
                    frontier.push(i);
                }
            }
        }
        found
    }

    pub fn stages_for<'a>(&'a self, adapter_id: &'a str) -> impl Iterator<Item = &'a Stage> {
        self.stages.iter().filter(move |s| s.adapter.id == adapter_id)
    }

    pub fn cache_reports(&self) -> &[CacheReport] {
        &self.cache_reports
    }

    pub(crate) fn stage_mut(&mut self, index: usize) -> Option<&mut Stage> {
        self.stages.get_mut(index)
    }
}

/// Builds pipelines against an artifact store
pub struct PipelineGenerator<'a> {
    store: &'a ArtifactStore,
    force_render: bool,
    default_target: Option<String>,
}

impl<'a> PipelineGenerator<'a> {
    pub fn new(store: &'a ArtifactStore) -> Self {
        Self {
            store,
            force_render: false,
            default_target: None,
        }
    }

    /// Render even when the store already holds the output
    pub fn force_render(mut self, force: bool) -> Self {
        self.force_render = force;
        self
    }

    /// Resource key for adapters without a `target`
    pub fn default_target(mut self, target: Option<String>) -> Self {
        self.default_target = target;
        self
    }

    /// Generate the pipeline for `order`
    ///
    /// `contexts` must hold a snapshot for every adapter in the order.
    pub fn generate(
        &self,
        order: &ResolvedOrder,
        contexts: &BTreeMap<String, Arc<Context>>,
    ) -> Result<Pipeline> {
        let mut stages: Vec<Stage> = Vec::new();
        let mut prerequisites: Vec<Vec<usize>> = Vec::new();
        let mut cache_reports: Vec<CacheReport> = Vec::new();
        let mut last_stage: HashMap<&str, usize> = HashMap::new();

        for adapter in order.adapters() {
            let context = contexts.get(&adapter.id).cloned().ok_or_else(|| {
                Error::config(adapter.id.clone(), "context", "no context snapshot for adapter")
            })?;

            let mut entry_prereqs: Vec<usize> = order
                .ancestors(&adapter.id)
                .into_iter()
                .flatten()
                .filter_map(|ancestor| last_stage.get(ancestor.as_str()).copied())
                .collect();
            entry_prereqs.sort_unstable();

            let mut previous: Option<usize> = None;
            let mut push = |stage: Stage, stages: &mut Vec<Stage>| {
                let prereqs = match previous {
                    Some(p) => vec![p],
                    None => entry_prereqs.clone(),
                };
                stages.push(stage);
                prerequisites.push(prereqs);
                previous = Some(stages.len() - 1);
            };

            if !adapter.templates.is_empty() {
                let (stage, report) = self.render_stage(adapter, &context)?;
                cache_reports.push(report);
                push(stage, &mut stages);
            }

            let resource_key = adapter
                .target
                .clone()
                .or_else(|| self.default_target.clone());
            for phase in Phase::SCRIPT_PHASES {
                for (n, script) in adapter.scripts_for(phase).enumerate() {
                    push(
                        Stage {
                            id: StageId::script(&adapter.id, phase, n),
                            adapter: Arc::clone(adapter),
                            phase,
                            work: StageWork::Script(script.clone()),
                            context: Arc::clone(&context),
                            resource_key: resource_key.clone(),
                            status: StageStatus::Pending,
                        },
                        &mut stages,
                    );
                }
            }

            if let Some(last) = previous {
                last_stage.insert(&adapter.id, last);
            }
        }

        let index = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        log::debug!(
            "Generated pipeline with {} stage(s) for {} adapter(s)",
            stages.len(),
            order.len()
        );

        Ok(Pipeline {
            stages,
            prerequisites,
            index,
            cache_reports,
        })
    }

    fn render_stage(&self, adapter: &Arc<Adapter>, context: &Arc<Context>) -> Result<(Stage, CacheReport)> {
        let templates = TemplateSet::load(adapter)?;
        let inputs = KeyInputs {
            adapter_id: adapter.id.clone(),
            adapter_version: adapter.version.clone(),
            context: context.canonical_json(),
            template_set_version: templates.version().to_string(),
        };
        let key = ArtifactKey::compute(&inputs);

        let lookup = match self.store.get(&key) {
            Ok(Some(_)) if self.force_render => CacheLookup::Forced,
            Ok(Some(_)) => CacheLookup::Hit,
            Ok(None) => CacheLookup::Miss,
            Err(err) if err.is_corruption() => {
                log::warn!(
                    "Artifact entry {} for '{}' is corrupt, re-rendering: {err}",
                    key.short(),
                    adapter.id
                );
                self.store.invalidate(&key)?;
                CacheLookup::Corrupted {
                    detail: err.to_string(),
                }
            }
            Err(err) => return Err(err.into()),
        };

        let cached = lookup == CacheLookup::Hit;
        let report = CacheReport {
            adapter_id: adapter.id.clone(),
            key: key.clone(),
            lookup,
        };
        let stage = Stage {
            id: StageId::render(&adapter.id),
            adapter: Arc::clone(adapter),
            phase: Phase::Render,
            work: StageWork::Render {
                templates: Arc::new(templates),
                inputs,
                key,
                cached,
            },
            context: Arc::clone(context),
            resource_key: None,
            status: StageStatus::Pending,
        };
        Ok((stage, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBuilder;
    use crate::resolver::resolve;
    use crate::testing::{add_template, scripted};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: ArtifactStore,
        order: ResolvedOrder,
        contexts: BTreeMap<String, Arc<Context>>,
    }

    fn fixture(adapters: Vec<Adapter>, tmp: TempDir) -> Fixture {
        let adapters: Vec<Arc<Adapter>> = adapters.into_iter().map(Arc::new).collect();
        let order = resolve(&adapters).unwrap();
        let contexts = ContextBuilder::new(&tmp.path().join("out")).build_all(&order);
        let store = ArtifactStore::open(&tmp.path().join("cache")).unwrap();
        Fixture {
            _tmp: tmp,
            store,
            order,
            contexts,
        }
    }

    fn ids(pipeline: &Pipeline) -> Vec<&str> {
        pipeline.stages().iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_stage_order_and_prerequisites() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("adapters");
        let mut talos = scripted(&root, "talos", &[], &[Phase::PostWork, Phase::Bootstrap]);
        add_template(&mut talos, "machine.yaml", "name: {{ adapter_id }}");
        let cilium = scripted(&root, "cilium", &["talos"], &[Phase::Bootstrap]);
        let crossplane = scripted(&root, "crossplane", &["cilium"], &[Phase::PreWork, Phase::Bootstrap]);
        let fx = fixture(vec![crossplane, cilium, talos], tmp);

        let pipeline = PipelineGenerator::new(&fx.store)
            .generate(&fx.order, &fx.contexts)
            .unwrap();

        assert_eq!(
            ids(&pipeline),
            vec![
                "talos/render",
                "talos/bootstrap/0",
                "talos/post_work/0",
                "cilium/bootstrap/0",
                "crossplane/pre_work/0",
                "crossplane/bootstrap/0",
            ]
        );
        assert!(pipeline.prerequisites(0).is_empty());
        assert_eq!(pipeline.prerequisites(1), &[0]);
        // cilium waits for the last talos stage
        assert_eq!(pipeline.prerequisites(3), &[2]);
        // crossplane waits for cilium and (transitively) talos
        assert_eq!(pipeline.prerequisites(4), &[2, 3]);
        assert_eq!(pipeline.prerequisites(5), &[4]);

        let downstream: Vec<usize> = pipeline.descendants(1).into_iter().collect();
        assert_eq!(downstream, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_same_context_for_all_stages_of_adapter() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("adapters");
        let mut talos = scripted(&root, "talos", &[], &[Phase::Bootstrap, Phase::PostWork]);
        add_template(&mut talos, "a", "x");
        let fx = fixture(vec![talos], tmp);

        let pipeline = PipelineGenerator::new(&fx.store)
            .generate(&fx.order, &fx.contexts)
            .unwrap();
        let first = &pipeline.stages()[0].context;
        assert!(pipeline.stages().iter().all(|s| Arc::ptr_eq(&s.context, first)));
    }

    #[test]
    fn test_resource_keys() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("adapters");
        let mut talos = scripted(&root, "talos", &[], &[Phase::Bootstrap]);
        talos.target = Some("cp-1".into());
        add_template(&mut talos, "a", "x");
        let other = scripted(&root, "other", &[], &[Phase::Bootstrap]);
        let fx = fixture(vec![talos, other], tmp);

        let pipeline = PipelineGenerator::new(&fx.store)
            .default_target(Some("local".into()))
            .generate(&fx.order, &fx.contexts)
            .unwrap();
        let key = |id: &str| {
            pipeline
                .stage(&StageId(id.into()))
                .unwrap()
                .resource_key
                .clone()
        };
        assert_eq!(key("talos/render"), None);
        assert_eq!(key("talos/bootstrap/0"), Some("cp-1".into()));
        assert_eq!(key("other/bootstrap/0"), Some("local".into()));
    }

    #[test]
    fn test_cache_hit_marks_render_cached() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("adapters");
        let mut talos = scripted(&root, "talos", &[], &[]);
        add_template(&mut talos, "a", "{{ version }}");
        let fx = fixture(vec![talos], tmp);
        let generator = PipelineGenerator::new(&fx.store);

        let pipeline = generator.generate(&fx.order, &fx.contexts).unwrap();
        assert_eq!(pipeline.stages()[0].status(), &StageStatus::Pending);
        assert!(!pipeline.stages()[0].is_cached());
        assert_eq!(pipeline.cache_reports()[0].lookup, CacheLookup::Miss);

        let StageWork::Render { inputs, .. } = &pipeline.stages()[0].work else {
            panic!("expected render stage");
        };
        let mut files = artifacts::FileSet::new();
        files.insert("a".into(), b"1.0.0".to_vec());
        fx.store.put(inputs, &files).unwrap();

        // Still pending: the executor decides the final status once the
        // files are restored
        let pipeline = generator.generate(&fx.order, &fx.contexts).unwrap();
        assert_eq!(pipeline.stages()[0].status(), &StageStatus::Pending);
        assert!(pipeline.stages()[0].is_cached());
        assert_eq!(pipeline.cache_reports()[0].lookup, CacheLookup::Hit);

        let forced = PipelineGenerator::new(&fx.store)
            .force_render(true)
            .generate(&fx.order, &fx.contexts)
            .unwrap();
        assert!(!forced.stages()[0].is_cached());
        assert_eq!(forced.cache_reports()[0].lookup, CacheLookup::Forced);
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("adapters");
        let mut talos = scripted(&root, "talos", &[], &[]);
        add_template(&mut talos, "a", "x");
        let fx = fixture(vec![talos], tmp);
        let generator = PipelineGenerator::new(&fx.store);

        let pipeline = generator.generate(&fx.order, &fx.contexts).unwrap();
        let StageWork::Render { inputs, key, .. } = &pipeline.stages()[0].work else {
            panic!("expected render stage");
        };
        let mut files = artifacts::FileSet::new();
        files.insert("a".into(), b"x".to_vec());
        fx.store.put(inputs, &files).unwrap();

        let stored = fx
            .store
            .root()
            .join(&key.as_str()[..2])
            .join(key.as_str())
            .join("files")
            .join("a");
        std::fs::write(&stored, b"tampered").unwrap();

        let pipeline = generator.generate(&fx.order, &fx.contexts).unwrap();
        assert!(!pipeline.stages()[0].is_cached());
        assert!(matches!(
            pipeline.cache_reports()[0].lookup,
            CacheLookup::Corrupted { .. }
        ));
        assert!(!fx.store.contains(key));
    }

    #[test]
    fn test_render_error_at_generation() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("adapters");
        let mut talos = scripted(&root, "talos", &[], &[]);
        add_template(&mut talos, "broken", "{% for %}");
        let fx = fixture(vec![talos], tmp);

        assert!(matches!(
            PipelineGenerator::new(&fx.store).generate(&fx.order, &fx.contexts),
            Err(Error::Render { .. })
        ));
    }

    #[test]
    fn test_transitions() {
        let tmp = TempDir::new().unwrap();
        let talos = scripted(tmp.path(), "talos", &[], &[Phase::Bootstrap]);
        let fx = fixture(vec![talos], tmp);
        let mut pipeline = PipelineGenerator::new(&fx.store)
            .generate(&fx.order, &fx.contexts)
            .unwrap();
        let stage = pipeline.stage_mut(0).unwrap();

        assert!(stage.transition(StageStatus::Succeeded).is_err());
        stage.transition(StageStatus::Running).unwrap();
        assert!(stage.transition(StageStatus::Pending).is_err());
        stage.transition(StageStatus::Failed).unwrap();
        match stage.transition(StageStatus::Running) {
            Err(Error::InvalidTransition { stage, from, to }) => {
                assert_eq!(stage, "talos/bootstrap/0");
                assert_eq!(from, "failed");
                assert_eq!(to, "running");
            }
            other => panic!("expected invalid transition, got {other:?}"),
        }
        assert_eq!(stage.status(), &StageStatus::Failed);
    }

    #[test]
    fn test_adapter_without_stages_is_transparent() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("adapters");
        let a = scripted(&root, "a", &[], &[Phase::Bootstrap]);
        let b = scripted(&root, "b", &["a"], &[]);
        let c = scripted(&root, "c", &["b"], &[Phase::Bootstrap]);
        let fx = fixture(vec![a, b, c], tmp);

        let pipeline = PipelineGenerator::new(&fx.store)
            .generate(&fx.order, &fx.contexts)
            .unwrap();
        assert_eq!(ids(&pipeline), vec!["a/bootstrap/0", "c/bootstrap/0"]);
        assert_eq!(pipeline.prerequisites(1), &[0]);
    }
}
