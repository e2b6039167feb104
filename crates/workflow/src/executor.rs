//! Pipeline execution
//!
//! The dispatcher runs on the calling thread and owns every status change.
//! Stage work runs on a bounded rayon pool and reports back over a channel.
//! A stage launches once all of its prerequisites are terminal and
//! satisfied; a failure marks every transitive dependent as skipped before
//! it can start, while independent branches keep going.

use crate::adapter::ScriptRef;
use crate::cancel::CancelToken;
use crate::command::{CommandRunner, CommandSpec, NullSink};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::pipeline::{Pipeline, Stage, StageWork};
use crate::progress::ProgressCallback;
use crate::render::TemplateSet;
use crate::results::ExecutionLog;
use crate::retry::{RetryCallback, with_retry};
use crate::types::{EngineSettings, ParallelismPolicy, SkipReason, StageStatus};
use artifacts::{ArtifactKey, ArtifactStore, KeyInputs};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

/// Environment variable holding the path of the context document
pub const CONTEXT_ENV: &str = "KEEL_CONTEXT";

/// Lock shared by every script stage under [`ParallelismPolicy::RenderOnly`]
const SERIAL_SCRIPT_LOCK: &str = "*";

/// How a stage's work ended
#[derive(Debug)]
struct StageOutcome {
    status: StageStatus,
    error: Option<String>,
}

impl StageOutcome {
    fn succeeded() -> Self {
        Self {
            status: StageStatus::Succeeded,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            error: Some(error.into()),
        }
    }

    fn cancelled() -> Self {
        Self {
            status: StageStatus::Cancelled,
            error: Some("cancelled".to_string()),
        }
    }

    fn skipped(reason: SkipReason) -> Self {
        Self {
            status: StageStatus::Skipped { reason },
            error: None,
        }
    }
}

/// Runs a pipeline against real (or fake) systems
pub struct BootstrapExecutor<'a> {
    store: &'a ArtifactStore,
    runner: &'a dyn CommandRunner,
    settings: &'a EngineSettings,
    cancel: &'a CancelToken,
}

impl<'a> BootstrapExecutor<'a> {
    pub fn new(
        store: &'a ArtifactStore,
        runner: &'a dyn CommandRunner,
        settings: &'a EngineSettings,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            store,
            runner,
            settings,
            cancel,
        }
    }

    /// Run every stage of `pipeline` to a terminal status
    ///
    /// Stage failures are recorded in `log`, not returned. An `Err` means the
    /// scheduler itself could not proceed.
    pub fn execute(
        &self,
        pipeline: &mut Pipeline,
        log: &ExecutionLog,
        progress: &mut dyn ProgressCallback,
    ) -> Result<()> {
        let workers = self.settings.max_parallelism.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("keel-stage-{i}"))
            .build()
            .map_err(|e| Error::config("<engine>", "max_parallelism", e.to_string()))?;

        progress.run_started(pipeline.len());
        log::info!(
            "Run {}: {} stage(s), {} worker(s)",
            log.run_id(),
            pipeline.len(),
            workers
        );

        let mut dispatch = Dispatch::new(pipeline.len());
        let (tx, rx) = mpsc::channel::<(usize, StageOutcome)>();

        pool.in_place_scope(|scope| -> Result<()> {
            loop {
                if self.cancel.is_cancelled() || dispatch.halted {
                    self.cancel_waiting(pipeline, log, progress, &mut dispatch)?;
                } else {
                    self.launch_ready(pipeline, log, progress, &mut dispatch, |index, stage| {
                        let tx = tx.clone();
                        scope.spawn(move |_| {
                            let outcome = self.run_stage(index, &stage, log);
                            let _ = tx.send((index, outcome));
                        });
                    })?;
                }

                if dispatch.in_flight == 0 {
                    if !dispatch.all_settled() {
                        self.abandon_unreachable(pipeline, log, progress, &mut dispatch)?;
                    }
                    break;
                }

                let Ok((index, outcome)) = rx.recv() else {
                    break;
                };
                dispatch.in_flight -= 1;
                if let Some(key) = dispatch.held_locks.remove(&index) {
                    dispatch.busy.remove(&key);
                }
                self.finish(pipeline, log, progress, &mut dispatch, index, outcome)?;
            }
            Ok(())
        })?;

        progress.run_finished(&log.summary());
        Ok(())
    }

    /// Launch every ready stage the worker budget and resource locks allow
    fn launch_ready(
        &self,
        pipeline: &mut Pipeline,
        log: &ExecutionLog,
        progress: &mut dyn ProgressCallback,
        dispatch: &mut Dispatch,
        mut spawn: impl FnMut(usize, Stage),
    ) -> Result<()> {
        let workers = self.settings.max_parallelism.max(1);
        for index in 0..pipeline.len() {
            if dispatch.in_flight >= workers {
                break;
            }
            if dispatch.settled[index] || dispatch.running[index] || !dispatch.is_ready(pipeline, index) {
                continue;
            }

            if let Some(key) = self.lock_key(&pipeline.stages()[index]) {
                if dispatch.busy.contains(&key) {
                    continue;
                }
                dispatch.busy.insert(key.clone());
                dispatch.held_locks.insert(index, key);
            }

            let stage = pipeline
                .stage_mut(index)
                .ok_or_else(|| Error::config("<engine>", "pipeline", "stage index out of range"))?;
            stage.transition(StageStatus::Running)?;
            log.update(index, |r| {
                r.status = StageStatus::Running;
                r.started_at = Some(Utc::now());
            });
            log::info!("Starting {}", stage.id);
            progress.stage_started(stage);

            dispatch.running[index] = true;
            dispatch.in_flight += 1;
            spawn(index, stage.clone());
        }
        Ok(())
    }

    /// Record a finished stage and propagate failures
    fn finish(
        &self,
        pipeline: &mut Pipeline,
        log: &ExecutionLog,
        progress: &mut dyn ProgressCallback,
        dispatch: &mut Dispatch,
        index: usize,
        outcome: StageOutcome,
    ) -> Result<()> {
        dispatch.running[index] = false;
        let failed = matches!(outcome.status, StageStatus::Failed);
        let cancelled = matches!(outcome.status, StageStatus::Cancelled);

        self.settle(pipeline, log, progress, dispatch, index, outcome.status, outcome.error)?;

        if failed {
            self.skip_dependents(pipeline, log, progress, dispatch, index)?;
            if self.settings.fail_fast {
                log::warn!("Fail-fast: not starting further stages");
                dispatch.halted = true;
            }
        } else if cancelled {
            dispatch.halted = true;
        }
        Ok(())
    }

    /// Move stage `index` to a terminal status everywhere it is tracked
    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        pipeline: &mut Pipeline,
        log: &ExecutionLog,
        progress: &mut dyn ProgressCallback,
        dispatch: &mut Dispatch,
        index: usize,
        status: StageStatus,
        error: Option<String>,
    ) -> Result<()> {
        let stage = pipeline
            .stage_mut(index)
            .ok_or_else(|| Error::config("<engine>", "pipeline", "stage index out of range"))?;
        stage.transition(status.clone())?;
        dispatch.settled[index] = true;

        match &status {
            StageStatus::Failed => log::error!(
                "{} failed: {}",
                stage.id,
                error.as_deref().unwrap_or("unknown error")
            ),
            other => log::info!("{} {other}", stage.id),
        }

        log.update(index, |r| {
            r.status = status;
            r.finished_at = Some(Utc::now());
            if error.is_some() {
                r.error = error;
            }
        });
        if let Some(result) = log.get(&stage.id) {
            progress.stage_finished(stage, &result);
        }
        Ok(())
    }

    /// Skip everything downstream of a failed stage
    fn skip_dependents(
        &self,
        pipeline: &mut Pipeline,
        log: &ExecutionLog,
        progress: &mut dyn ProgressCallback,
        dispatch: &mut Dispatch,
        failed: usize,
    ) -> Result<()> {
        let failed_stage = pipeline.stages()[failed].id.to_string();
        for index in pipeline.descendants(failed) {
            if dispatch.settled[index] {
                continue;
            }
            self.settle(
                pipeline,
                log,
                progress,
                dispatch,
                index,
                StageStatus::Skipped {
                    reason: SkipReason::UpstreamFailure {
                        failed_stage: failed_stage.clone(),
                    },
                },
                Some(format!("upstream stage {failed_stage} failed")),
            )?;
        }
        Ok(())
    }

    /// Cancel every stage that has not started
    fn cancel_waiting(
        &self,
        pipeline: &mut Pipeline,
        log: &ExecutionLog,
        progress: &mut dyn ProgressCallback,
        dispatch: &mut Dispatch,
    ) -> Result<()> {
        let reason = if self.cancel.is_cancelled() {
            "run cancelled"
        } else {
            "not started after an earlier failure (fail-fast)"
        };
        for index in 0..pipeline.len() {
            if dispatch.settled[index] || dispatch.running[index] {
                continue;
            }
            self.settle(
                pipeline,
                log,
                progress,
                dispatch,
                index,
                StageStatus::Cancelled,
                Some(reason.to_string()),
            )?;
        }
        Ok(())
    }

    /// Nothing is running and nothing can start: cancel what is left
    fn abandon_unreachable(
        &self,
        pipeline: &mut Pipeline,
        log: &ExecutionLog,
        progress: &mut dyn ProgressCallback,
        dispatch: &mut Dispatch,
    ) -> Result<()> {
        log::error!("Scheduler stalled with unfinished stages");
        for index in 0..pipeline.len() {
            if dispatch.settled[index] {
                continue;
            }
            self.settle(
                pipeline,
                log,
                progress,
                dispatch,
                index,
                StageStatus::Cancelled,
                Some("prerequisites never completed".to_string()),
            )?;
        }
        Ok(())
    }

    fn lock_key(&self, stage: &Stage) -> Option<String> {
        if !stage.phase.is_script() {
            return None;
        }
        match self.settings.parallelism {
            ParallelismPolicy::All => stage.resource_key.clone(),
            ParallelismPolicy::RenderOnly => Some(SERIAL_SCRIPT_LOCK.to_string()),
        }
    }

    /// Worker entry point
    fn run_stage(&self, index: usize, stage: &Stage, log: &ExecutionLog) -> StageOutcome {
        if self.cancel.is_cancelled() {
            return StageOutcome::cancelled();
        }
        match &stage.work {
            StageWork::Render {
                templates,
                inputs,
                key,
                cached,
            } => {
                let restored = if *cached {
                    self.restore(stage, key)
                } else {
                    Ok(None)
                };
                match restored {
                    Ok(Some(paths)) => {
                        log.update(index, |r| r.stdout = list_paths(&paths));
                        StageOutcome::skipped(SkipReason::CacheHit)
                    }
                    Ok(None) => match self.render(stage, templates, inputs) {
                        Ok(paths) => {
                            log.update(index, |r| r.stdout = list_paths(&paths));
                            StageOutcome::succeeded()
                        }
                        Err(e) => StageOutcome::failed(e.to_string()),
                    },
                    Err(e) => StageOutcome::failed(format!("cached render could not be restored: {e}")),
                }
            }
            StageWork::Script(script) => self.run_script(index, stage, script, log),
        }
    }

    /// Expand templates, store the result and write it out
    fn render(&self, stage: &Stage, templates: &TemplateSet, inputs: &KeyInputs) -> Result<Vec<PathBuf>> {
        let files = templates.render(&stage.context)?;
        let entry = self.store.put(inputs, &files)?;
        let dest = output_dir(stage)?;
        Ok(self.store.materialize(&entry, &dest)?)
    }

    /// Restore a cached render into the output directory
    ///
    /// `Ok(None)` means the entry is gone or failed verification since
    /// planning; it is invalidated and the caller renders from scratch.
    fn restore(&self, stage: &Stage, key: &ArtifactKey) -> Result<Option<Vec<PathBuf>>> {
        let entry = match self.store.get(key) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                log::warn!("{}: cached entry {} disappeared, rendering", stage.id, key.short());
                return Ok(None);
            }
            Err(e) if e.is_corruption() => {
                log::warn!("{}: cached entry {} is corrupt, rendering: {e}", stage.id, key.short());
                self.store.invalidate(key)?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let dest = output_dir(stage)?;
        log::debug!("{}: restoring {} cached file(s)", stage.id, entry.files.len());
        Ok(Some(self.store.materialize(&entry, &dest)?))
    }

    fn run_script(&self, index: usize, stage: &Stage, script: &ScriptRef, log: &ExecutionLog) -> StageOutcome {
        let document = match write_context_document(&stage.context) {
            Ok(doc) => doc,
            Err(e) => return StageOutcome::failed(e.to_string()),
        };

        let mut env = self.inherited_env();
        env.insert(
            CONTEXT_ENV.to_string(),
            document.path().to_string_lossy().into_owned(),
        );
        let timeout = script.timeout.unwrap_or_else(|| self.settings.script_timeout());

        if let Some(precheck) = &script.precheck {
            let spec = CommandSpec {
                program: stage.adapter.resolve_path(precheck),
                args: Vec::new(),
                env: env.clone(),
                cwd: stage.adapter.root.clone(),
                timeout,
            };
            match self.runner.run(&spec, &NullSink, self.cancel) {
                Ok(outcome) if outcome.success() => {
                    return StageOutcome::skipped(SkipReason::PrecheckSatisfied);
                }
                Ok(outcome) if outcome.cancelled => return StageOutcome::cancelled(),
                Ok(outcome) => log::debug!(
                    "{}: precheck not satisfied ({})",
                    stage.id,
                    outcome.failure_reason()
                ),
                Err(e) => log::warn!("{}: precheck could not run, treating as unsatisfied: {e}", stage.id),
            }
        }

        let spec = CommandSpec {
            program: stage.adapter.resolve_path(&script.path),
            args: script.args.clone(),
            env,
            cwd: stage.adapter.root.clone(),
            timeout,
        };
        let sink = log.sink(index);
        let notify = StageRetryLog {
            stage: stage.id.as_str(),
        };
        let retried = with_retry(
            &self.settings.retry,
            &script.transient_exit_codes,
            self.cancel,
            &notify,
            |attempt| {
                sink.reset();
                log.update(index, |r| r.attempts = attempt);
                self.runner.run(&spec, &sink, self.cancel)
            },
        );

        let attempts = retried.attempts;
        log.update(index, |r| r.attempts = attempts);
        let outcome = match retried.result {
            Ok(outcome) => outcome,
            Err(e) => {
                return StageOutcome::failed(format!("{}: {e}", spec.display()));
            }
        };
        log.update(index, |r| r.exit_code = outcome.exit_code);

        if outcome.success() {
            return StageOutcome::succeeded();
        }
        if outcome.cancelled || retried.interrupted {
            return StageOutcome::cancelled();
        }

        let failure = Error::ExecutionFailure {
            adapter: stage.adapter.id.clone(),
            stage: stage.id.to_string(),
            phase: stage.phase,
            attempts,
            exit_code: outcome.exit_code,
            reason: outcome.failure_reason(),
            stderr: outcome.stderr,
        };
        StageOutcome::failed(failure.to_string())
    }

    /// Allowlisted variables copied from the driver's environment
    fn inherited_env(&self) -> BTreeMap<String, String> {
        self.settings
            .inherit_env
            .iter()
            .filter_map(|name| {
                std::env::var_os(name).map(|value| (name.clone(), value.to_string_lossy().into_owned()))
            })
            .collect()
    }
}

/// Dispatcher bookkeeping
struct Dispatch {
    /// The scheduler is done with the stage
    settled: Vec<bool>,
    running: Vec<bool>,
    in_flight: usize,
    busy: HashSet<String>,
    held_locks: BTreeMap<usize, String>,
    /// No further launches (fail-fast or a cancelled stage)
    halted: bool,
}

impl Dispatch {
    fn new(stages: usize) -> Self {
        Self {
            settled: vec![false; stages],
            running: vec![false; stages],
            in_flight: 0,
            busy: HashSet::new(),
            held_locks: BTreeMap::new(),
            halted: false,
        }
    }

    fn all_settled(&self) -> bool {
        self.settled.iter().all(|s| *s)
    }

    fn is_ready(&self, pipeline: &Pipeline, index: usize) -> bool {
        pipeline.prerequisites(index).iter().all(|p| {
            self.settled[*p] && pipeline.stages()[*p].status().is_satisfied()
        })
    }
}

struct StageRetryLog<'a> {
    stage: &'a str,
}

impl RetryCallback for StageRetryLog<'_> {
    fn on_retry(&self, attempt: u32, max_attempts: u32, reason: &str, delay: Duration) {
        log::warn!(
            "{}: attempt {attempt}/{max_attempts} failed ({reason}), retrying in {}s",
            self.stage,
            delay.as_secs_f64()
        );
    }
}

fn output_dir(stage: &Stage) -> Result<PathBuf> {
    stage
        .context
        .output_dir()
        .ok_or_else(|| Error::config(stage.adapter.id.clone(), "output_dir", "missing from context"))
}

fn write_context_document(context: &Context) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("keel-context-")
        .suffix(".json")
        .tempfile()
        .map_err(|e| Error::io(std::env::temp_dir(), e))?;
    let json = context.to_json_pretty()?;
    file.write_all(json.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|e| Error::io(file.path(), e))?;
    Ok(file)
}

fn list_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("wrote {}\n", p.display()))
        .collect()
}
