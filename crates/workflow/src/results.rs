//! Per-stage execution records
//!
//! The log holds one slot per pipeline stage. Each slot has its own mutex
//! and is only written by the thread currently working on that stage (and
//! by the dispatcher before or after), so writers never contend.

use crate::command::{OutputSink, Stream};
use crate::pipeline::{Pipeline, StageId};
use crate::types::{Phase, RunSummary, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Record of one stage in one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub stage_id: StageId,
    pub adapter_id: String,
    pub phase: Phase,
    #[serde(flatten)]
    pub status: StageStatus,
    /// Output of the last attempt
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    /// Failure or cancellation detail
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Wall-clock duration, when the stage ran
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Execution records of one run
#[derive(Debug)]
pub struct ExecutionLog {
    run_id: Uuid,
    slots: Vec<Mutex<ExecutionResult>>,
    index: HashMap<StageId, usize>,
}

impl ExecutionLog {
    /// One slot per stage, seeded with the stage's current status
    pub fn new(run_id: Uuid, pipeline: &Pipeline) -> Self {
        let slots = pipeline
            .stages()
            .iter()
            .map(|stage| {
                Mutex::new(ExecutionResult {
                    run_id,
                    stage_id: stage.id.clone(),
                    adapter_id: stage.adapter_id().to_string(),
                    phase: stage.phase,
                    status: stage.status().clone(),
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    started_at: None,
                    finished_at: None,
                    attempts: 0,
                    error: None,
                })
            })
            .collect();
        let index = pipeline
            .stages()
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        Self {
            run_id,
            slots,
            index,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn slot(&self, index: usize) -> Option<MutexGuard<'_, ExecutionResult>> {
        self.slots
            .get(index)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Apply `f` to the record of stage `index`
    pub fn update(&self, index: usize, f: impl FnOnce(&mut ExecutionResult)) {
        if let Some(mut slot) = self.slot(index) {
            f(&mut slot);
        }
    }

    /// Copy of one record
    pub fn get(&self, id: &StageId) -> Option<ExecutionResult> {
        self.index
            .get(id)
            .and_then(|i| self.slot(*i))
            .map(|slot| slot.clone())
    }

    /// Copy of all records, in pipeline order
    pub fn snapshot(&self) -> Vec<ExecutionResult> {
        (0..self.slots.len())
            .filter_map(|i| self.slot(i).map(|slot| slot.clone()))
            .collect()
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for i in 0..self.slots.len() {
            if let Some(slot) = self.slot(i) {
                summary.add_status(&slot.status);
            }
        }
        summary
    }

    /// A sink that streams output lines into the record of stage `index`
    pub fn sink(&self, index: usize) -> StageSink<'_> {
        StageSink { log: self, index }
    }
}

/// Streams command output into one stage's record
pub struct StageSink<'a> {
    log: &'a ExecutionLog,
    index: usize,
}

impl StageSink<'_> {
    /// Drop output of a previous attempt
    pub fn reset(&self) {
        self.log.update(self.index, |r| {
            r.stdout.clear();
            r.stderr.clear();
        });
    }
}

impl OutputSink for StageSink<'_> {
    fn line(&self, stream: Stream, line: &str) {
        self.log.update(self.index, |r| {
            let buf = match stream {
                Stream::Stdout => &mut r.stdout,
                Stream::Stderr => &mut r.stderr,
            };
            buf.push_str(line);
            buf.push('\n');
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextBuilder;
    use crate::pipeline::PipelineGenerator;
    use crate::resolver::resolve;
    use crate::testing::scripted;
    use crate::types::SkipReason;
    use artifacts::ArtifactStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn pipeline(tmp: &TempDir) -> Pipeline {
        let adapters = vec![
            Arc::new(scripted(tmp.path(), "talos", &[], &[Phase::Bootstrap])),
            Arc::new(scripted(tmp.path(), "cilium", &["talos"], &[Phase::Bootstrap])),
        ];
        let order = resolve(&adapters).unwrap();
        let contexts = ContextBuilder::new(&tmp.path().join("out")).build_all(&order);
        let store = ArtifactStore::open(&tmp.path().join("cache")).unwrap();
        PipelineGenerator::new(&store)
            .generate(&order, &contexts)
            .unwrap()
    }

    #[test]
    fn test_slots_seeded_from_pipeline() {
        let tmp = TempDir::new().unwrap();
        let pipeline = pipeline(&tmp);
        let run_id = Uuid::new_v4();
        let log = ExecutionLog::new(run_id, &pipeline);

        let records = log.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stage_id.as_str(), "talos/bootstrap/0");
        assert_eq!(records[1].adapter_id, "cilium");
        assert!(records.iter().all(|r| r.run_id == run_id));
        assert_eq!(log.summary().unfinished, 2);
    }

    #[test]
    fn test_sink_streams_lines() {
        let tmp = TempDir::new().unwrap();
        let log = ExecutionLog::new(Uuid::new_v4(), &pipeline(&tmp));
        let sink = log.sink(0);
        sink.line(Stream::Stdout, "installing");
        sink.line(Stream::Stderr, "warning: slow mirror");
        sink.line(Stream::Stdout, "done");

        let id = StageId::script("talos", Phase::Bootstrap, 0);
        let record = log.get(&id).unwrap();
        assert_eq!(record.stdout, "installing\ndone\n");
        assert_eq!(record.stderr, "warning: slow mirror\n");

        sink.reset();
        assert!(log.get(&id).unwrap().stdout.is_empty());
    }

    #[test]
    fn test_concurrent_writers_on_distinct_slots() {
        let tmp = TempDir::new().unwrap();
        let log = ExecutionLog::new(Uuid::new_v4(), &pipeline(&tmp));
        std::thread::scope(|s| {
            for index in 0..2 {
                let log = &log;
                s.spawn(move || {
                    let sink = log.sink(index);
                    for n in 0..100 {
                        sink.line(Stream::Stdout, &format!("line {n}"));
                    }
                });
            }
        });
        for record in log.snapshot() {
            assert_eq!(record.stdout.lines().count(), 100);
        }
    }

    #[test]
    fn test_summary_and_serialization() {
        let tmp = TempDir::new().unwrap();
        let log = ExecutionLog::new(Uuid::new_v4(), &pipeline(&tmp));
        log.update(0, |r| r.status = StageStatus::Failed);
        log.update(1, |r| {
            r.status = StageStatus::Skipped {
                reason: SkipReason::UpstreamFailure {
                    failed_stage: "talos/bootstrap/0".into(),
                },
            };
        });
        let summary = log.summary();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped_upstream, 1);

        let json = serde_json::to_value(log.snapshot()).unwrap();
        assert_eq!(json[1]["status"], "skipped");
        assert_eq!(json[1]["reason"]["kind"], "upstream_failure");

        let back: Vec<ExecutionResult> = serde_json::from_value(json).unwrap();
        assert_eq!(back, log.snapshot());
    }
}
