//! Progress reporting hooks
//!
//! Callbacks run on the dispatcher thread, between scheduling decisions, so
//! implementations get `&mut self` and need no synchronization.

use crate::pipeline::Stage;
use crate::results::ExecutionResult;
use crate::types::RunSummary;

/// Receives stage lifecycle events during a run
pub trait ProgressCallback {
    /// The run is about to start `total` stages
    fn run_started(&mut self, _total: usize) {}

    /// A stage was handed to a worker
    fn stage_started(&mut self, _stage: &Stage) {}

    /// A stage reached a terminal status
    fn stage_finished(&mut self, _stage: &Stage, _result: &ExecutionResult) {}

    /// Every stage is terminal
    fn run_finished(&mut self, _summary: &RunSummary) {}
}

/// Ignores every event
pub struct NoProgress;

impl ProgressCallback for NoProgress {}
