//! Core types shared across the engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Phase of a stage. Stages of one adapter always run in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Template expansion into the artifact store
    Render,
    /// Preparation scripts
    PreWork,
    /// Main install scripts
    Bootstrap,
    /// Follow-up scripts
    PostWork,
}

impl Phase {
    /// Script phases in execution order
    pub const SCRIPT_PHASES: [Phase; 3] = [Phase::PreWork, Phase::Bootstrap, Phase::PostWork];

    /// Name used in descriptors, stage ids and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Render => "render",
            Self::PreWork => "pre_work",
            Self::Bootstrap => "bootstrap",
            Self::PostWork => "post_work",
        }
    }

    /// Whether stages of this phase run an external script
    pub fn is_script(&self) -> bool {
        !matches!(self, Self::Render)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage was skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Rendered output already in the artifact store
    CacheHit,
    /// The idempotency precheck found the desired state already in place
    PrecheckSatisfied,
    /// A prerequisite stage failed (directly or transitively)
    UpstreamFailure { failed_stage: String },
}

impl SkipReason {
    /// Whether the skip stems from a failure elsewhere in the run
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::UpstreamFailure { .. })
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CacheHit => f.write_str("cache hit"),
            Self::PrecheckSatisfied => f.write_str("precheck satisfied"),
            Self::UpstreamFailure { .. } => f.write_str("upstream failure"),
        }
    }
}

/// Lifecycle of a stage: `pending → running → {succeeded | failed | skipped | cancelled}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped { reason: SkipReason },
    Cancelled,
}

impl StageStatus {
    /// Terminal states are final within a run
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Terminal and satisfied: dependents may proceed
    pub fn is_satisfied(&self) -> bool {
        match self {
            Self::Succeeded => true,
            Self::Skipped { reason } => !reason.is_failure(),
            _ => false,
        }
    }

    /// Short label for display
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped { .. } => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped { reason } => write!(f, "skipped ({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Which stages may run concurrently across independent adapters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParallelismPolicy {
    /// Render and script stages of independent adapters run concurrently;
    /// script stages sharing a resource key are serialized
    #[default]
    All,
    /// Only render stages run concurrently; script stages run one at a time
    RenderOnly,
}

/// Configuration for retrying transient script failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds
    pub base_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Upper bound for a single delay, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay after a failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Engine-wide execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    /// Size of the worker pool
    pub max_parallelism: usize,
    /// Concurrency policy for script stages
    pub parallelism: ParallelismPolicy,
    /// Stop launching stages after the first failure
    pub fail_fast: bool,
    /// Default timeout for one script attempt
    pub script_timeout_secs: u64,
    /// Time a terminated script gets before it is killed
    pub grace_period_secs: u64,
    /// Variables copied from the driver's environment into script environments
    pub inherit_env: Vec<String>,
    /// Resource key for script stages of adapters without a `target`
    pub default_target: Option<String>,
    /// Retry policy for transient failures
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            parallelism: ParallelismPolicy::All,
            fail_fast: false,
            script_timeout_secs: 600,
            grace_period_secs: 10,
            inherit_env: vec!["PATH".to_string(), "HOME".to_string()],
            default_target: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineSettings {
    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Counts of final stage states for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Skipped because a prerequisite failed (subset of `skipped`)
    pub skipped_upstream: usize,
    pub cancelled: usize,
    /// Stages that never reached a terminal state
    pub unfinished: usize,
}

impl RunSummary {
    /// Add one stage's final status
    pub fn add_status(&mut self, status: &StageStatus) {
        match status {
            StageStatus::Succeeded => self.succeeded += 1,
            StageStatus::Failed => self.failed += 1,
            StageStatus::Skipped { reason } => {
                self.skipped += 1;
                if reason.is_failure() {
                    self.skipped_upstream += 1;
                }
            }
            StageStatus::Cancelled => self.cancelled += 1,
            StageStatus::Pending | StageStatus::Running => self.unfinished += 1,
        }
    }

    /// Whether every stage succeeded or was legitimately skipped
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped_upstream == 0 && self.cancelled == 0 && self.unfinished == 0
    }

    /// Total number of stages counted
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.cancelled + self.unfinished
    }
}
