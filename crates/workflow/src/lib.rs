//! # Workflow
//!
//! Adapter-driven provisioning engine.
//!
//! An *adapter* packages the install logic for one infrastructure component
//! (a control plane, a CNI layer, an operator) as templates plus scripts
//! bound to phases. This crate turns a set of adapters into an ordered,
//! partially parallel pipeline and runs it.
//!
//! ## Flow
//!
//! 1. [`AdapterRegistry`] loads and validates `adapter.toml` descriptors
//! 2. [`resolve`] orders the selected adapters (ties broken by id)
//! 3. [`ContextBuilder`] snapshots a layered context per adapter
//! 4. [`PipelineGenerator`] emits render and script stages, consulting the
//!    artifact store so unchanged renders are skipped
//! 5. [`BootstrapExecutor`] runs ready stages on a bounded pool, retrying
//!    transient failures and skipping everything downstream of a failure
//!
//! [`Engine`] wraps these steps behind `plan` and `run`.
//!
//! ## Example
//!
//! ```no_run
//! use artifacts::ArtifactStore;
//! use std::path::{Path, PathBuf};
//! use workflow::{
//!     AdapterRegistry, CancelToken, Engine, EngineSettings, NoProgress, ProcessRunner, RunRequest,
//! };
//!
//! let registry = AdapterRegistry::load_dir(Path::new("adapters"))?;
//! let store = ArtifactStore::open(Path::new(".keel/cache"))?;
//! let settings = EngineSettings::default();
//! let runner = ProcessRunner::new(settings.grace_period());
//! let engine = Engine::new(&registry, &store, settings);
//!
//! let request = RunRequest {
//!     adapters: vec!["crossplane".into()],
//!     output_root: PathBuf::from("out"),
//!     ..Default::default()
//! };
//! let report = engine.run(&request, &runner, &CancelToken::new(), &mut NoProgress)?;
//! for failed in report.failures() {
//!     eprintln!("{}: {}", failed.stage_id, failed.error.as_deref().unwrap_or(""));
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Injection points
//!
//! - [`CommandRunner`]: how scripts are executed ([`ProcessRunner`] for real
//!   processes)
//! - [`ProgressCallback`]: receives stage lifecycle events
//! - [`RetryCallback`]: observes retries

pub mod adapter;
pub mod cancel;
pub mod command;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod render;
pub mod resolver;
pub mod results;
pub mod retry;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use adapter::{Adapter, Dependency, ScriptRef, TemplateRef};
pub use cancel::CancelToken;
pub use command::{CommandOutcome, CommandRunner, CommandSpec, OutputSink, ProcessRunner, Stream};
pub use context::{Context, ContextBuilder, Overrides};
pub use engine::{Engine, RunReport, RunRequest};
pub use error::{Error, FailureClass, Result};
pub use executor::{BootstrapExecutor, CONTEXT_ENV};
pub use pipeline::{CacheLookup, CacheReport, Pipeline, PipelineGenerator, Stage, StageId, StageWork};
pub use progress::{NoProgress, ProgressCallback};
pub use registry::{AdapterRegistry, DESCRIPTOR_FILE};
pub use render::TemplateSet;
pub use resolver::{ResolvedOrder, resolve};
pub use results::{ExecutionLog, ExecutionResult};
pub use retry::{NoCallback, RetryCallback};
pub use types::{
    EngineSettings, ParallelismPolicy, Phase, RetryPolicy, RunSummary, SkipReason, StageStatus,
};
