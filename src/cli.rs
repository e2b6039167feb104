use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keel")]
#[command(version)]
#[command(about = "Provision infrastructure from declarative adapters", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: <config dir>/keel.toml)
    #[arg(short, long, global = true, env = "KEEL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate adapter descriptors and the dependency graph
    Validate,

    /// Show the stage plan without running anything
    Plan(PlanArgs),

    /// Render templates and run adapter scripts
    Run(RunArgs),

    /// Show the most recent run
    Status(StatusArgs),

    /// Inspect or clear the artifact cache
    #[command(subcommand)]
    Cache(CacheCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser)]
pub struct PlanArgs {
    /// Adapters to provision (dependencies are included); all when omitted
    pub adapters: Vec<String>,

    /// Ignore cached renders
    #[arg(long)]
    pub force_render: bool,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct RunArgs {
    /// Adapters to provision (dependencies are included); all when omitted
    pub adapters: Vec<String>,

    /// Ignore cached renders
    #[arg(long)]
    pub force_render: bool,

    /// Maximum number of stages running at once
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Stop starting new stages after the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Do not record the run in the state directory
    #[arg(long)]
    pub no_history: bool,
}

#[derive(Parser)]
pub struct StatusArgs {
    /// Show every stage, not just failures
    #[arg(short, long)]
    pub all: bool,
}

#[derive(Subcommand)]
pub enum CacheCommand {
    /// List cached renders
    List,

    /// Check every entry against its digests
    Verify {
        /// Remove corrupt entries
        #[arg(long)]
        fix: bool,
    },

    /// Remove every entry
    Clear,
}
