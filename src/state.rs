//! Run history under the state directory
//!
//! ```text
//! <state_dir>/
//!   last_run.toml      summary of the most recent run
//!   runs/<run_id>.json full RunReport
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use workflow::{RunReport, RunSummary};

use crate::paths;

/// Summary of the most recent run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    /// Adapters in execution order
    #[serde(default)]
    pub adapters: Vec<String>,
    /// Stage ids that failed
    #[serde(default)]
    pub failed_stages: Vec<String>,
    pub summary: RunSummary,
}

impl LastRun {
    pub fn from_report(report: &RunReport) -> Self {
        Self {
            run_id: report.run_id,
            started_at: report.started_at,
            finished_at: report.finished_at,
            success: report.is_success(),
            adapters: report.order.clone(),
            failed_stages: report.failures().map(|r| r.stage_id.to_string()).collect(),
            summary: report.summary.clone(),
        }
    }
}

/// Persisted run reports
pub struct RunHistory {
    dir: PathBuf,
}

impl RunHistory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// History in the default state directory
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(paths::state_dir()?))
    }

    fn runs_dir(&self) -> PathBuf {
        self.dir.join("runs")
    }

    fn last_run_file(&self) -> PathBuf {
        self.dir.join("last_run.toml")
    }

    /// Write the full report and update `last_run.toml`
    pub fn record(&self, report: &RunReport) -> Result<PathBuf> {
        let runs = self.runs_dir();
        fs::create_dir_all(&runs)
            .with_context(|| format!("Failed to create state directory: {}", runs.display()))?;

        let path = runs.join(format!("{}.json", report.run_id));
        let json = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;

        let last = LastRun::from_report(report);
        let content = toml::to_string_pretty(&last).context("Failed to serialize run summary to TOML")?;
        let last_path = self.last_run_file();
        fs::write(&last_path, content)
            .with_context(|| format!("Failed to write state file: {}", last_path.display()))?;

        log::debug!("Saved run report to {}", path.display());
        Ok(path)
    }

    /// Summary of the most recent run, if any
    pub fn last(&self) -> Result<Option<LastRun>> {
        let path = self.last_run_file();
        if !path.exists() {
            log::debug!("No previous run recorded");
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        let last = toml::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
        Ok(Some(last))
    }

    /// Full report of one run
    pub fn report(&self, run_id: &Uuid) -> Result<RunReport> {
        let path = self.runs_dir().join(format!("{run_id}.json"));
        load_report(&path)
    }

    /// Recorded run ids, newest first
    pub fn runs(&self) -> Result<Vec<(Uuid, DateTime<Utc>)>> {
        let dir = self.runs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to read {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            match load_report(&path) {
                Ok(report) => runs.push((report.run_id, report.started_at)),
                Err(e) => log::warn!("Skipping unreadable run report {}: {e:#}", path.display()),
            }
        }
        runs.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(runs)
    }
}

fn load_report(path: &Path) -> Result<RunReport> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid run report: {}", path.display()))
}
