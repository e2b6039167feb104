//! Run progress display

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use workflow::{ExecutionResult, ProgressCallback, RunSummary, Stage, StageStatus};

use crate::ui;

/// Progress bar over the stages of a run, with one line per finished stage
pub struct RunProgress {
    bar: ProgressBar,
    quiet: bool,
}

impl RunProgress {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(0);
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-");
            bar.set_style(style);
            bar
        };
        Self { bar, quiet }
    }
}

impl ProgressCallback for RunProgress {
    fn run_started(&mut self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn stage_started(&mut self, stage: &Stage) {
        self.bar.set_message(stage.id.to_string());
    }

    fn stage_finished(&mut self, stage: &Stage, result: &ExecutionResult) {
        self.bar.inc(1);
        if self.quiet {
            return;
        }

        let duration = result
            .duration()
            .map(|d| format!(" ({})", ui::format_duration(d)))
            .unwrap_or_default();
        let line = match &result.status {
            StageStatus::Skipped { reason } => {
                format!("{} {} {}", ui::status_symbol(&result.status), stage.id, format!("[{reason}]").dimmed())
            }
            StageStatus::Failed => format!(
                "{} {} {}{}",
                ui::status_symbol(&result.status),
                stage.id,
                result.error.as_deref().unwrap_or("failed").red(),
                duration
            ),
            status => format!("{} {}{}", ui::status_symbol(status), stage.id, duration.dimmed()),
        };

        // Last lines of stderr for failed stages
        let failure_tail: Vec<String> = if matches!(result.status, StageStatus::Failed) {
            ui::tail(&result.stderr, 5)
                .into_iter()
                .map(|l| format!("      {}", l.dimmed()))
                .collect()
        } else {
            Vec::new()
        };

        self.bar.suspend(|| {
            println!("  {line}");
            for l in &failure_tail {
                println!("{l}");
            }
        });
    }

    fn run_finished(&mut self, _summary: &RunSummary) {
        self.bar.finish_and_clear();
    }
}
