use anyhow::Result;
use colored::Colorize;
use workflow::StageStatus;

use crate::Context;
use crate::cli::StatusArgs;
use crate::state::RunHistory;
use crate::ui;

/// Show the most recent recorded run
pub fn run(ctx: &Context, args: StatusArgs) -> Result<()> {
    let history = RunHistory::open_default()?;
    let Some(last) = history.last()? else {
        ui::info("No runs recorded yet. Run 'keel run' to provision.");
        return Ok(());
    };

    ui::header("Last Run");
    ui::kv("run id", &last.run_id.to_string());
    ui::kv(
        "started",
        &last.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    );
    ui::kv(
        "duration",
        &ui::format_duration(last.finished_at - last.started_at),
    );
    ui::kv("adapters", &last.adapters.join(" → "));
    let outcome = if last.success {
        "succeeded".green()
    } else {
        "failed".red()
    };
    ui::kv("outcome", &outcome.to_string());

    let s = &last.summary;
    println!(
        "  {} succeeded, {} failed, {} skipped, {} cancelled",
        s.succeeded.to_string().green(),
        s.failed.to_string().red(),
        s.skipped.to_string().cyan(),
        s.cancelled.to_string().yellow()
    );

    if !args.all && last.success {
        return Ok(());
    }

    // Stage detail comes from the full report
    let report = match history.report(&last.run_id) {
        Ok(report) => report,
        Err(e) => {
            ui::warn(&format!("Full report unavailable: {e:#}"));
            return Ok(());
        }
    };

    ui::section("Stages");
    for result in &report.results {
        let failed = matches!(result.status, StageStatus::Failed);
        if !args.all && result.status.is_satisfied() {
            continue;
        }
        let duration = result
            .duration()
            .map(|d| format!(" ({})", ui::format_duration(d)))
            .unwrap_or_default();
        println!(
            "  {} {} {}{}",
            ui::status_symbol(&result.status),
            result.stage_id,
            result.status.to_string().dimmed(),
            duration.dimmed()
        );
        if result.attempts > 1 {
            ui::dim(&format!("  {} attempts", result.attempts));
        }
        if let Some(error) = &result.error {
            println!("      {}", error.red());
        }
        if failed {
            let lines = if ctx.verbose > 0 { 40 } else { 5 };
            for line in ui::tail(&result.stderr, lines) {
                println!("      {}", line.dimmed());
            }
        }
    }

    let runs = history.runs()?;
    if runs.len() > 1 && ctx.verbose > 0 {
        ui::section("History");
        for (id, started_at) in runs.iter().take(10) {
            ui::dim(&format!("{} {id}", started_at.format("%Y-%m-%d %H:%M")));
        }
    }
    Ok(())
}
