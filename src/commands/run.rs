use anyhow::{Result, bail};
use colored::Colorize;
use workflow::{CancelToken, Engine, ProcessRunner, RunReport};

use crate::Context;
use crate::cli::RunArgs;
use crate::commands::Workspace;
use crate::progress::RunProgress;
use crate::signal;
use crate::state::RunHistory;
use crate::ui;

pub fn run(ctx: &Context, args: RunArgs) -> Result<()> {
    let ws = Workspace::open(ctx)?;

    let mut settings = ws.settings();
    if let Some(jobs) = args.jobs {
        settings.max_parallelism = jobs.max(1);
    }
    if args.fail_fast {
        settings.fail_fast = true;
    }

    let runner = ProcessRunner::new(settings.grace_period());
    let cancel = CancelToken::new();
    signal::cancel_on_interrupt(&cancel);

    let engine = Engine::new(&ws.registry, &ws.store, settings);
    let request = ws.request(args.adapters, args.force_render);

    if !ctx.quiet {
        ui::header("Run");
        ui::kv("output", &request.output_root.display().to_string());
        ui::kv("jobs", &engine.settings().max_parallelism.to_string());
        println!();
    }

    let mut progress = RunProgress::new(ctx.quiet);
    let report = engine.run(&request, &runner, &cancel, &mut progress)?;
    // Stop the signal watcher
    cancel.cancel();

    if !args.no_history {
        match RunHistory::open_default().and_then(|h| h.record(&report)) {
            Ok(path) => log::debug!("Recorded run at {}", path.display()),
            Err(e) => ui::warn(&format!("Could not record run history: {e:#}")),
        }
    }

    print_summary(&report);

    if !report.is_success() {
        bail!(
            "Run {} did not complete: {} failed, {} skipped after failures, {} cancelled",
            report.run_id,
            report.summary.failed,
            report.summary.skipped_upstream,
            report.summary.cancelled
        );
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    let summary = &report.summary;
    let elapsed = ui::format_duration(report.finished_at - report.started_at);
    println!();
    if report.is_success() {
        ui::success(&format!(
            "{} stage(s) succeeded, {} skipped in {elapsed}",
            summary.succeeded, summary.skipped
        ));
    } else {
        ui::error(&format!(
            "{} succeeded, {} failed, {} skipped, {} cancelled in {elapsed}",
            summary.succeeded, summary.failed, summary.skipped, summary.cancelled
        ));
        for failure in report.failures() {
            println!(
                "  {} {}: {}",
                "✗".red(),
                failure.stage_id,
                failure.error.as_deref().unwrap_or("failed")
            );
        }
    }
    ui::dim(&format!("run id {}", report.run_id));
}
