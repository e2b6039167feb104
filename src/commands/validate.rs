use anyhow::Result;
use colored::Colorize;
use workflow::{Engine, Phase};

use crate::Context;
use crate::commands::Workspace;
use crate::ui;

/// Load every adapter and check the dependency graph
pub fn run(ctx: &Context) -> Result<()> {
    let ws = Workspace::open(ctx)?;
    let engine = Engine::new(&ws.registry, &ws.store, ws.settings());
    let order = engine.resolve(&ws.request(Vec::new(), false))?;

    if !ctx.quiet {
        ui::header("Adapters");
        for adapter in order.adapters() {
            let deps: Vec<String> = adapter.dependencies.iter().map(ToString::to_string).collect();
            let scripts: Vec<&str> = Phase::SCRIPT_PHASES
                .iter()
                .filter(|p| adapter.scripts_for(**p).next().is_some())
                .map(Phase::as_str)
                .collect();
            println!(
                "  {} {} {}",
                adapter.id.bold(),
                adapter.version.dimmed(),
                if deps.is_empty() {
                    String::new()
                } else {
                    format!("← {}", deps.join(", ")).dimmed().to_string()
                }
            );
            if ctx.verbose > 0 {
                ui::kv("templates", &adapter.templates.len().to_string());
                ui::kv("phases", &scripts.join(", "));
            }
        }
        println!();
    }

    ui::success(&format!(
        "{} adapter(s) valid, execution order: {}",
        order.len(),
        order.ids().join(" → ")
    ));
    Ok(())
}
