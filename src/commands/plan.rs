use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use workflow::{CacheLookup, CacheReport, Engine, Pipeline, StageStatus, StageWork};

use crate::Context;
use crate::cli::PlanArgs;
use crate::commands::Workspace;
use crate::ui;

#[derive(Serialize)]
struct PlanView<'a> {
    order: Vec<&'a str>,
    stages: Vec<StageView<'a>>,
    cache: &'a [CacheReport],
}

#[derive(Serialize)]
struct StageView<'a> {
    id: &'a str,
    adapter: &'a str,
    phase: &'a str,
    #[serde(flatten)]
    status: &'a StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    script: Option<String>,
    after: Vec<&'a str>,
}

pub fn run(ctx: &Context, args: PlanArgs) -> Result<()> {
    let ws = Workspace::open(ctx)?;
    let engine = Engine::new(&ws.registry, &ws.store, ws.settings());
    let request = ws.request(args.adapters, args.force_render);
    let order = engine.resolve(&request)?;
    let pipeline = engine.plan(&request)?;

    if args.json {
        let view = plan_view(order.ids(), &pipeline);
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    ui::header("Plan");
    ui::kv("order", &order.ids().join(" → "));
    ui::kv("output", &request.output_root.display().to_string());

    let mut current = "";
    for stage in pipeline.stages() {
        if stage.adapter_id() != current {
            current = stage.adapter_id();
            ui::section(&format!("{} {}", current, stage.adapter.version.dimmed()));
        }
        let detail = match &stage.work {
            StageWork::Render { templates, .. } => {
                let lookup = pipeline
                    .cache_reports()
                    .iter()
                    .find(|r| r.adapter_id == current)
                    .map(|r| lookup_label(&r.lookup))
                    .unwrap_or_default();
                format!("{} template(s){lookup}", templates.templates().len())
            }
            StageWork::Script(script) => script.path.display().to_string(),
        };
        let after: Vec<String> = pipeline
            .prerequisite_ids(&stage.id)
            .iter()
            .map(ToString::to_string)
            .collect();
        println!(
            "  {} {} {}",
            ui::status_symbol(stage.status()),
            stage.id,
            detail.dimmed()
        );
        if ctx.verbose > 0 && !after.is_empty() {
            ui::dim(&format!("  after: {}", after.join(", ")));
        }
    }
    println!();
    ui::info(&format!("{} stage(s) across {} adapter(s)", pipeline.len(), order.len()));
    Ok(())
}

fn plan_view<'a>(order: Vec<&'a str>, pipeline: &'a Pipeline) -> PlanView<'a> {
    let stages = pipeline
        .stages()
        .iter()
        .map(|stage| StageView {
            id: stage.id.as_str(),
            adapter: stage.adapter_id(),
            phase: stage.phase.as_str(),
            status: stage.status(),
            resource_key: stage.resource_key.as_deref(),
            script: match &stage.work {
                StageWork::Script(script) => Some(script.path.display().to_string()),
                StageWork::Render { .. } => None,
            },
            after: pipeline
                .prerequisite_ids(&stage.id)
                .into_iter()
                .map(|id| id.as_str())
                .collect(),
        })
        .collect();
    PlanView {
        order,
        stages,
        cache: pipeline.cache_reports(),
    }
}

fn lookup_label(lookup: &CacheLookup) -> String {
    match lookup {
        CacheLookup::Hit => ", cached".to_string(),
        CacheLookup::Miss => String::new(),
        CacheLookup::Forced => ", forced".to_string(),
        CacheLookup::Corrupted { detail } => format!(", cache entry invalidated: {detail}"),
    }
}
