use anyhow::{Result, bail};
use artifacts::{ArtifactKey, ArtifactStore};
use colored::Colorize;

use crate::Context;
use crate::cli::CacheCommand;
use crate::commands::open_store;
use crate::config::LoadedConfig;
use crate::ui;

pub fn run(ctx: &Context, cmd: CacheCommand) -> Result<()> {
    let loaded = LoadedConfig::load(ctx.config.as_deref())?;
    let store = open_store(&loaded)?;
    match cmd {
        CacheCommand::List => list(&store),
        CacheCommand::Verify { fix } => verify(&store, fix),
        CacheCommand::Clear => clear(&store),
    }
}

fn list(store: &ArtifactStore) -> Result<()> {
    ui::header("Artifact Cache");
    ui::kv("location", &store.root().display().to_string());

    let keys = store.keys()?;
    if keys.is_empty() {
        ui::dim("(empty)");
        return Ok(());
    }

    println!();
    let mut total = 0;
    for key in &keys {
        match store.get(key) {
            Ok(Some(entry)) => {
                total += entry.total_size();
                println!(
                    "  {} {}@{} {} file(s), {} {}",
                    key.short().cyan(),
                    entry.inputs.adapter_id.bold(),
                    entry.inputs.adapter_version,
                    entry.files.len(),
                    ui::format_size(entry.total_size()),
                    entry.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed()
                );
            }
            Ok(None) => {}
            Err(e) => println!("  {} {}", key.short().red(), format!("unreadable: {e}").dimmed()),
        }
    }
    println!();
    ui::info(&format!("{} entr(ies), {}", keys.len(), ui::format_size(total)));
    Ok(())
}

fn verify(store: &ArtifactStore, fix: bool) -> Result<()> {
    let report = store.verify_all()?;
    if report.is_clean() {
        ui::success(&format!("{} entr(ies) verified", report.valid));
        return Ok(());
    }

    for (key, reason) in &report.corrupt {
        ui::error(&format!("{key}: {reason}"));
    }
    if !fix {
        bail!(
            "{} corrupt entr(ies); run 'keel cache verify --fix' to remove them",
            report.corrupt.len()
        );
    }

    let mut removed = 0;
    for key in report.corrupt.iter().filter_map(|(key, _)| ArtifactKey::from_hex(key)) {
        if store.invalidate(&key)? {
            removed += 1;
        }
    }
    ui::success(&format!(
        "Removed {removed} corrupt entr(ies), {} valid",
        report.valid
    ));
    Ok(())
}

fn clear(store: &ArtifactStore) -> Result<()> {
    let removed = store.clear()?;
    ui::success(&format!("Removed {removed} cached render(s)"));
    Ok(())
}
