//! Inspection commands — `trawler status` and `trawler list`.

use anyhow::{Context, Result};
use console::style;
use walkdir::WalkDir;

use trawler::checkpoint::{CheckpointStore, FileCheckpointStore, ItemState};
use trawler::config::Config;
use trawler::ledger::RunLedger;
use trawler::pipeline::PipelineFile;
use trawler::session::SessionPool;

pub fn cmd_status(config: &Config) -> Result<()> {
    let file = PipelineFile::load(&config.pipeline_file)?;
    let store = FileCheckpointStore::open(&config.state_dir, &file.name)
        .context("Failed to open checkpoint store")?;

    let Some(run) = store.latest_run()? else {
        println!("No runs recorded for pipeline '{}'", file.name);
        return Ok(());
    };

    println!(
        "{} {} ({:?}, started {})",
        style("Run").bold(),
        run.run_id,
        run.status,
        run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(recovery) = run.recovery_step {
        println!("  recovered at step {recovery}");
    }
    if let Some(failure) = run.failure_step {
        println!("  {} step {failure}", style("failed at").red());
    }

    for entry in &file.steps {
        let Some(record) = store.step_record(&run.run_id, entry.number)? else {
            println!(
                "  {:>2} {:<24} {}",
                entry.number,
                entry.name,
                style("pending").dim()
            );
            continue;
        };

        let items = store.list_items(&run.run_id, entry.number)?;
        let done = items.iter().filter(|i| i.state == ItemState::Done).count();
        let exhausted = items
            .iter()
            .filter(|i| i.state == ItemState::Exhausted)
            .count();
        let item_note = if items.is_empty() {
            String::new()
        } else if exhausted > 0 {
            format!("  {done}/{} items, {exhausted} exhausted", items.len())
        } else {
            format!("  {done}/{} items", items.len())
        };

        let duration = record
            .duration_secs
            .map(|d| format!(" ({d:.1}s)"))
            .unwrap_or_default();
        println!(
            "  {:>2} {:<24} {:?}{}{}",
            record.step_number, record.step_name, record.status, duration, item_note
        );
        if let Some(error) = &record.error_message {
            println!("     {}", style(error).red());
        }
    }

    let registry_path = config.state_dir.join(&file.name).join("sessions.json");
    let registry = SessionPool::load_registry(&registry_path);
    let live = registry
        .values()
        .filter(|m| m.terminated_at.is_none())
        .count();
    if !registry.is_empty() {
        println!(
            "  sessions: {} issued, {} live",
            registry.len(),
            live
        );
    }
    Ok(())
}

pub fn cmd_list(config: &Config) -> Result<()> {
    let mut found = false;
    for entry in WalkDir::new(&config.state_dir)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_name() != "ledger.jsonl" {
            continue;
        }
        found = true;
        let ledger = RunLedger::new(entry.path().to_path_buf());
        for row in ledger.entries()? {
            let runtime = row
                .total_runtime_secs
                .map(|s| format!("{s:.1}s"))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<16} {:<36} {:<10} {:>8}  {}",
                row.pipeline_name,
                row.run_id,
                format!("{:?}", row.status),
                runtime,
                row.started_at.format("%Y-%m-%d %H:%M")
            );
        }
    }
    if !found {
        println!("No ledgers under {}", config.state_dir.display());
    }
    Ok(())
}
