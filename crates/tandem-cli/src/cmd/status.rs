use crate::output::{format_elapsed, print_json, print_table};
use anyhow::Context;
use std::path::Path;
use tandem_core::{config::Config, context::ContextSummary, store::SnapshotStore};

pub fn run(root: &Path, id: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let store = SnapshotStore::new(root, config.context);
    match id {
        Some(id) => show(&store, id, json),
        None => list(&store, json),
    }
}

fn list(store: &SnapshotStore, json: bool) -> anyhow::Result<()> {
    let mut summaries: Vec<ContextSummary> = Vec::new();
    for id in store.list()? {
        match store.load(&id) {
            Ok(ctx) => summaries.push(ctx.summary()),
            Err(e) => tracing::warn!(workflow = %id, error = %e, "skipping unreadable context"),
        }
    }

    if json {
        return print_json(&summaries);
    }
    if summaries.is_empty() {
        println!("No workflows yet. Start one with `tandem run <workflow.yaml>`.");
        return Ok(());
    }
    let rows = summaries
        .iter()
        .map(|s| {
            vec![
                s.workflow_id.clone(),
                s.phase.clone(),
                format!("{}/{}", s.completed, s.total),
                s.failed.to_string(),
                s.blocked.to_string(),
                s.last_checkpoint.clone().unwrap_or_else(|| "-".to_string()),
                format_elapsed(s.elapsed_secs),
            ]
        })
        .collect();
    print_table(
        &["WORKFLOW", "PHASE", "DONE", "FAILED", "BLOCKED", "CHECKPOINT", "ELAPSED"],
        rows,
    );
    Ok(())
}

fn show(store: &SnapshotStore, id: &str, json: bool) -> anyhow::Result<()> {
    let ctx = store
        .load(id)
        .with_context(|| format!("failed to load workflow '{id}'"))?;

    if json {
        #[derive(serde::Serialize)]
        struct StatusOutput<'a> {
            summary: ContextSummary,
            tasks: &'a std::collections::BTreeMap<String, tandem_core::types::TaskStatus>,
            pending_actions: &'a [String],
        }
        return print_json(&StatusOutput {
            summary: ctx.summary(),
            tasks: &ctx.task_status,
            pending_actions: &ctx.pending_actions,
        });
    }

    println!("{}", ctx.summary());
    println!();
    let rows = ctx
        .task_status
        .iter()
        .map(|(task, status)| vec![task.clone(), status.to_string()])
        .collect();
    print_table(&["TASK", "STATUS"], rows);
    if !ctx.pending_actions.is_empty() {
        println!("\nPending actions:");
        for action in &ctx.pending_actions {
            println!("  - {action}");
        }
    }
    Ok(())
}
