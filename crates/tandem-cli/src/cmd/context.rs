use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use tandem_core::{
    config::Config,
    store::{SnapshotSource, SnapshotStore},
};

#[derive(Subcommand)]
pub enum ContextSubcommand {
    /// List stored workflow ids
    List,

    /// Show a stored context
    Show {
        id: String,

        /// Number of recent log entries to print
        #[arg(long, default_value = "20")]
        tail: usize,

        /// Include entries moved to the log archive
        #[arg(long)]
        archive: bool,
    },
}

pub fn run(root: &Path, subcmd: ContextSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let store = SnapshotStore::new(root, config.context);
    match subcmd {
        ContextSubcommand::List => list(&store, json),
        ContextSubcommand::Show { id, tail, archive } => show(&store, &id, tail, archive, json),
    }
}

fn list(store: &SnapshotStore, json: bool) -> anyhow::Result<()> {
    let ids = store.list()?;
    if json {
        return print_json(&ids);
    }
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

fn show(store: &SnapshotStore, id: &str, tail: usize, archive: bool, json: bool) -> anyhow::Result<()> {
    let (ctx, source) = store
        .load_with_source(id)
        .with_context(|| format!("failed to load workflow '{id}'"))?;
    if source == SnapshotSource::Backup {
        eprintln!("warning: primary snapshot unreadable; showing the backup");
    }
    let archived = if archive {
        store.read_archive(id)?
    } else {
        Vec::new()
    };

    if json {
        return print_json(&serde_json::json!({
            "source": source,
            "context": ctx,
            "archived_log": archived,
        }));
    }

    println!("{}", ctx.summary());
    println!("  version:  {}", ctx.version);
    println!("  modified: {} files", ctx.modified_files.len());

    if !ctx.decisions.is_empty() {
        println!("\nDecisions:");
        for d in &ctx.decisions {
            println!("  {} {}", d.at.format("%Y-%m-%d %H:%M:%S"), d.summary);
        }
    }

    if !ctx.checkpoints.is_empty() {
        println!("\nCheckpoints:");
        let rows = ctx
            .checkpoints
            .iter()
            .map(|c| {
                vec![
                    c.id.clone(),
                    c.category.to_string(),
                    c.label.clone(),
                    if c.is_live() { "live" } else { "pruned" }.to_string(),
                ]
            })
            .collect();
        print_table(&["ID", "CATEGORY", "LABEL", "STATE"], rows);
    }

    let entries: Vec<_> = archived.iter().chain(ctx.log.iter()).collect();
    let skip = entries.len().saturating_sub(tail);
    println!("\nLog ({} archived):", ctx.archived_log_entries);
    for e in &entries[skip..] {
        println!(
            "  {} [{}] {}{}",
            e.at.format("%H:%M:%S"),
            e.kind.as_str(),
            e.task_id.as_deref().map(|t| format!("{t}: ")).unwrap_or_default(),
            e.message
        );
    }
    Ok(())
}
