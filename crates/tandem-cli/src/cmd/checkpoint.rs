use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use tandem_core::{
    checkpoint::{CheckpointManager, GitHead},
    config::Config,
    context::CheckpointCategory,
    store::SnapshotStore,
};

#[derive(Subcommand)]
pub enum CheckpointSubcommand {
    /// List a workflow's checkpoints, oldest first
    List { id: String },

    /// Checkpoint a workflow's current context
    Create {
        id: String,

        #[arg(long, default_value = "manual checkpoint")]
        label: String,

        /// phase_complete, integration_barrier, pre_rollback, interval or manual
        #[arg(long, default_value = "manual")]
        category: CheckpointCategory,
    },

    /// Restore a workflow's context from a checkpoint
    Rollback {
        id: String,
        checkpoint: String,

        /// Also restore the working tree to the recorded git revision
        #[arg(long)]
        restore_files: bool,
    },
}

pub fn run(root: &Path, subcmd: CheckpointSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let store = SnapshotStore::new(root, config.context.clone());
    let mut manager = CheckpointManager::new(root, config.checkpoints.clone());
    if let Some(head) = GitHead::detect(root) {
        manager = manager.with_external(Box::new(head));
    }
    let retries = config.scheduler.save_retries;

    match subcmd {
        CheckpointSubcommand::List { id } => {
            let ctx = store
                .load(&id)
                .with_context(|| format!("failed to load workflow '{id}'"))?;
            let refs = manager.list(&ctx);
            if json {
                return print_json(&refs);
            }
            let rows = refs
                .iter()
                .map(|c| {
                    vec![
                        c.id.clone(),
                        c.category.to_string(),
                        c.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                        c.external_ref.clone().unwrap_or_else(|| "-".to_string()),
                        if c.is_live() { "live" } else { "pruned" }.to_string(),
                        c.label.clone(),
                    ]
                })
                .collect();
            print_table(&["ID", "CATEGORY", "CREATED", "REVISION", "STATE", "LABEL"], rows);
            Ok(())
        }
        CheckpointSubcommand::Create {
            id,
            label,
            category,
        } => {
            let mut ctx = store
                .load(&id)
                .with_context(|| format!("failed to load workflow '{id}'"))?;
            let reference = manager
                .checkpoint(&mut ctx, &label, category)
                .context("failed to create checkpoint")?;
            store.save_with_retries(&mut ctx, retries)?;
            if json {
                print_json(&reference)
            } else {
                println!("Created checkpoint {} ({category}): {label}", reference.id);
                Ok(())
            }
        }
        CheckpointSubcommand::Rollback {
            id,
            checkpoint,
            restore_files,
        } => {
            let mut live = store
                .load(&id)
                .with_context(|| format!("failed to load workflow '{id}'"))?;
            let mut restored = manager
                .rollback(&mut live, &checkpoint, restore_files)
                .with_context(|| format!("failed to roll back to {checkpoint}"))?;
            store.save_with_retries(&mut restored, retries)?;
            if json {
                print_json(&restored.summary())
            } else {
                println!("Rolled back '{id}' to {checkpoint}");
                println!("{}", restored.summary());
                Ok(())
            }
        }
    }
}
