use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use tandem_core::{
    config::Config, orchestrator::recovery, store::SnapshotStore, workflow::WorkflowDef,
};

#[derive(Subcommand)]
pub enum TaskSubcommand {
    /// Count a failed task as done; takes effect on the next --resume
    Accept {
        /// Workflow definition (YAML)
        workflow: PathBuf,
        task: String,
    },

    /// Return a blocked task to scheduling; takes effect on the next --resume
    Unblock {
        /// Workflow definition (YAML)
        workflow: PathBuf,
        task: String,
    },
}

pub fn run(root: &Path, subcmd: TaskSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let store = SnapshotStore::new(root, config.context.clone());
    let (workflow, task_id) = match &subcmd {
        TaskSubcommand::Accept { workflow, task } | TaskSubcommand::Unblock { workflow, task } => {
            (workflow, task.as_str())
        }
    };

    let def = WorkflowDef::load(workflow)
        .with_context(|| format!("failed to read workflow {}", workflow.display()))?;
    let mut graph = def.build().context("invalid workflow")?;
    let mut ctx = store
        .load(&def.id)
        .with_context(|| format!("failed to load workflow '{}'", def.id))?;
    recovery::restore(&mut graph, &ctx);

    let message = match &subcmd {
        TaskSubcommand::Accept { .. } => {
            recovery::accept_failure(&mut graph, &mut ctx, task_id)
                .with_context(|| format!("cannot accept '{task_id}'"))?;
            format!("Accepted failure of '{task_id}' in '{}'", def.id)
        }
        TaskSubcommand::Unblock { .. } => {
            let status = recovery::unblock(&mut graph, &mut ctx, task_id)
                .with_context(|| format!("cannot unblock '{task_id}'"))?;
            format!("Unblocked '{task_id}' in '{}': now {status}", def.id)
        }
    };
    store.save_with_retries(&mut ctx, config.scheduler.save_retries)?;

    if json {
        print_json(&ctx.summary())
    } else {
        println!("{message}");
        println!("{}", ctx.summary());
        Ok(())
    }
}
