use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use tandem_core::{
    graph::TaskGraph,
    workflow::{self, WorkflowDef},
};

#[derive(Subcommand)]
pub enum PlanSubcommand {
    /// Check a workflow file: roles, globs, dependencies and cycles
    Validate {
        /// Workflow definition (YAML)
        workflow: PathBuf,
    },

    /// Print the tasks grouped into dependency waves
    Order {
        /// Workflow definition (YAML)
        workflow: PathBuf,
    },
}

pub fn run(subcmd: PlanSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        PlanSubcommand::Validate { workflow } => validate(&workflow, json),
        PlanSubcommand::Order { workflow } => order(&workflow, json),
    }
}

fn load(path: &Path) -> anyhow::Result<(WorkflowDef, TaskGraph)> {
    let def = WorkflowDef::load(path)
        .with_context(|| format!("failed to read workflow {}", path.display()))?;
    let graph = def.build().context("invalid workflow")?;
    Ok((def, graph))
}

fn validate(path: &Path, json: bool) -> anyhow::Result<()> {
    let (def, graph) = load(path)?;
    let lanes = graph.lanes();
    if json {
        print_json(&serde_json::json!({
            "id": def.id,
            "valid": true,
            "tasks": graph.len(),
            "workers": def.workers.len(),
            "lanes": lanes,
        }))
    } else {
        println!(
            "Workflow '{}' is valid: {} tasks across {} lanes, {} workers.",
            def.id,
            graph.len(),
            lanes.len(),
            def.workers.len()
        );
        Ok(())
    }
}

fn order(path: &Path, json: bool) -> anyhow::Result<()> {
    let (_, graph) = load(path)?;
    let waves = workflow::waves(&graph);
    if json {
        return print_json(&waves);
    }
    let mut rows = Vec::new();
    for (n, wave) in waves.iter().enumerate() {
        for id in wave {
            let task = graph.get(id)?;
            rows.push(vec![
                (n + 1).to_string(),
                id.clone(),
                task.role.to_string(),
                task.lane.clone(),
                task.depends_on.join(", "),
            ]);
        }
    }
    print_table(&["WAVE", "TASK", "ROLE", "LANE", "DEPENDS ON"], rows);
    Ok(())
}
