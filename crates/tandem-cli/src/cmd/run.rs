use crate::output::print_json;
use anyhow::Context;
use std::path::Path;
use tandem_core::{
    checkpoint::GitHead,
    config::Config,
    orchestrator::Orchestrator,
    store::SnapshotStore,
    worker::{ShellAgent, SimulatedAgent},
    workflow::{AgentKind, WorkflowDef},
};

pub fn run(
    root: &Path,
    workflow: &Path,
    simulate: bool,
    resume: bool,
    json: bool,
) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let def = WorkflowDef::load(workflow)
        .with_context(|| format!("failed to read workflow {}", workflow.display()))?;
    let graph = def.build().context("invalid workflow")?;

    let store = SnapshotStore::new(root, config.context.clone());
    if !resume && store.exists(&def.id) {
        anyhow::bail!(
            "workflow '{}' already has a saved context; pass --resume to continue it",
            def.id
        );
    }

    let needs_shell = !simulate && def.workers.iter().any(|w| w.agent == AgentKind::Shell);
    if needs_shell && !ShellAgent::is_available() {
        anyhow::bail!("shell workers need `sh` on PATH; use --simulate for a dry run");
    }

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let mut orch = if resume {
            Orchestrator::resume(root, config, &def.id, graph)
                .with_context(|| format!("failed to resume '{}'", def.id))?
        } else {
            Orchestrator::new(root, config, &def.id, graph)?
        };
        if let Some(head) = GitHead::detect(root) {
            orch = orch.with_external_state(Box::new(head));
        }

        for w in &def.workers {
            if simulate || w.agent == AgentKind::Simulated {
                orch.add_worker(&w.id, w.role, &w.ownership, SimulatedAgent::new())?;
            } else {
                orch.add_worker(&w.id, w.role, &w.ownership, ShellAgent::new(root))?;
            }
        }

        orch.run()
            .await
            .with_context(|| format!("workflow '{}' aborted", def.id))
    })?;

    if json {
        print_json(&report)?;
    } else {
        print!("{}", report.render());
    }

    if !report.is_success() {
        anyhow::bail!(
            "workflow '{}' finished {} ({} failed, {} blocked)",
            report.workflow_id,
            report.outcome.as_str(),
            report.counts.failed,
            report.counts.blocked
        );
    }
    Ok(())
}
