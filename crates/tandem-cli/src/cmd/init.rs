use anyhow::Context;
use std::path::Path;
use tandem_core::{config::Config, io, paths};

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing tandem in: {}", root.display());

    for p in [paths::tandem_dir(root), paths::contexts_dir(root)] {
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let config_path = paths::config_path(root);
    if config_path.exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    }
    Ok(())
}
