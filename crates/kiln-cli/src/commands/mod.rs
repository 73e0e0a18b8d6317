//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result};
use kiln_core::config::RunnerConfig;

pub fn validate(path: &str) -> Result<()> {
    let config = kiln_config::load_runner_config(path)
        .with_context(|| format!("Invalid runner configuration: {}", path))?;

    println!("Configuration is valid");
    print!("{}", summary(&config));
    Ok(())
}

fn summary(config: &RunnerConfig) -> String {
    let mut out = format!("  runner:   {}\n", config.name);
    out.push_str(&format!("  executor: {}\n", config.executor));
    out.push_str(&format!("  builds:   {}\n", config.builds_dir));

    if let Some(docker) = &config.docker {
        out.push_str(&format!("  image:    {}\n", docker.image));
        if !docker.services.is_empty() {
            out.push_str(&format!("  services: {}\n", docker.services.join(", ")));
        }
    }
    if let Some(parallels) = &config.parallels {
        out.push_str(&format!(
            "  base vm:  {} (template {})\n",
            parallels.base_name,
            parallels.template_name()
        ));
        if parallels.disable_snapshots {
            out.push_str("  snapshots disabled\n");
        }
    }
    out
}
