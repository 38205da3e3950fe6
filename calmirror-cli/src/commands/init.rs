use std::path::Path;

use anyhow::{Context, Result};
use calmirror_core::config::MirrorConfig;
use owo_colors::OwoColorize;

pub fn run(config_path: &Path) -> Result<()> {
    let created = MirrorConfig::create_default_config(config_path)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    if created {
        println!("{} {}", "Created".green(), config_path.display());
        println!("Edit the [store] and [[sync]] tables, then run `calmirror start`.");
    } else {
        println!(
            "{} already exists, leaving it untouched",
            config_path.display().to_string().yellow()
        );
    }
    Ok(())
}
