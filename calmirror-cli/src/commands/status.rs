use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use calmirror_core::config::MirrorConfig;
use calmirror_core::state::SyncState;
use owo_colors::OwoColorize;

pub fn run(config_path: &Path) -> Result<()> {
    let config = MirrorConfig::load(config_path)?;
    let properties = config.properties()?;
    let properties_path = properties.path().to_path_buf();
    let state = SyncState::new(Arc::new(properties));

    println!("{}", "Paths".bold());
    println!("  Config:      {}", config_path.display());
    println!("  State:       {}", properties_path.display());
    println!();

    println!("{}", "Pairs".bold());
    for pair in &config.pairs {
        println!("  {} → {}", pair.source, pair.target);
    }
    println!();

    println!("{}", "State".bold());
    if state.is_stopped()? {
        println!("  Scheduling:  {}", "stopped".red());
    } else {
        println!(
            "  Scheduling:  {} every {}",
            "active".green(),
            humantime::format_duration(config.run.sync_interval)
        );
    }
    let registered = state.registered_pairs()?;
    if registered.is_empty() {
        println!("  No calendar has been synchronized yet");
    }
    for pair in &registered {
        let last = match state.watermark(pair)? {
            Some(at) => at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string(),
            None => "pending full sync".dimmed().to_string(),
        };
        println!("  {} → {}  last synced: {}", pair.source, pair.target, last);
    }

    Ok(())
}

