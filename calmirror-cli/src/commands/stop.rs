use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use calmirror_core::config::MirrorConfig;
use calmirror_core::state::SyncState;
use owo_colors::OwoColorize;

/// Sets the durable stop flag; a running `calmirror start` sees it on its
/// next tick and exits without rescheduling.
pub fn run(config_path: &Path) -> Result<()> {
    let config = MirrorConfig::load(config_path)?;
    let state = SyncState::new(Arc::new(config.properties()?));
    state.set_stopped(true)?;

    println!("{}", "The synchronization will not run again.".bold());
    println!("If a synchronization is currently running, it will complete.");
    Ok(())
}
