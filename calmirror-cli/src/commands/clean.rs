use std::path::Path;

use anyhow::{Context, Result};
use calmirror_core::lock::PassLock;
use calmirror_core::sync::{Invocation, PassContext};
use owo_colors::OwoColorize;

use super::Engine;

pub async fn run(config_path: &Path) -> Result<()> {
    let engine = Engine::load(config_path)?;
    let guard = engine
        .lock
        .acquire(engine.config.run.lock_timeout)
        .await
        .context("Another synchronization is still running")?;
    let ctx = PassContext::new(Invocation::Operator, &guard);

    let report = engine.synchronizer.clean(&ctx).await?;

    println!(
        "Removed {} mirrored events from {} calendar pairs",
        report.removed.to_string().bold(),
        report.pairs
    );
    if report.failed > 0 {
        anyhow::bail!(
            "{} events could not be removed, run `calmirror clean` again",
            report.failed
        );
    }
    println!("{}", "All sync state forgotten.".green());
    Ok(())
}
