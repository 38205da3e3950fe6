use std::path::Path;

use anyhow::{Context, Result};
use calmirror_core::lock::PassLock;
use calmirror_core::sync::{Invocation, PassContext};
use owo_colors::OwoColorize;

use super::Engine;

pub async fn run(config_path: &Path, source: Option<&str>) -> Result<()> {
    let engine = Engine::load(config_path)?;
    let jobs: Vec<_> = engine
        .config
        .jobs()
        .into_iter()
        .filter(|job| source.is_none_or(|s| job.source == s))
        .collect();
    if jobs.is_empty() {
        anyhow::bail!(
            "No [[sync]] pair with source \"{}\" in {}",
            source.unwrap_or_default(),
            config_path.display()
        );
    }

    let guard = engine
        .lock
        .acquire(engine.config.run.lock_timeout)
        .await
        .context("Another synchronization is still running")?;
    let ctx = PassContext::new(Invocation::Operator, &guard);

    let mut failures = 0;
    for (i, job) in jobs.iter().enumerate() {
        println!("{} → {}", job.source.bold(), job.target.bold());
        match engine.synchronizer.sync(&ctx, job).await {
            Ok(report) => {
                let line = format!(
                    "   +{} -{} ({} unchanged, {} skipped)",
                    report.created, report.deleted, report.unchanged, report.skipped
                );
                if report.failed > 0 {
                    failures += 1;
                    println!("{}", line.yellow());
                    println!("   {}", format!("{} changes failed", report.failed).red());
                } else {
                    println!("{}", line.green());
                }
            }
            Err(e) => {
                failures += 1;
                println!("   {}", e.to_string().red());
            }
        }

        if i < jobs.len() - 1 {
            println!();
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} pairs did not sync cleanly", failures, jobs.len());
    }
    Ok(())
}
