use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use calmirror_core::run_loop::{RunLoop, TickOutcome};
use calmirror_core::scheduler::TokioScheduler;
use owo_colors::OwoColorize;
use tracing::error;

use super::Engine;

/// Runs the loop in the foreground until `calmirror stop` or Ctrl-C.
pub async fn run(config_path: &Path) -> Result<()> {
    let engine = Engine::load(config_path)?;
    let scheduler = TokioScheduler::new();
    let run_loop = Arc::new(RunLoop::new(
        Arc::clone(&engine.synchronizer),
        engine.config.jobs(),
        Arc::new(scheduler.clone()),
        Arc::new(engine.lock.clone()),
        engine.config.run_loop_config(),
    ));
    run_loop.register_with(&scheduler);

    match run_loop.start().await {
        Ok(TickOutcome::Stopped) => return Ok(()),
        Ok(TickOutcome::Rescheduled(_)) => {}
        // The backstop trigger is already scheduled, keep going
        Err(e) => error!("First run failed: {}", e),
    }
    println!(
        "{} Run `calmirror stop` or press Ctrl-C to exit.",
        "Synchronizing on schedule.".bold()
    );

    tokio::select! {
        _ = run_loop.stopped() => {
            println!("{}", "Stopped.".green());
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            println!("Interrupted, the next `calmirror start` resumes where this one left off.");
        }
    }
    Ok(())
}
