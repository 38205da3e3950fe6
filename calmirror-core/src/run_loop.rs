//! The self-rescheduling run loop.
//!
//! Every tick runs all configured passes under the pass lock and then asks
//! the scheduler to invoke the next tick after the sync interval. Before
//! doing any work a tick also schedules a backstop trigger, so that a tick
//! which dies half way still gets a successor. The durable stop flag is
//! checked at tick boundaries; once set, nothing is rescheduled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::MirrorResult;
use crate::lock::PassLock;
use crate::retry::RetryPolicy;
use crate::scheduler::{Scheduler, TokioScheduler, Trigger};
use crate::sync::{Invocation, PassContext, SyncJob, Synchronizer};

/// Task name of the tick trigger.
pub const START_TASK: &str = "start";

#[derive(Debug, Clone)]
pub struct RunLoopConfig {
    /// Delay between the end of a tick and the next one
    pub sync_interval: Duration,
    /// Delay of the backstop trigger scheduled at tick start
    pub max_execution_time: Duration,
    /// How long a tick waits for the pass lock
    pub lock_timeout: Duration,
    /// Backoff between failed attempts to schedule the next tick
    pub reschedule_backoff: RetryPolicy,
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60),
            max_execution_time: Duration::from_secs(6 * 60),
            lock_timeout: Duration::from_secs(30 * 60),
            reschedule_backoff: RetryPolicy {
                max_attempts: u32::MAX,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The next tick is scheduled
    Rescheduled(Trigger),
    /// The stop flag is set; nothing was scheduled
    Stopped,
}

pub struct RunLoop {
    synchronizer: Arc<Synchronizer>,
    jobs: Vec<SyncJob>,
    scheduler: Arc<dyn Scheduler>,
    lock: Arc<dyn PassLock>,
    config: RunLoopConfig,
    stopped_tx: watch::Sender<bool>,
}

impl RunLoop {
    pub fn new(
        synchronizer: Arc<Synchronizer>,
        jobs: Vec<SyncJob>,
        scheduler: Arc<dyn Scheduler>,
        lock: Arc<dyn PassLock>,
        config: RunLoopConfig,
    ) -> Self {
        let (stopped_tx, _) = watch::channel(false);
        RunLoop {
            synchronizer,
            jobs,
            scheduler,
            lock,
            config,
            stopped_tx,
        }
    }

    /// Route the scheduler's tick triggers to this loop.
    pub fn register_with(self: &Arc<Self>, scheduler: &TokioScheduler) {
        let run_loop = Arc::downgrade(self);
        scheduler.register(START_TASK, move || {
            let run_loop = run_loop.clone();
            async move {
                let Some(run_loop) = run_loop.upgrade() else {
                    return;
                };
                if let Err(e) = run_loop.tick(Invocation::Trigger).await {
                    error!("Tick failed: {}", e);
                }
            }
        });
    }

    /// Operator start: forget pending triggers, clear the stop flag, tick now.
    pub async fn start(&self) -> MirrorResult<TickOutcome> {
        self.scheduler.cancel_all(START_TASK).await?;
        self.synchronizer.state().set_stopped(false)?;
        self.stopped_tx.send_replace(false);
        self.tick(Invocation::Operator).await
    }

    /// Cancel pending triggers and set the durable stop flag.
    ///
    /// A tick that is already running completes its passes but schedules
    /// nothing afterwards.
    pub async fn stop(&self) -> MirrorResult<()> {
        self.scheduler.cancel_all(START_TASK).await?;
        self.synchronizer.state().set_stopped(true)?;
        self.stopped_tx.send_replace(true);
        info!("The synchronization will not run again");
        info!("If a synchronization is currently running, it will complete");
        Ok(())
    }

    /// Resolves once a tick has observed the stop flag (or `stop` was called).
    pub async fn stopped(&self) {
        let mut rx = self.stopped_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub async fn tick(&self, invocation: Invocation) -> MirrorResult<TickOutcome> {
        if invocation == Invocation::Trigger && self.is_stopped() {
            return Ok(self.observe_stop());
        }

        // Backstop in case this tick never reaches its reschedule step
        if let Err(e) = self
            .scheduler
            .schedule_once(START_TASK, self.config.max_execution_time)
            .await
        {
            warn!("Could not schedule the backstop trigger: {}", e);
        }

        let guard = self.lock.acquire(self.config.lock_timeout).await?;
        let ctx = PassContext::new(invocation, &guard);
        let mut failed = 0;
        for job in &self.jobs {
            // Errors are logged by the pass; one failing pair never blocks the others
            if self.synchronizer.sync(&ctx, job).await.is_err() {
                failed += 1;
            }
        }
        drop(guard);
        if failed > 0 {
            warn!(
                "{} of {} passes failed, they are retried on the next tick",
                failed,
                self.jobs.len()
            );
        }

        if self.is_stopped() {
            return Ok(self.observe_stop());
        }
        self.reschedule().await
    }

    /// Replace every pending trigger with one after the sync interval,
    /// retrying until the scheduler accepts or a stop is observed.
    async fn reschedule(&self) -> MirrorResult<TickOutcome> {
        let backoff = &self.config.reschedule_backoff;
        let mut attempt: u32 = 0;
        loop {
            let result = match self.scheduler.cancel_all(START_TASK).await {
                Ok(_) => {
                    self.scheduler
                        .schedule_once(START_TASK, self.config.sync_interval)
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(trigger) => {
                    info!(
                        "Synchronization will run again in approximately {}",
                        humantime::format_duration(self.config.sync_interval)
                    );
                    return Ok(TickOutcome::Rescheduled(trigger));
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = backoff.delay_for(attempt);
                    warn!(
                        "Could not schedule the next run (attempt {}), retrying in {}: {}",
                        attempt,
                        humantime::format_duration(delay),
                        e
                    );
                    sleep(delay).await;
                    if self.is_stopped() {
                        return Ok(self.observe_stop());
                    }
                }
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.synchronizer.state().is_stopped().unwrap_or_else(|e| {
            warn!("Could not read the stop flag, assuming not stopped: {}", e);
            false
        })
    }

    fn observe_stop(&self) -> TickOutcome {
        info!("Stop flag set, not scheduling another run");
        self.stopped_tx.send_replace(true);
        TickOutcome::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MirrorError;
    use crate::lock::LocalLock;
    use crate::properties::{MemoryProperties, PropertyStore};
    use crate::scheduler::TriggerKind;
    use crate::store::MemoryCalendarStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rejects the first `failures` calls to `schedule_once`.
    struct FlakyScheduler {
        inner: TokioScheduler,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Scheduler for FlakyScheduler {
        async fn schedule_once(&self, task: &str, delay: Duration) -> MirrorResult<Trigger> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(MirrorError::Scheduling("quota exceeded".into()));
            }
            self.inner.schedule_once(task, delay).await
        }

        async fn schedule_recurring(&self, task: &str, every: Duration) -> MirrorResult<Trigger> {
            self.inner.schedule_recurring(task, every).await
        }

        async fn cancel_all(&self, task: &str) -> MirrorResult<usize> {
            self.inner.cancel_all(task).await
        }

        async fn list_scheduled(&self) -> MirrorResult<Vec<Trigger>> {
            self.inner.list_scheduled().await
        }
    }

    struct Fixture {
        run_loop: Arc<RunLoop>,
        scheduler: TokioScheduler,
        properties: MemoryProperties,
        lock: LocalLock,
    }

    fn fixture_with(scheduler: Arc<dyn Scheduler>, tokio_scheduler: TokioScheduler) -> Fixture {
        let properties = MemoryProperties::new();
        let synchronizer = Arc::new(
            Synchronizer::new(
                Arc::new(MemoryCalendarStore::new()),
                Arc::new(properties.clone()),
            )
            .with_retry(RetryPolicy::none()),
        );
        let lock = LocalLock::new();
        let config = RunLoopConfig {
            lock_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let run_loop = Arc::new(RunLoop::new(
            synchronizer,
            Vec::new(),
            scheduler,
            Arc::new(lock.clone()),
            config,
        ));
        run_loop.register_with(&tokio_scheduler);
        Fixture {
            run_loop,
            scheduler: tokio_scheduler,
            properties,
            lock,
        }
    }

    fn fixture() -> Fixture {
        let scheduler = TokioScheduler::new();
        fixture_with(Arc::new(scheduler.clone()), scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_schedules_exactly_one_next_tick() {
        let f = fixture();

        let outcome = f.run_loop.start().await.unwrap();

        let scheduled = f.scheduler.list_scheduled().await.unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(outcome, TickOutcome::Rescheduled(scheduled[0].clone()));
        assert!(matches!(scheduled[0].kind, TriggerKind::Once { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggered_tick_respects_stop_flag() {
        let f = fixture();
        f.properties.set("stopped", "true").unwrap();

        let outcome = f.run_loop.tick(Invocation::Trigger).await.unwrap();

        assert_eq!(outcome, TickOutcome::Stopped);
        assert!(f.scheduler.list_scheduled().await.unwrap().is_empty());
        f.run_loop.stopped().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_clears_stop_flag() {
        let f = fixture();
        f.properties.set("stopped", "true").unwrap();

        let outcome = f.run_loop.start().await.unwrap();

        assert!(matches!(outcome, TickOutcome::Rescheduled(_)));
        assert_eq!(f.properties.get("stopped").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_ticks() {
        let f = fixture();
        f.run_loop.start().await.unwrap();

        f.run_loop.stop().await.unwrap();

        assert!(f.scheduler.list_scheduled().await.unwrap().is_empty());
        assert_eq!(f.properties.get("stopped").unwrap().as_deref(), Some("true"));
        f.run_loop.stopped().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_ticks_keep_running_until_stopped() {
        let f = fixture();
        f.run_loop.start().await.unwrap();

        // Three intervals later the loop is still alive with one pending tick
        tokio::time::sleep(Duration::from_secs(3 * 60 + 5)).await;
        assert_eq!(f.scheduler.list_scheduled().await.unwrap().len(), 1);

        f.properties.set("stopped", "true").unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(f.scheduler.list_scheduled().await.unwrap().is_empty());
        f.run_loop.stopped().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_retries_until_accepted() {
        let tokio_scheduler = TokioScheduler::new();
        let flaky = Arc::new(FlakyScheduler {
            inner: tokio_scheduler.clone(),
            failures: AtomicUsize::new(3),
        });
        let f = fixture_with(flaky, tokio_scheduler);

        let outcome = f.run_loop.tick(Invocation::Operator).await.unwrap();

        assert!(matches!(outcome, TickOutcome::Rescheduled(_)));
        assert_eq!(f.scheduler.list_scheduled().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_observed_while_rescheduling() {
        let tokio_scheduler = TokioScheduler::new();
        let flaky = Arc::new(FlakyScheduler {
            inner: tokio_scheduler.clone(),
            failures: AtomicUsize::new(usize::MAX),
        });
        let f = fixture_with(flaky, tokio_scheduler);

        let run_loop = Arc::clone(&f.run_loop);
        let tick = tokio::spawn(async move { run_loop.tick(Invocation::Operator).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        f.properties.set("stopped", "true").unwrap();

        assert_eq!(tick.await.unwrap().unwrap(), TickOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_timeout_leaves_backstop_scheduled() {
        let f = fixture();
        let _held = f.lock.acquire(Duration::from_secs(1)).await.unwrap();

        let err = f.run_loop.tick(Invocation::Operator).await.unwrap_err();

        assert!(matches!(err, MirrorError::LockTimeout(_)));
        let scheduled = f.scheduler.list_scheduled().await.unwrap();
        assert_eq!(scheduled.len(), 1);
    }
}
