//! Deferred task triggers.
//!
//! The run loop never sleeps between ticks: it asks a [`Scheduler`] to
//! invoke a named task later and returns. [`TokioScheduler`] runs those
//! triggers as tokio tasks in the current process.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{MirrorError, MirrorResult};

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type TaskHandler = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Once { at: DateTime<Utc> },
    Recurring { every: Duration },
}

/// A pending invocation of a named task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub id: u64,
    pub task: String,
    pub kind: TriggerKind,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TriggerKind::Once { at } => write!(f, "{} at {}", self.task, at.format("%Y-%m-%d %H:%M:%S")),
            TriggerKind::Recurring { every } => {
                write!(f, "{} every {}", self.task, humantime::format_duration(every))
            }
        }
    }
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn schedule_once(&self, task: &str, delay: Duration) -> MirrorResult<Trigger>;

    async fn schedule_recurring(&self, task: &str, every: Duration) -> MirrorResult<Trigger>;

    /// Cancel every pending trigger of `task`; returns how many were cancelled.
    async fn cancel_all(&self, task: &str) -> MirrorResult<usize>;

    async fn list_scheduled(&self) -> MirrorResult<Vec<Trigger>>;
}

struct Pending {
    trigger: Trigger,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerInner {
    handlers: HashMap<String, TaskHandler>,
    pending: Vec<Pending>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct TokioScheduler {
    inner: Arc<Mutex<SchedulerInner>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the function invoked when a trigger for `task` fires.
    pub fn register<F, Fut>(&self, task: &str, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move || Box::pin(handler()) as TaskFuture);
        self.lock().handlers.insert(task.to_string(), handler);
    }

    fn handler(inner: &SchedulerInner, task: &str) -> MirrorResult<TaskHandler> {
        inner
            .handlers
            .get(task)
            .cloned()
            .ok_or_else(|| MirrorError::Scheduling(format!("No handler registered for task '{task}'")))
    }
}

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn schedule_once(&self, task: &str, delay: Duration) -> MirrorResult<Trigger> {
        let mut inner = self.lock();
        let handler = Self::handler(&inner, task)?;
        inner.next_id += 1;
        let id = inner.next_id;
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let trigger = Trigger {
            id,
            task: task.to_string(),
            kind: TriggerKind::Once { at },
        };

        // Spawned under the lock so the trigger is pending before it can fire
        let shared = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pending
                .retain(|p| p.trigger.id != id);
            handler().await;
        });
        debug!(trigger = %trigger, "Scheduled trigger");
        inner.pending.push(Pending {
            trigger: trigger.clone(),
            handle,
        });
        Ok(trigger)
    }

    async fn schedule_recurring(&self, task: &str, every: Duration) -> MirrorResult<Trigger> {
        if every.is_zero() {
            return Err(MirrorError::Scheduling("Recurring interval must be positive".into()));
        }
        let mut inner = self.lock();
        let handler = Self::handler(&inner, task)?;
        inner.next_id += 1;
        let trigger = Trigger {
            id: inner.next_id,
            task: task.to_string(),
            kind: TriggerKind::Recurring { every },
        };

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                interval.tick().await;
                // Detached so that cancelling this trigger never aborts a running handler
                tokio::spawn(handler());
            }
        });
        debug!(trigger = %trigger, "Scheduled trigger");
        inner.pending.push(Pending {
            trigger: trigger.clone(),
            handle,
        });
        Ok(trigger)
    }

    async fn cancel_all(&self, task: &str) -> MirrorResult<usize> {
        let mut inner = self.lock();
        let (cancelled, kept): (Vec<Pending>, Vec<Pending>) =
            inner.pending.drain(..).partition(|p| p.trigger.task == task);
        inner.pending = kept;
        for pending in &cancelled {
            pending.handle.abort();
        }
        if !cancelled.is_empty() {
            debug!(task = task, count = cancelled.len(), "Cancelled triggers");
        }
        Ok(cancelled.len())
    }

    async fn list_scheduled(&self) -> MirrorResult<Vec<Trigger>> {
        Ok(self.lock().pending.iter().map(|p| p.trigger.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_scheduler(task: &str) -> (TokioScheduler, Arc<AtomicUsize>) {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        scheduler.register(task, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (scheduler, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_trigger_fires_and_unlists_itself() {
        let (scheduler, fired) = counting_scheduler("start");
        scheduler.schedule_once("start", Duration::from_secs(60)).await.unwrap();
        assert_eq!(scheduler.list_scheduled().await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.list_scheduled().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_prevents_firing() {
        let (scheduler, fired) = counting_scheduler("start");
        scheduler.schedule_once("start", Duration::from_secs(60)).await.unwrap();
        scheduler.schedule_once("start", Duration::from_secs(360)).await.unwrap();

        assert_eq!(scheduler.cancel_all("start").await.unwrap(), 2);
        tokio::time::sleep(Duration::from_secs(400)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.cancel_all("start").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recurring_trigger_fires_repeatedly() {
        let (scheduler, fired) = counting_scheduler("start");
        scheduler
            .schedule_recurring("start", Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        scheduler.cancel_all("start").await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unknown_task_is_rejected() {
        let scheduler = TokioScheduler::new();
        let err = scheduler
            .schedule_once("nope", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Scheduling(_)));
    }
}
