//! One mirroring pass from a source calendar into a target calendar.
//!
//! A pass resolves both calendars, fetches the source events in the window
//! (everything, or only what changed since the last successful pass), cuts
//! recurring series to the window, runs the transform, compares the result
//! against the linked events already in the target and applies the
//! difference as deletes and creates.

mod clean;

pub use clean::CleanReport;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, info, warn};

use crate::diff::ReconcilePlan;
use crate::error::{MirrorError, MirrorResult};
use crate::event::{Event, Linkage};
use crate::expand::{expand_events, materialize_exclusions};
use crate::lock::PassGuard;
use crate::properties::PropertyStore;
use crate::retry::RetryPolicy;
use crate::state::{SyncPair, SyncState};
use crate::store::{CalendarInfo, CalendarStore, EventQuery};
use crate::transform::{Transform, draft_target_event};
use crate::window::{DaySpan, SyncWindow};

/// Source of "now" for a pass.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Who started the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// Started by an operator (`calmirror start` or `calmirror sync`)
    Operator,
    /// Fired by a scheduled trigger
    Trigger,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invocation::Operator => write!(f, "operator"),
            Invocation::Trigger => write!(f, "trigger"),
        }
    }
}

/// Proof that the caller holds the pass lock.
///
/// Passes and cleanups can only be started with a context, and a context can
/// only be built from a held [`PassGuard`].
#[derive(Debug, Clone, Copy)]
pub struct PassContext<'a> {
    pub invocation: Invocation,
    _guard: &'a PassGuard,
}

impl<'a> PassContext<'a> {
    pub fn new(invocation: Invocation, guard: &'a PassGuard) -> Self {
        PassContext {
            invocation,
            _guard: guard,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Start,
    ResolveCalendars,
    FetchSource,
    ExpandRecurrence,
    ApplyTransform,
    FetchExistingTarget,
    Diff,
    Mutate,
    PersistWatermark,
    Completed,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::Start => "start",
            SyncStage::ResolveCalendars => "resolve calendars",
            SyncStage::FetchSource => "fetch source",
            SyncStage::ExpandRecurrence => "expand recurrence",
            SyncStage::ApplyTransform => "apply transform",
            SyncStage::FetchExistingTarget => "fetch existing target",
            SyncStage::Diff => "diff",
            SyncStage::Mutate => "mutate",
            SyncStage::PersistWatermark => "persist watermark",
            SyncStage::Completed => "completed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Every source event in the window, diffed against every linked target event
    Full,
    /// Only source events changed since the watermark, diffed against their copies
    Incremental,
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchMode::Full => write!(f, "full"),
            FetchMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// One configured source/target pair.
#[derive(Clone)]
pub struct SyncJob {
    /// Source calendar display name
    pub source: String,
    /// Target calendar display name
    pub target: String,
    pub past: DaySpan,
    pub next: DaySpan,
    pub transform: Arc<dyn Transform>,
}

impl fmt::Debug for SyncJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncJob")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("past", &self.past)
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub mode: FetchMode,
    /// Source events in the window after expansion
    pub source_events: usize,
    pub created: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Mutations that failed; when non-zero the watermark keeps its previous
    /// value, so the next pass looks at the same changes again
    pub failed: usize,
    /// Source events the transform cancelled
    pub skipped: usize,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} deleted, {} unchanged, {} skipped, {} failed ({} fetch)",
            self.created, self.deleted, self.unchanged, self.skipped, self.failed, self.mode
        )
    }
}

/// Source events changed since the watermark.
struct Changes {
    events: Vec<Event>,
    /// Source event ids whose target copies are re-examined
    scope: HashSet<String>,
}

pub struct Synchronizer {
    store: Arc<dyn CalendarStore>,
    state: SyncState,
    retry: RetryPolicy,
    clock: Clock,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn CalendarStore>, properties: Arc<dyn PropertyStore>) -> Self {
        Synchronizer {
            store,
            state: SyncState::new(properties),
            retry: RetryPolicy::default(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Run one pass for `job`.
    ///
    /// The watermark is only advanced when every mutation succeeded, so the
    /// next pass looks at the changes of a partially applied one again.
    pub async fn sync(&self, ctx: &PassContext<'_>, job: &SyncJob) -> MirrorResult<SyncReport> {
        info!(
            "Synchronization started from \"{}\" to \"{}\"",
            job.source, job.target
        );
        debug!(invocation = %ctx.invocation, "Pass context");

        let mut stage = SyncStage::Start;
        let result = self.run_pass(job, &mut stage).await;
        match &result {
            Ok(report) => info!(
                source = %job.source,
                target = %job.target,
                "Synchronization completed: {}",
                report
            ),
            Err(e) => error!(
                source = %job.source,
                target = %job.target,
                stage = %stage,
                "Synchronization failed: {}",
                e
            ),
        }
        result
    }

    async fn run_pass(&self, job: &SyncJob, stage: &mut SyncStage) -> MirrorResult<SyncReport> {
        *stage = SyncStage::ResolveCalendars;
        let source = self.resolve_calendar(&job.source).await?;
        let target = self.resolve_calendar(&job.target).await?;
        let pair = SyncPair::new(&source.id, &target.id);
        self.state.register_pair(&pair)?;

        let source_tz = source.zone();
        let target_tz = target.zone();
        // Captured before fetching so that edits racing with this pass are seen next time
        let started_at = (self.clock)();
        let window = SyncWindow::from_days(
            job.past.past_days(source_tz, started_at),
            job.next.next_days(source_tz, started_at),
            source_tz,
            started_at,
        );

        *stage = SyncStage::FetchSource;
        let watermark = self
            .state
            .watermark(&pair)?
            .filter(|w| same_local_day(*w, started_at, source_tz));
        let changes = match watermark {
            Some(since) => self.fetch_changes(&source, &target, &window, since).await?,
            None => None,
        };
        let (mode, fetched, scope) = match changes {
            Some(changes) => (FetchMode::Incremental, changes.events, Some(changes.scope)),
            None => (FetchMode::Full, self.fetch_window(&source, &window).await?, None),
        };
        debug!(mode = %mode, fetched = fetched.len(), "Fetched source events");

        *stage = SyncStage::ExpandRecurrence;
        let source_events = expand_events(materialize_exclusions(fetched), &window, source_tz)?;
        info!(
            "{} found between {}",
            plural(source_events.len(), "source event"),
            window
        );

        *stage = SyncStage::ApplyTransform;
        let mut skipped = 0;
        let mut desired = Vec::with_capacity(source_events.len());
        for event in &source_events {
            let draft = draft_target_event(event, &source);
            let mut mirrored = job.transform.apply(draft, event);
            if mirrored.is_cancelled() {
                skipped += 1;
                info!("Skipped event {}", event.describe(source_tz));
                continue;
            }
            // The copy stays linked whatever the transform did
            mirrored.id = None;
            mirrored.set_linkage(&Linkage {
                source_calendar_id: source.id.clone(),
                source_event_id: event.id_str().to_string(),
            });
            desired.push(mirrored);
        }

        *stage = SyncStage::FetchExistingTarget;
        let query = EventQuery::default().linked_to(&source.id);
        let existing = self
            .retry
            .run("list target events", || self.store.list_events(&target.id, &query))
            .await?;
        let mut existing = materialize_exclusions(existing);
        existing.retain(|e| {
            e.linkage().is_some_and(|l| {
                l.source_calendar_id == source.id
                    && scope.as_ref().is_none_or(|s| s.contains(&l.source_event_id))
            })
        });

        *stage = SyncStage::Diff;
        let plan = ReconcilePlan::compute(desired, existing);

        *stage = SyncStage::Mutate;
        let (deleted, created, failed) = self.apply(&target, &plan, target_tz).await;
        info!("{} deleted", plural(deleted, "obsolete target event"));
        info!("{} created", plural(created, "missing target event"));

        *stage = SyncStage::PersistWatermark;
        if failed == 0 {
            self.state.set_watermark(&pair, started_at)?;
        } else {
            warn!(
                failed = failed,
                "Watermark not advanced, the next pass retries these changes"
            );
        }

        *stage = SyncStage::Completed;
        Ok(SyncReport {
            mode,
            source_events: source_events.len(),
            created,
            deleted,
            unchanged: plan.unchanged,
            failed,
            skipped,
        })
    }

    /// Find a calendar by display name, or by id when no name matches.
    pub async fn resolve_calendar(&self, name: &str) -> MirrorResult<CalendarInfo> {
        let calendars = self
            .retry
            .run("list calendars", || self.store.list_calendars())
            .await?;

        let mut matches: Vec<&CalendarInfo> =
            calendars.iter().filter(|c| c.summary == name).collect();
        if matches.is_empty() {
            matches = calendars.iter().filter(|c| c.id == name).collect();
        }
        match matches.as_slice() {
            [calendar] => Ok((*calendar).clone()),
            [] => Err(MirrorError::CalendarNotFound(name.to_string())),
            several => Err(MirrorError::AmbiguousCalendar {
                name: name.to_string(),
                count: several.len(),
            }),
        }
    }

    async fn fetch_window(&self, source: &CalendarInfo, window: &SyncWindow) -> MirrorResult<Vec<Event>> {
        let query = EventQuery::between(window.date_min, window.date_max);
        self.retry
            .run("list source events", || self.store.list_events(&source.id, &query))
            .await
    }

    /// Source events changed since `since`, or `None` when only a full
    /// fetch can give a consistent picture.
    ///
    /// Linked target events changed since `since` (edited, deleted or
    /// duplicated out of band) pull their source events into the scope too,
    /// so the pass repairs them.
    async fn fetch_changes(
        &self,
        source: &CalendarInfo,
        target: &CalendarInfo,
        window: &SyncWindow,
        since: DateTime<Utc>,
    ) -> MirrorResult<Option<Changes>> {
        // No time bounds: an event moved out of the window must still be seen
        let query = EventQuery::default().updated_since(since);
        let mut events = self
            .retry
            .run("list changed source events", || {
                self.store.list_events(&source.id, &query)
            })
            .await?;
        let mut scope: HashSet<String> = events.iter().filter_map(|e| e.id.clone()).collect();

        let target_query = EventQuery::default().linked_to(&source.id).updated_since(since);
        let touched = self
            .retry
            .run("list changed target events", || {
                self.store.list_events(&target.id, &target_query)
            })
            .await?;
        let drifted: Vec<String> = touched
            .iter()
            .filter_map(|e| e.linkage())
            .filter(|l| l.source_calendar_id == source.id)
            .map(|l| l.source_event_id)
            .filter(|id| !scope.contains(id))
            .collect();
        for id in drifted {
            if !scope.insert(id.clone()) {
                continue;
            }
            let found = self
                .retry
                .run("get source event", || self.store.get_event(&source.id, &id))
                .await?;
            match found {
                Some(event) => events.push(event),
                None => debug!(event = %id, "Source of a changed target event no longer exists"),
            }
        }

        if let Some(orphan) = events.iter().find(|e| {
            e.recurring_event_id
                .as_ref()
                .is_some_and(|master| !scope.contains(master))
        }) {
            info!(
                "Instance {} of an unchanged series changed, fetching everything",
                orphan.id_str()
            );
            return Ok(None);
        }

        // Every instance stored apart from a changed series excludes its occurrence
        let instance_query = EventQuery {
            show_deleted: true,
            ..EventQuery::between(window.date_min, window.date_max)
        };
        let masters: Vec<String> = events
            .iter()
            .filter(|e| e.is_series() && !e.is_cancelled())
            .map(|e| e.id_str().to_string())
            .collect();
        for master in masters {
            let instances = self
                .retry
                .run("list instances", || {
                    self.store.list_instances(&source.id, &master, &instance_query)
                })
                .await?;
            for instance in instances {
                if let Some(id) = instance.id.clone() {
                    if scope.insert(id) {
                        events.push(instance);
                    }
                }
            }
        }

        debug!(changed = events.len(), since = %since, "Incremental fetch");
        Ok(Some(Changes { events, scope }))
    }

    /// Deletes first, then creates; every mutation is attempted once.
    async fn apply(&self, target: &CalendarInfo, plan: &ReconcilePlan, tz: Tz) -> (usize, usize, usize) {
        let (mut deleted, mut created, mut failed) = (0, 0, 0);

        for diff in &plan.obsolete {
            let event = &diff.event;
            match self.store.remove_event(&target.id, event.id_str()).await {
                Ok(()) => {
                    deleted += 1;
                    info!("Deleted event {}", event.describe(tz));
                }
                Err(e) => {
                    failed += 1;
                    warn!(
                        calendar = %target.summary,
                        "Failed to delete event {}: {}",
                        event.describe(tz),
                        e
                    );
                }
            }
        }

        for diff in &plan.missing {
            let event = &diff.event;
            match self.store.insert_event(&target.id, event).await {
                Ok(_) => {
                    created += 1;
                    info!("Created event {}", event.describe(tz));
                }
                Err(e) => {
                    failed += 1;
                    warn!(
                        calendar = %target.summary,
                        "Failed to create event {}: {}",
                        event.describe(tz),
                        e
                    );
                }
            }
        }

        (deleted, created, failed)
    }
}

fn same_local_day(a: DateTime<Utc>, b: DateTime<Utc>, tz: Tz) -> bool {
    a.with_timezone(&tz).date_naive() == b.with_timezone(&tz).date_naive()
}

fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LocalLock, PassLock};
    use crate::properties::MemoryProperties;
    use crate::store::MemoryCalendarStore;
    use chrono::TimeZone;
    use std::time::Duration;

    fn synchronizer(store: &MemoryCalendarStore) -> Synchronizer {
        let clock_store = store.clone();
        Synchronizer::new(Arc::new(store.clone()), Arc::new(MemoryProperties::new()))
            .with_retry(RetryPolicy::none())
            .with_clock(Arc::new(move || clock_store.now()))
    }

    #[tokio::test]
    async fn test_resolve_calendar_by_name() {
        let store = MemoryCalendarStore::new();
        store.add_calendar("a@group", "Work", None);
        store.add_calendar("b@group", "Home", None);
        store.add_calendar("c@group", "Home", None);
        let sync = synchronizer(&store);

        assert_eq!(sync.resolve_calendar("Work").await.unwrap().id, "a@group");
        assert_eq!(sync.resolve_calendar("b@group").await.unwrap().summary, "Home");
        assert!(matches!(
            sync.resolve_calendar("Gym").await,
            Err(MirrorError::CalendarNotFound(_))
        ));
        assert!(matches!(
            sync.resolve_calendar("Home").await,
            Err(MirrorError::AmbiguousCalendar { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_calendar_fails_before_any_mutation() {
        let store = MemoryCalendarStore::new();
        store.add_calendar("src", "Personal", Some("Europe/Berlin"));
        store.set_now(Utc.with_ymd_and_hms(2025, 5, 14, 8, 0, 0).unwrap());
        let sync = synchronizer(&store);
        let guard = LocalLock::new().acquire(Duration::from_secs(1)).await.unwrap();
        let ctx = PassContext::new(Invocation::Operator, &guard);

        let job = SyncJob {
            source: "Personal".to_string(),
            target: "Missing".to_string(),
            past: DaySpan::Days(7),
            next: DaySpan::Days(28),
            transform: Arc::new(|draft: Event, _: &Event| draft),
        };
        assert!(sync.sync(&ctx, &job).await.is_err());
        assert_eq!(store.inserts(), 0);
        assert!(sync.state().registered_pairs().unwrap().is_empty());
    }

    #[test]
    fn test_plural() {
        assert_eq!(plural(1, "source event"), "1 source event");
        assert_eq!(plural(0, "source event"), "0 source events");
    }
}
