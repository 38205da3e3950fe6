//! Removal of everything the engine ever mirrored.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::error::{MirrorError, MirrorResult};
use crate::store::EventQuery;
use crate::sync::{PassContext, Synchronizer, plural};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub pairs: usize,
    pub removed: usize,
    pub failed: usize,
}

impl Synchronizer {
    /// Delete every linked target event of every registered pair.
    ///
    /// Watermarks are dropped per pair; the registry itself is only dropped
    /// when every removal succeeded, so that a failed cleanup can be re-run.
    pub async fn clean(&self, ctx: &PassContext<'_>) -> MirrorResult<CleanReport> {
        info!(invocation = %ctx.invocation, "Cleanup started");
        let pairs = self.state.registered_pairs()?;
        let mut report = CleanReport {
            pairs: pairs.len(),
            ..Default::default()
        };

        for pair in &pairs {
            let query = EventQuery::default().linked_to(&pair.source);
            let listed = self
                .retry
                .run("list target events", || self.store.list_events(&pair.target, &query))
                .await;
            let events = match listed {
                Ok(events) => events,
                Err(MirrorError::CalendarNotFound(id)) => {
                    warn!(calendar = %id, "Target calendar no longer exists, skipping");
                    self.state.clear_watermark(pair)?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let linked: Vec<_> = events
                .into_iter()
                .filter(|e| !e.is_cancelled())
                .filter(|e| e.linkage().is_some_and(|l| l.source_calendar_id == pair.source))
                .collect();
            // Instances go away with their master
            let ids: HashSet<&str> = linked.iter().map(|e| e.id_str()).collect();
            for event in linked
                .iter()
                .filter(|e| e.recurring_event_id.as_deref().is_none_or(|m| !ids.contains(m)))
            {
                match self.store.remove_event(&pair.target, event.id_str()).await {
                    Ok(()) => {
                        report.removed += 1;
                        info!("Deleted event {}", event.describe(chrono_tz::UTC));
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!("Failed to delete event {}: {}", event.describe(chrono_tz::UTC), e);
                    }
                }
            }
            self.state.clear_watermark(pair)?;
        }

        if report.failed == 0 {
            self.state.clear_registry()?;
        } else {
            warn!(
                failed = report.failed,
                "Sync pairs kept so that cleanup can be run again"
            );
        }
        info!("{} deleted", plural(report.removed, "obsolete target event"));
        info!("Cleanup completed");
        Ok(report)
    }
}
