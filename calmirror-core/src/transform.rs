//! Turning source events into the events mirrored into the target.
//!
//! The engine first drafts a minimal target event (times, recurrence and
//! linkage only, summary "Busy") and then hands it to a [`Transform`] along
//! with the source event. Whatever the transform returns is what the target
//! should contain. A transform may mark the draft `cancelled` to keep an
//! event out of the target.

use serde::{Deserialize, Serialize};

use crate::event::{Event, EventStatus, Linkage};
use crate::store::CalendarInfo;

pub const DEFAULT_SUMMARY: &str = "Busy";

/// User-supplied rule shaping the target event.
pub trait Transform: Send + Sync {
    fn apply(&self, draft: Event, source: &Event) -> Event;
}

impl<F> Transform for F
where
    F: Fn(Event, &Event) -> Event + Send + Sync,
{
    fn apply(&self, draft: Event, source: &Event) -> Event {
        self(draft, source)
    }
}

/// Minimal target event for `source`: start, end, recurrence and linkage.
///
/// Date-times without a zone get the source calendar's zone, so the target
/// evaluates recurrences exactly like the source did. All-day dates are
/// copied verbatim.
pub fn draft_target_event(source: &Event, source_calendar: &CalendarInfo) -> Event {
    let fill_zone = |time: &crate::event::EventTime| match &source_calendar.time_zone {
        Some(tz) => time.clone().with_default_time_zone(tz),
        None => time.clone(),
    };

    let mut draft = Event {
        summary: Some(DEFAULT_SUMMARY.to_string()),
        start: source.start.as_ref().map(fill_zone),
        end: source.end.as_ref().map(fill_zone),
        recurrence: source.recurrence.clone(),
        ..Default::default()
    };
    draft.set_linkage(&Linkage {
        source_calendar_id: source_calendar.id.clone(),
        source_event_id: source.id_str().to_string(),
    });
    draft
}

/// Source fields a [`RuleTransform`] can copy onto the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyField {
    Summary,
    Description,
    Location,
    ColorId,
}

/// Transform configured declaratively (the `[sync.transform]` table).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleTransform {
    /// Fixed summary; the draft keeps "Busy" when unset
    pub summary: Option<String>,
    /// Fields copied from the source, applied after `summary`
    pub copy: Vec<CopyField>,
    pub color_id: Option<String>,
    pub visibility: Option<String>,
    pub transparency: Option<String>,
    /// Source summaries (exact match) that are never mirrored
    pub skip_summaries: Vec<String>,
    pub skip_all_day: bool,
    /// Skip source events marked as free (transparent)
    pub skip_free: bool,
    pub skip_tentative: bool,
}

impl RuleTransform {
    fn skips(&self, source: &Event) -> bool {
        let summary = source.summary.as_deref().unwrap_or_default();
        self.skip_summaries.iter().any(|s| s == summary)
            || (self.skip_all_day && source.start.as_ref().is_some_and(|s| s.is_all_day()))
            || (self.skip_free && source.transparency.as_deref() == Some("transparent"))
            || (self.skip_tentative && source.status == EventStatus::Tentative)
    }
}

impl Transform for RuleTransform {
    fn apply(&self, mut draft: Event, source: &Event) -> Event {
        if self.skips(source) {
            draft.status = EventStatus::Cancelled;
            return draft;
        }

        if let Some(summary) = &self.summary {
            draft.summary = Some(summary.clone());
        }
        for field in &self.copy {
            match field {
                CopyField::Summary => draft.summary = source.summary.clone(),
                CopyField::Description => draft.description = source.description.clone(),
                CopyField::Location => draft.location = source.location.clone(),
                CopyField::ColorId => draft.color_id = source.color_id.clone(),
            }
        }
        if let Some(color_id) = &self.color_id {
            draft.color_id = Some(color_id.clone());
        }
        if let Some(visibility) = &self.visibility {
            draft.visibility = Some(visibility.clone());
        }
        if let Some(transparency) = &self.transparency {
            draft.transparency = Some(transparency.clone());
        }
        draft
    }
}
