//! Calendar store boundary.
//!
//! The engine reads and mutates calendars only through [`CalendarStore`].
//! Pagination is the store's business: list calls return every matching
//! event.

mod memory;

pub use memory::MemoryCalendarStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::MirrorResult;
use crate::event::{Event, SOURCE_CALENDAR_ID_KEY};

/// A calendar visible to the authenticated principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarInfo {
    pub id: String,
    /// Display name, used to resolve calendars from configuration
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

impl CalendarInfo {
    /// The calendar's default zone; UTC when unset or unknown.
    pub fn zone(&self) -> Tz {
        self.time_zone
            .as_deref()
            .and_then(|name| name.parse().ok())
            .unwrap_or(chrono_tz::UTC)
    }
}

/// Filter for listing events.
///
/// `time_min`/`time_max` select events overlapping the range. Recurring
/// series are returned as masters, not expanded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_min: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_max: Option<DateTime<Utc>>,
    /// Only events modified at or after this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_min: Option<DateTime<Utc>>,
    /// `key=value` private extended property filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_property: Option<String>,
    /// Include deleted events (as `cancelled`)
    #[serde(default)]
    pub show_deleted: bool,
}

impl EventQuery {
    pub fn between(time_min: DateTime<Utc>, time_max: DateTime<Utc>) -> Self {
        EventQuery {
            time_min: Some(time_min),
            time_max: Some(time_max),
            ..Default::default()
        }
    }

    /// Restrict to events the engine created from `source_calendar_id`.
    pub fn linked_to(mut self, source_calendar_id: &str) -> Self {
        self.private_property = Some(format!("{SOURCE_CALENDAR_ID_KEY}={source_calendar_id}"));
        self
    }

    pub fn updated_since(mut self, updated_min: DateTime<Utc>) -> Self {
        self.updated_min = Some(updated_min);
        self.show_deleted = true;
        self
    }
}

#[async_trait]
pub trait CalendarStore: Send + Sync {
    async fn list_calendars(&self) -> MirrorResult<Vec<CalendarInfo>>;

    async fn list_events(&self, calendar_id: &str, query: &EventQuery) -> MirrorResult<Vec<Event>>;

    /// One event by id, deleted ones included; `None` when the store never
    /// had it.
    async fn get_event(&self, calendar_id: &str, event_id: &str) -> MirrorResult<Option<Event>>;

    /// Instances of one series stored apart from their master (modified or
    /// cancelled) overlapping the query range. Plain occurrences that only
    /// exist through the rule are not returned.
    async fn list_instances(
        &self,
        calendar_id: &str,
        event_id: &str,
        query: &EventQuery,
    ) -> MirrorResult<Vec<Event>>;

    async fn insert_event(&self, calendar_id: &str, event: &Event) -> MirrorResult<Event>;

    async fn patch_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        patch: &serde_json::Value,
    ) -> MirrorResult<Event>;

    async fn remove_event(&self, calendar_id: &str, event_id: &str) -> MirrorResult<()>;
}
