//! Calendar event types.
//!
//! These types mirror the JSON event resource exchanged with the calendar
//! store (camelCase keys, `date` / `dateTime` time objects, recurrence as a
//! list of iCalendar lines). Fields the typed model does not know about are
//! kept in [`Event::extra`] so a transform can add them and they survive a
//! round-trip through the store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::recurrence::Recurrence;

/// Private extended property holding the source calendar id.
pub const SOURCE_CALENDAR_ID_KEY: &str = "sourceCalendarId";
/// Private extended property holding the source event id.
pub const SOURCE_EVENT_ID_KEY: &str = "sourceEventId";

/// A calendar event as exchanged with the calendar store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    /// `opaque` (busy) or `transparent` (free)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparency: Option<String>,

    // Deleted events returned by an incremental fetch may carry no times.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<EventTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<EventTime>,

    // Recurrence fields
    /// RRULE / EXDATE lines for series masters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,
    /// Master id, set on instances of a series
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring_event_id: Option<String>,
    /// Start of the occurrence this instance replaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_start_time: Option<EventTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<ExtendedProperties>,

    // Store metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminders: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<Person>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<Person>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_link: Option<String>,
    #[serde(default, rename = "iCalUID", skip_serializing_if = "Option::is_none")]
    pub ical_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    /// Any other field of the resource
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Link from a target event back to the source event it mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Linkage {
    pub source_calendar_id: String,
    pub source_event_id: String,
}

impl Event {
    pub fn is_cancelled(&self) -> bool {
        self.status == EventStatus::Cancelled
    }

    /// A series master: carries at least one repetition rule.
    pub fn is_series(&self) -> bool {
        self.recurrence.as_ref().is_some_and(|r| !r.rules.is_empty())
    }

    /// An instance of a series (materialized, modified or cancelled).
    pub fn is_instance(&self) -> bool {
        self.recurring_event_id.is_some()
    }

    pub fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    pub fn title(&self) -> &str {
        match self.summary.as_deref() {
            Some(s) if !s.is_empty() => s,
            _ => "(no title)",
        }
    }

    /// Read the linkage metadata, if this event was created by the engine.
    pub fn linkage(&self) -> Option<Linkage> {
        let private = &self.extended_properties.as_ref()?.private;
        Some(Linkage {
            source_calendar_id: private.get(SOURCE_CALENDAR_ID_KEY)?.clone(),
            source_event_id: private.get(SOURCE_EVENT_ID_KEY)?.clone(),
        })
    }

    pub fn set_linkage(&mut self, linkage: &Linkage) {
        let props = self.extended_properties.get_or_insert_with(Default::default);
        props.private.insert(
            SOURCE_CALENDAR_ID_KEY.to_string(),
            linkage.source_calendar_id.clone(),
        );
        props.private.insert(
            SOURCE_EVENT_ID_KEY.to_string(),
            linkage.source_event_id.clone(),
        );
    }

    /// Human-readable label used in log lines: `"Lunch" at 2025-03-20 12:00:00`.
    pub fn describe(&self, fallback_tz: Tz) -> String {
        match &self.start {
            Some(start) => format!("\"{}\" at {}", self.title(), start.display_local(fallback_tz)),
            None => format!("\"{}\"", self.title()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[default]
    Confirmed,
    Tentative,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedProperties {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub private: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shared: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, rename = "self", skip_serializing_if = "Option::is_none")]
    pub is_self: Option<bool>,
}

/// Start or end of an event: a whole day or an instant with its zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EventTimeRepr", into = "EventTimeRepr")]
pub enum EventTime {
    Date {
        date: NaiveDate,
        time_zone: Option<String>,
    },
    DateTime {
        date_time: DateTime<FixedOffset>,
        time_zone: Option<String>,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventTimeRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date_time: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time_zone: Option<String>,
}

impl TryFrom<EventTimeRepr> for EventTime {
    type Error = String;

    fn try_from(repr: EventTimeRepr) -> Result<Self, Self::Error> {
        match (repr.date_time, repr.date) {
            (Some(date_time), _) => Ok(EventTime::DateTime {
                date_time,
                time_zone: repr.time_zone,
            }),
            (None, Some(date)) => Ok(EventTime::Date {
                date,
                time_zone: repr.time_zone,
            }),
            (None, None) => Err("event time has neither date nor dateTime".to_string()),
        }
    }
}

impl From<EventTime> for EventTimeRepr {
    fn from(time: EventTime) -> Self {
        match time {
            EventTime::Date { date, time_zone } => EventTimeRepr {
                date: Some(date),
                date_time: None,
                time_zone,
            },
            EventTime::DateTime {
                date_time,
                time_zone,
            } => EventTimeRepr {
                date: None,
                date_time: Some(date_time),
                time_zone,
            },
        }
    }
}

impl EventTime {
    pub fn date(date: NaiveDate) -> Self {
        EventTime::Date {
            date,
            time_zone: None,
        }
    }

    pub fn date_time(date_time: DateTime<FixedOffset>, time_zone: Option<&str>) -> Self {
        EventTime::DateTime {
            date_time,
            time_zone: time_zone.map(String::from),
        }
    }

    pub fn is_all_day(&self) -> bool {
        matches!(self, EventTime::Date { .. })
    }

    pub fn time_zone(&self) -> Option<&str> {
        match self {
            EventTime::Date { time_zone, .. } | EventTime::DateTime { time_zone, .. } => {
                time_zone.as_deref()
            }
        }
    }

    /// Fill in the time zone of a date-time the store left it out of.
    ///
    /// Dates stay as they are: stores drop the zone of all-day times.
    pub fn with_default_time_zone(mut self, tz_name: &str) -> Self {
        if let EventTime::DateTime { time_zone, .. } = &mut self {
            if time_zone.is_none() {
                *time_zone = Some(tz_name.to_string());
            }
        }
        self
    }

    /// The event's own zone if set and known, else `fallback`.
    pub fn zone(&self, fallback: Tz) -> Tz {
        self.time_zone()
            .and_then(|name| name.parse::<Tz>().ok())
            .unwrap_or(fallback)
    }

    /// Absolute instant. All-day times resolve to local midnight in their zone.
    pub fn to_utc(&self, fallback: Tz) -> DateTime<Utc> {
        match self {
            EventTime::Date { date, .. } => {
                let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
                local_to_utc(self.zone(fallback), midnight)
            }
            EventTime::DateTime { date_time, .. } => date_time.with_timezone(&Utc),
        }
    }

    /// `YYYY-MM-DD HH:MM:SS` in the event's zone, `YYYY-MM-DD` for all-day times.
    pub fn display_local(&self, fallback: Tz) -> String {
        match self {
            EventTime::Date { date, .. } => date.format("%Y-%m-%d").to_string(),
            EventTime::DateTime { date_time, .. } => date_time
                .with_timezone(&self.zone(fallback))
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        }
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventTime::Date { date, .. } => write!(f, "{}", date.format("%Y-%m-%d")),
            EventTime::DateTime { date_time, .. } => write!(f, "{}", date_time.to_rfc3339()),
        }
    }
}

/// Resolve a local wall-clock time in `tz` to an instant.
///
/// Ambiguous times (DST fold) take the earlier instant; times inside a DST
/// gap are moved forward by an hour.
pub fn local_to_utc(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => tz
            .from_local_datetime(&(local + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&local)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_store_resource() {
        let event: Event = serde_json::from_value(json!({
            "id": "abc123",
            "status": "confirmed",
            "summary": "Lunch",
            "start": {"dateTime": "2025-03-20T12:00:00+01:00", "timeZone": "Europe/Berlin"},
            "end": {"dateTime": "2025-03-20T13:00:00+01:00", "timeZone": "Europe/Berlin"},
            "iCalUID": "abc123@google.com",
            "extendedProperties": {"private": {"sourceCalendarId": "src", "sourceEventId": "e1"}},
            "hangoutLink": "https://meet.example.com/xyz"
        }))
        .unwrap();

        assert_eq!(event.ical_uid.as_deref(), Some("abc123@google.com"));
        assert_eq!(
            event.linkage(),
            Some(Linkage {
                source_calendar_id: "src".into(),
                source_event_id: "e1".into()
            })
        );
        assert!(event.extra.contains_key("hangoutLink"));
        assert!(!event.start.as_ref().unwrap().is_all_day());
    }

    #[test]
    fn test_event_time_requires_date_or_date_time() {
        let result: Result<EventTime, _> = serde_json::from_value(json!({"timeZone": "UTC"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_all_day_resolves_to_local_midnight() {
        let time = EventTime::Date {
            date: NaiveDate::from_ymd_opt(2025, 3, 20).unwrap(),
            time_zone: Some("Europe/Berlin".into()),
        };
        let utc = time.to_utc(chrono_tz::UTC);
        assert_eq!(utc.to_rfc3339(), "2025-03-19T23:00:00+00:00");
    }

    #[test]
    fn test_dst_gap_moves_forward() {
        let local = NaiveDate::from_ymd_opt(2025, 3, 30)
            .unwrap()
            .and_hms_opt(2, 30, 0)
            .unwrap();
        let utc = local_to_utc(chrono_tz::Europe::Berlin, local);
        assert_eq!(utc.to_rfc3339(), "2025-03-30T01:30:00+00:00");
    }
}
