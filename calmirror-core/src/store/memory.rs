//! In-memory calendar store.
//!
//! Behaves like the hosted store as far as the engine can observe: ids are
//! issued on insert, removals leave a cancelled tombstone that incremental
//! listings report, and every mutation stamps `updated` from a settable
//! clock. Failures can be injected per call.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{MirrorError, MirrorResult};
use crate::event::{Event, EventStatus};
use crate::store::{CalendarInfo, CalendarStore, EventQuery};

#[derive(Debug, Clone, Default)]
pub struct MemoryCalendarStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    calendars: Vec<CalendarInfo>,
    events: BTreeMap<String, Vec<Event>>,
    next_id: u64,
    now: Option<DateTime<Utc>>,
    fail_next_list: Option<String>,
    fail_next_insert: Option<String>,
    fail_next_remove: Option<String>,
    fail_summaries: HashSet<String>,
    list_calls: usize,
    inserts: usize,
    removes: usize,
}

impl MemoryStoreInner {
    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    fn issue_id(&mut self) -> String {
        self.next_id += 1;
        format!("ev{:06}", self.next_id)
    }

    fn calendar_events(&mut self, calendar_id: &str) -> MirrorResult<&mut Vec<Event>> {
        self.events
            .get_mut(calendar_id)
            .ok_or_else(|| MirrorError::CalendarNotFound(calendar_id.to_string()))
    }

    fn store_new(&mut self, calendar_id: &str, event: &Event) -> MirrorResult<Event> {
        let now = self.now();
        let id = match &event.id {
            Some(id) => id.clone(),
            None => self.issue_id(),
        };
        let mut stored = event.clone();
        stored.etag = Some(format!("\"{}\"", now.timestamp_micros()));
        stored.ical_uid = Some(format!("{id}@calmirror.local"));
        stored.kind = Some("calendar#event".to_string());
        stored.id = Some(id);
        stored.created = Some(now);
        stored.updated = Some(now);
        self.calendar_events(calendar_id)?.push(stored.clone());
        Ok(stored)
    }
}

impl MemoryCalendarStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_calendar(&self, id: &str, summary: &str, time_zone: Option<&str>) -> CalendarInfo {
        let info = CalendarInfo {
            id: id.to_string(),
            summary: summary.to_string(),
            time_zone: time_zone.map(String::from),
        };
        let mut inner = self.lock();
        inner.calendars.push(info.clone());
        inner.events.entry(id.to_string()).or_default();
        info
    }

    /// Store an event directly, bypassing failure injection and counters.
    pub fn seed(&self, calendar_id: &str, event: Event) -> MirrorResult<Event> {
        self.lock().store_new(calendar_id, &event)
    }

    /// Replace a stored event, as an edit made by a user would.
    pub fn replace(&self, calendar_id: &str, event: Event) -> MirrorResult<Event> {
        let mut inner = self.lock();
        let now = inner.now();
        let id = event.id_str().to_string();
        let events = inner.calendar_events(calendar_id)?;
        let slot = events
            .iter_mut()
            .find(|e| e.id_str() == id)
            .ok_or_else(|| MirrorError::Store(format!("Event {id} not found")))?;
        *slot = Event {
            updated: Some(now),
            ..event
        };
        Ok(slot.clone())
    }

    /// Delete an event the way a user would, leaving a tombstone.
    pub fn delete(&self, calendar_id: &str, event_id: &str) -> MirrorResult<()> {
        self.lock_and_remove(calendar_id, event_id)
    }

    /// Live (non-cancelled) events of a calendar.
    pub fn events(&self, calendar_id: &str) -> Vec<Event> {
        self.lock()
            .events
            .get(calendar_id)
            .map(|events| events.iter().filter(|e| !e.is_cancelled()).cloned().collect())
            .unwrap_or_default()
    }

    /// The store's clock; the wall clock unless set.
    pub fn now(&self) -> DateTime<Utc> {
        self.lock().now()
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        self.lock().now = Some(now);
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.lock();
        let now = inner.now();
        inner.now = Some(now + by);
    }

    pub fn fail_next_list(&self, error: &str) {
        self.lock().fail_next_list = Some(error.to_string());
    }

    pub fn fail_next_insert(&self, error: &str) {
        self.lock().fail_next_insert = Some(error.to_string());
    }

    pub fn fail_next_remove(&self, error: &str) {
        self.lock().fail_next_remove = Some(error.to_string());
    }

    /// Fail every insert of an event with this summary.
    pub fn fail_inserts_of(&self, summary: &str) {
        self.lock().fail_summaries.insert(summary.to_string());
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn inserts(&self) -> usize {
        self.lock().inserts
    }

    pub fn removes(&self) -> usize {
        self.lock().removes
    }

    fn lock_and_remove(&self, calendar_id: &str, event_id: &str) -> MirrorResult<()> {
        let mut inner = self.lock();
        let now = inner.now();
        let events = inner.calendar_events(calendar_id)?;
        let event = events
            .iter_mut()
            .find(|e| e.id_str() == event_id)
            .ok_or_else(|| MirrorError::Store(format!("Event {event_id} not found")))?;
        if event.is_cancelled() && !event.is_instance() {
            return Err(MirrorError::Store(format!("Event {event_id} already deleted")));
        }
        event.status = EventStatus::Cancelled;
        event.updated = Some(now);
        Ok(())
    }
}

fn matches_query(event: &Event, query: &EventQuery) -> bool {
    // Deleted events only show up on request; cancelled instances always do
    if event.is_cancelled() && !event.is_instance() && !query.show_deleted {
        return false;
    }
    if let Some(updated_min) = query.updated_min {
        if event.updated.is_none_or(|u| u < updated_min) {
            return false;
        }
    }
    if let Some(filter) = &query.private_property {
        let (key, value) = filter.split_once('=').unwrap_or((filter.as_str(), ""));
        let private = event.extended_properties.as_ref().map(|p| &p.private);
        if private.and_then(|p| p.get(key)).map(String::as_str) != Some(value) {
            return false;
        }
    }
    overlaps(event, query)
}

fn overlaps(event: &Event, query: &EventQuery) -> bool {
    let Some(start) = event.start.as_ref().or(event.original_start_time.as_ref()) else {
        // Tombstones without times are only ever matched on `updated`
        return true;
    };
    let start = start.to_utc(chrono_tz::UTC);
    if query.time_max.is_some_and(|max| start >= max) {
        return false;
    }
    // Series stay listed while any later occurrence may fall in range
    if event.is_series() {
        return true;
    }
    let end = event
        .end
        .as_ref()
        .map(|end| end.to_utc(chrono_tz::UTC))
        .unwrap_or(start);
    query.time_min.is_none_or(|min| end > min || (end == start && start >= min))
}

#[async_trait]
impl CalendarStore for MemoryCalendarStore {
    async fn list_calendars(&self) -> MirrorResult<Vec<CalendarInfo>> {
        Ok(self.lock().calendars.clone())
    }

    async fn list_events(&self, calendar_id: &str, query: &EventQuery) -> MirrorResult<Vec<Event>> {
        let mut inner = self.lock();
        inner.list_calls += 1;
        if let Some(error) = inner.fail_next_list.take() {
            return Err(MirrorError::Store(error));
        }
        Ok(inner
            .calendar_events(calendar_id)?
            .iter()
            .filter(|e| matches_query(e, query))
            .cloned()
            .collect())
    }

    async fn get_event(&self, calendar_id: &str, event_id: &str) -> MirrorResult<Option<Event>> {
        let mut inner = self.lock();
        inner.list_calls += 1;
        if let Some(error) = inner.fail_next_list.take() {
            return Err(MirrorError::Store(error));
        }
        Ok(inner
            .calendar_events(calendar_id)?
            .iter()
            .find(|e| e.id_str() == event_id)
            .cloned())
    }

    /// Instances live here only when stored on their own, so all of them are returned.
    async fn list_instances(
        &self,
        calendar_id: &str,
        event_id: &str,
        query: &EventQuery,
    ) -> MirrorResult<Vec<Event>> {
        let mut inner = self.lock();
        inner.list_calls += 1;
        if let Some(error) = inner.fail_next_list.take() {
            return Err(MirrorError::Store(error));
        }
        Ok(inner
            .calendar_events(calendar_id)?
            .iter()
            .filter(|e| e.recurring_event_id.as_deref() == Some(event_id))
            .filter(|e| query.show_deleted || !e.is_cancelled())
            .filter(|e| overlaps(e, query))
            .cloned()
            .collect())
    }

    async fn insert_event(&self, calendar_id: &str, event: &Event) -> MirrorResult<Event> {
        let mut inner = self.lock();
        if let Some(error) = inner.fail_next_insert.take() {
            return Err(MirrorError::Store(error));
        }
        if inner.fail_summaries.contains(event.title()) {
            return Err(MirrorError::Store(format!("Rejected insert of \"{}\"", event.title())));
        }
        let mut event = event.clone();
        event.id = None;
        let stored = inner.store_new(calendar_id, &event)?;
        inner.inserts += 1;
        Ok(stored)
    }

    async fn patch_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        patch: &serde_json::Value,
    ) -> MirrorResult<Event> {
        let serde_json::Value::Object(fields) = patch else {
            return Err(MirrorError::Store("Patch must be a JSON object".to_string()));
        };
        let mut inner = self.lock();
        let now = inner.now();
        let events = inner.calendar_events(calendar_id)?;
        let slot = events
            .iter_mut()
            .find(|e| e.id_str() == event_id)
            .ok_or_else(|| MirrorError::Store(format!("Event {event_id} not found")))?;

        let mut value = serde_json::to_value(&*slot)?;
        if let serde_json::Value::Object(map) = &mut value {
            for (key, field) in fields {
                if field.is_null() {
                    map.remove(key);
                } else {
                    map.insert(key.clone(), field.clone());
                }
            }
        }
        let mut patched: Event = serde_json::from_value(value)?;
        patched.updated = Some(now);
        *slot = patched;
        Ok(slot.clone())
    }

    async fn remove_event(&self, calendar_id: &str, event_id: &str) -> MirrorResult<()> {
        {
            let mut inner = self.lock();
            if let Some(error) = inner.fail_next_remove.take() {
                return Err(MirrorError::Store(error));
            }
            inner.removes += 1;
        }
        self.lock_and_remove(calendar_id, event_id)
    }
}
