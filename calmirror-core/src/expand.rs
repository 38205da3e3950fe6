//! Recurrence expansion and windowing.
//!
//! Series are cut to the sync window: the master start moves to the first
//! surviving in-window occurrence and the termination clause is rewritten so
//! the series ends inside the window. Singular events are clamped to the
//! window. Anything left without an occurrence is marked cancelled.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;
use rrule::RRuleSet;

use crate::error::{MirrorError, MirrorResult};
use crate::event::{Event, EventStatus, EventTime, local_to_utc};
use crate::recurrence::{ExDate, RecurrenceRule, Termination, Until};
use crate::window::SyncWindow;

/// Upper bound on occurrences evaluated per rule and window.
const MAX_OCCURRENCES: u16 = u16::MAX;

/// Fold fetched sibling instances into their master's exclusion dates.
///
/// Every instance of a series that the store returned separately (because it
/// was cancelled or modified) is excluded from the master, so that the master
/// alone no longer produces that occurrence. Cancelled instances are dropped
/// afterwards; modified ones stay and are mirrored as singular events.
pub fn materialize_exclusions(events: Vec<Event>) -> Vec<Event> {
    let mut exclusions: HashMap<String, Vec<ExDate>> = HashMap::new();
    for instance in events.iter().filter(|e| e.is_instance()) {
        let (Some(master_id), Some(original)) = (
            instance.recurring_event_id.as_ref(),
            instance.original_start_time.as_ref().or(instance.start.as_ref()),
        ) else {
            continue;
        };
        let exdate = match original {
            EventTime::Date { date, .. } => ExDate::Date(*date),
            EventTime::DateTime { date_time, .. } => ExDate::Instant(date_time.with_timezone(&Utc)),
        };
        exclusions.entry(master_id.clone()).or_default().push(exdate);
    }

    events
        .into_iter()
        .filter(|e| !(e.is_instance() && e.is_cancelled()))
        .map(|mut event| {
            let exdates = event.id.as_ref().and_then(|id| exclusions.get(id));
            if let (Some(recurrence), Some(exdates)) = (event.recurrence.as_mut(), exdates) {
                recurrence.exdates.extend(exdates.iter().copied());
            }
            event
        })
        .collect()
}

/// Cut every event to the window and drop the ones left without occurrences.
pub fn expand_events(
    events: Vec<Event>,
    window: &SyncWindow,
    calendar_tz: Tz,
) -> MirrorResult<Vec<Event>> {
    let mut expanded = Vec::with_capacity(events.len());
    for event in events {
        // Deleted events may come without times
        if event.is_cancelled() {
            continue;
        }
        let event = if event.is_series() {
            window_series(event, window, calendar_tz)?
        } else {
            clamp_single(event, window, calendar_tz)
        };
        if !event.is_cancelled() {
            expanded.push(event);
        }
    }
    Ok(expanded)
}

/// Bound a series to the window.
///
/// Returns the event marked cancelled when no occurrence survives, otherwise
/// the series rewritten to start at its first surviving in-window occurrence
/// and to terminate no later than the window end.
pub fn window_series(mut event: Event, window: &SyncWindow, calendar_tz: Tz) -> MirrorResult<Event> {
    let Some(mut recurrence) = event.recurrence.take() else {
        return Ok(event);
    };
    let (Some(start), Some(end)) = (event.start.clone(), event.end.clone()) else {
        return Err(MirrorError::Recurrence(format!(
            "Series {} has no start or end",
            event.describe(calendar_tz)
        )));
    };

    let tz = start.zone(calendar_tz);
    let all_day = start.is_all_day();
    let dtstart = match &start {
        EventTime::Date { date, .. } => date.and_hms_opt(0, 0, 0).unwrap_or_default(),
        EventTime::DateTime { date_time, .. } => date_time.with_timezone(&tz).naive_local(),
    };
    let last = window.last_instant();

    let per_rule = recurrence
        .rules
        .iter()
        .map(|rule| rule_occurrences(rule, tz, dtstart, window.date_min, last))
        .collect::<MirrorResult<Vec<_>>>()?;

    let is_excluded = |instant: &DateTime<Utc>| {
        if all_day {
            let date = instant.with_timezone(&tz).date_naive();
            recurrence.exdates.contains(&ExDate::Date(date))
        } else {
            recurrence.exdates.contains(&ExDate::Instant(*instant))
        }
    };
    let surviving: BTreeSet<DateTime<Utc>> = per_rule
        .iter()
        .flatten()
        .filter(|instant| !is_excluded(instant))
        .copied()
        .collect();

    let (Some(first), Some(last_occurrence)) = (surviving.first().copied(), surviving.last().copied())
    else {
        event.recurrence = Some(recurrence);
        event.status = EventStatus::Cancelled;
        return Ok(event);
    };

    // Move the series to its first surviving occurrence, keeping the duration
    match (&start, &end) {
        (EventTime::Date { date: s, time_zone }, EventTime::Date { date: e, time_zone: end_tz }) => {
            let new_start = first.with_timezone(&tz).date_naive();
            event.start = Some(EventTime::Date {
                date: new_start,
                time_zone: time_zone.clone(),
            });
            event.end = Some(EventTime::Date {
                date: new_start + (*e - *s),
                time_zone: end_tz.clone(),
            });
        }
        _ => {
            let duration = end.to_utc(calendar_tz) - start.to_utc(calendar_tz);
            let end_zone = end.zone(tz);
            event.start = Some(EventTime::DateTime {
                date_time: first.with_timezone(&tz).fixed_offset(),
                time_zone: start.time_zone().map(String::from),
            });
            event.end = Some(EventTime::DateTime {
                date_time: (first + duration).with_timezone(&end_zone).fixed_offset(),
                time_zone: end.time_zone().map(String::from),
            });
        }
    }

    // Rewrite termination clauses so the series ends inside the window
    let last_day_end = local_to_utc(
        tz,
        last_occurrence
            .with_timezone(&tz)
            .date_naive()
            .and_hms_opt(23, 59, 59)
            .unwrap_or_default(),
    );
    let mut rules = Vec::with_capacity(recurrence.rules.len());
    for (mut rule, occurrences) in recurrence.rules.into_iter().zip(per_rule) {
        match &rule.termination {
            Termination::Count(_) => {
                let count = occurrences.iter().filter(|i| **i >= first).count();
                if count == 0 {
                    continue;
                }
                rule.termination = Termination::Count(u32::try_from(count).unwrap_or(u32::MAX));
            }
            Termination::Until(_) | Termination::Never => {
                let mut until = last_day_end.min(last);
                if let Termination::Until(original) = &rule.termination {
                    until = until.min(original.to_utc(tz));
                }
                rule.termination = Termination::Until(if all_day {
                    Until::Date(until.with_timezone(&tz).date_naive())
                } else {
                    Until::Instant(until)
                });
            }
        }
        rules.push(rule);
    }
    recurrence.rules = rules;
    event.recurrence = Some(recurrence);

    Ok(event)
}

/// Clamp a singular event to the window; cancelled if nothing is left.
pub fn clamp_single(mut event: Event, window: &SyncWindow, calendar_tz: Tz) -> Event {
    let (Some(start), Some(end)) = (event.start.clone(), event.end.clone()) else {
        return event;
    };

    let start_utc = start.to_utc(calendar_tz);
    let end_utc = end.to_utc(calendar_tz);
    let clamped_start = start_utc.max(window.date_min);
    let clamped_end = end_utc.min(window.date_max);

    if clamped_end <= clamped_start {
        event.status = EventStatus::Cancelled;
        return event;
    }
    if clamped_start != start_utc {
        event.start = Some(move_time(&start, clamped_start, calendar_tz));
    }
    if clamped_end != end_utc {
        event.end = Some(move_time(&end, clamped_end, calendar_tz));
    }
    event
}

fn move_time(time: &EventTime, instant: DateTime<Utc>, calendar_tz: Tz) -> EventTime {
    let tz = time.zone(calendar_tz);
    match time {
        EventTime::Date { time_zone, .. } => EventTime::Date {
            date: instant.with_timezone(&tz).date_naive(),
            time_zone: time_zone.clone(),
        },
        EventTime::DateTime { time_zone, .. } => EventTime::DateTime {
            date_time: instant.with_timezone(&tz).fixed_offset(),
            time_zone: time_zone.clone(),
        },
    }
}

/// Occurrences of one rule (exclusions not applied) with start in `[from, to]`.
fn rule_occurrences(
    rule: &RecurrenceRule,
    tz: Tz,
    dtstart: NaiveDateTime,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> MirrorResult<Vec<DateTime<Utc>>> {
    let series_start = local_to_utc(tz, dtstart);
    if series_start > to {
        return Ok(Vec::new());
    }
    if let Termination::Until(until) = &rule.termination {
        let until = until.to_utc(tz);
        if until < from || until < series_start {
            return Ok(Vec::new());
        }
    }

    let rrule_str = format!(
        "DTSTART;TZID={}:{}\n{}",
        tz.name(),
        dtstart.format("%Y%m%dT%H%M%S"),
        rule.to_evaluation_line(tz)
    );
    let rrule_set: RRuleSet = rrule_str.parse().map_err(|e| {
        MirrorError::Recurrence(format!("Failed to parse rule '{rule}': {e}"))
    })?;

    // Widen by a second on both sides; bounds are applied exactly below.
    let rtz = rrule::Tz::Tz(tz);
    let after = (from - Duration::seconds(1)).with_timezone(&rtz);
    let before = (to + Duration::seconds(1)).with_timezone(&rtz);
    let result = rrule_set.after(after).before(before).all(MAX_OCCURRENCES);

    Ok(result
        .dates
        .iter()
        .map(|dt| dt.with_timezone(&Utc))
        .filter(|dt| *dt >= from && *dt <= to)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recurrence::Recurrence;
    use chrono::{NaiveDate, TimeZone};
    use chrono_tz::Europe::Berlin;

    fn window() -> SyncWindow {
        // 2025-05-07 00:00 .. 2025-06-12 00:00 Berlin
        SyncWindow::from_days(7, 28, Berlin, Utc.with_ymd_and_hms(2025, 5, 14, 10, 0, 0).unwrap())
    }

    fn berlin(y: i32, m: u32, d: u32, h: u32, min: u32) -> EventTime {
        EventTime::DateTime {
            date_time: Berlin
                .with_ymd_and_hms(y, m, d, h, min, 0)
                .unwrap()
                .fixed_offset(),
            time_zone: Some("Europe/Berlin".to_string()),
        }
    }

    fn series(id: &str, start: EventTime, end: EventTime, lines: &[&str]) -> Event {
        Event {
            id: Some(id.to_string()),
            summary: Some("Standup".to_string()),
            start: Some(start),
            end: Some(end),
            recurrence: Some(Recurrence::parse_lines(lines).unwrap()),
            ..Default::default()
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_weekly_series_moves_to_first_in_window_occurrence() {
        let event = series(
            "s1",
            berlin(2025, 1, 6, 9, 0),
            berlin(2025, 1, 6, 9, 30),
            &["RRULE:FREQ=WEEKLY;BYDAY=MO"],
        );

        let windowed = window_series(event, &window(), Berlin).unwrap();

        assert!(!windowed.is_cancelled());
        assert_eq!(windowed.start, Some(berlin(2025, 5, 12, 9, 0)));
        assert_eq!(windowed.end, Some(berlin(2025, 5, 12, 9, 30)));

        let rule = &windowed.recurrence.unwrap().rules[0];
        // Last Monday in the window is June 9th
        let expected_until = Berlin.with_ymd_and_hms(2025, 6, 9, 23, 59, 59).unwrap();
        assert_eq!(
            rule.termination,
            Termination::Until(Until::Instant(expected_until.with_timezone(&Utc)))
        );
    }

    #[test]
    fn test_series_without_window_occurrence_is_cancelled() {
        let before = series(
            "s2",
            berlin(2025, 1, 6, 9, 0),
            berlin(2025, 1, 6, 10, 0),
            &["RRULE:FREQ=DAILY;COUNT=5"],
        );
        assert!(window_series(before, &window(), Berlin).unwrap().is_cancelled());

        let after = series(
            "s3",
            berlin(2025, 7, 1, 9, 0),
            berlin(2025, 7, 1, 10, 0),
            &["RRULE:FREQ=DAILY"],
        );
        assert!(window_series(after, &window(), Berlin).unwrap().is_cancelled());
    }

    #[test]
    fn test_series_fully_excluded_is_cancelled() {
        let event = series(
            "s4",
            berlin(2025, 5, 20, 9, 0),
            berlin(2025, 5, 20, 10, 0),
            &[
                "RRULE:FREQ=DAILY;COUNT=2",
                "EXDATE;TZID=Europe/Berlin:20250520T090000,20250521T090000",
            ],
        );
        assert!(window_series(event, &window(), Berlin).unwrap().is_cancelled());
    }

    #[test]
    fn test_count_is_recomputed_within_window() {
        // Daily from May 1st, 60 occurrences; window keeps May 7 .. June 11
        let event = series(
            "s5",
            berlin(2025, 5, 1, 8, 0),
            berlin(2025, 5, 1, 9, 0),
            &["RRULE:FREQ=DAILY;COUNT=60"],
        );

        let windowed = window_series(event, &window(), Berlin).unwrap();

        assert_eq!(windowed.start, Some(berlin(2025, 5, 7, 8, 0)));
        let rule = &windowed.recurrence.unwrap().rules[0];
        assert_eq!(rule.termination, Termination::Count(36));
    }

    #[test]
    fn test_count_never_exceeds_instances_before_window_end() {
        let event = series(
            "s6",
            berlin(2025, 5, 10, 8, 0),
            berlin(2025, 5, 10, 9, 0),
            &["RRULE:FREQ=DAILY;COUNT=5"],
        );

        let windowed = window_series(event, &window(), Berlin).unwrap();

        let rule = &windowed.recurrence.unwrap().rules[0];
        assert_eq!(rule.termination, Termination::Count(5));
    }

    #[test]
    fn test_excluded_first_occurrence_is_skipped() {
        let event = series(
            "s7",
            berlin(2025, 5, 12, 9, 0),
            berlin(2025, 5, 12, 10, 0),
            &[
                "RRULE:FREQ=WEEKLY;BYDAY=MO;COUNT=3",
                "EXDATE:20250512T070000Z",
            ],
        );

        let windowed = window_series(event, &window(), Berlin).unwrap();

        assert_eq!(windowed.start, Some(berlin(2025, 5, 19, 9, 0)));
        let rule = &windowed.recurrence.unwrap().rules[0];
        assert_eq!(rule.termination, Termination::Count(2));
    }

    #[test]
    fn test_all_day_series_until_stays_inside_window() {
        let event = series(
            "s8",
            EventTime::date(date(2025, 4, 1)),
            EventTime::date(date(2025, 4, 2)),
            &["RRULE:FREQ=DAILY"],
        );

        let windowed = window_series(event, &window(), Berlin).unwrap();

        assert_eq!(windowed.start, Some(EventTime::date(date(2025, 5, 7))));
        assert_eq!(windowed.end, Some(EventTime::date(date(2025, 5, 8))));
        let rule = &windowed.recurrence.unwrap().rules[0];
        assert_eq!(
            rule.termination,
            Termination::Until(Until::Date(date(2025, 6, 11)))
        );
    }

    #[test]
    fn test_original_until_is_kept_when_earlier() {
        let event = series(
            "s9",
            berlin(2025, 5, 1, 8, 0),
            berlin(2025, 5, 1, 9, 0),
            &["RRULE:FREQ=DAILY;UNTIL=20250515T060000Z"],
        );

        let windowed = window_series(event, &window(), Berlin).unwrap();

        let rule = &windowed.recurrence.unwrap().rules[0];
        assert_eq!(
            rule.termination,
            Termination::Until(Until::Instant(Utc.with_ymd_and_hms(2025, 5, 15, 6, 0, 0).unwrap()))
        );
    }

    #[test]
    fn test_materialize_exclusions_from_sibling_instances() {
        let master = series(
            "m1",
            berlin(2025, 5, 12, 9, 0),
            berlin(2025, 5, 12, 10, 0),
            &["RRULE:FREQ=DAILY;COUNT=5"],
        );
        let cancelled = Event {
            id: Some("m1_20250513".to_string()),
            status: EventStatus::Cancelled,
            recurring_event_id: Some("m1".to_string()),
            original_start_time: Some(berlin(2025, 5, 13, 9, 0)),
            ..Default::default()
        };
        let moved = Event {
            id: Some("m1_20250514".to_string()),
            summary: Some("Standup (moved)".to_string()),
            recurring_event_id: Some("m1".to_string()),
            original_start_time: Some(berlin(2025, 5, 14, 9, 0)),
            start: Some(berlin(2025, 5, 14, 15, 0)),
            end: Some(berlin(2025, 5, 14, 16, 0)),
            ..Default::default()
        };

        let events = materialize_exclusions(vec![master, cancelled, moved]);

        assert_eq!(events.len(), 2);
        let exdates = &events[0].recurrence.as_ref().unwrap().exdates;
        assert_eq!(exdates.len(), 2);
        assert!(exdates.contains(&ExDate::Instant(Utc.with_ymd_and_hms(2025, 5, 13, 7, 0, 0).unwrap())));
        assert_eq!(events[1].id.as_deref(), Some("m1_20250514"));
    }

    #[test]
    fn test_series_without_instances_is_untouched_by_materialize() {
        let master = series(
            "m2",
            berlin(2025, 5, 12, 9, 0),
            berlin(2025, 5, 12, 10, 0),
            &["RRULE:FREQ=DAILY"],
        );
        let events = materialize_exclusions(vec![master.clone()]);
        assert_eq!(events, vec![master]);
    }

    #[test]
    fn test_clamp_single_event_to_window() {
        let w = window();
        let spanning = Event {
            start: Some(EventTime::date(date(2025, 5, 1))),
            end: Some(EventTime::date(date(2025, 5, 10))),
            ..Default::default()
        };
        let clamped = clamp_single(spanning, &w, Berlin);
        assert_eq!(clamped.start, Some(EventTime::date(date(2025, 5, 7))));
        assert_eq!(clamped.end, Some(EventTime::date(date(2025, 5, 10))));

        let outside = Event {
            start: Some(berlin(2025, 5, 1, 9, 0)),
            end: Some(berlin(2025, 5, 1, 10, 0)),
            ..Default::default()
        };
        assert!(clamp_single(outside, &w, Berlin).is_cancelled());
    }
}
