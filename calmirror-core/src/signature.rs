//! Canonical event signatures.
//!
//! Two events are treated as the same target content when their signatures
//! are equal. The signature is compact JSON of the content-relevant fields
//! with object keys sorted, arrays sorted, date-times rendered as UTC instants
//! and recurrence lines normalized, so that neither field order nor metadata
//! the store adds on its own changes it.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::event::Event;

/// Fields maintained by the store rather than by the engine.
const STORE_ONLY_FIELDS: &[&str] = &[
    "id",
    "etag",
    "htmlLink",
    "iCalUID",
    "kind",
    "created",
    "updated",
    "creator",
    "organizer",
    "sequence",
    "eventType",
    "recurringEventId",
    "originalStartTime",
    "reminders",
    "hangoutLink",
    "conferenceData",
];

/// Deterministic signature of an event's content.
pub fn signature(event: &Event) -> String {
    let mut value = match serde_json::to_value(event) {
        Ok(value) => value,
        // Serializing the typed model cannot fail; fall back to Debug output
        Err(_) => return format!("{event:?}"),
    };
    if let Value::Object(map) = &mut value {
        for field in STORE_ONLY_FIELDS {
            map.remove(*field);
        }
    }

    let mut out = String::new();
    render(&normalize(value, None), &mut out);
    out
}

/// Whether two events carry the same content.
pub fn events_equal(a: &Event, b: &Event) -> bool {
    signature(a) == signature(b)
}

fn normalize(value: Value, key: Option<&str>) -> Value {
    match (key, value) {
        (Some("dateTime"), Value::String(s)) => Value::String(normalize_date_time(s)),
        (Some("recurrence"), Value::Array(lines)) => Value::Array(
            lines
                .into_iter()
                .map(|line| match line {
                    Value::String(s) => Value::String(normalize_recurrence_line(&s)),
                    other => other,
                })
                .collect(),
        ),
        (_, Value::Object(map)) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let v = normalize(v, Some(&k));
                    (k, v)
                })
                .collect(),
        ),
        (_, Value::Array(items)) => {
            Value::Array(items.into_iter().map(|v| normalize(v, None)).collect())
        }
        (_, other) => other,
    }
}

fn normalize_date_time(s: String) -> String {
    match DateTime::parse_from_rfc3339(&s) {
        Ok(dt) => dt
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        Err(_) => s,
    }
}

/// `RRULE:FREQ=WEEKLY;BYDAY=WE,MO` and `RRULE:BYDAY=MO,WE;FREQ=WEEKLY` normalize alike.
fn normalize_recurrence_line(line: &str) -> String {
    let Some((head, body)) = line.split_once(':') else {
        return line.to_string();
    };

    let mut params = head.split(';');
    let name = params.next().unwrap_or_default().to_ascii_uppercase();
    let mut params: Vec<&str> = params.collect();
    params.sort_unstable();

    let mut parts: Vec<String> = body
        .split(';')
        .filter(|p| !p.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => format!("{}={}", k.to_ascii_uppercase(), sorted_list(v)),
            None => sorted_list(part),
        })
        .collect();
    parts.sort_unstable();

    let mut out = name;
    for param in params {
        out.push(';');
        out.push_str(param);
    }
    out.push(':');
    out.push_str(&parts.join(";"));
    out
}

fn sorted_list(values: &str) -> String {
    let mut values: Vec<&str> = values.split(',').collect();
    values.sort_unstable();
    values.join(",")
}

/// Compact JSON with object keys and array elements in sorted order.
fn render(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                render(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            let mut rendered: Vec<String> = items
                .iter()
                .map(|item| {
                    let mut s = String::new();
                    render(item, &mut s);
                    s
                })
                .collect();
            rendered.sort_unstable();
            out.push('[');
            out.push_str(&rendered.join(","));
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
