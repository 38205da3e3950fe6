//! Structured recurrence descriptions.
//!
//! The store exchanges recurrence as a list of iCalendar lines
//! (`RRULE:FREQ=WEEKLY;BYDAY=MO`, `EXDATE;TZID=Europe/Berlin:20250106T100000`).
//! Inside the engine those lines are parsed once into [`Recurrence`] so that
//! termination clauses and exclusion dates can be rewritten as values, and are
//! rendered back to text only when an event crosses the store boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{MirrorError, MirrorResult};
use crate::event::local_to_utc;

const DATE_FORMAT: &str = "%Y%m%d";
const LOCAL_FORMAT: &str = "%Y%m%dT%H%M%S";
const UTC_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Repetition rules plus exclusion dates of a series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recurrence {
    pub rules: Vec<RecurrenceRule>,
    pub exdates: BTreeSet<ExDate>,
    /// Lines the engine does not interpret (RDATE, ...), kept verbatim.
    pub other: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecurrenceRule {
    pub freq: Frequency,
    pub termination: Termination,
    /// Remaining `KEY=VALUE` parts (INTERVAL, BYDAY, WKST, ...)
    pub parts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Never,
    Count(u32),
    Until(Until),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Until {
    Date(NaiveDate),
    Instant(DateTime<Utc>),
    Floating(NaiveDateTime),
}

/// One excluded occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExDate {
    Date(NaiveDate),
    Instant(DateTime<Utc>),
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Secondly => "SECONDLY",
            Frequency::Minutely => "MINUTELY",
            Frequency::Hourly => "HOURLY",
            Frequency::Daily => "DAILY",
            Frequency::Weekly => "WEEKLY",
            Frequency::Monthly => "MONTHLY",
            Frequency::Yearly => "YEARLY",
        }
    }
}

impl FromStr for Frequency {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SECONDLY" => Ok(Frequency::Secondly),
            "MINUTELY" => Ok(Frequency::Minutely),
            "HOURLY" => Ok(Frequency::Hourly),
            "DAILY" => Ok(Frequency::Daily),
            "WEEKLY" => Ok(Frequency::Weekly),
            "MONTHLY" => Ok(Frequency::Monthly),
            "YEARLY" => Ok(Frequency::Yearly),
            other => Err(MirrorError::Recurrence(format!("Unknown FREQ '{other}'"))),
        }
    }
}

impl Until {
    fn parse(value: &str) -> MirrorResult<Self> {
        if let Some(utc) = value.strip_suffix('Z') {
            return NaiveDateTime::parse_from_str(utc, LOCAL_FORMAT)
                .map(|dt| Until::Instant(dt.and_utc()))
                .map_err(|_| MirrorError::Recurrence(format!("Invalid UNTIL '{value}'")));
        }
        if value.len() == 8 {
            return NaiveDate::parse_from_str(value, DATE_FORMAT)
                .map(Until::Date)
                .map_err(|_| MirrorError::Recurrence(format!("Invalid UNTIL '{value}'")));
        }
        NaiveDateTime::parse_from_str(value, LOCAL_FORMAT)
            .map(Until::Floating)
            .map_err(|_| MirrorError::Recurrence(format!("Invalid UNTIL '{value}'")))
    }

    /// The last instant the rule may produce, read in the series zone.
    /// A date-only UNTIL covers its whole day.
    pub fn to_utc(&self, tz: Tz) -> DateTime<Utc> {
        match self {
            Until::Date(date) => {
                local_to_utc(tz, date.and_hms_opt(23, 59, 59).unwrap_or_default())
            }
            Until::Instant(instant) => *instant,
            Until::Floating(local) => local_to_utc(tz, *local),
        }
    }
}

impl fmt::Display for Until {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Until::Date(date) => write!(f, "{}", date.format(DATE_FORMAT)),
            Until::Instant(instant) => write!(f, "{}", instant.format(UTC_FORMAT)),
            Until::Floating(local) => write!(f, "{}", local.format(LOCAL_FORMAT)),
        }
    }
}

impl RecurrenceRule {
    /// Parse a single `RRULE:` line (the prefix is optional).
    pub fn parse(line: &str) -> MirrorResult<Self> {
        let body = strip_prefix_ignore_case(line, "RRULE:").unwrap_or(line);

        let mut freq = None;
        let mut count = None;
        let mut until = None;
        let mut parts = BTreeMap::new();

        for part in body.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                MirrorError::Recurrence(format!("Malformed rule part '{part}' in '{line}'"))
            })?;
            match key.to_ascii_uppercase().as_str() {
                "FREQ" => freq = Some(value.parse::<Frequency>()?),
                "COUNT" => {
                    let n = value.parse::<u32>().ok().filter(|n| *n > 0).ok_or_else(|| {
                        MirrorError::Recurrence(format!("Invalid COUNT '{value}'"))
                    })?;
                    count = Some(n);
                }
                "UNTIL" => until = Some(Until::parse(value)?),
                other => {
                    parts.insert(other.to_string(), value.to_string());
                }
            }
        }

        let freq = freq.ok_or_else(|| MirrorError::Recurrence(format!("Missing FREQ in '{line}'")))?;
        let termination = match (count, until) {
            (Some(_), Some(_)) => {
                return Err(MirrorError::Recurrence(format!(
                    "COUNT and UNTIL are mutually exclusive in '{line}'"
                )));
            }
            (Some(n), None) => Termination::Count(n),
            (None, Some(u)) => Termination::Until(u),
            (None, None) => Termination::Never,
        };

        Ok(RecurrenceRule {
            freq,
            termination,
            parts,
        })
    }

    fn body_parts(&self) -> Vec<String> {
        let mut out = vec![format!("FREQ={}", self.freq.as_str())];
        out.extend(self.parts.iter().map(|(k, v)| format!("{k}={v}")));
        out
    }

    /// Rule line for evaluation against a DTSTART carrying a TZID: UNTIL must be UTC.
    pub(crate) fn to_evaluation_line(&self, tz: Tz) -> String {
        let mut parts = self.body_parts();
        match &self.termination {
            Termination::Never => {}
            Termination::Count(n) => parts.push(format!("COUNT={n}")),
            Termination::Until(until) => {
                parts.push(format!("UNTIL={}", until.to_utc(tz).format(UTC_FORMAT)))
            }
        }
        format!("RRULE:{}", parts.join(";"))
    }
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = self.body_parts();
        match &self.termination {
            Termination::Never => {}
            Termination::Count(n) => parts.push(format!("COUNT={n}")),
            Termination::Until(until) => parts.push(format!("UNTIL={until}")),
        }
        write!(f, "RRULE:{}", parts.join(";"))
    }
}

impl ExDate {
    /// Parse one `EXDATE` line into its dates.
    fn parse_line(line: &str) -> MirrorResult<Vec<ExDate>> {
        let (head, values) = line
            .split_once(':')
            .ok_or_else(|| MirrorError::Recurrence(format!("Malformed EXDATE '{line}'")))?;

        let mut tz: Option<Tz> = None;
        let mut date_only = false;
        for param in head.split(';').skip(1) {
            match param.split_once('=') {
                Some((k, v)) if k.eq_ignore_ascii_case("TZID") => {
                    tz = Some(v.parse::<Tz>().map_err(|_| {
                        MirrorError::Recurrence(format!("Unknown TZID '{v}' in '{line}'"))
                    })?);
                }
                Some((k, v)) if k.eq_ignore_ascii_case("VALUE") => {
                    date_only = v.eq_ignore_ascii_case("DATE");
                }
                _ => {}
            }
        }

        values
            .split(',')
            .filter(|v| !v.is_empty())
            .map(|value| {
                let invalid = || MirrorError::Recurrence(format!("Invalid EXDATE '{value}'"));
                if date_only || value.len() == 8 {
                    NaiveDate::parse_from_str(value, DATE_FORMAT)
                        .map(ExDate::Date)
                        .map_err(|_| invalid())
                } else if let Some(utc) = value.strip_suffix('Z') {
                    NaiveDateTime::parse_from_str(utc, LOCAL_FORMAT)
                        .map(|dt| ExDate::Instant(dt.and_utc()))
                        .map_err(|_| invalid())
                } else {
                    // Floating values without TZID are read as UTC
                    NaiveDateTime::parse_from_str(value, LOCAL_FORMAT)
                        .map(|dt| ExDate::Instant(local_to_utc(tz.unwrap_or(chrono_tz::UTC), dt)))
                        .map_err(|_| invalid())
                }
            })
            .collect()
    }
}

impl Recurrence {
    pub fn parse_lines<S: AsRef<str>>(lines: &[S]) -> MirrorResult<Self> {
        let mut recurrence = Recurrence::default();
        for line in lines.iter().map(|l| l.as_ref().trim()) {
            if line.is_empty() {
                continue;
            }
            let upper = line.to_ascii_uppercase();
            if upper.starts_with("RRULE:") {
                recurrence.rules.push(RecurrenceRule::parse(line)?);
            } else if upper.starts_with("EXDATE") {
                recurrence.exdates.extend(ExDate::parse_line(line)?);
            } else {
                recurrence.other.push(line.to_string());
            }
        }
        Ok(recurrence)
    }

    /// Render back to store lines: rules, then one EXDATE line per value type.
    pub fn to_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.rules.iter().map(|r| r.to_string()).collect();

        let dates: Vec<String> = self
            .exdates
            .iter()
            .filter_map(|x| match x {
                ExDate::Date(d) => Some(d.format(DATE_FORMAT).to_string()),
                ExDate::Instant(_) => None,
            })
            .collect();
        if !dates.is_empty() {
            lines.push(format!("EXDATE;VALUE=DATE:{}", dates.join(",")));
        }

        let instants: Vec<String> = self
            .exdates
            .iter()
            .filter_map(|x| match x {
                ExDate::Instant(i) => Some(i.format(UTC_FORMAT).to_string()),
                ExDate::Date(_) => None,
            })
            .collect();
        if !instants.is_empty() {
            lines.push(format!("EXDATE:{}", instants.join(",")));
        }

        lines.extend(self.other.iter().cloned());
        lines
    }
}

impl Serialize for Recurrence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_lines().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Recurrence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let lines = Vec::<String>::deserialize(deserializer)?;
        Recurrence::parse_lines(&lines).map_err(serde::de::Error::custom)
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    match s.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => s.get(prefix.len()..),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_rule_with_count() {
        let rule = RecurrenceRule::parse("RRULE:FREQ=WEEKLY;BYDAY=MO,WE;COUNT=10").unwrap();
        assert_eq!(rule.freq, Frequency::Weekly);
        assert_eq!(rule.termination, Termination::Count(10));
        assert_eq!(rule.parts.get("BYDAY").map(String::as_str), Some("MO,WE"));
        assert_eq!(rule.to_string(), "RRULE:FREQ=WEEKLY;BYDAY=MO,WE;COUNT=10");
    }

    #[test]
    fn test_parse_rule_until_variants() {
        let date = RecurrenceRule::parse("RRULE:FREQ=DAILY;UNTIL=20250131").unwrap();
        assert_eq!(
            date.termination,
            Termination::Until(Until::Date(NaiveDate::from_ymd_opt(2025, 1, 31).unwrap()))
        );

        let utc = RecurrenceRule::parse("RRULE:UNTIL=20250131T100000Z;FREQ=DAILY").unwrap();
        assert_eq!(
            utc.termination,
            Termination::Until(Until::Instant(
                Utc.with_ymd_and_hms(2025, 1, 31, 10, 0, 0).unwrap()
            ))
        );
    }

    #[test]
    fn test_rule_rejects_count_and_until() {
        assert!(RecurrenceRule::parse("RRULE:FREQ=DAILY;COUNT=3;UNTIL=20250131").is_err());
        assert!(RecurrenceRule::parse("RRULE:BYDAY=MO").is_err());
    }

    #[test]
    fn test_parse_exdate_with_tzid_converts_to_utc() {
        let recurrence = Recurrence::parse_lines(&[
            "RRULE:FREQ=WEEKLY;BYDAY=MO",
            "EXDATE;TZID=Europe/Berlin:20250106T100000,20250113T100000",
        ])
        .unwrap();

        let expected: BTreeSet<ExDate> = [
            ExDate::Instant(Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap()),
            ExDate::Instant(Utc.with_ymd_and_hms(2025, 1, 13, 9, 0, 0).unwrap()),
        ]
        .into_iter()
        .collect();
        assert_eq!(recurrence.exdates, expected);
    }

    #[test]
    fn test_store_exdate_prefixes_normalize_to_same_value() {
        let returned = Recurrence::parse_lines(&["EXDATE;VALUE=DATE-TIME:20250106T090000Z"]).unwrap();
        let sent = Recurrence::parse_lines(&["EXDATE:20250106T090000Z"]).unwrap();
        assert_eq!(returned, sent);
    }

    #[test]
    fn test_lines_roundtrip_keeps_unknown_lines() {
        let lines = vec![
            "RRULE:FREQ=DAILY;INTERVAL=2".to_string(),
            "EXDATE;VALUE=DATE:20250102,20250104".to_string(),
            "RDATE;VALUE=DATE:20250110".to_string(),
        ];
        let recurrence = Recurrence::parse_lines(&lines).unwrap();
        assert_eq!(recurrence.to_lines(), lines);
    }
}
