//! Sync window computation.
//!
//! A pass mirrors the half-open range `[date_min, date_max)`, anchored on the
//! start of "today" in the source calendar's zone.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;
use crate::event::local_to_utc;

/// Range of time mirrored by one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub date_min: DateTime<Utc>,
    pub date_max: DateTime<Utc>,
}

impl SyncWindow {
    /// `[start of today - past_days, start of today + next_days + 1)` in `tz`.
    pub fn from_days(past_days: u32, next_days: u32, tz: Tz, now: DateTime<Utc>) -> Self {
        let today = now.with_timezone(&tz).date_naive();
        let first = today - Duration::days(i64::from(past_days));
        let after_last = today + Duration::days(i64::from(next_days) + 1);
        SyncWindow {
            date_min: local_to_utc(tz, first.and_hms_opt(0, 0, 0).unwrap_or_default()),
            date_max: local_to_utc(tz, after_last.and_hms_opt(0, 0, 0).unwrap_or_default()),
        }
    }

    /// Last instant that still belongs to the window.
    pub fn last_instant(&self) -> DateTime<Utc> {
        self.date_max - Duration::seconds(1)
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.date_min && instant < self.date_max
    }
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} and {}",
            self.date_min.format("%Y-%m-%d %H:%M:%S"),
            self.date_max.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// How far a window reaches into the past or the future.
///
/// Either a plain day count or a calendar anchor such as `start_of_month`
/// or `end_of_week+1` (one week later), resolved against "now" on every pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DaySpanRepr", into = "DaySpanRepr")]
pub enum DaySpan {
    Days(u32),
    Anchor(Anchor),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub edge: Edge,
    pub period: Period,
    /// Whole periods added to the current one (negative = earlier).
    pub offset: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Week,
    Month,
    Quarter,
    Halfyear,
    Year,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DaySpanRepr {
    Days(u32),
    Anchor(String),
}

impl TryFrom<DaySpanRepr> for DaySpan {
    type Error = MirrorError;

    fn try_from(repr: DaySpanRepr) -> Result<Self, Self::Error> {
        match repr {
            DaySpanRepr::Days(n) => Ok(DaySpan::Days(n)),
            DaySpanRepr::Anchor(s) => s.parse(),
        }
    }
}

impl From<DaySpan> for DaySpanRepr {
    fn from(span: DaySpan) -> Self {
        match span {
            DaySpan::Days(n) => DaySpanRepr::Days(n),
            DaySpan::Anchor(anchor) => DaySpanRepr::Anchor(anchor.to_string()),
        }
    }
}

impl FromStr for DaySpan {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u32>() {
            return Ok(DaySpan::Days(n));
        }
        let invalid = || {
            MirrorError::Config(format!(
                "Invalid day span '{s}'. Expected a number of days or e.g. 'start_of_month', 'end_of_week+1'"
            ))
        };

        let (name, offset) = match s.find(['+', '-']) {
            Some(i) => (&s[..i], s[i..].parse::<i32>().map_err(|_| invalid())?),
            None => (s, 0),
        };
        let (edge, period) = name.split_once("_of_").ok_or_else(invalid)?;
        let edge = match edge {
            "start" => Edge::Start,
            "end" => Edge::End,
            _ => return Err(invalid()),
        };
        let period = match period {
            "week" => Period::Week,
            "month" => Period::Month,
            "quarter" => Period::Quarter,
            "halfyear" => Period::Halfyear,
            "year" => Period::Year,
            _ => return Err(invalid()),
        };
        Ok(DaySpan::Anchor(Anchor {
            edge,
            period,
            offset,
        }))
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let edge = match self.edge {
            Edge::Start => "start",
            Edge::End => "end",
        };
        let period = match self.period {
            Period::Week => "week",
            Period::Month => "month",
            Period::Quarter => "quarter",
            Period::Halfyear => "halfyear",
            Period::Year => "year",
        };
        match self.offset {
            0 => write!(f, "{edge}_of_{period}"),
            n => write!(f, "{edge}_of_{period}{n:+}"),
        }
    }
}

impl DaySpan {
    /// Days between the resolved date and today, for the past side.
    pub fn past_days(&self, tz: Tz, now: DateTime<Utc>) -> u32 {
        match self {
            DaySpan::Days(n) => *n,
            DaySpan::Anchor(anchor) => {
                let today = now.with_timezone(&tz).date_naive();
                clamp_days((today - anchor.resolve(today)).num_days())
            }
        }
    }

    /// Days between today and the resolved date, for the future side.
    pub fn next_days(&self, tz: Tz, now: DateTime<Utc>) -> u32 {
        match self {
            DaySpan::Days(n) => *n,
            DaySpan::Anchor(anchor) => {
                let today = now.with_timezone(&tz).date_naive();
                clamp_days((anchor.resolve(today) - today).num_days())
            }
        }
    }
}

impl Anchor {
    /// First (or last) day of the anchored period.
    fn resolve(&self, today: NaiveDate) -> NaiveDate {
        let start = match self.period {
            Period::Week => {
                let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
                monday + Duration::weeks(i64::from(self.offset))
            }
            Period::Month => shift_months(first_of_month(today, today.month()), self.offset),
            Period::Quarter => {
                let month = (today.month() - 1) / 3 * 3 + 1;
                shift_months(first_of_month(today, month), self.offset * 3)
            }
            Period::Halfyear => {
                let month = (today.month() - 1) / 6 * 6 + 1;
                shift_months(first_of_month(today, month), self.offset * 6)
            }
            Period::Year => shift_months(first_of_month(today, 1), self.offset * 12),
        };

        match self.edge {
            Edge::Start => start,
            Edge::End => {
                let next_start = match self.period {
                    Period::Week => start + Duration::weeks(1),
                    Period::Month => shift_months(start, 1),
                    Period::Quarter => shift_months(start, 3),
                    Period::Halfyear => shift_months(start, 6),
                    Period::Year => shift_months(start, 12),
                };
                next_start - Duration::days(1)
            }
        }
    }
}

fn first_of_month(today: NaiveDate, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(today.year(), month, 1).unwrap_or(today)
}

fn shift_months(date: NaiveDate, months: i32) -> NaiveDate {
    let shifted = if months >= 0 {
        date.checked_add_months(Months::new(months.unsigned_abs()))
    } else {
        date.checked_sub_months(Months::new(months.unsigned_abs()))
    };
    shifted.unwrap_or(date)
}

fn clamp_days(days: i64) -> u32 {
    u32::try_from(days.max(0)).unwrap_or(u32::MAX)
}
