use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Store mutation a diff turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    /// Desired event with no existing match
    Insert,
    /// Existing event nothing desired matches
    Remove,
}

impl DiffKind {
    pub fn symbol(&self) -> char {
        match self {
            DiffKind::Insert => '+',
            DiffKind::Remove => '-',
        }
    }
}

impl fmt::Display for DiffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// One mutation against the target calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDiff {
    pub kind: DiffKind,
    pub event: Event,
}

impl fmt::Display for EventDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.event.start {
            Some(start) => write!(f, "{} {} ({})", self.kind, self.event.title(), start),
            None => write!(f, "{} {}", self.kind, self.event.title()),
        }
    }
}

impl EventDiff {
    pub fn insert(event: Event) -> Self {
        EventDiff {
            kind: DiffKind::Insert,
            event,
        }
    }

    pub fn remove(event: Event) -> Self {
        EventDiff {
            kind: DiffKind::Remove,
            event,
        }
    }
}
