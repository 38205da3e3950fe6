//! Create/delete plan between desired and existing target events.

use std::collections::{HashMap, HashSet};

use crate::diff::EventDiff;
use crate::event::Event;
use crate::signature::signature;

/// Mutations needed to turn `existing` into `desired`.
///
/// Events are compared by signature only, so a changed event shows up as one
/// delete plus one create. Nothing is ever updated in place.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// Existing events to delete.
    pub obsolete: Vec<EventDiff>,
    /// Desired events to create.
    pub missing: Vec<EventDiff>,
    /// Desired events already present in the target.
    pub unchanged: usize,
}

impl ReconcilePlan {
    pub fn compute(desired: Vec<Event>, existing: Vec<Event>) -> Self {
        let desired: Vec<(String, Event)> = desired
            .into_iter()
            .filter(|e| !e.is_cancelled())
            .map(|e| (signature(&e), e))
            .collect();
        let existing: Vec<(String, Event)> = existing
            .into_iter()
            .map(|e| (signature(&e), e))
            .collect();

        // Lowest id (then earliest position) wins among equal signatures
        let mut keepers: HashMap<&str, usize> = HashMap::new();
        for (index, (sig, event)) in existing.iter().enumerate() {
            keepers
                .entry(sig.as_str())
                .and_modify(|kept| {
                    if event.id_str() < existing[*kept].1.id_str() {
                        *kept = index;
                    }
                })
                .or_insert(index);
        }

        let desired_sigs: HashSet<&str> = desired.iter().map(|(sig, _)| sig.as_str()).collect();
        let obsolete_indices: Vec<usize> = existing
            .iter()
            .enumerate()
            .filter(|(index, (sig, _))| {
                keepers.get(sig.as_str()) != Some(index) || !desired_sigs.contains(sig.as_str())
            })
            .map(|(index, _)| index)
            .collect();

        let mut seen = HashSet::new();
        let mut unchanged = 0;
        let mut missing_indices = Vec::new();
        for (index, (sig, _)) in desired.iter().enumerate() {
            if !seen.insert(sig.as_str()) {
                continue;
            }
            if keepers.contains_key(sig.as_str()) {
                unchanged += 1;
            } else {
                missing_indices.push(index);
            }
        }

        let obsolete = take_indices(existing, &obsolete_indices)
            .into_iter()
            .map(EventDiff::remove)
            .collect();
        let missing = take_indices(desired, &missing_indices)
            .into_iter()
            .map(EventDiff::insert)
            .collect();

        ReconcilePlan {
            obsolete,
            missing,
            unchanged,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.obsolete.is_empty() && self.missing.is_empty()
    }

    /// Deletes first, then creates.
    pub fn diffs(&self) -> impl Iterator<Item = &EventDiff> {
        self.obsolete.iter().chain(self.missing.iter())
    }
}

fn take_indices(items: Vec<(String, Event)>, indices: &[usize]) -> Vec<Event> {
    let wanted: HashSet<usize> = indices.iter().copied().collect();
    items
        .into_iter()
        .enumerate()
        .filter(|(index, _)| wanted.contains(index))
        .map(|(_, (_, event))| event)
        .collect()
}
