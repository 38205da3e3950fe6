//! Reconciliation of desired against existing target events.

mod event_diff;
mod reconcile;

pub use event_diff::{DiffKind, EventDiff};
pub use reconcile::ReconcilePlan;
