//! Core of calmirror: one-way mirroring of a source calendar into a target
//! calendar.
//!
//! A pass fetches the source events inside a moving window, expands
//! recurring series to that window, transforms every event into the shape
//! it should have in the target, and reconciles the result against the
//! target's linked events by canonical signature. The [`run_loop`] keeps
//! passes going on a schedule until a durable stop flag is set.
//!
//! Calendars are reached through [`store::CalendarStore`]; the
//! [`remote::ProviderStore`] implementation talks to a provider executable
//! over JSON on stdin/stdout.

pub mod config;
pub mod diff;
pub mod error;
pub mod event;
pub mod expand;
pub mod lock;
pub mod properties;
pub mod recurrence;
pub mod remote;
pub mod retry;
pub mod run_loop;
pub mod scheduler;
pub mod signature;
pub mod state;
pub mod store;
pub mod sync;
pub mod transform;
pub mod window;

pub use error::{MirrorError, MirrorResult};
pub use event::Event;
