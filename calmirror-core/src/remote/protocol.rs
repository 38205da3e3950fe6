//! JSON protocol spoken with provider binaries over stdin/stdout.
//!
//! One request per process: the engine writes a single JSON line
//! `{"command": ..., "params": {...}}` and reads a single response
//! `{"status": "success", "data": ...}` or `{"status": "error", "error": ...}`.
//! Provider-specific settings from the configuration are flattened into
//! every request's params.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::event::Event;
use crate::store::{CalendarInfo, EventQuery};

pub type ProviderConfig = serde_json::Map<String, serde_json::Value>;

pub trait ProviderCommand: Serialize {
    type Response: DeserializeOwned;
    fn command() -> Command;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    ListCalendars,
    ListEvents,
    GetEvent,
    ListInstances,
    InsertEvent,
    PatchEvent,
    RemoveEvent,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response<T> {
    Success { data: T },
    Error { error: String },
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    #[serde(default)]
    pub items: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListCalendars {
    #[serde(flatten)]
    pub provider_config: ProviderConfig,
}

impl ProviderCommand for ListCalendars {
    type Response = Vec<CalendarInfo>;
    fn command() -> Command {
        Command::ListCalendars
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListEvents {
    #[serde(flatten)]
    pub provider_config: ProviderConfig,
    pub calendar_id: String,
    #[serde(flatten)]
    pub query: EventQuery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
}

impl ProviderCommand for ListEvents {
    type Response = EventPage;
    fn command() -> Command {
        Command::ListEvents
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetEvent {
    #[serde(flatten)]
    pub provider_config: ProviderConfig,
    pub calendar_id: String,
    pub event_id: String,
}

impl ProviderCommand for GetEvent {
    /// `null` when the event does not exist
    type Response = Option<Event>;
    fn command() -> Command {
        Command::GetEvent
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListInstances {
    #[serde(flatten)]
    pub provider_config: ProviderConfig,
    pub calendar_id: String,
    pub event_id: String,
    #[serde(flatten)]
    pub query: EventQuery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
}

impl ProviderCommand for ListInstances {
    type Response = EventPage;
    fn command() -> Command {
        Command::ListInstances
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InsertEvent {
    #[serde(flatten)]
    pub provider_config: ProviderConfig,
    pub calendar_id: String,
    pub event: Event,
}

impl ProviderCommand for InsertEvent {
    type Response = Event;
    fn command() -> Command {
        Command::InsertEvent
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PatchEvent {
    #[serde(flatten)]
    pub provider_config: ProviderConfig,
    pub calendar_id: String,
    pub event_id: String,
    pub patch: serde_json::Value,
}

impl ProviderCommand for PatchEvent {
    type Response = Event;
    fn command() -> Command {
        Command::PatchEvent
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveEvent {
    #[serde(flatten)]
    pub provider_config: ProviderConfig,
    pub calendar_id: String,
    pub event_id: String,
}

impl ProviderCommand for RemoveEvent {
    type Response = ();
    fn command() -> Command {
        Command::RemoveEvent
    }
}
