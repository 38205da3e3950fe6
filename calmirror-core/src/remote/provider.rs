//! Provider subprocess calls.
//!
//! A provider is any executable named `calmirror-provider-<name>` on the
//! PATH that answers the JSON protocol in [`super::protocol`]. Providers
//! manage their own credentials; the engine only forwards the
//! provider-specific settings from the configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;

use crate::error::{MirrorError, MirrorResult};
use crate::event::Event;
use crate::remote::protocol::{
    Command, EventPage, GetEvent, InsertEvent, ListCalendars, ListEvents, ListInstances, PatchEvent,
    ProviderCommand, ProviderConfig, RemoveEvent, Request, Response,
};
use crate::store::{CalendarInfo, CalendarStore, EventQuery};

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct Provider(String);

impl Provider {
    pub fn from_name(name: &str) -> Self {
        Provider(name.to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn binary_name(&self) -> String {
        format!("calmirror-provider-{}", self.0)
    }

    fn binary_path(&self) -> MirrorResult<PathBuf> {
        which::which(self.binary_name())
            .map_err(|_| MirrorError::ProviderNotInstalled(self.binary_name()))
    }

    /// Call a typed provider command, bounded by the provider timeout.
    pub async fn call<C: ProviderCommand>(&self, cmd: C) -> MirrorResult<C::Response> {
        timeout(PROVIDER_TIMEOUT, self.call_raw(C::command(), cmd))
            .await
            .map_err(|_| MirrorError::StoreTimeout(PROVIDER_TIMEOUT.as_secs()))?
    }

    async fn call_raw<P: Serialize, R: DeserializeOwned>(
        &self,
        command: Command,
        params: P,
    ) -> MirrorResult<R> {
        let request = Request {
            command,
            params: serde_json::to_value(params)?,
        };
        let request_json = serde_json::to_string(&request)?;

        let binary_path = self.binary_path()?;

        let mut child = TokioCommand::new(&binary_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                MirrorError::Store(format!("Failed to spawn {}: {}", binary_path.display(), e))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| MirrorError::Store("Provider stdin unavailable".into()))?;
        stdin
            .write_all(format!("{request_json}\n").as_bytes())
            .await?;
        drop(stdin);

        let output = child.wait_with_output().await?;

        if !output.status.success() {
            return Err(MirrorError::Store(format!(
                "Provider exited with status: {}",
                output.status.code().unwrap_or(-1)
            )));
        }

        let response_str = String::from_utf8_lossy(&output.stdout);
        if response_str.trim().is_empty() {
            return Err(MirrorError::Store("Provider returned no response".into()));
        }

        let response: Response<R> = serde_json::from_str(&response_str)
            .map_err(|e| MirrorError::Store(format!("Failed to parse response: {e}")))?;

        match response {
            Response::Success { data } => Ok(data),
            Response::Error { error } => Err(MirrorError::Store(error)),
        }
    }
}

/// [`CalendarStore`] that forwards every call to a provider binary.
#[derive(Clone, Debug)]
pub struct ProviderStore {
    provider: Provider,
    config: ProviderConfig,
}

impl ProviderStore {
    pub fn new(provider: Provider, config: ProviderConfig) -> Self {
        ProviderStore { provider, config }
    }

    /// Build from the `[store]` section of the configuration.
    pub fn from_params(provider: &str, params: &BTreeMap<String, toml::Value>) -> Self {
        let config = params
            .iter()
            .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|v| (k.clone(), v)))
            .collect();
        ProviderStore::new(Provider::from_name(provider), config)
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Follow `next_page_token` until the listing is exhausted.
    async fn collect_pages<C, F>(&self, mut request: F) -> MirrorResult<Vec<Event>>
    where
        C: ProviderCommand<Response = EventPage>,
        F: FnMut(Option<String>) -> C,
    {
        let mut events = Vec::new();
        let mut page_token = None;
        loop {
            let page = self.provider.call(request(page_token)).await?;
            events.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl CalendarStore for ProviderStore {
    async fn list_calendars(&self) -> MirrorResult<Vec<CalendarInfo>> {
        self.provider
            .call(ListCalendars {
                provider_config: self.config.clone(),
            })
            .await
    }

    async fn list_events(&self, calendar_id: &str, query: &EventQuery) -> MirrorResult<Vec<Event>> {
        self.collect_pages(|page_token| ListEvents {
            provider_config: self.config.clone(),
            calendar_id: calendar_id.to_string(),
            query: query.clone(),
            page_token,
        })
        .await
    }

    async fn get_event(&self, calendar_id: &str, event_id: &str) -> MirrorResult<Option<Event>> {
        self.provider
            .call(GetEvent {
                provider_config: self.config.clone(),
                calendar_id: calendar_id.to_string(),
                event_id: event_id.to_string(),
            })
            .await
    }

    async fn list_instances(
        &self,
        calendar_id: &str,
        event_id: &str,
        query: &EventQuery,
    ) -> MirrorResult<Vec<Event>> {
        self.collect_pages(|page_token| ListInstances {
            provider_config: self.config.clone(),
            calendar_id: calendar_id.to_string(),
            event_id: event_id.to_string(),
            query: query.clone(),
            page_token,
        })
        .await
    }

    async fn insert_event(&self, calendar_id: &str, event: &Event) -> MirrorResult<Event> {
        self.provider
            .call(InsertEvent {
                provider_config: self.config.clone(),
                calendar_id: calendar_id.to_string(),
                event: event.clone(),
            })
            .await
    }

    async fn patch_event(
        &self,
        calendar_id: &str,
        event_id: &str,
        patch: &serde_json::Value,
    ) -> MirrorResult<Event> {
        self.provider
            .call(PatchEvent {
                provider_config: self.config.clone(),
                calendar_id: calendar_id.to_string(),
                event_id: event_id.to_string(),
                patch: patch.clone(),
            })
            .await
    }

    async fn remove_event(&self, calendar_id: &str, event_id: &str) -> MirrorResult<()> {
        self.provider
            .call(RemoveEvent {
                provider_config: self.config.clone(),
                calendar_id: calendar_id.to_string(),
                event_id: event_id.to_string(),
            })
            .await
    }
}
