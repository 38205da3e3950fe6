//! Engine state persisted in the property store.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::MirrorResult;
use crate::properties::PropertyStore;

const SYNC_PAIRS_KEY: &str = "syncPairs";
const STOPPED_KEY: &str = "stopped";

/// Source and target calendar ids mirrored by one pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncPair {
    pub source: String,
    pub target: String,
}

impl SyncPair {
    pub fn new(source: &str, target: &str) -> Self {
        SyncPair {
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    fn watermark_key(&self) -> String {
        format!("watermark:{}>{}", self.source, self.target)
    }
}

#[derive(Clone)]
pub struct SyncState {
    properties: Arc<dyn PropertyStore>,
}

impl SyncState {
    pub fn new(properties: Arc<dyn PropertyStore>) -> Self {
        SyncState { properties }
    }

    /// Instant the last successful pass for this pair started at.
    pub fn watermark(&self, pair: &SyncPair) -> MirrorResult<Option<DateTime<Utc>>> {
        let key = pair.watermark_key();
        let Some(value) = self.properties.get(&key)? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&value) {
            Ok(dt) => Ok(Some(dt.with_timezone(&Utc))),
            Err(e) => {
                warn!(key = %key, value = %value, "Ignoring unreadable watermark: {}", e);
                Ok(None)
            }
        }
    }

    pub fn set_watermark(&self, pair: &SyncPair, at: DateTime<Utc>) -> MirrorResult<()> {
        self.properties.set(
            &pair.watermark_key(),
            &at.to_rfc3339_opts(SecondsFormat::Millis, true),
        )
    }

    pub fn clear_watermark(&self, pair: &SyncPair) -> MirrorResult<()> {
        self.properties.delete(&pair.watermark_key())
    }

    pub fn registered_pairs(&self) -> MirrorResult<Vec<SyncPair>> {
        match self.properties.get(SYNC_PAIRS_KEY)? {
            Some(value) => Ok(serde_json::from_str(&value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Record a pair for cleanup. Registering twice is a no-op.
    pub fn register_pair(&self, pair: &SyncPair) -> MirrorResult<()> {
        let mut pairs = self.registered_pairs()?;
        if pairs.contains(pair) {
            return Ok(());
        }
        pairs.push(pair.clone());
        self.properties.set(SYNC_PAIRS_KEY, &serde_json::to_string(&pairs)?)
    }

    pub fn clear_registry(&self) -> MirrorResult<()> {
        self.properties.delete(SYNC_PAIRS_KEY)
    }

    pub fn is_stopped(&self) -> MirrorResult<bool> {
        Ok(self.properties.get(STOPPED_KEY)?.as_deref() == Some("true"))
    }

    pub fn set_stopped(&self, stopped: bool) -> MirrorResult<()> {
        if stopped {
            self.properties.set(STOPPED_KEY, "true")
        } else {
            self.properties.delete(STOPPED_KEY)
        }
    }
}
