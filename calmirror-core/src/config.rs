//! calmirror configuration at ~/.config/calmirror/config.toml

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{MirrorError, MirrorResult};
use crate::lock::FileLock;
use crate::properties::FileProperties;
use crate::retry::RetryPolicy;
use crate::run_loop::RunLoopConfig;
use crate::sync::SyncJob;
use crate::transform::RuleTransform;
use crate::window::DaySpan;

const DEFAULT_CONFIG: &str = r#"# calmirror configuration

# Calendar store. Every key besides `provider` is passed to the
# calmirror-provider-<provider> executable as-is.
[store]
provider = "google"
# account = "me@example.com"

# Run loop timings
[run]
sync_interval = "1m"
max_execution_time = "6m"
lock_timeout = "30m"

# One [[sync]] table per mirrored calendar pair.
[[sync]]
source = "Work"
target = "Personal"
# Whole days, or an anchor such as "start_of_month" or "end_of_week+1"
past_days = 7
next_days = 28

# What mirrored events look like. Without this table every copy is "Busy".
[sync.transform]
summary = "Busy"
# copy = ["location"]
# skip_free = true
"#;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorConfig {
    pub store: StoreConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default, rename = "sync")]
    pub pairs: Vec<PairConfig>,

    /// Where sync state is persisted (default: data dir)
    pub properties_path: Option<PathBuf>,

    /// Cross-process pass lock file (default: runtime dir)
    pub lock_path: Option<PathBuf>,
}

/// Calendar store provider and its parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub provider: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    #[serde(deserialize_with = "human_duration")]
    pub sync_interval: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub max_execution_time: Duration,
    #[serde(deserialize_with = "human_duration")]
    pub lock_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        let defaults = RunLoopConfig::default();
        RunConfig {
            sync_interval: defaults.sync_interval,
            max_execution_time: defaults.max_execution_time,
            lock_timeout: defaults.lock_timeout,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairConfig {
    pub source: String,
    pub target: String,
    #[serde(default = "default_past_days")]
    pub past_days: DaySpan,
    #[serde(default = "default_next_days")]
    pub next_days: DaySpan,
    #[serde(default)]
    pub transform: RuleTransform,
}

fn default_past_days() -> DaySpan {
    DaySpan::Days(7)
}

fn default_next_days() -> DaySpan {
    DaySpan::Days(28)
}

fn human_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

impl MirrorConfig {
    pub fn config_path() -> MirrorResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| MirrorError::Config("Could not determine config directory".into()))?
            .join("calmirror");

        Ok(config_dir.join("config.toml"))
    }

    /// Load and validate the config file at `path`.
    pub fn load(path: &Path) -> MirrorResult<Self> {
        if !path.exists() {
            return Err(MirrorError::Config(format!(
                "No config file at {}, run `calmirror init` first",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> MirrorResult<Self> {
        let config: MirrorConfig =
            toml::from_str(content).map_err(|e| MirrorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> MirrorResult<()> {
        if self.store.provider.trim().is_empty() {
            return Err(MirrorError::Config("store.provider must not be empty".into()));
        }
        if self.pairs.is_empty() {
            return Err(MirrorError::Config("At least one [[sync]] pair is required".into()));
        }
        for pair in &self.pairs {
            if pair.source == pair.target {
                return Err(MirrorError::Config(format!(
                    "Calendar \"{}\" cannot be mirrored into itself",
                    pair.source
                )));
            }
        }
        if self.run.sync_interval.is_zero() {
            return Err(MirrorError::Config("run.sync_interval must be positive".into()));
        }
        Ok(())
    }

    /// Write the commented default config, unless a file already exists.
    ///
    /// Returns whether a file was written.
    pub fn create_default_config(path: &Path) -> MirrorResult<bool> {
        if path.exists() {
            return Ok(false);
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, DEFAULT_CONFIG)?;
        Ok(true)
    }

    pub fn jobs(&self) -> Vec<SyncJob> {
        self.pairs
            .iter()
            .map(|pair| SyncJob {
                source: pair.source.clone(),
                target: pair.target.clone(),
                past: pair.past_days,
                next: pair.next_days,
                transform: Arc::new(pair.transform.clone()),
            })
            .collect()
    }

    pub fn run_loop_config(&self) -> RunLoopConfig {
        RunLoopConfig {
            sync_interval: self.run.sync_interval,
            max_execution_time: self.run.max_execution_time,
            lock_timeout: self.run.lock_timeout,
            reschedule_backoff: RetryPolicy {
                max_delay: self.run.sync_interval.max(Duration::from_secs(1)),
                ..RunLoopConfig::default().reschedule_backoff
            },
        }
    }

    pub fn properties(&self) -> MirrorResult<FileProperties> {
        let path = match &self.properties_path {
            Some(path) => path.clone(),
            None => FileProperties::default_path()?,
        };
        Ok(FileProperties::new(path))
    }

    pub fn lock(&self) -> MirrorResult<FileLock> {
        let path = match &self.lock_path {
            Some(path) => path.clone(),
            None => FileLock::default_path()?,
        };
        Ok(FileLock::new(path))
    }
}
