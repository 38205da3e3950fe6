pub mod clean;
pub mod init;
pub mod start;
pub mod status;
pub mod stop;
pub mod sync;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use calmirror_core::config::MirrorConfig;
use calmirror_core::lock::FileLock;
use calmirror_core::remote::ProviderStore;
use calmirror_core::sync::Synchronizer;

/// Everything a command needs, built from the config file.
pub struct Engine {
    pub config: MirrorConfig,
    pub synchronizer: Arc<Synchronizer>,
    pub lock: FileLock,
}

impl Engine {
    pub fn load(config_path: &Path) -> Result<Self> {
        let config = MirrorConfig::load(config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;
        let store = ProviderStore::from_params(&config.store.provider, &config.store.params);
        let properties = config.properties()?;
        let lock = config.lock()?;
        let synchronizer = Arc::new(Synchronizer::new(Arc::new(store), Arc::new(properties)));

        Ok(Engine {
            config,
            synchronizer,
            lock,
        })
    }
}
