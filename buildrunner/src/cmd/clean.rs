use crate::cache::CacheStore;
use crate::config::GlobalConfig;
use crate::errors::FailureKind;
use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;

/// Remove cache archives from the caches root.
#[derive(Debug, Parser)]
pub(crate) struct Clean {
    /// Path to the global config file. Defaults to ~/.buildrunner.toml when
    /// present.
    #[clap(short = 'c', long = "global-config")]
    global_config: Option<PathBuf>,
}

impl Clean {
    pub(super) async fn run(&self) -> Result<()> {
        let config = GlobalConfig::load(self.global_config.as_deref())
            .context(FailureKind::Config)?;
        let store = CacheStore::new(config.caches_root());
        let removed = store.wipe().context("Unable to clean the cache")?;
        info!(
            "Removed {} entries from '{}'",
            removed,
            config.caches_root().display()
        );
        Ok(())
    }
}
