use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use super::AppConfig;
use crate::error::{Result, SessionError};

/// Configuration store backed by a TOML file
///
/// Uses `ArcSwap` so readers never contend with `reload()`.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Load and validate a configuration file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with(path, |_| {}).await
    }

    /// Load a configuration file, letting `overrides` adjust it before validation
    ///
    /// Used for command line flags that fill in values the file leaves out.
    pub async fn load_with<F>(path: impl AsRef<Path>, overrides: F) -> Result<Self>
    where
        F: FnOnce(&mut AppConfig),
    {
        let path = path.as_ref().to_path_buf();
        let mut config = Self::parse_file(&path).await?;
        overrides(&mut config);
        config.validate()?;
        info!("Configuration loaded from {}", path.display());

        Ok(Self {
            path: Some(path),
            cache: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    /// Wrap an in-memory configuration (not validated until used)
    pub fn from_config(config: AppConfig) -> Self {
        Self {
            path: None,
            cache: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    async fn parse_file(path: &Path) -> Result<AppConfig> {
        let text = tokio::fs::read_to_string(path).await?;
        toml::from_str(&text)
            .map_err(|e| SessionError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Re-read the backing file; the cached value is kept on error
    pub async fn reload(&self) -> Result<Arc<AppConfig>> {
        self.reload_with(|_| {}).await
    }

    /// Re-read the backing file, applying `overrides` the same way `load_with` does
    pub async fn reload_with<F>(&self, overrides: F) -> Result<Arc<AppConfig>>
    where
        F: FnOnce(&mut AppConfig),
    {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| SessionError::Config("No configuration file to reload".into()))?;
        let mut config = Self::parse_file(path).await?;
        overrides(&mut config);
        config.validate()?;
        self.cache.store(Arc::new(config));
        info!("Configuration reloaded from {}", path.display());
        Ok(self.get())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
