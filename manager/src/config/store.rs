//! Configuration store

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::schedule::ScheduleConfig;
use crate::config::schema::FullConfig;
use crate::errors::ManagerError;
use crate::filesys::file::File;
use crate::models::definition::{definitions_from_config, AgentDefinition};

/// A base image replaced by a newer tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageUpdate {
    pub from: String,
    pub to: String,
}

/// What the engine reads at the start of a cycle
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub schedule: Option<ScheduleConfig>,
    pub definitions: Vec<AgentDefinition>,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self) -> Result<LoadedConfig, ManagerError>;

    /// Rewrite every base image reference named by `updates`
    async fn persist(&self, updates: &[ImageUpdate]) -> Result<(), ManagerError>;
}

/// `runners_config.yaml` on disk
#[derive(Debug, Clone)]
pub struct YamlConfigStore {
    file: File,
}

impl YamlConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: File::new(path),
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub async fn read_full(&self) -> Result<FullConfig, ManagerError> {
        if !self.file.exists().await {
            return Err(ManagerError::ConfigError(format!(
                "Configuration file not found: {}",
                self.file.path().display()
            )));
        }
        self.file.read_yaml().await
    }
}

#[async_trait]
impl ConfigStore for YamlConfigStore {
    async fn load(&self) -> Result<LoadedConfig, ManagerError> {
        let config = self.read_full().await?;
        let schedule = config
            .scheduler
            .as_ref()
            .map(ScheduleConfig::from_settings)
            .transpose()?;
        let definitions = definitions_from_config(&config)?;

        debug!(
            "Loaded {} runner groups from {}",
            definitions.len(),
            self.file.path().display()
        );
        Ok(LoadedConfig {
            schedule,
            definitions,
        })
    }

    async fn persist(&self, updates: &[ImageUpdate]) -> Result<(), ManagerError> {
        let mut config = self.read_full().await?;
        let mut changed = 0;

        for update in updates {
            if config.runners_defaults.base_image == update.from {
                config.runners_defaults.base_image = update.to.clone();
                changed += 1;
            }
            for runner in &mut config.runners {
                if runner.base_image.as_deref() == Some(update.from.as_str()) {
                    runner.base_image = Some(update.to.clone());
                    changed += 1;
                }
            }
        }

        if changed == 0 {
            return Err(ManagerError::ConfigError(format!(
                "No base_image reference to update in {}",
                self.file.path().display()
            )));
        }

        self.file.write_yaml(&config).await?;
        info!(
            "Persisted {} base image reference(s) to {}",
            changed,
            self.file.path().display()
        );
        Ok(())
    }
}
