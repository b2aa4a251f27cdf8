//! Configuration management for Crucible

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use crate::backend::cpu::DEFAULT_BLOCK_SIZE;
use crate::error::{CrucibleError, CrucibleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cpu,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Tile edge of the blocked GEMM
    pub block_size: usize,
    /// Worker threads for the CPU backend, 0 uses the global rayon pool
    pub num_threads: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Cpu,
            block_size: DEFAULT_BLOCK_SIZE,
            num_threads: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutogradConfig {
    pub retain_graph: bool,
    pub clear_existing: bool,
    pub warn_on_non_scalar_seed: bool,
}

impl Default for AutogradConfig {
    fn default() -> Self {
        Self {
            retain_graph: false,
            clear_existing: true,
            warn_on_non_scalar_seed: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrucibleConfig {
    pub backend: BackendConfig,
    pub autograd: AutogradConfig,
}

impl CrucibleConfig {
    pub fn validate(&self) -> CrucibleResult<()> {
        if self.backend.block_size == 0 {
            return Err(CrucibleError::ConfigurationError(
                "backend.block_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration manager, optionally backed by a JSON file
pub struct ConfigManager {
    config: Arc<RwLock<CrucibleConfig>>,
    config_file: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(CrucibleConfig::default())),
            config_file: None,
        }
    }

    /// Persist every later update to `path`
    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn load_from_file(&mut self, path: &Path) -> CrucibleResult<()> {
        let content = std::fs::read_to_string(path)?;
        let config: CrucibleConfig = serde_json::from_str(&content)?;
        config.validate()?;

        *self.config.write() = config;
        self.config_file = Some(path.to_path_buf());

        tracing::info!("Configuration loaded from {:?}", path);
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> CrucibleResult<()> {
        let content = serde_json::to_string_pretty(&*self.config.read())?;
        std::fs::write(path, content)?;

        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn get_config(&self) -> CrucibleConfig {
        self.config.read().clone()
    }

    /// Apply `f` to a copy of the configuration and keep it if it validates
    pub fn update_config<F>(&mut self, f: F) -> CrucibleResult<()>
    where
        F: FnOnce(&mut CrucibleConfig),
    {
        let mut updated = self.get_config();
        f(&mut updated);
        updated.validate()?;
        *self.config.write() = updated;

        if let Some(ref path) = self.config_file {
            self.save_to_file(path)?;
        }

        Ok(())
    }

    pub fn set_config(&mut self, config: CrucibleConfig) -> CrucibleResult<()> {
        self.update_config(|current| *current = config)
    }

    /// Back to defaults, no longer tied to a file
    pub fn reset(&mut self) {
        *self.config.write() = CrucibleConfig::default();
        self.config_file = None;
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref CONFIG_MANAGER: RwLock<ConfigManager> = RwLock::new(ConfigManager::new());
}

/// Get the global configuration
pub fn get_config() -> CrucibleConfig {
    CONFIG_MANAGER.read().get_config()
}

/// Update the global configuration
pub fn update_config<F>(f: F) -> CrucibleResult<()>
where
    F: FnOnce(&mut CrucibleConfig),
{
    CONFIG_MANAGER.write().update_config(f)
}

/// Load the global configuration from a JSON file; later updates are saved back to it
pub fn load_config_from_file(path: &Path) -> CrucibleResult<()> {
    CONFIG_MANAGER.write().load_from_file(path)
}

/// Restore the default global configuration and detach it from any file
pub fn reset_config() {
    CONFIG_MANAGER.write().reset();
}

/// Serializes tests that read or write the global configuration
#[cfg(test)]
pub(crate) static GLOBAL_CONFIG_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

pub struct ConfigBuilder {
    config: CrucibleConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CrucibleConfig::default(),
        }
    }

    pub fn backend(mut self, f: impl FnOnce(&mut BackendConfig)) -> Self {
        f(&mut self.config.backend);
        self
    }

    pub fn autograd(mut self, f: impl FnOnce(&mut AutogradConfig)) -> Self {
        f(&mut self.config.autograd);
        self
    }

    pub fn build(self) -> CrucibleResult<CrucibleConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Validate and install as the global configuration
    pub fn apply(self) -> CrucibleResult<()> {
        let config = self.build()?;
        update_config(|current| *current = config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
