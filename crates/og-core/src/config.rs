//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{EmulatorError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub debug: DebugConfig,
    pub jit: JitConfig,
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let path = Self::config_path().ok_or_else(|| {
            EmulatorError::Config("no configuration directory available".to_string())
        })?;
        Self::load_from(&path)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&text).map_err(|e| EmulatorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().ok_or_else(|| {
            EmulatorError::Config("no configuration directory available".to_string())
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| EmulatorError::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("oxidized-gekko").join("config.toml"))
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let jit = &self.jit;
        if jit.code_size < JitConfig::MIN_REGION_SIZE {
            return Err(EmulatorError::Config(format!(
                "jit.code_size {} is below the minimum of {}",
                jit.code_size,
                JitConfig::MIN_REGION_SIZE
            )));
        }
        if jit.far_code_size < JitConfig::MIN_REGION_SIZE {
            return Err(EmulatorError::Config(format!(
                "jit.far_code_size {} is below the minimum of {}",
                jit.far_code_size,
                JitConfig::MIN_REGION_SIZE
            )));
        }
        if jit.max_block_instructions == 0 {
            return Err(EmulatorError::Config(
                "jit.max_block_instructions must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&jit.clear_threshold) || jit.clear_threshold == 0.0 {
            return Err(EmulatorError::Config(format!(
                "jit.clear_threshold {} must be in (0, 1]",
                jit.clear_threshold
            )));
        }
        Ok(())
    }
}

/// Debug configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub log_to_file: bool,
    pub log_path: PathBuf,
    /// Log a guest/host listing of every block as it is translated
    pub dump_blocks: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_to_file: false,
            log_path: PathBuf::from("oxidized-gekko.log"),
            dump_blocks: false,
        }
    }
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Which translator backend executes guest code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuBackend {
    /// Emit host operations with native memory access and block linking
    #[default]
    Recompiler,
    /// Emit callback descriptors; no linking, no fastmem
    CachedInterpreter,
}

/// Translation cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    pub backend: CpuBackend,
    /// Size in bytes of the near (block code) region
    pub code_size: usize,
    /// Size in bytes of the far (trampoline) region
    pub far_code_size: usize,
    /// Access guest memory directly and patch faulting sites
    pub fastmem: bool,
    /// Guest MMU emulation; forces translated slow-path accesses
    pub mmu: bool,
    /// Patch block exits to jump straight into translated successors
    pub block_linking: bool,
    /// Flush the whole cache before every translation
    pub no_block_cache: bool,
    pub max_block_instructions: usize,
    /// Occupancy fraction at which the whole cache is flushed before translating
    pub clear_threshold: f64,
}

impl JitConfig {
    pub const MIN_REGION_SIZE: usize = 1024;
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            backend: CpuBackend::Recompiler,
            code_size: 16 * 1024 * 1024,
            far_code_size: 4 * 1024 * 1024,
            fastmem: true,
            mmu: false,
            block_linking: true,
            no_block_cache: false,
            max_block_instructions: 64,
            clear_threshold: 0.9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.jit.backend, CpuBackend::Recompiler);
        assert!(config.jit.fastmem);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [jit]
            backend = "cached_interpreter"
            no_block_cache = true
            "#,
        )
        .unwrap();
        assert_eq!(config.jit.backend, CpuBackend::CachedInterpreter);
        assert!(config.jit.no_block_cache);
        assert_eq!(config.jit.code_size, JitConfig::default().code_size);
        assert_eq!(config.debug.log_level, LogLevel::Info);
    }

    #[test]
    fn test_validate_rejects_tiny_region() {
        let mut config = Config::default();
        config.jit.code_size = 16;
        assert!(matches!(config.validate(), Err(EmulatorError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = Config::default();
        config.jit.clear_threshold = 1.5;
        assert!(config.validate().is_err());
        config.jit.clear_threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let mut config = Config::default();
        config.jit.mmu = true;
        config.debug.log_level = LogLevel::Trace;
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert!(parsed.jit.mmu);
        assert_eq!(parsed.debug.log_level, LogLevel::Trace);
    }
}
