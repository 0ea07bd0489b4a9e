//! Configuration management for wsim.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (WSIM_SEED, WSIM_ENGINES, etc.)
//! 2. Project-local config file (`./wsim.toml`)
//! 3. User config file (`~/.config/wsim/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # wsim.toml
//!
//! # Seed for the pseudo-random streams (default: wall clock)
//! seed = 1234
//!
//! # Engines exposed by the simulated device
//! engines = ["RCS", "BCS", "VCS1", "VCS2", "VECS"]
//!
//! # Device timestamp counter frequency
//! timestamp_frequency_hz = 12000000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Engines of the simulated device when nothing is configured.
pub const DEFAULT_ENGINES: &[&str] = &["RCS", "BCS", "VCS1", "VCS2", "VECS"];

/// Default device timestamp frequency (12.5 MHz).
pub const DEFAULT_TIMESTAMP_HZ: u64 = 12_500_000;

/// Default slice mask of the simulated device.
pub const DEFAULT_SLICE_MASK: u64 = 0b11;

/// Default arbitration period for submitted work.
pub const DEFAULT_PREEMPT_US: u32 = 100;

/// wsim configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Seed for the pseudo-random streams.
    /// Falls back to the wall clock when unset.
    pub seed: Option<u64>,

    /// Device timestamp counter frequency in Hz.
    pub timestamp_frequency_hz: Option<u64>,

    /// Physical engine names of the simulated device.
    /// Names ending in digits (`VCS1`) form multi-instance classes (`VCS`).
    pub engines: Option<Vec<String>>,

    /// Full slice mask of the simulated device.
    pub slice_mask: Option<u64>,

    /// Whether the simulated device supports load-balanced virtual engines.
    pub load_balance: Option<bool>,

    /// Arbitration period applied to submitted work unless a workload overrides it.
    pub default_preempt_us: Option<u32>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `wsim.toml`
    /// 3. User config `~/.config/wsim/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        // Environment variables override everything
        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Engine topology, with fallback to [`DEFAULT_ENGINES`].
    pub fn engines(&self) -> Vec<String> {
        self.engines
            .clone()
            .unwrap_or_else(|| DEFAULT_ENGINES.iter().map(|s| s.to_string()).collect())
    }

    pub fn timestamp_frequency_hz(&self) -> u64 {
        self.timestamp_frequency_hz.unwrap_or(DEFAULT_TIMESTAMP_HZ)
    }

    pub fn slice_mask(&self) -> u64 {
        self.slice_mask.unwrap_or(DEFAULT_SLICE_MASK)
    }

    pub fn load_balance(&self) -> bool {
        self.load_balance.unwrap_or(true)
    }

    pub fn default_preempt_us(&self) -> u32 {
        self.default_preempt_us.unwrap_or(DEFAULT_PREEMPT_US)
    }

    /// Load user configuration from ~/.config/wsim/config.toml
    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./wsim.toml
    fn load_local_config() -> Option<Self> {
        Self::load_from_file(Path::new("wsim.toml"))
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.seed.is_some() {
            self.seed = other.seed;
        }
        if other.timestamp_frequency_hz.is_some() {
            self.timestamp_frequency_hz = other.timestamp_frequency_hz;
        }
        if other.engines.is_some() {
            self.engines = other.engines;
        }
        if other.slice_mask.is_some() {
            self.slice_mask = other.slice_mask;
        }
        if other.load_balance.is_some() {
            self.load_balance = other.load_balance;
        }
        if other.default_preempt_us.is_some() {
            self.default_preempt_us = other.default_preempt_us;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("WSIM_SEED") {
            match value.parse() {
                Ok(seed) => {
                    log::info!("Using WSIM_SEED from environment: {}", seed);
                    self.seed = Some(seed);
                }
                Err(_) => log::warn!("Ignoring invalid WSIM_SEED '{}'", value),
            }
        }
        if let Some(value) = lookup("WSIM_TIMESTAMP_HZ") {
            match value.parse() {
                Ok(hz) if hz > 0 => {
                    log::info!("Using WSIM_TIMESTAMP_HZ from environment: {}", hz);
                    self.timestamp_frequency_hz = Some(hz);
                }
                _ => log::warn!("Ignoring invalid WSIM_TIMESTAMP_HZ '{}'", value),
            }
        }
        if let Some(value) = lookup("WSIM_ENGINES") {
            let engines: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if engines.is_empty() {
                log::warn!("Ignoring empty WSIM_ENGINES");
            } else {
                log::info!("Using WSIM_ENGINES from environment: {:?}", engines);
                self.engines = Some(engines);
            }
        }
        if let Some(value) = lookup("WSIM_PREEMPT_US") {
            match value.parse() {
                Ok(us) => {
                    log::info!("Using WSIM_PREEMPT_US from environment: {}", us);
                    self.default_preempt_us = Some(us);
                }
                Err(_) => log::warn!("Ignoring invalid WSIM_PREEMPT_US '{}'", value),
            }
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("wsim").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# wsim configuration
# Place this file at ~/.config/wsim/config.toml or ./wsim.toml

# Seed for duration and buffer size randomization (default: wall clock)
# seed = 1234

# Engines of the simulated device
engines = ["RCS", "BCS", "VCS1", "VCS2", "VECS"]

# Device timestamp frequency
timestamp_frequency_hz = 12500000

# Full slice mask and load balancing support
slice_mask = 3
load_balance = true

# Arbitration period for submitted work, in microseconds
default_preempt_us = 100
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.engines(), DEFAULT_ENGINES);
        assert_eq!(config.timestamp_frequency_hz(), DEFAULT_TIMESTAMP_HZ);
        assert_eq!(config.default_preempt_us(), 100);
        assert!(config.load_balance());
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config {
            seed: Some(1),
            engines: Some(vec!["RCS".into()]),
            ..Default::default()
        };

        let overlay = Config {
            seed: None,
            engines: Some(vec!["BCS".into(), "VCS1".into()]),
            default_preempt_us: Some(0),
            ..Default::default()
        };

        base.merge(overlay);

        // seed unchanged (overlay was None)
        assert_eq!(base.seed, Some(1));
        assert_eq!(base.engines(), ["BCS", "VCS1"]);
        assert_eq!(base.default_preempt_us(), 0);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            "WSIM_SEED" => Some("42".into()),
            "WSIM_ENGINES" => Some("RCS, VCS1,VCS2".into()),
            "WSIM_TIMESTAMP_HZ" => Some("0".into()),
            _ => None,
        });
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.engines(), ["RCS", "VCS1", "VCS2"]);
        // Zero frequency is ignored
        assert_eq!(config.timestamp_frequency_hz, None);
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = Config::sample_config();
        let config: Config = toml::from_str(&sample).expect("Sample config should parse");
        assert_eq!(config.slice_mask(), 3);
    }

    #[test]
    fn test_config_file_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wsim.toml");
        std::fs::write(&path, "seed = 7\ndefault_preempt_us = 250\n").unwrap();
        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.default_preempt_us(), 250);

        std::fs::write(&path, "seed = \"x\"").unwrap();
        assert!(Config::load_from_file(&path).is_none());
    }
}
