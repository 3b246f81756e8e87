//! Configuration file support for Bolus.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/bolus/config.toml`.

use crate::types::InsulinKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub therapy: TherapyConfig,

    #[serde(default)]
    pub risk: RiskConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Therapy parameters configuration
///
/// These seed ad-hoc dose calculations; records fetched from the care
/// backend carry their own parameters and are never overridden by this
/// section.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TherapyConfig {
    #[serde(default = "default_target_glucose")]
    pub target_glucose: f64,

    #[serde(default = "default_insulin_ratio")]
    pub insulin_ratio: f64,

    #[serde(default = "default_correction_factor")]
    pub correction_factor: f64,

    #[serde(default = "default_timer_duration_minutes")]
    pub timer_duration_minutes: u32,

    #[serde(default = "default_insulin_kind")]
    pub insulin_kind: InsulinKind,
}

impl Default for TherapyConfig {
    fn default() -> Self {
        Self {
            target_glucose: default_target_glucose(),
            insulin_ratio: default_insulin_ratio(),
            correction_factor: default_correction_factor(),
            timer_duration_minutes: default_timer_duration_minutes(),
            insulin_kind: default_insulin_kind(),
        }
    }
}

/// Risk assessment configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_night_hypo_threshold")]
    pub night_hypo_threshold: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            night_hypo_threshold: default_night_hypo_threshold(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        let home = std::env::var("HOME")
            .expect("HOME environment variable not set");
        PathBuf::from(home).join(".local/share")
    });
    base.join("bolus")
}

fn default_target_glucose() -> f64 {
    100.0
}

fn default_insulin_ratio() -> f64 {
    10.0
}

fn default_correction_factor() -> f64 {
    50.0
}

fn default_timer_duration_minutes() -> u32 {
    180
}

fn default_insulin_kind() -> InsulinKind {
    InsulinKind::Rapid
}

fn default_night_hypo_threshold() -> f64 {
    70.0
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            let home = std::env::var("HOME")
                .expect("HOME environment variable not set");
            PathBuf::from(home).join(".config")
        });
        base.join("bolus").join("config.toml")
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to(&config_path)
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject therapy parameters the dose math cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.therapy.target_glucose <= 0.0 {
            return Err(Error::Config(format!(
                "target_glucose must be positive, got {}",
                self.therapy.target_glucose
            )));
        }
        if self.therapy.insulin_ratio <= 0.0 {
            return Err(Error::Config(format!(
                "insulin_ratio must be positive, got {}",
                self.therapy.insulin_ratio
            )));
        }
        if self.therapy.correction_factor <= 0.0 {
            return Err(Error::Config(format!(
                "correction_factor must be positive, got {}",
                self.therapy.correction_factor
            )));
        }
        if self.risk.night_hypo_threshold <= 0.0 {
            return Err(Error::Config(format!(
                "night_hypo_threshold must be positive, got {}",
                self.risk.night_hypo_threshold
            )));
        }
        Ok(())
    }
}
