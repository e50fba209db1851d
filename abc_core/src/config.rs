//! Configuration file support.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/abc-case/config.toml`.

use crate::dosage::DosageCalculator;
use crate::protocol::{get_default_protocol, ProtocolTable};
use crate::case_number::CaseScope;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub organization: OrganizationConfig,

    #[serde(default)]
    pub allocation: AllocationConfig,

    #[serde(default)]
    pub surgery: SurgeryConfig,

    #[serde(default)]
    pub protocol: ProtocolConfig,
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

/// Tenant codes used in case numbers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrganizationConfig {
    #[serde(default = "default_org_code")]
    pub org_code: String,

    #[serde(default = "default_project_code")]
    pub project_code: String,
}

impl Default for OrganizationConfig {
    fn default() -> Self {
        Self {
            org_code: default_org_code(),
            project_code: default_project_code(),
        }
    }
}

/// Case number allocation parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Attempts before giving up when a number is taken concurrently
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Give each surgery its own `S` sequence number
    #[serde(default = "default_surgery_sequence")]
    pub surgery_sequence: bool,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            surgery_sequence: default_surgery_sequence(),
        }
    }
}

/// Weight range in which surgery medicines are auto-calculated
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SurgeryConfig {
    #[serde(default = "default_min_weight_kg")]
    pub min_weight_kg: f64,

    #[serde(default = "default_max_weight_kg")]
    pub max_weight_kg: f64,
}

impl Default for SurgeryConfig {
    fn default() -> Self {
        Self {
            min_weight_kg: default_min_weight_kg(),
            max_weight_kg: default_max_weight_kg(),
        }
    }
}

/// Optional project-specific protocol table
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local/share")
    });
    base.join("abc-case")
}

fn default_org_code() -> String {
    "JS".into()
}

fn default_project_code() -> String {
    "TAL".into()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_surgery_sequence() -> bool {
    true
}

fn default_min_weight_kg() -> f64 {
    DosageCalculator::DEFAULT_MIN_WEIGHT_KG
}

fn default_max_weight_kg() -> f64 {
    DosageCalculator::DEFAULT_MAX_WEIGHT_KG
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".config")
        });
        base.join("abc-case").join("config.toml")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Validated org/project scope for case numbers
    pub fn scope(&self) -> Result<CaseScope> {
        CaseScope::new(
            &self.organization.org_code,
            &self.organization.project_code,
        )
        .map_err(|e| Error::Config(e.to_string()))
    }

    /// Calculator over the configured (or built-in) protocol and weight range
    pub fn dosage_calculator(&self) -> Result<DosageCalculator> {
        let protocol = match &self.protocol.path {
            Some(path) => Arc::new(ProtocolTable::load_from(path)?),
            None => get_default_protocol(),
        };

        DosageCalculator::new(protocol)
            .with_weight_range(self.surgery.min_weight_kg, self.surgery.max_weight_kg)
    }

    pub fn cases_path(&self) -> PathBuf {
        self.data.data_dir.join("cases.jsonl")
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.data.data_dir.join("inventory.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data.data_dir.join("stock_ledger.jsonl")
    }

    pub fn feeding_path(&self) -> PathBuf {
        self.data.data_dir.join("feeding.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.organization.org_code, "JS");
        assert_eq!(config.organization.project_code, "TAL");
        assert_eq!(config.allocation.max_attempts, 5);
        assert!(config.allocation.surgery_sequence);
        assert_eq!(config.surgery.min_weight_kg, 10.0);
        assert_eq!(config.surgery.max_weight_kg, 30.0);
        assert!(config.protocol.path.is_none());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.organization.org_code, parsed.organization.org_code);
        assert_eq!(config.allocation.max_attempts, parsed.allocation.max_attempts);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[organization]
project_code = "PUN"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.organization.project_code, "PUN");
        assert_eq!(config.organization.org_code, "JS"); // default
        assert_eq!(config.scope().unwrap().project(), "PUN");
    }

    #[test]
    fn test_invalid_scope_is_config_error() {
        let toml_str = r#"
[organization]
org_code = "janice"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(matches!(config.scope(), Err(Error::Config(_))));
    }

    #[test]
    fn test_calculator_uses_configured_range() {
        let toml_str = r#"
[surgery]
min_weight_kg = 5.0
max_weight_kg = 45.0
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let calculator = config.dosage_calculator().unwrap();
        assert_eq!(calculator.weight_range(), (5.0, 45.0));
    }

    #[test]
    fn test_builtin_protocol_is_shared() {
        let config = Config::default();
        let first = config.dosage_calculator().unwrap();
        let second = config.dosage_calculator().unwrap();
        assert!(std::ptr::eq(first.protocol(), second.protocol()));
    }

    #[test]
    fn test_save_and_load_from() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.allocation.surgery_sequence = false;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert!(!loaded.allocation.surgery_sequence);
    }
}
