//! Surgery medicine protocol table.
//!
//! The built-in table is constructed once and shared by reference. Projects
//! that dose differently can load their own table from TOML; a loaded table
//! is validated and never mutated afterwards.

use crate::types::*;
use crate::{Error, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Cached default protocol - built once and shared by every calculator
static DEFAULT_PROTOCOL: Lazy<Arc<ProtocolTable>> =
    Lazy::new(|| Arc::new(build_default_protocol_internal()));

/// Immutable mapping from drug name to dosing rule
#[derive(Clone, Debug, PartialEq)]
pub struct ProtocolTable {
    rules: BTreeMap<DrugName, DosageRule>,
}

/// On-disk shape of a protocol file
#[derive(Debug, Serialize, Deserialize)]
struct ProtocolFile {
    #[serde(rename = "drug")]
    drugs: Vec<DosageRule>,
}

/// Shared handle on the cached default protocol
pub fn get_default_protocol() -> Arc<ProtocolTable> {
    Arc::clone(&DEFAULT_PROTOCOL)
}

/// Builds the default protocol table
///
/// **Note**: For production use, prefer `get_default_protocol()` which returns a
/// handle on the cached table.
pub fn build_default_protocol() -> ProtocolTable {
    build_default_protocol_internal()
}

fn fixed(name: &str, base_dose: f64, unit: DoseUnit) -> DosageRule {
    DosageRule {
        name: name.into(),
        base_dose,
        unit,
        mode: DosageMode::Fixed,
        female_only: false,
    }
}

fn per_ten_kg(
    name: &str,
    base_dose: f64,
    unit: DoseUnit,
    max_cap: Option<f64>,
    rounding: RoundingPolicy,
) -> DosageRule {
    DosageRule {
        name: name.into(),
        base_dose,
        unit,
        mode: DosageMode::PerTenKg { max_cap, rounding },
        female_only: false,
    }
}

fn build_default_protocol_internal() -> ProtocolTable {
    use DoseUnit::*;
    use RoundingPolicy::{NearestFifty, NearestFive, NearestHalf};
    let none = RoundingPolicy::None;

    // Zero base doses are placeholders: the vet decides these amounts.
    let rules = vec![
        fixed("Anti-Rabies Vaccine", 1.0, Ml),
        per_ten_kg("Xylazine", 1.0, Ml, None, none),
        per_ten_kg("Melonex", 0.8, Ml, Some(1.0), none),
        per_ten_kg("Atropine", 1.0, Ml, None, NearestHalf),
        per_ten_kg("Diazepam", 0.0, Ml, None, none),
        per_ten_kg("Prednisolone", 0.0, Ml, None, none),
        per_ten_kg("Ketamine", 3.0, Ml, None, NearestHalf),
        fixed("Tribivet", 1.0, Ml),
        per_ten_kg("Intacef Tazo", 400.0, Mg, None, NearestFifty),
        per_ten_kg("Adrenaline", 0.0, Ml, None, none),
        per_ten_kg("Alu Spray", 2.0, Ml, None, NearestHalf),
        per_ten_kg("Ethamsylate", 1.0, Ml, None, NearestHalf),
        per_ten_kg("Tincture", 20.0, Ml, None, NearestFive),
        fixed("Avil", 1.0, Ml),
        fixed("Vicryl 1", 0.20, Pcs),
        fixed("Catgut", 0.20, Pcs),
        DosageRule {
            female_only: true,
            ..fixed("Vicryl 2", 0.20, Pcs)
        },
        fixed("Metronidazole", 50.0, Ml),
    ];

    ProtocolTable {
        rules: rules.into_iter().map(|r| (r.name.clone(), r)).collect(),
    }
}

impl ProtocolTable {
    /// Build a table from rules, rejecting duplicates and invalid entries
    pub fn from_rules(rules: Vec<DosageRule>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for rule in rules {
            if let Some(previous) = map.insert(rule.name.clone(), rule) {
                return Err(Error::ProtocolValidation(format!(
                    "Duplicate drug '{}'",
                    previous.name
                )));
            }
        }

        let table = Self { rules: map };
        let errors = table.validate();
        if !errors.is_empty() {
            return Err(Error::ProtocolValidation(errors.join("; ")));
        }
        Ok(table)
    }

    /// Load a protocol table from a TOML file of `[[drug]]` entries
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let file: ProtocolFile = toml::from_str(&contents)?;
        let table = Self::from_rules(file.drugs)?;
        tracing::info!("Loaded {} protocol rules from {:?}", table.len(), path);
        Ok(table)
    }

    /// Serialize the table in the same format `load_from` reads
    pub fn to_toml(&self) -> Result<String> {
        let file = ProtocolFile {
            drugs: self.rules.values().cloned().collect(),
        };
        toml::to_string_pretty(&file)
            .map_err(|e| Error::Config(format!("Failed to serialize protocol: {}", e)))
    }

    /// Look up a rule; unknown drugs are an explicit `None`
    pub fn get(&self, name: &str) -> Option<&DosageRule> {
        self.rules.get(name)
    }

    pub fn rules(&self) -> impl Iterator<Item = &DosageRule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Validate the table for consistency
    ///
    /// Returns a list of validation errors, or empty Vec if valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (key, rule) in &self.rules {
            if key.as_str().trim().is_empty() {
                errors.push("Protocol rule has empty drug name".to_string());
            }
            if key != &rule.name {
                errors.push(format!(
                    "Protocol key '{}' doesn't match rule name '{}'",
                    key, rule.name
                ));
            }
            if !rule.base_dose.is_finite() || rule.base_dose < 0.0 {
                errors.push(format!(
                    "Drug '{}': base dose {} must be a non-negative number",
                    key, rule.base_dose
                ));
            }
            if let DosageMode::PerTenKg {
                max_cap: Some(cap), ..
            } = rule.mode
            {
                if !cap.is_finite() || cap <= 0.0 {
                    errors.push(format!(
                        "Drug '{}': max cap {} must be positive",
                        key, cap
                    ));
                }
            }
        }

        errors
    }
}
