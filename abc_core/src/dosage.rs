//! Dosage calculator over a protocol table.
//!
//! `compute_dose` is a pure lookup-table interpreter:
//! - Unknown drugs dose 0
//! - Female-only drugs dose 0 for males
//! - Fixed drugs return the base dose
//! - Per-10kg drugs scale with weight, then cap, then round

use crate::protocol::{get_default_protocol, ProtocolTable};
use crate::{DosageMode, DosageResult, Error, Gender, Result};
use std::sync::Arc;

/// Compute the dose of one drug for an animal of the given weight and gender
///
/// Never fails: an unknown drug name doses 0.
/// Weight validation is the caller's job (see [`validate_weight`]).
pub fn compute_dose(protocol: &ProtocolTable, weight: f64, drug_name: &str, gender: Gender) -> f64 {
    let Some(rule) = protocol.get(drug_name) else {
        return 0.0;
    };

    if rule.female_only && gender != Gender::Female {
        return 0.0;
    }

    match rule.mode {
        DosageMode::Fixed => rule.base_dose,
        DosageMode::PerTenKg { max_cap, rounding } => {
            let mut dose = rule.base_dose * weight / 10.0;
            if let Some(cap) = max_cap {
                dose = dose.min(cap);
            }
            rounding.apply(dose)
        }
    }
}

/// Reject weights that cannot belong to a real animal
pub fn validate_weight(weight: f64) -> Result<()> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(Error::InvalidInput(format!(
            "Weight must be a positive number of kg, got {}",
            weight
        )));
    }
    Ok(())
}

/// Shared-ownership handle on an immutable protocol plus the surgical
/// weight range the auto-calculation applies to
#[derive(Clone, Debug)]
pub struct DosageCalculator {
    protocol: Arc<ProtocolTable>,
    min_weight_kg: f64,
    max_weight_kg: f64,
}

impl Default for DosageCalculator {
    fn default() -> Self {
        Self::new(get_default_protocol())
    }
}

impl DosageCalculator {
    pub const DEFAULT_MIN_WEIGHT_KG: f64 = 10.0;
    pub const DEFAULT_MAX_WEIGHT_KG: f64 = 30.0;

    pub fn new(protocol: Arc<ProtocolTable>) -> Self {
        Self {
            protocol,
            min_weight_kg: Self::DEFAULT_MIN_WEIGHT_KG,
            max_weight_kg: Self::DEFAULT_MAX_WEIGHT_KG,
        }
    }

    /// Override the inclusive weight range used by [`Self::surgery_plan`]
    pub fn with_weight_range(mut self, min_weight_kg: f64, max_weight_kg: f64) -> Result<Self> {
        validate_weight(min_weight_kg)?;
        validate_weight(max_weight_kg)?;
        if min_weight_kg > max_weight_kg {
            return Err(Error::Config(format!(
                "Surgical weight range is empty: {} > {}",
                min_weight_kg, max_weight_kg
            )));
        }
        self.min_weight_kg = min_weight_kg;
        self.max_weight_kg = max_weight_kg;
        Ok(self)
    }

    pub fn protocol(&self) -> &ProtocolTable {
        &self.protocol
    }

    pub fn weight_range(&self) -> (f64, f64) {
        (self.min_weight_kg, self.max_weight_kg)
    }

    pub fn compute_dose(&self, weight: f64, drug_name: &str, gender: Gender) -> f64 {
        compute_dose(&self.protocol, weight, drug_name, gender)
    }

    /// Dose every protocol drug, including the non-applicable zeros
    pub fn compute_all(&self, weight: f64, gender: Gender) -> DosageResult {
        let mut result = DosageResult::new();
        for rule in self.protocol.rules() {
            result.insert(rule.name.clone(), self.compute_dose(weight, rule.name.as_str(), gender));
        }
        result
    }

    /// Medicines to deduct for a surgery
    ///
    /// Only animals inside the surgical weight range are auto-calculated;
    /// the plan keeps drugs with a positive dose.
    pub fn surgery_plan(&self, weight: f64, gender: Gender) -> Result<DosageResult> {
        validate_weight(weight)?;
        if weight < self.min_weight_kg || weight > self.max_weight_kg {
            return Err(Error::InvalidInput(format!(
                "Weight must be between {}-{} kg, got {}",
                self.min_weight_kg, self.max_weight_kg, weight
            )));
        }

        let plan = self.compute_all(weight, gender).retain_positive();
        tracing::debug!(
            "Surgery plan for {} kg {}: {} medicines",
            weight,
            gender,
            plan.len()
        );
        Ok(plan)
    }
}
