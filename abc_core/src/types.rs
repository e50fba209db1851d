//! Core domain types for the ABC case tracking system.
//!
//! This module defines the fundamental types used throughout the system:
//! - Protocol rules (drug names, dosing modes, rounding)
//! - Dosage results
//! - Case record types and lifecycle status
//! - Inventory items and stock movements

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Animal Types
// ============================================================================

/// Sex of the animal as recorded at observation or surgery time
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Gender {
    Male,
    Female,
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gender::Male => f.write_str("Male"),
            Gender::Female => f.write_str("Female"),
        }
    }
}

impl FromStr for Gender {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "male" | "m" => Ok(Gender::Male),
            "female" | "f" => Ok(Gender::Female),
            other => Err(Error::InvalidInput(format!("Unknown gender '{}'", other))),
        }
    }
}

// ============================================================================
// Protocol Types
// ============================================================================

/// Drug identifier used as the protocol table key
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct DrugName(String);

impl DrugName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for DrugName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DrugName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for DrugName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unit a dose is measured in (informational only)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoseUnit {
    Ml,
    Mg,
    Pcs,
}

impl fmt::Display for DoseUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoseUnit::Ml => f.write_str("ml"),
            DoseUnit::Mg => f.write_str("mg"),
            DoseUnit::Pcs => f.write_str("pcs"),
        }
    }
}

/// Rounding applied to a weight-scaled dose after capping
///
/// Ties round half away from zero (`f64::round`).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoundingPolicy {
    #[default]
    None,
    NearestHalf,
    NearestFifty,
    NearestFive,
}

impl RoundingPolicy {
    pub fn apply(self, dose: f64) -> f64 {
        match self {
            RoundingPolicy::None => dose,
            RoundingPolicy::NearestHalf => (dose * 2.0).round() / 2.0,
            RoundingPolicy::NearestFifty => (dose / 50.0).round() * 50.0,
            RoundingPolicy::NearestFive => (dose / 5.0).round() * 5.0,
        }
    }
}

/// How a protocol rule turns body weight into a dose
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DosageMode {
    /// Always the base dose, weight is ignored
    Fixed,
    /// `base_dose * weight / 10`, then capped, then rounded
    PerTenKg {
        #[serde(default)]
        max_cap: Option<f64>,
        #[serde(default)]
        rounding: RoundingPolicy,
    },
}

/// One protocol entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DosageRule {
    pub name: DrugName,
    pub base_dose: f64,
    pub unit: DoseUnit,
    pub mode: DosageMode,
    #[serde(default)]
    pub female_only: bool,
}

/// Computed doses for one (weight, gender) pair, keyed by drug name
///
/// Zero means "not applicable".
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(transparent)]
pub struct DosageResult(BTreeMap<DrugName, f64>);

impl DosageResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, drug: DrugName, dose: f64) {
        self.0.insert(drug, dose);
    }

    pub fn get(&self, drug: &str) -> Option<f64> {
        self.0.get(drug).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DrugName, f64)> {
        self.0.iter().map(|(k, v)| (k, *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Drop every entry that is not applicable (zero dose)
    pub fn retain_positive(mut self) -> Self {
        self.0.retain(|_, dose| *dose > 0.0);
        self
    }
}

// ============================================================================
// Case Number Types
// ============================================================================

/// Which workflow stage's counter a case number belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecordType {
    Catching,
    Surgery,
    /// Any other single uppercase letter
    Other(char),
}

impl RecordType {
    pub fn tag(self) -> char {
        match self {
            RecordType::Catching => 'C',
            RecordType::Surgery => 'S',
            RecordType::Other(c) => c,
        }
    }

    pub fn from_tag(tag: char) -> Result<Self> {
        match tag {
            'C' => Ok(RecordType::Catching),
            'S' => Ok(RecordType::Surgery),
            c if c.is_ascii_uppercase() => Ok(RecordType::Other(c)),
            c => Err(Error::InvalidInput(format!(
                "Record type tag must be one uppercase letter, got '{}'",
                c
            ))),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for RecordType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => RecordType::from_tag(c.to_ascii_uppercase()),
            _ => Err(Error::InvalidInput(format!(
                "Record type must be a single letter, got '{}'",
                s
            ))),
        }
    }
}

// ============================================================================
// Case Record Types
// ============================================================================

/// Lifecycle status of a case
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Caught,
    InKennel,
    SurgeryCompleted,
    SurgeryCancelled,
    UnderTreatment,
    Released,
    Deceased,
}

impl CaseStatus {
    /// Released and deceased cases accept no further lifecycle records
    pub fn is_closed(self) -> bool {
        matches!(self, CaseStatus::Released | CaseStatus::Deceased)
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CaseStatus::Caught => "Caught",
            CaseStatus::InKennel => "In Kennel",
            CaseStatus::SurgeryCompleted => "Surgery Completed",
            CaseStatus::SurgeryCancelled => "Surgery Cancelled",
            CaseStatus::UnderTreatment => "Under Treatment",
            CaseStatus::Released => "Released",
            CaseStatus::Deceased => "Deceased",
        };
        f.write_str(label)
    }
}

impl FromStr for CaseStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .collect();
        match normalized.as_str() {
            "caught" => Ok(CaseStatus::Caught),
            "inkennel" => Ok(CaseStatus::InKennel),
            "surgerycompleted" => Ok(CaseStatus::SurgeryCompleted),
            "surgerycancelled" => Ok(CaseStatus::SurgeryCancelled),
            "undertreatment" => Ok(CaseStatus::UnderTreatment),
            "released" => Ok(CaseStatus::Released),
            "deceased" => Ok(CaseStatus::Deceased),
            _ => Err(Error::InvalidInput(format!("Unknown case status '{}'", s))),
        }
    }
}

/// Sterilization procedure performed
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SurgeryType {
    Castration,
    Ovariohysterectomy,
}

impl SurgeryType {
    pub fn for_gender(gender: Gender) -> Self {
        match gender {
            Gender::Male => SurgeryType::Castration,
            Gender::Female => SurgeryType::Ovariohysterectomy,
        }
    }
}

impl fmt::Display for SurgeryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurgeryType::Castration => write!(f, "Castration"),
            SurgeryType::Ovariohysterectomy => write!(f, "Ovariohysterectomy"),
        }
    }
}

/// Where and when the animal was caught
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatchingRecord {
    pub caught_at: DateTime<Utc>,
    pub address: String,
    pub ward_number: Option<String>,
    pub remarks: Option<String>,
}

/// Surgery details, including the medicines deducted for it
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SurgeryRecord {
    /// Separate `S` sequence number, when the project uses one
    pub surgery_number: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub weight_kg: f64,
    pub gender: Gender,
    pub surgery_type: SurgeryType,
    pub cancelled: bool,
    pub cancellation_reason: Option<String>,
    #[serde(default)]
    pub medicines_used: DosageResult,
    #[serde(default)]
    pub remarks: Option<String>,
}

/// How the surgical wound looked at a treatment round
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WoundCondition {
    #[default]
    NormalHealing,
    Inflammation,
    Infection,
    Other,
}

impl fmt::Display for WoundCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WoundCondition::NormalHealing => "Normal Healing",
            WoundCondition::Inflammation => "Inflammation",
            WoundCondition::Infection => "Infection",
            WoundCondition::Other => "Other",
        };
        f.pad(label)
    }
}

impl FromStr for WoundCondition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_lowercase();
        match key.as_str() {
            "normal" | "normalhealing" => Ok(WoundCondition::NormalHealing),
            "inflammation" => Ok(WoundCondition::Inflammation),
            "infection" => Ok(WoundCondition::Infection),
            "other" => Ok(WoundCondition::Other),
            _ => Err(Error::InvalidInput(format!("Unknown wound condition '{}'", s))),
        }
    }
}

/// One day of post-operative treatment
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreatmentRecord {
    pub recorded_at: DateTime<Utc>,
    /// Whole days since the surgery, 0 on the day of surgery
    pub day_post_surgery: i64,
    pub wound_condition: WoundCondition,
    #[serde(default)]
    pub medicines_used: DosageResult,
    pub remarks: Option<String>,
}

/// Terminal outcome of a case
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    Released {
        released_at: DateTime<Utc>,
        remarks: Option<String>,
    },
    Deceased {
        died_at: DateTime<Utc>,
        cause: String,
    },
}

/// A tracked animal from catching through release or death
///
/// Case numbers are stored as plain strings so legacy or hand-edited values
/// never prevent the store from loading.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: Uuid,
    pub case_number: String,
    pub org_code: String,
    pub project_code: String,
    pub status: CaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub catching: CatchingRecord,
    pub surgery: Option<SurgeryRecord>,
    /// Post-operative treatment days, oldest first
    #[serde(default)]
    pub treatments: Vec<TreatmentRecord>,
    pub outcome: Option<Outcome>,
}

impl CaseRecord {
    pub fn surgery_number(&self) -> Option<&str> {
        self.surgery
            .as_ref()
            .and_then(|s| s.surgery_number.as_deref())
    }
}

// ============================================================================
// Inventory Types
// ============================================================================

/// Category of consumable
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StockKind {
    Medicine,
    Food,
}

impl FromStr for StockKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "medicine" => Ok(StockKind::Medicine),
            "food" => Ok(StockKind::Food),
            _ => Err(Error::InvalidInput(format!("Unknown stock kind '{}'", s))),
        }
    }
}

/// A consumable tracked in the inventory
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StockItem {
    pub name: String,
    pub kind: StockKind,
    pub unit: String,
    pub current_stock: f64,
}

/// Direction of a stock movement
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Restock,
    Usage,
    Adjustment,
    /// Stock put back after a deduction whose case update failed
    Reversal,
}

/// Kennel feeding round
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MealTime {
    Morning,
    Evening,
}

impl fmt::Display for MealTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MealTime::Morning => f.pad("Morning"),
            MealTime::Evening => f.pad("Evening"),
        }
    }
}

impl FromStr for MealTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "morning" | "am" => Ok(MealTime::Morning),
            "evening" | "pm" => Ok(MealTime::Evening),
            _ => Err(Error::InvalidInput(format!("Unknown meal time '{}'", s))),
        }
    }
}

/// Food given to a set of kennels in one round
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedingRecord {
    pub id: Uuid,
    pub fed_at: DateTime<Utc>,
    pub meal_time: MealTime,
    pub kennel_numbers: Vec<String>,
    /// Quantity of each food item, in the item's stock unit
    pub food_items: BTreeMap<String, f64>,
    pub remarks: Option<String>,
}

/// One entry in the stock ledger
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: Uuid,
    pub item: String,
    pub kind: MovementKind,
    pub quantity: f64,
    pub case_number: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub note: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gender_parsing() {
        assert_eq!("F".parse::<Gender>().unwrap(), Gender::Female);
        assert_eq!(" male ".parse::<Gender>().unwrap(), Gender::Male);
        assert!("unknown".parse::<Gender>().is_err());
    }

    #[test]
    fn test_record_type_tags() {
        assert_eq!("c".parse::<RecordType>().unwrap(), RecordType::Catching);
        assert_eq!(RecordType::from_tag('S').unwrap(), RecordType::Surgery);
        assert_eq!(RecordType::from_tag('T').unwrap().tag(), 'T');
        assert!(RecordType::from_tag('7').is_err());
        assert!("CS".parse::<RecordType>().is_err());
    }

    #[test]
    fn test_wound_and_meal_parsing() {
        assert_eq!(
            "Normal Healing".parse::<WoundCondition>().unwrap(),
            WoundCondition::NormalHealing
        );
        assert_eq!(
            "infection".parse::<WoundCondition>().unwrap(),
            WoundCondition::Infection
        );
        assert_eq!(WoundCondition::Inflammation.to_string(), "Inflammation");
        assert!("bleeding".parse::<WoundCondition>().is_err());

        assert_eq!("Evening".parse::<MealTime>().unwrap(), MealTime::Evening);
        assert!("noon".parse::<MealTime>().is_err());
    }

    #[test]
    fn test_case_status_labels_parse_back() {
        for status in [
            CaseStatus::Caught,
            CaseStatus::InKennel,
            CaseStatus::SurgeryCompleted,
            CaseStatus::SurgeryCancelled,
            CaseStatus::UnderTreatment,
            CaseStatus::Released,
            CaseStatus::Deceased,
        ] {
            assert_eq!(status.to_string().parse::<CaseStatus>().unwrap(), status);
        }
        assert_eq!(
            "surgery_completed".parse::<CaseStatus>().unwrap(),
            CaseStatus::SurgeryCompleted
        );
        assert!(CaseStatus::Deceased.is_closed());
        assert!(!CaseStatus::UnderTreatment.is_closed());
    }

    #[test]
    fn test_dosage_result_drops_zero_doses() {
        let mut result = DosageResult::new();
        result.insert(DrugName::from("Xylazine"), 2.0);
        result.insert(DrugName::from("Diazepam"), 0.0);

        let plan = result.retain_positive();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.get("Xylazine"), Some(2.0));
        assert_eq!(plan.get("Diazepam"), None);
    }

    #[test]
    fn test_per_ten_kg_mode_defaults() {
        let mode: DosageMode = serde_json::from_str(r#"{"type": "per_ten_kg"}"#).unwrap();
        assert_eq!(
            mode,
            DosageMode::PerTenKg {
                max_cap: None,
                rounding: RoundingPolicy::None,
            }
        );
    }
}
