#![forbid(unsafe_code)]

//! Core domain model and business logic for ABC case tracking.
//!
//! This crate provides:
//! - Domain types (cases, surgeries, stock items)
//! - Medicine protocol table and dosage calculator
//! - Case number formatting and sequence allocation
//! - Persistence (case store, inventory, stock ledger, feeding log, CSV)
//! - Case lifecycle operations
//! - Stock usage reports

pub mod types;
pub mod error;
pub mod protocol;
pub mod dosage;
pub mod case_number;
pub mod allocator;
pub mod config;
pub mod logging;
pub mod store;
pub mod inventory;
pub mod ledger;
pub mod report;
pub mod service;
pub mod csv_io;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use protocol::{build_default_protocol, get_default_protocol, ProtocolTable};
pub use dosage::{compute_dose, DosageCalculator};
pub use case_number::{CaseNumber, CaseScope, PeriodWindow};
pub use allocator::{allocate_with_retry, next_case_number, CaseNumberSource};
pub use config::Config;
pub use store::CaseStore;
pub use inventory::{Inventory, Shortfall};
pub use ledger::{FeedingLog, JsonlLedger, StockSink};
pub use report::{usage_report, UsagePeriod, UsageReport};
pub use service::{
    CaseService, FeedingOutcome, FeedingRequest, SurgeryOutcome, SurgeryRequest,
    TreatmentOutcome, TreatmentRequest,
};
pub use csv_io::{export_cases, import_catching, import_surgery, ImportReport};
