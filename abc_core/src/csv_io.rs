//! CSV export of case records and bulk import of catching and surgery rows.
//!
//! Imported rows never carry their own numbers: catching rows open a case
//! through [`CaseService::open_case`] and surgery rows go through
//! [`CaseService::record_surgery`], so numbering and stock deduction follow
//! the same path as single entries.

use crate::service::{CaseService, SurgeryRequest};
use crate::{CaseRecord, CatchingRecord, Error, Gender, Outcome, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// A row in the case export
#[derive(Debug, Serialize)]
struct CaseRow {
    case_number: String,
    status: String,
    caught_at: String,
    address: String,
    ward_number: Option<String>,
    surgery_number: Option<String>,
    surgery_at: Option<String>,
    weight_kg: Option<f64>,
    gender: Option<String>,
    surgery_type: Option<String>,
    cancellation_reason: Option<String>,
    medicines: Option<String>,
    closed_at: Option<String>,
}

impl From<&CaseRecord> for CaseRow {
    fn from(record: &CaseRecord) -> Self {
        let surgery = record.surgery.as_ref();
        let medicines = surgery
            .filter(|s| !s.medicines_used.is_empty())
            .map(|s| {
                s.medicines_used
                    .iter()
                    .map(|(drug, dose)| format!("{}={}", drug, dose))
                    .collect::<Vec<_>>()
                    .join("; ")
            });
        let closed_at = record.outcome.as_ref().map(|outcome| match outcome {
            Outcome::Released { released_at, .. } => released_at.to_rfc3339(),
            Outcome::Deceased { died_at, .. } => died_at.to_rfc3339(),
        });

        CaseRow {
            case_number: record.case_number.clone(),
            status: record.status.to_string(),
            caught_at: record.catching.caught_at.to_rfc3339(),
            address: record.catching.address.clone(),
            ward_number: record.catching.ward_number.clone(),
            surgery_number: surgery.and_then(|s| s.surgery_number.clone()),
            surgery_at: surgery.map(|s| s.recorded_at.to_rfc3339()),
            weight_kg: surgery.map(|s| s.weight_kg),
            gender: surgery.map(|s| s.gender.to_string()),
            surgery_type: surgery.map(|s| s.surgery_type.to_string()),
            cancellation_reason: surgery.and_then(|s| s.cancellation_reason.clone()),
            medicines,
            closed_at,
        }
    }
}

/// Write every record to a fresh CSV file, returning the row count
pub fn export_cases(records: &[CaseRecord], csv_path: &Path) -> Result<usize> {
    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(csv_path)?;
    for record in records {
        writer.serialize(CaseRow::from(record))?;
    }
    writer.flush()?;

    tracing::info!("Exported {} cases to {:?}", records.len(), csv_path);
    Ok(records.len())
}

/// A catching row as supplied by field teams
#[derive(Debug, Deserialize)]
struct CatchingRow {
    caught_at: String,
    address: String,
    #[serde(default)]
    ward_number: Option<String>,
    #[serde(default)]
    remarks: Option<String>,
}

impl TryFrom<CatchingRow> for CatchingRecord {
    type Error = Error;

    fn try_from(row: CatchingRow) -> Result<Self> {
        let caught_at = DateTime::parse_from_rfc3339(row.caught_at.trim())
            .map_err(|e| Error::InvalidInput(format!("Invalid caught_at: {}", e)))?
            .with_timezone(&Utc);

        let address = row.address.trim();
        if address.is_empty() {
            return Err(Error::InvalidInput("Address is required".into()));
        }

        Ok(CatchingRecord {
            caught_at,
            address: address.to_string(),
            ward_number: row.ward_number.filter(|w| !w.trim().is_empty()),
            remarks: row.remarks.filter(|r| !r.trim().is_empty()),
        })
    }
}

/// Outcome of a bulk import
#[derive(Debug, Default)]
pub struct ImportReport {
    /// Case numbers created or updated by the import, in file order
    pub created: Vec<String>,
    /// 1-based data row number and reason for every skipped row
    pub errors: Vec<(usize, String)>,
    /// Stock deducted per item across all imported rows
    pub medicines_deducted: BTreeMap<String, f64>,
}

impl ImportReport {
    fn skip(&mut self, row_number: usize, reason: String) {
        tracing::warn!("Skipping row {}: {}", row_number, reason);
        self.errors.push((row_number, reason));
    }
}

/// Open a case for every valid row of a catching CSV
///
/// Bad rows are reported and skipped; only store or allocation failures
/// that are not about the row itself abort the import.
pub fn import_catching(service: &CaseService, csv_path: &Path) -> Result<ImportReport> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_path(csv_path)?;

    let mut report = ImportReport::default();

    for (index, result) in reader.deserialize::<CatchingRow>().enumerate() {
        let row_number = index + 1;
        let catching = match result
            .map_err(Error::from)
            .and_then(CatchingRecord::try_from)
        {
            Ok(catching) => catching,
            Err(e) => {
                report.skip(row_number, e.to_string());
                continue;
            }
        };

        match service.open_case(catching) {
            Ok(record) => report.created.push(record.case_number),
            Err(Error::AllocationRace(taken)) => {
                report.skip(row_number, format!("Case number collision: {}", taken));
            }
            Err(e) => return Err(e),
        }
    }

    tracing::info!(
        "Imported {} cases from {:?}, {} rows skipped",
        report.created.len(),
        csv_path,
        report.errors.len()
    );
    Ok(report)
}

/// A surgery row as kept in the vets' register
#[derive(Debug, Deserialize)]
struct SurgeryRow {
    #[serde(alias = "case number")]
    case_number: String,
    #[serde(alias = "surgery date (dd/mm/yyyy)", alias = "surgery date")]
    surgery_date: String,
    gender: String,
    #[serde(alias = "weight (kg)", alias = "weight")]
    weight_kg: String,
    #[serde(default, alias = "surgery cancelled")]
    cancelled: Option<String>,
    #[serde(default, alias = "cancellation reason")]
    cancellation_reason: Option<String>,
    #[serde(default)]
    remarks: Option<String>,
}

/// A validated surgery row
struct SurgeryEntry {
    case_number: String,
    request: SurgeryRequest,
}

/// `dd/mm/yyyy` first, then `YYYY-MM-DD` (optionally followed by a time),
/// then RFC 3339. Bare dates are taken as midnight UTC.
fn parse_surgery_date(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    let day = NaiveDate::parse_from_str(raw, "%d/%m/%Y").or_else(|_| {
        let first = raw.split_whitespace().next().unwrap_or_default();
        NaiveDate::parse_from_str(first, "%Y-%m-%d")
    });
    if let Ok(day) = day {
        return Ok(day.and_time(NaiveTime::MIN).and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| Error::InvalidInput(format!("Invalid date '{}', use DD/MM/YYYY", raw)))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl TryFrom<SurgeryRow> for SurgeryEntry {
    type Error = Error;

    fn try_from(row: SurgeryRow) -> Result<Self> {
        let case_number = row.case_number.trim().to_string();
        if case_number.is_empty() {
            return Err(Error::InvalidInput("Missing case number".into()));
        }

        let recorded_at = parse_surgery_date(&row.surgery_date)?;
        let gender: Gender = row.gender.parse()?;
        let weight_kg: f64 = row
            .weight_kg
            .trim()
            .parse()
            .map_err(|_| Error::InvalidInput(format!("Invalid weight '{}'", row.weight_kg)))?;

        let cancelled = row
            .cancelled
            .as_deref()
            .map(|c| matches!(c.trim().to_lowercase().as_str(), "yes" | "y" | "true" | "1"))
            .unwrap_or(false);
        let cancellation_reason = if cancelled {
            Some(non_blank(row.cancellation_reason).ok_or_else(|| {
                Error::InvalidInput("Cancellation reason is required when cancelled".into())
            })?)
        } else {
            None
        };

        Ok(SurgeryEntry {
            case_number,
            request: SurgeryRequest {
                recorded_at,
                weight_kg,
                gender,
                cancellation_reason,
                remarks: non_blank(row.remarks),
            },
        })
    }
}

/// Record a surgery for every valid row of a surgery CSV
///
/// Weights must fall in the calculator's surgical range. Rows naming an
/// unknown case, a case that already has a surgery, or bad values are
/// reported and skipped; storage failures abort the import.
pub fn import_surgery(service: &mut CaseService, csv_path: &Path) -> Result<ImportReport> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_path(csv_path)?;
    // Register headers come as "Case Number*", "Weight (kg)" and the like
    let headers: csv::StringRecord = reader
        .headers()?
        .iter()
        .map(|h| h.replace('*', "").trim().to_lowercase())
        .collect();
    reader.set_headers(headers);
    let (min_kg, max_kg) = service.calculator().weight_range();

    let mut report = ImportReport::default();

    for (index, result) in reader.deserialize::<SurgeryRow>().enumerate() {
        let row_number = index + 1;
        let entry = match result.map_err(Error::from).and_then(SurgeryEntry::try_from) {
            Ok(entry) => entry,
            Err(e) => {
                report.skip(row_number, e.to_string());
                continue;
            }
        };

        let weight = entry.request.weight_kg;
        if !(min_kg..=max_kg).contains(&weight) {
            report.skip(
                row_number,
                format!("Weight must be between {}-{} kg, got {}", min_kg, max_kg, weight),
            );
            continue;
        }

        match service.record_surgery(&entry.case_number, entry.request) {
            Ok(outcome) => {
                for movement in &outcome.movements {
                    *report
                        .medicines_deducted
                        .entry(movement.item.clone())
                        .or_insert(0.0) += movement.quantity;
                }
                report.created.push(outcome.case.case_number);
            }
            Err(
                e @ (Error::NotFound(_)
                | Error::InvalidTransition(_)
                | Error::InvalidInput(_)
                | Error::AllocationRace(_)),
            ) => report.skip(row_number, e.to_string()),
            Err(e) => return Err(e),
        }
    }

    tracing::info!(
        "Imported {} surgeries from {:?}, {} rows skipped",
        report.created.len(),
        csv_path,
        report.errors.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CaseStatus, Config, StockKind};
    use tempfile::TempDir;

    fn setup() -> (TempDir, CaseService) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data.data_dir = temp_dir.path().to_path_buf();
        let service = CaseService::from_config(&config).unwrap();
        (temp_dir, service)
    }

    #[test]
    fn test_import_assigns_numbers_and_reports_bad_rows() {
        let (dir, service) = setup();
        let csv_path = dir.path().join("catching.csv");
        std::fs::write(
            &csv_path,
            "caught_at,address,ward_number,remarks\n\
             2026-01-04T06:30:00Z,Station Road,12,\n\
             yesterday,Market,3,\n\
             2026-01-04T07:10:00Z,,4,\n\
             2026-01-05T06:00:00Z,Bus Stand,,limping\n\
             2026-02-01T06:00:00Z,Bus Stand,,\n",
        )
        .unwrap();

        let report = import_catching(&service, &csv_path).unwrap();

        assert_eq!(
            report.created,
            vec!["JS-TAL-JAN-C0001", "JS-TAL-JAN-C0002", "JS-TAL-FEB-C0001"]
        );
        let bad_rows: Vec<usize> = report.errors.iter().map(|(row, _)| *row).collect();
        assert_eq!(bad_rows, vec![2, 3]);
    }

    #[test]
    fn test_import_continues_existing_sequence() {
        let (dir, service) = setup();
        let csv_path = dir.path().join("catching.csv");
        std::fs::write(
            &csv_path,
            "caught_at,address\n2026-01-04T06:30:00Z,Station Road\n",
        )
        .unwrap();

        import_catching(&service, &csv_path).unwrap();
        let report = import_catching(&service, &csv_path).unwrap();

        assert_eq!(report.created, vec!["JS-TAL-JAN-C0002"]);
    }

    #[test]
    fn test_export_writes_one_row_per_case() {
        let (dir, mut service) = setup();
        let first = service
            .open_case(CatchingRecord {
                caught_at: "2026-01-04T06:30:00Z".parse().unwrap(),
                address: "Station Road".into(),
                ward_number: Some("12".into()),
                remarks: None,
            })
            .unwrap();
        service
            .record_surgery(
                &first.case_number,
                SurgeryRequest {
                    recorded_at: "2026-01-05T09:00:00Z".parse().unwrap(),
                    weight_kg: 20.0,
                    gender: Gender::Male,
                    cancellation_reason: None,
                    remarks: None,
                },
            )
            .unwrap();

        let csv_path = dir.path().join("export").join("cases.csv");
        let records = service.store().list().unwrap();
        assert_eq!(export_cases(&records, &csv_path).unwrap(), 1);

        let contents = std::fs::read_to_string(&csv_path).unwrap();
        let mut lines = contents.lines();
        assert!(lines.next().unwrap().starts_with("case_number,status,caught_at"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("JS-TAL-JAN-C0001,Surgery Completed,"));
        assert!(row.contains("JS-TAL-JAN-S0001"));
        assert!(row.contains("Xylazine=2"));
        assert!(lines.next().is_none());
    }

    fn catch_three(service: &CaseService) {
        for hour in 6..9 {
            service
                .open_case(CatchingRecord {
                    caught_at: format!("2026-01-04T0{}:00:00Z", hour).parse().unwrap(),
                    address: "Station Road".into(),
                    ward_number: None,
                    remarks: None,
                })
                .unwrap();
        }
    }

    #[test]
    fn test_surgery_import_records_and_reports() {
        let (dir, mut service) = setup();
        catch_three(&service);
        service
            .restock("Xylazine", StockKind::Medicine, "ml", 20.0, Utc::now())
            .unwrap();

        let csv_path = dir.path().join("surgery.csv");
        std::fs::write(
            &csv_path,
            "Case Number,Surgery Date (dd/mm/yyyy),Gender,Weight (kg),Surgery Cancelled,Cancellation Reason,Remarks\n\
             JS-TAL-JAN-C0001,05/01/2026,Female,20,No,,\n\
             JS-TAL-JAN-C0002,2026-01-05,male,10,,,stitches ok\n\
             JS-TAL-JAN-C0003,05/01/2026,Female,8,No,,\n\
             JS-TAL-JAN-C0099,05/01/2026,Male,15,No,,\n\
             JS-TAL-JAN-C0001,06/01/2026,Female,20,No,,\n\
             JS-TAL-JAN-C0003,5th Jan,Female,20,No,,\n\
             JS-TAL-JAN-C0003,05/01/2026,Female,20,yes,,\n\
             JS-TAL-JAN-C0003,05/01/2026,Female,20,yes,Lactating,\n",
        )
        .unwrap();

        let report = import_surgery(&mut service, &csv_path).unwrap();

        assert_eq!(
            report.created,
            vec!["JS-TAL-JAN-C0001", "JS-TAL-JAN-C0002", "JS-TAL-JAN-C0003"]
        );
        let bad_rows: Vec<usize> = report.errors.iter().map(|(row, _)| *row).collect();
        assert_eq!(bad_rows, vec![3, 4, 5, 6, 7]);
        assert!(report.errors[0].1.contains("Weight must be between"));

        // 2 ml for the 20 kg female and 1 ml for the 10 kg male
        assert_eq!(report.medicines_deducted.get("Xylazine"), Some(&3.0));
        assert_eq!(report.medicines_deducted.len(), 1);

        let first = service.store().find_by_number("JS-TAL-JAN-C0001").unwrap().unwrap();
        assert_eq!(first.surgery_number(), Some("JS-TAL-JAN-S0001"));
        let second = service.store().find_by_number("JS-TAL-JAN-C0002").unwrap().unwrap();
        assert_eq!(second.surgery.unwrap().remarks.as_deref(), Some("stitches ok"));
        let third = service.store().find_by_number("JS-TAL-JAN-C0003").unwrap().unwrap();
        assert_eq!(third.status, CaseStatus::SurgeryCancelled);
    }

    #[test]
    fn test_surgery_dates() {
        assert_eq!(
            parse_surgery_date("05/01/2026").unwrap(),
            "2026-01-05T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            parse_surgery_date("2026-01-05 00:00:00").unwrap(),
            "2026-01-05T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            parse_surgery_date("2026-01-05T10:30:00+05:30").unwrap(),
            "2026-01-05T05:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert!(parse_surgery_date("01/13/2026").is_err());
    }
}
