//! File-backed case record store.
//!
//! Cases live in a JSON Lines file, one record per line. Every write takes an
//! exclusive lock on a sidecar `.lock` file, reloads, checks that no number
//! is held twice within its month and atomically replaces the file (temp
//! file + rename). Readers take a shared lock. Lines that fail to parse are logged, ignored for
//! lookups and allocation, and written back verbatim so hand-repairable data
//! is never dropped.

use crate::allocator::CaseNumberSource;
use crate::case_number::PeriodWindow;
use crate::{CaseRecord, Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

/// One line of the store file
#[derive(Clone, Debug)]
enum StoredLine {
    Record(Box<CaseRecord>),
    Unreadable(String),
}

/// Case records persisted to a JSONL file with file locking
pub struct CaseStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl CaseStore {
    /// Create a store for the given path; nothing is touched until first use
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_lock(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        Ok(file)
    }

    fn read_lines(&self) -> Result<Vec<StoredLine>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut lines = Vec::new();

        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<CaseRecord>(&line) {
                Ok(record) => lines.push(StoredLine::Record(Box::new(record))),
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse case record at line {} of {:?}: {}",
                        line_num + 1,
                        self.path,
                        e
                    );
                    lines.push(StoredLine::Unreadable(line));
                }
            }
        }

        Ok(lines)
    }

    fn write_lines(&self, lines: &[StoredLine]) -> Result<()> {
        let parent = self.path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "case store path missing parent")
        })?;
        std::fs::create_dir_all(parent)?;

        let temp = NamedTempFile::new_in(parent)?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            for line in lines {
                match line {
                    StoredLine::Record(record) => {
                        let json = serde_json::to_string(record)?;
                        writer.write_all(json.as_bytes())?;
                    }
                    StoredLine::Unreadable(raw) => writer.write_all(raw.as_bytes())?,
                }
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Run `f` over the records while holding the shared lock
    fn with_shared<T>(&self, f: impl FnOnce(Vec<CaseRecord>) -> T) -> Result<T> {
        let lock = self.open_lock()?;
        lock.lock_shared()?;
        let lines = self.read_lines();
        lock.unlock()?;

        let records = lines?
            .into_iter()
            .filter_map(|line| match line {
                StoredLine::Record(record) => Some(*record),
                StoredLine::Unreadable(_) => None,
            })
            .collect();
        Ok(f(records))
    }

    /// Load, modify and save under the exclusive lock
    fn transact<T>(&self, f: impl FnOnce(&mut Vec<StoredLine>) -> Result<T>) -> Result<T> {
        let lock = self.open_lock()?;
        lock.lock_exclusive()?;

        let result = self.read_lines().and_then(|mut lines| {
            let value = f(&mut lines)?;
            self.write_lines(&lines)?;
            Ok(value)
        });

        lock.unlock()?;
        result
    }

    /// All readable records in insertion order
    pub fn list(&self) -> Result<Vec<CaseRecord>> {
        self.with_shared(|records| records)
    }

    /// The most recent record holding `case_number`
    ///
    /// Numbers restart every month, so the same string can belong to cases
    /// from different years; the newest one wins. Use [`Self::find_by_id`]
    /// to reach an older case.
    pub fn find_by_number(&self, case_number: &str) -> Result<Option<CaseRecord>> {
        self.with_shared(|records| {
            records
                .into_iter()
                .filter(|r| r.case_number == case_number)
                .max_by_key(|r| r.created_at)
        })
    }

    pub fn find_by_id(&self, id: Uuid) -> Result<Option<CaseRecord>> {
        self.with_shared(|records| records.into_iter().find(|r| r.id == id))
    }

    /// Insert a new record, rejecting a number already held in its month
    pub fn insert(&self, record: CaseRecord) -> Result<CaseRecord> {
        self.transact(|lines| {
            check_claims(lines, None, &record)?;
            lines.push(StoredLine::Record(Box::new(record.clone())));
            tracing::debug!("Inserted case {}", record.case_number);
            Ok(record)
        })
    }

    /// Modify the most recent record with the given case number
    ///
    /// Nothing is written if `f` fails or if the modified record would reuse
    /// a number another record holds in the same month.
    pub fn update<F>(&self, case_number: &str, f: F) -> Result<CaseRecord>
    where
        F: FnOnce(&mut CaseRecord) -> Result<()>,
    {
        self.modify(
            |lines| {
                readable(lines)
                    .filter(|(_, r)| r.case_number == case_number)
                    .max_by_key(|(_, r)| r.created_at)
                    .map(|(index, _)| index)
            },
            &format!("Case {}", case_number),
            f,
        )
    }

    /// Modify the record with the given id
    pub fn update_by_id<F>(&self, id: Uuid, f: F) -> Result<CaseRecord>
    where
        F: FnOnce(&mut CaseRecord) -> Result<()>,
    {
        self.modify(
            |lines| {
                readable(lines)
                    .find(|(_, r)| r.id == id)
                    .map(|(index, _)| index)
            },
            &format!("Case id {}", id),
            f,
        )
    }

    fn modify<L, F>(&self, locate: L, what: &str, f: F) -> Result<CaseRecord>
    where
        L: FnOnce(&[StoredLine]) -> Option<usize>,
        F: FnOnce(&mut CaseRecord) -> Result<()>,
    {
        self.transact(|lines| {
            let index = locate(lines.as_slice())
                .ok_or_else(|| Error::NotFound(what.to_string()))?;
            let StoredLine::Record(current) = &lines[index] else {
                return Err(Error::NotFound(what.to_string()));
            };

            let mut record = current.as_ref().clone();
            f(&mut record)?;
            check_claims(lines, Some(index), &record)?;

            record.updated_at = Utc::now().max(record.updated_at);
            lines[index] = StoredLine::Record(Box::new(record.clone()));
            tracing::debug!("Updated case {}", record.case_number);
            Ok(record)
        })
    }
}

/// Readable records with their line index
fn readable(lines: &[StoredLine]) -> impl Iterator<Item = (usize, &CaseRecord)> {
    lines.iter().enumerate().filter_map(|(i, line)| match line {
        StoredLine::Record(record) => Some((i, record.as_ref())),
        StoredLine::Unreadable(_) => None,
    })
}

/// Each number a record holds, paired with the first day of the month it
/// was allocated in
///
/// Case numbers belong to the month of `created_at` and surgery numbers to
/// the month of the surgery, matching the windows the allocator counts in.
fn claims(record: &CaseRecord) -> Vec<(String, NaiveDate)> {
    let month = |at: DateTime<Utc>| PeriodWindow::month_of(at.date_naive()).start;

    let mut claims = vec![(record.case_number.clone(), month(record.created_at))];
    if let Some(surgery) = &record.surgery {
        if let Some(number) = &surgery.surgery_number {
            claims.push((number.clone(), month(surgery.recorded_at)));
        }
    }
    claims
}

/// Reject `record` if another line already holds one of its numbers in the
/// same month
fn check_claims(lines: &[StoredLine], skip: Option<usize>, record: &CaseRecord) -> Result<()> {
    let taken: HashSet<(String, NaiveDate)> = readable(lines)
        .filter(|(i, _)| Some(*i) != skip)
        .flat_map(|(_, r)| claims(r))
        .collect();

    for claim in claims(record) {
        if taken.contains(&claim) {
            return Err(Error::AllocationRace(claim.0));
        }
    }
    Ok(())
}

impl CaseNumberSource for CaseStore {
    fn find_case_numbers_matching(
        &self,
        prefix: &str,
        window: &PeriodWindow,
    ) -> Result<Vec<String>> {
        self.with_shared(|records| {
            let mut numbers = Vec::new();
            for record in records {
                if record.case_number.starts_with(prefix) && window.contains(record.created_at) {
                    numbers.push(record.case_number.clone());
                }
                if let Some(surgery) = &record.surgery {
                    if let Some(number) = &surgery.surgery_number {
                        if number.starts_with(prefix) && window.contains(surgery.recorded_at) {
                            numbers.push(number.clone());
                        }
                    }
                }
            }
            tracing::debug!("{} stored numbers match {}", numbers.len(), prefix);
            numbers
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CaseStatus, CatchingRecord, Gender, SurgeryRecord, SurgeryType};
    use chrono::{DateTime, NaiveDate, Utc};
    use uuid::Uuid;

    fn create_test_case(number: &str, at: &str) -> CaseRecord {
        let at: DateTime<Utc> = at.parse().unwrap();
        CaseRecord {
            id: Uuid::new_v4(),
            case_number: number.into(),
            org_code: "JS".into(),
            project_code: "TAL".into(),
            status: CaseStatus::Caught,
            created_at: at,
            updated_at: at,
            catching: CatchingRecord {
                caught_at: at,
                address: "Market Road".into(),
                ward_number: Some("7".into()),
                remarks: None,
            },
            surgery: None,
            treatments: Vec::new(),
            outcome: None,
        }
    }

    fn surgery(number: Option<&str>, at: &str) -> SurgeryRecord {
        SurgeryRecord {
            surgery_number: number.map(str::to_string),
            recorded_at: at.parse().unwrap(),
            weight_kg: 18.0,
            gender: Gender::Female,
            surgery_type: SurgeryType::Ovariohysterectomy,
            cancelled: false,
            cancellation_reason: None,
            medicines_used: Default::default(),
            remarks: None,
        }
    }

    fn jan_window() -> PeriodWindow {
        PeriodWindow::month_of(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap())
    }

    #[test]
    fn test_insert_and_find() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CaseStore::new(temp_dir.path().join("cases.jsonl"));

        store
            .insert(create_test_case("JS-TAL-JAN-C0001", "2026-01-05T10:00:00Z"))
            .unwrap();

        let found = store.find_by_number("JS-TAL-JAN-C0001").unwrap();
        assert!(found.is_some());
        assert!(store.find_by_number("JS-TAL-JAN-C0002").unwrap().is_none());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_number_is_a_race() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CaseStore::new(temp_dir.path().join("cases.jsonl"));

        store
            .insert(create_test_case("JS-TAL-JAN-C0001", "2026-01-05T10:00:00Z"))
            .unwrap();
        let err = store
            .insert(create_test_case("JS-TAL-JAN-C0001", "2026-01-05T10:00:01Z"))
            .unwrap_err();

        assert!(matches!(err, Error::AllocationRace(_)));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_update_rejects_surgery_number_in_use() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CaseStore::new(temp_dir.path().join("cases.jsonl"));

        let mut first = create_test_case("JS-TAL-JAN-C0001", "2026-01-05T10:00:00Z");
        first.surgery = Some(surgery(Some("JS-TAL-JAN-S0001"), "2026-01-06T10:00:00Z"));
        store.insert(first).unwrap();
        store
            .insert(create_test_case("JS-TAL-JAN-C0002", "2026-01-05T11:00:00Z"))
            .unwrap();

        let err = store
            .update("JS-TAL-JAN-C0002", |record| {
                record.surgery = Some(surgery(Some("JS-TAL-JAN-S0001"), "2026-01-06T11:00:00Z"));
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, Error::AllocationRace(_)));

        let unchanged = store.find_by_number("JS-TAL-JAN-C0002").unwrap().unwrap();
        assert!(unchanged.surgery.is_none());
    }

    #[test]
    fn test_same_number_in_a_later_year() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CaseStore::new(temp_dir.path().join("cases.jsonl"));

        let old = store
            .insert(create_test_case("JS-TAL-JAN-C0001", "2026-01-05T10:00:00Z"))
            .unwrap();
        let new = store
            .insert(create_test_case("JS-TAL-JAN-C0001", "2027-01-04T10:00:00Z"))
            .unwrap();

        // Lookups by number land on the newest holder
        let found = store.find_by_number("JS-TAL-JAN-C0001").unwrap().unwrap();
        assert_eq!(found.id, new.id);

        let updated = store
            .update("JS-TAL-JAN-C0001", |record| {
                record.status = CaseStatus::InKennel;
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.id, new.id);

        store
            .update_by_id(old.id, |record| {
                record.status = CaseStatus::Released;
                Ok(())
            })
            .unwrap();
        let old = store.find_by_id(old.id).unwrap().unwrap();
        assert_eq!(old.status, CaseStatus::Released);
        assert_eq!(
            store.find_by_id(new.id).unwrap().unwrap().status,
            CaseStatus::InKennel
        );
    }

    #[test]
    fn test_surgery_number_claimed_in_its_own_month() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CaseStore::new(temp_dir.path().join("cases.jsonl"));

        let mut first = create_test_case("JS-TAL-JAN-C0001", "2026-01-05T10:00:00Z");
        first.surgery = Some(surgery(Some("JS-TAL-FEB-S0001"), "2026-02-02T10:00:00Z"));
        store.insert(first).unwrap();
        store
            .insert(create_test_case("JS-TAL-FEB-C0001", "2026-02-01T10:00:00Z"))
            .unwrap();

        // Same S number a year later is free
        store
            .update("JS-TAL-FEB-C0001", |record| {
                record.surgery = Some(surgery(Some("JS-TAL-FEB-S0001"), "2027-02-03T10:00:00Z"));
                Ok(())
            })
            .unwrap();

        let err = store
            .insert({
                let mut clash = create_test_case("JS-TAL-FEB-C0002", "2026-02-03T10:00:00Z");
                clash.surgery = Some(surgery(Some("JS-TAL-FEB-S0001"), "2026-02-20T10:00:00Z"));
                clash
            })
            .unwrap_err();
        assert!(matches!(err, Error::AllocationRace(_)));
    }

    #[test]
    fn test_update_missing_case() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CaseStore::new(temp_dir.path().join("cases.jsonl"));

        let err = store.update("JS-TAL-JAN-C0009", |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_matching_numbers_respect_prefix_and_window() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CaseStore::new(temp_dir.path().join("cases.jsonl"));

        let mut operated = create_test_case("JS-TAL-JAN-C0001", "2026-01-05T10:00:00Z");
        operated.surgery = Some(surgery(Some("JS-TAL-JAN-S0001"), "2026-01-06T10:00:00Z"));
        store.insert(operated).unwrap();
        store
            .insert(create_test_case("JS-TAL-JAN-C0002", "2026-01-31T23:59:59Z"))
            .unwrap();
        // Same prefix a year earlier: outside the window.
        store
            .insert(create_test_case("JS-TAL-JAN-C0040", "2025-01-20T09:00:00Z"))
            .unwrap();
        store
            .insert(create_test_case("JS-TAL-FEB-C0001", "2026-02-01T00:00:01Z"))
            .unwrap();

        let mut catching = store
            .find_case_numbers_matching("JS-TAL-JAN-C", &jan_window())
            .unwrap();
        catching.sort();
        assert_eq!(catching, vec!["JS-TAL-JAN-C0001", "JS-TAL-JAN-C0002"]);

        let surgeries = store
            .find_case_numbers_matching("JS-TAL-JAN-S", &jan_window())
            .unwrap();
        assert_eq!(surgeries, vec!["JS-TAL-JAN-S0001"]);
    }

    #[test]
    fn test_unreadable_lines_are_kept() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("cases.jsonl");
        std::fs::write(&path, "{ not a case }\n").unwrap();

        let store = CaseStore::new(&path);
        assert!(store.list().unwrap().is_empty());

        store
            .insert(create_test_case("JS-TAL-JAN-C0001", "2026-01-05T10:00:00Z"))
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("{ not a case }\n"));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_store_file_replaced_atomically() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CaseStore::new(temp_dir.path().join("cases.jsonl"));
        store
            .insert(create_test_case("JS-TAL-JAN-C0001", "2026-01-05T10:00:00Z"))
            .unwrap();

        let mut names: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["cases.jsonl", "cases.lock"]);
    }
}
