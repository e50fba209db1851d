//! Stock ledger and feeding log.
//!
//! Both are JSON Lines files that only ever grow. Appends hold an exclusive
//! `flock` on the file itself; reads hold a shared one and drop lines that
//! no longer parse, so one torn write costs one entry rather than the file.

use crate::{FeedingRecord, Result, StockMovement};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Where stock movements end up
pub trait StockSink {
    fn append(&mut self, movement: &StockMovement) -> Result<()>;
}

/// Stock movements, one JSON object per line
pub struct JsonlLedger {
    path: PathBuf,
}

impl JsonlLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StockSink for JsonlLedger {
    fn append(&mut self, movement: &StockMovement) -> Result<()> {
        append_line(&self.path, movement)?;
        tracing::debug!(
            "Ledger: {:?} {} {}",
            movement.kind,
            movement.quantity,
            movement.item
        );
        Ok(())
    }
}

/// Feeding rounds, one JSON object per line
pub struct FeedingLog {
    path: PathBuf,
}

impl FeedingLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, feeding: &FeedingRecord) -> Result<()> {
        append_line(&self.path, feeding)?;
        tracing::debug!("Feeding log: {} round {}", feeding.meal_time, feeding.id);
        Ok(())
    }
}

fn append_line<T: Serialize>(path: &Path, entry: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Serialize before taking the lock so a bad entry never holds it
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;
    let written = (&file).write_all(line.as_bytes()).and_then(|_| (&file).flush());
    file.unlock()?;
    written?;
    Ok(())
}

fn read_entries<T: DeserializeOwned>(path: &Path, what: &str) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let mut entries = Vec::new();
    for (index, line) in BufReader::new(&file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!("Skipping {} line {} of {:?}: {}", what, index + 1, path, e),
        }
    }

    file.unlock()?;
    tracing::debug!("{} {} entries in {:?}", entries.len(), what, path);
    Ok(entries)
}

/// Every readable movement in the ledger, in append order
pub fn read_movements(path: &Path) -> Result<Vec<StockMovement>> {
    read_entries(path, "stock movement")
}

/// Movements recorded in `[start, end]`, both ends inclusive
pub fn movements_between(
    path: &Path,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<StockMovement>> {
    Ok(read_movements(path)?
        .into_iter()
        .filter(|m| m.recorded_at >= start && m.recorded_at <= end)
        .collect())
}

/// Every readable feeding round, in append order
pub fn read_feedings(path: &Path) -> Result<Vec<FeedingRecord>> {
    read_entries(path, "feeding")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MealTime, MovementKind};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn usage(item: &str, quantity: f64, at: &str) -> StockMovement {
        StockMovement {
            id: Uuid::new_v4(),
            item: item.into(),
            kind: MovementKind::Usage,
            quantity,
            case_number: Some("JS-TAL-JAN-C0001".into()),
            recorded_at: at.parse().unwrap(),
            note: None,
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("stock_ledger.jsonl");

        let mut ledger = JsonlLedger::new(&path);
        ledger.append(&usage("Xylazine", 1.5, "2026-01-06T10:00:00Z")).unwrap();
        ledger.append(&usage("Ketamine", 4.5, "2026-01-06T10:00:00Z")).unwrap();

        let movements = read_movements(&path).unwrap();
        assert_eq!(movements.len(), 2);
        assert_eq!(movements[1].item, "Ketamine");
        assert_eq!(movements[1].quantity, 4.5);
    }

    #[test]
    fn test_missing_files_read_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(read_movements(&temp_dir.path().join("nope.jsonl")).unwrap().is_empty());
        assert!(read_feedings(&temp_dir.path().join("nope.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn test_torn_line_costs_one_entry() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("stock_ledger.jsonl");

        let mut ledger = JsonlLedger::new(&path);
        ledger.append(&usage("Avil", 1.0, "2026-01-06T10:00:00Z")).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{ truncated").unwrap();
        drop(file);
        ledger.append(&usage("Avil", 2.0, "2026-01-07T10:00:00Z")).unwrap();

        let movements = read_movements(&path).unwrap();
        assert_eq!(movements.len(), 2);
        assert_eq!(movements[1].quantity, 2.0);
    }

    #[test]
    fn test_movements_between_is_inclusive() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("stock_ledger.jsonl");

        let mut ledger = JsonlLedger::new(&path);
        ledger.append(&usage("Avil", 1.0, "2026-01-31T23:59:59Z")).unwrap();
        ledger.append(&usage("Avil", 2.0, "2026-02-01T00:00:00Z")).unwrap();
        ledger.append(&usage("Avil", 3.0, "2026-02-28T23:59:59Z")).unwrap();
        ledger.append(&usage("Avil", 4.0, "2026-03-01T00:00:00Z")).unwrap();

        let february = movements_between(
            &path,
            "2026-02-01T00:00:00Z".parse().unwrap(),
            "2026-02-28T23:59:59Z".parse().unwrap(),
        )
        .unwrap();
        let quantities: Vec<f64> = february.iter().map(|m| m.quantity).collect();
        assert_eq!(quantities, vec![2.0, 3.0]);
    }

    #[test]
    fn test_feeding_log_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("feeding.jsonl");

        let mut food_items = BTreeMap::new();
        food_items.insert("Pedigree".to_string(), 3.0);
        let log = FeedingLog::new(&path);
        log.append(&FeedingRecord {
            id: Uuid::new_v4(),
            fed_at: "2026-01-06T07:00:00Z".parse().unwrap(),
            meal_time: MealTime::Morning,
            kennel_numbers: vec!["K1".into(), "K2".into()],
            food_items,
            remarks: None,
        })
        .unwrap();

        let feedings = read_feedings(&path).unwrap();
        assert_eq!(feedings.len(), 1);
        assert_eq!(feedings[0].kennel_numbers, vec!["K1", "K2"]);
        assert_eq!(feedings[0].food_items.get("Pedigree"), Some(&3.0));
    }
}
