//! Medicine and food stock levels with file locking.
//!
//! The current stock snapshot is a JSON file written atomically; every
//! change also produces a [`StockMovement`] for the ledger. Deductions never
//! check sufficiency: stock may go negative and the shortfall report is a
//! separate, read-only question. A snapshot that cannot be parsed reads as
//! empty and is renamed to `<name>.corrupt` before the next save replaces it.

use crate::{
    DosageResult, Error, MovementKind, Result, StockItem, StockKind, StockMovement,
};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;

/// Stock levels keyed by item name
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Inventory {
    pub items: BTreeMap<String, StockItem>,
}

/// An item that would go below zero if a plan were deducted
#[derive(Clone, Debug, PartialEq)]
pub struct Shortfall {
    pub item: String,
    pub required: f64,
    /// `None` when the item is not stocked at all
    pub available: Option<f64>,
}

fn movement(
    item: &str,
    kind: MovementKind,
    quantity: f64,
    case_number: Option<&str>,
    note: Option<&str>,
    at: DateTime<Utc>,
) -> StockMovement {
    StockMovement {
        id: Uuid::new_v4(),
        item: item.to_string(),
        kind,
        quantity,
        case_number: case_number.map(str::to_string),
        recorded_at: at,
        note: note.map(str::to_string),
    }
}

fn validate_quantity(quantity: f64) -> Result<()> {
    if !quantity.is_finite() || quantity <= 0.0 {
        return Err(Error::InvalidInput(format!(
            "Quantity must be positive, got {}",
            quantity
        )));
    }
    Ok(())
}

/// What a snapshot read found on disk
enum Snapshot {
    Missing,
    Parsed(Inventory),
    Unreadable(String),
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    if !path.exists() {
        return Ok(Snapshot::Missing);
    }

    let file = File::open(path)?;
    file.lock_shared()?;
    let mut contents = String::new();
    let read = std::io::BufReader::new(&file).read_to_string(&mut contents);
    file.unlock()?;
    read?;

    Ok(match serde_json::from_str::<Inventory>(&contents) {
        Ok(inventory) => Snapshot::Parsed(inventory),
        Err(e) => Snapshot::Unreadable(e.to_string()),
    })
}

/// Move an unreadable snapshot out of the way before it is replaced
///
/// The file keeps its contents under `<name>.corrupt`, or
/// `<name>.corrupt.<timestamp>` when an earlier copy already sits there.
fn quarantine(path: &Path) -> Result<PathBuf> {
    let mut aside = path.as_os_str().to_owned();
    aside.push(".corrupt");
    let mut aside = PathBuf::from(aside);
    if aside.exists() {
        let mut stamped = aside.into_os_string();
        stamped.push(format!(".{}", Utc::now().format("%Y%m%dT%H%M%S%.f")));
        aside = PathBuf::from(stamped);
    }

    std::fs::rename(path, &aside)?;
    tracing::warn!("Moved unreadable inventory {:?} to {:?}", path, aside);
    Ok(aside)
}

impl Inventory {
    /// Load inventory from a file with shared locking
    ///
    /// A missing file is an empty inventory. So is one that cannot be read
    /// or parsed, with a warning; the next [`Inventory::update`] moves an
    /// unparsable file aside before saving.
    pub fn load(path: &Path) -> Result<Self> {
        match read_snapshot(path) {
            Ok(Snapshot::Missing) => {
                tracing::info!("No inventory file found, starting empty");
                Ok(Self::default())
            }
            Ok(Snapshot::Parsed(inventory)) => {
                tracing::debug!("Loaded {} stock items from {:?}", inventory.items.len(), path);
                Ok(inventory)
            }
            Ok(Snapshot::Unreadable(reason)) => {
                tracing::warn!("Failed to parse inventory {:?}: {}. Starting empty.", path, reason);
                Ok(Self::default())
            }
            Err(e) => {
                tracing::warn!("Failed to read inventory {:?}: {}. Starting empty.", path, e);
                Ok(Self::default())
            }
        }
    }

    /// Save inventory with exclusive locking, via temp file and rename
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp = NamedTempFile::new_in(path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "inventory path missing parent")
        })?)?;

        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string_pretty(self)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved inventory to {:?}", path);
        Ok(())
    }

    /// Load, modify and save back
    ///
    /// Concurrent updates are serialized through an exclusive lock on a
    /// sidecar `.lock` file held for the whole read-modify-write.
    pub fn update<T, F>(path: &Path, f: F) -> Result<T>
    where
        F: FnOnce(&mut Inventory) -> Result<T>,
    {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path.with_extension("lock"))?;
        lock.lock_exclusive()?;

        let result = Self::load_for_update(path).and_then(|mut inventory| {
            let value = f(&mut inventory)?;
            inventory.save(path)?;
            Ok(value)
        });

        lock.unlock()?;
        result
    }

    /// Like [`Inventory::load`], but read errors propagate so nothing is
    /// saved over a file that could not be read
    fn load_for_update(path: &Path) -> Result<Self> {
        match read_snapshot(path)? {
            Snapshot::Missing => Ok(Self::default()),
            Snapshot::Parsed(inventory) => Ok(inventory),
            Snapshot::Unreadable(reason) => {
                tracing::warn!("Inventory {:?} is unreadable ({})", path, reason);
                quarantine(path)?;
                Ok(Self::default())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&StockItem> {
        self.items.get(name)
    }

    /// Add stock, registering the item on first restock
    pub fn restock(
        &mut self,
        name: &str,
        kind: StockKind,
        unit: &str,
        quantity: f64,
        at: DateTime<Utc>,
    ) -> Result<StockMovement> {
        validate_quantity(quantity)?;

        let item = self.items.entry(name.to_string()).or_insert_with(|| StockItem {
            name: name.to_string(),
            kind,
            unit: unit.to_string(),
            current_stock: 0.0,
        });
        item.current_stock += quantity;

        tracing::info!("Restocked {} {} of {}", quantity, item.unit, name);
        Ok(movement(name, MovementKind::Restock, quantity, None, None, at))
    }

    /// Deduct stock used outside a surgery (spillage, expiry, treatment)
    pub fn record_misc_use(
        &mut self,
        name: &str,
        quantity: f64,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<StockMovement> {
        validate_quantity(quantity)?;

        let item = self
            .items
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("Stock item {}", name)))?;
        item.current_stock -= quantity;

        Ok(movement(
            name,
            MovementKind::Adjustment,
            quantity,
            None,
            Some(note),
            at,
        ))
    }

    /// Deduct every positive dose of a plan from the matching stocked item
    ///
    /// Drugs the inventory does not stock are skipped.
    pub fn deduct_plan(
        &mut self,
        plan: &DosageResult,
        case_number: &str,
        at: DateTime<Utc>,
    ) -> Vec<StockMovement> {
        let mut movements = Vec::new();

        for (drug, dose) in plan.iter() {
            if dose <= 0.0 {
                continue;
            }
            let Some(item) = self.items.get_mut(drug.as_str()) else {
                tracing::debug!("{} not stocked, nothing deducted", drug);
                continue;
            };
            item.current_stock -= dose;
            if item.current_stock < 0.0 {
                tracing::warn!("{} stock is negative ({})", drug, item.current_stock);
            }
            movements.push(movement(
                drug.as_str(),
                MovementKind::Usage,
                dose,
                Some(case_number),
                None,
                at,
            ));
        }

        movements
    }

    /// Deduct one feeding round from food stock
    ///
    /// Every item must be stocked food; nothing is deducted otherwise.
    pub fn deduct_food(
        &mut self,
        food_items: &BTreeMap<String, f64>,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<StockMovement>> {
        for (name, quantity) in food_items {
            validate_quantity(*quantity)?;
            let item = self
                .items
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("Stock item {}", name)))?;
            if item.kind != StockKind::Food {
                return Err(Error::InvalidInput(format!("{} is not a food item", name)));
            }
        }

        let mut movements = Vec::new();
        for (name, quantity) in food_items {
            if let Some(item) = self.items.get_mut(name) {
                item.current_stock -= quantity;
                if item.current_stock < 0.0 {
                    tracing::warn!("{} stock is negative ({})", name, item.current_stock);
                }
            }
            movements.push(movement(
                name,
                MovementKind::Usage,
                *quantity,
                None,
                Some(note),
                at,
            ));
        }
        Ok(movements)
    }

    /// Put back the stock taken by earlier usage movements
    ///
    /// Each reversal carries the timestamp of the usage it cancels, so both
    /// fall in the same reporting period.
    pub fn reverse_usage(&mut self, usages: &[StockMovement]) -> Vec<StockMovement> {
        usages
            .iter()
            .filter(|m| m.kind == MovementKind::Usage)
            .map(|usage| {
                if let Some(item) = self.items.get_mut(&usage.item) {
                    item.current_stock += usage.quantity;
                }
                movement(
                    &usage.item,
                    MovementKind::Reversal,
                    usage.quantity,
                    usage.case_number.as_deref(),
                    Some(&format!("reverses {}", usage.id)),
                    usage.recorded_at,
                )
            })
            .collect()
    }

    /// Items the plan would overdraw
    pub fn shortfalls(&self, plan: &DosageResult) -> Vec<Shortfall> {
        plan.iter()
            .filter(|(_, dose)| *dose > 0.0)
            .filter_map(|(drug, dose)| {
                let available = self.items.get(drug.as_str()).map(|i| i.current_stock);
                match available {
                    Some(stock) if stock >= dose => None,
                    _ => Some(Shortfall {
                        item: drug.to_string(),
                        required: dose,
                        available,
                    }),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DrugName;

    fn plan(entries: &[(&str, f64)]) -> DosageResult {
        let mut plan = DosageResult::new();
        for (name, dose) in entries {
            plan.insert(DrugName::from(*name), *dose);
        }
        plan
    }

    fn stocked() -> Inventory {
        let mut inventory = Inventory::default();
        inventory
            .restock("Xylazine", StockKind::Medicine, "ml", 10.0, Utc::now())
            .unwrap();
        inventory
            .restock("Ketamine", StockKind::Medicine, "ml", 3.0, Utc::now())
            .unwrap();
        inventory
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("inventory.json");

        stocked().save(&path).unwrap();
        let loaded = Inventory::load(&path).unwrap();

        assert_eq!(loaded.items.len(), 2);
        assert_eq!(loaded.get("Xylazine").unwrap().current_stock, 10.0);
    }

    #[test]
    fn test_load_nonexistent_returns_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let inventory = Inventory::load(&temp_dir.path().join("none.json")).unwrap();
        assert!(inventory.items.is_empty());
    }

    #[test]
    fn test_corrupted_inventory_returns_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("inventory.json");
        std::fs::write(&path, "{ invalid json }").unwrap();

        let inventory = Inventory::load(&path).unwrap();
        assert!(inventory.items.is_empty());
    }

    #[test]
    fn test_update_moves_corrupt_snapshot_aside() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("inventory.json");
        std::fs::write(&path, "{ invalid json }").unwrap();

        Inventory::update(&path, |inv| {
            inv.restock("Pedigree", StockKind::Food, "kg", 25.0, Utc::now())
        })
        .unwrap();

        let aside = temp_dir.path().join("inventory.json.corrupt");
        assert_eq!(std::fs::read_to_string(&aside).unwrap(), "{ invalid json }");
        assert_eq!(
            Inventory::load(&path).unwrap().get("Pedigree").unwrap().current_stock,
            25.0
        );

        // A second corrupt snapshot does not overwrite the first copy
        std::fs::write(&path, "not json").unwrap();
        Inventory::update(&path, |_| Ok(())).unwrap();
        let copies = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt"))
            .count();
        assert_eq!(copies, 2);
        assert_eq!(std::fs::read_to_string(&aside).unwrap(), "{ invalid json }");
    }

    #[test]
    fn test_update_fails_when_snapshot_cannot_be_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("inventory.json");
        std::fs::create_dir(&path).unwrap();

        let result = Inventory::update(&path, |inv| {
            inv.restock("Pedigree", StockKind::Food, "kg", 25.0, Utc::now())
        });
        assert!(result.is_err());
        assert!(path.is_dir());
        assert!(!temp_dir.path().join("inventory.json.corrupt").exists());
    }

    #[test]
    fn test_deduct_food_checks_every_item_first() {
        let mut inventory = stocked();
        inventory
            .restock("Pedigree", StockKind::Food, "kg", 20.0, Utc::now())
            .unwrap();

        let mut round = BTreeMap::new();
        round.insert("Pedigree".to_string(), 2.5);
        let movements = inventory
            .deduct_food(&round, "Morning feeding", Utc::now())
            .unwrap();
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].note.as_deref(), Some("Morning feeding"));
        assert_eq!(inventory.get("Pedigree").unwrap().current_stock, 17.5);

        // A medicine in the round rejects the whole round
        round.insert("Xylazine".to_string(), 1.0);
        assert!(matches!(
            inventory.deduct_food(&round, "Evening feeding", Utc::now()),
            Err(Error::InvalidInput(_))
        ));
        round.remove("Xylazine");
        round.insert("Rice".to_string(), 1.0);
        assert!(matches!(
            inventory.deduct_food(&round, "Evening feeding", Utc::now()),
            Err(Error::NotFound(_))
        ));
        assert_eq!(inventory.get("Pedigree").unwrap().current_stock, 17.5);
    }

    #[test]
    fn test_reverse_usage_restores_stock() {
        let mut inventory = stocked();
        let usages = inventory.deduct_plan(
            &plan(&[("Xylazine", 2.0), ("Ketamine", 4.5)]),
            "JS-TAL-JAN-C0001",
            Utc::now(),
        );

        let reversals = inventory.reverse_usage(&usages);
        assert_eq!(reversals.len(), 2);
        assert!(reversals.iter().all(|m| m.kind == MovementKind::Reversal));
        assert_eq!(
            reversals[0].note.as_deref(),
            Some(format!("reverses {}", usages[0].id).as_str())
        );
        assert_eq!(inventory.get("Xylazine").unwrap().current_stock, 10.0);
        assert_eq!(inventory.get("Ketamine").unwrap().current_stock, 3.0);
    }

    #[test]
    fn test_restock_accumulates() {
        let mut inventory = stocked();
        let movement = inventory
            .restock("Xylazine", StockKind::Medicine, "ml", 2.5, Utc::now())
            .unwrap();

        assert_eq!(movement.kind, MovementKind::Restock);
        assert_eq!(inventory.get("Xylazine").unwrap().current_stock, 12.5);
        assert!(inventory
            .restock("Xylazine", StockKind::Medicine, "ml", -1.0, Utc::now())
            .is_err());
    }

    #[test]
    fn test_deduct_plan_allows_negative_and_skips_unstocked() {
        let mut inventory = stocked();
        let movements = inventory.deduct_plan(
            &plan(&[("Xylazine", 2.0), ("Ketamine", 4.5), ("Avil", 1.0), ("Diazepam", 0.0)]),
            "JS-TAL-JAN-C0001",
            Utc::now(),
        );

        assert_eq!(movements.len(), 2);
        assert!(movements.iter().all(|m| m.kind == MovementKind::Usage));
        assert_eq!(inventory.get("Xylazine").unwrap().current_stock, 8.0);
        assert_eq!(inventory.get("Ketamine").unwrap().current_stock, -1.5);
        assert!(inventory.get("Avil").is_none());
    }

    #[test]
    fn test_shortfalls() {
        let inventory = stocked();
        let shortfalls =
            inventory.shortfalls(&plan(&[("Xylazine", 2.0), ("Ketamine", 4.5), ("Avil", 1.0)]));

        assert_eq!(
            shortfalls,
            vec![
                Shortfall {
                    item: "Avil".into(),
                    required: 1.0,
                    available: None,
                },
                Shortfall {
                    item: "Ketamine".into(),
                    required: 4.5,
                    available: Some(3.0),
                },
            ]
        );
    }

    #[test]
    fn test_misc_use_requires_known_item() {
        let mut inventory = stocked();
        let movement = inventory
            .record_misc_use("Xylazine", 0.5, "vial dropped", Utc::now())
            .unwrap();
        assert_eq!(movement.kind, MovementKind::Adjustment);
        assert_eq!(inventory.get("Xylazine").unwrap().current_stock, 9.5);

        assert!(matches!(
            inventory.record_misc_use("Pedigree", 1.0, "spoiled", Utc::now()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_update_pattern() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("inventory.json");

        Inventory::update(&path, |inv| {
            inv.restock("Pedigree", StockKind::Food, "kg", 25.0, Utc::now())
        })
        .unwrap();

        let loaded = Inventory::load(&path).unwrap();
        assert_eq!(loaded.get("Pedigree").unwrap().kind, StockKind::Food);
    }
}
