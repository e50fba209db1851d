//! Case lifecycle operations.
//!
//! Composes the allocator, dosage calculator, case store and inventory the
//! way request handlers do: catching opens a case under a fresh `C` number,
//! surgery and treatment record the medicines used and deduct them from
//! stock, feeding rounds deduct food, and release or mortality close the case.
//!
//! Stock is deducted before the case is written. If the case write fails the
//! deduction is put back and logged as a reversal, so a failed step can be
//! retried without double-counting.

use crate::allocator::{allocate_with_retry, next_in_scope, CaseNumberSource};
use crate::case_number::{month_abbr, CaseNumber, CaseScope, PeriodWindow};
use crate::dosage::{validate_weight, DosageCalculator};
use crate::inventory::{Inventory, Shortfall};
use crate::ledger::{FeedingLog, JsonlLedger, StockSink};
use crate::report::{usage_report, UsagePeriod, UsageReport};
use crate::store::CaseStore;
use crate::{
    CaseRecord, CaseStatus, CatchingRecord, Config, DosageResult, Error, FeedingRecord, Gender,
    MealTime, Outcome, RecordType, Result, StockKind, StockMovement, SurgeryRecord, SurgeryType,
    TreatmentRecord, WoundCondition,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Surgery details supplied by the vet
#[derive(Clone, Debug)]
pub struct SurgeryRequest {
    pub recorded_at: DateTime<Utc>,
    pub weight_kg: f64,
    pub gender: Gender,
    /// Set when the animal was found unfit and the surgery was cancelled
    pub cancellation_reason: Option<String>,
    pub remarks: Option<String>,
}

/// A recorded surgery and the stock it consumed
#[derive(Clone, Debug)]
pub struct SurgeryOutcome {
    pub case: CaseRecord,
    pub movements: Vec<StockMovement>,
}

/// One post-operative treatment round
#[derive(Clone, Debug)]
pub struct TreatmentRequest {
    pub recorded_at: DateTime<Utc>,
    /// Medicines given, in each drug's stock unit
    pub medicines: DosageResult,
    pub wound_condition: WoundCondition,
    pub remarks: Option<String>,
}

#[derive(Clone, Debug)]
pub struct TreatmentOutcome {
    pub case: CaseRecord,
    pub movements: Vec<StockMovement>,
}

/// One kennel feeding round
#[derive(Clone, Debug)]
pub struct FeedingRequest {
    pub fed_at: DateTime<Utc>,
    pub meal_time: MealTime,
    pub kennel_numbers: Vec<String>,
    pub food_items: BTreeMap<String, f64>,
    pub remarks: Option<String>,
}

#[derive(Clone, Debug)]
pub struct FeedingOutcome {
    pub feeding: FeedingRecord,
    pub movements: Vec<StockMovement>,
}

fn check_open(record: &CaseRecord) -> Result<()> {
    if record.status.is_closed() {
        return Err(Error::InvalidTransition(format!(
            "{} is already {}",
            record.case_number, record.status
        )));
    }
    Ok(())
}

fn check_surgery_allowed(record: &CaseRecord) -> Result<()> {
    check_open(record)?;
    if record.surgery.is_some() {
        return Err(Error::InvalidTransition(format!(
            "{} already has a surgery record",
            record.case_number
        )));
    }
    Ok(())
}

/// Days since surgery for a treatment round on an operated case
fn treatment_day(record: &CaseRecord, at: DateTime<Utc>) -> Result<i64> {
    let surgery = match (&record.surgery, record.status) {
        (
            Some(surgery),
            CaseStatus::SurgeryCompleted | CaseStatus::UnderTreatment,
        ) if !surgery.cancelled => surgery,
        _ => {
            return Err(Error::InvalidTransition(format!(
                "{} is {}, treatment follows a completed surgery",
                record.case_number, record.status
            )))
        }
    };

    let days = (at.date_naive() - surgery.recorded_at.date_naive()).num_days();
    if days < 0 {
        return Err(Error::InvalidInput(format!(
            "Treatment on {} is before the surgery of {}",
            at.date_naive(),
            record.case_number
        )));
    }
    Ok(days)
}

/// Lifecycle operations over one project's data directory
pub struct CaseService {
    store: CaseStore,
    inventory_path: PathBuf,
    ledger: JsonlLedger,
    feedings: FeedingLog,
    calculator: DosageCalculator,
    scope: CaseScope,
    max_attempts: u32,
    surgery_sequence: bool,
}

impl CaseService {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            store: CaseStore::new(config.cases_path()),
            inventory_path: config.inventory_path(),
            ledger: JsonlLedger::new(config.ledger_path()),
            feedings: FeedingLog::new(config.feeding_path()),
            calculator: config.dosage_calculator()?,
            scope: config.scope()?,
            max_attempts: config.allocation.max_attempts,
            surgery_sequence: config.allocation.surgery_sequence,
        })
    }

    pub fn store(&self) -> &CaseStore {
        &self.store
    }

    pub fn calculator(&self) -> &DosageCalculator {
        &self.calculator
    }

    pub fn scope(&self) -> &CaseScope {
        &self.scope
    }

    pub fn ledger(&self) -> &JsonlLedger {
        &self.ledger
    }

    pub fn feedings(&self) -> &FeedingLog {
        &self.feedings
    }

    /// The case a number refers to, or `NotFound`
    fn case_for(&self, case_number: &str) -> Result<CaseRecord> {
        self.store
            .find_by_number(case_number)?
            .ok_or_else(|| Error::NotFound(format!("Case {}", case_number)))
    }

    /// The number the next record of `record_type` would get, without storing it
    pub fn preview_number(&self, record_type: RecordType, at: DateTime<Utc>) -> Result<CaseNumber> {
        let period_start = at.date_naive();
        let prefix = self.scope.prefix(&month_abbr(period_start), record_type);
        let existing = self
            .store
            .find_case_numbers_matching(&prefix, &PeriodWindow::month_of(period_start))?;
        next_in_scope(&self.scope, period_start, record_type, &existing)
    }

    /// Open a case for a caught animal under the next `C` number of its month
    pub fn open_case(&self, catching: CatchingRecord) -> Result<CaseRecord> {
        let created_at = catching.caught_at;

        let record = allocate_with_retry(
            &self.store,
            &self.scope,
            RecordType::Catching,
            created_at.date_naive(),
            self.max_attempts,
            |number| {
                self.store.insert(CaseRecord {
                    id: Uuid::new_v4(),
                    case_number: number.to_string(),
                    org_code: self.scope.org().to_string(),
                    project_code: self.scope.project().to_string(),
                    status: CaseStatus::Caught,
                    created_at,
                    updated_at: created_at,
                    catching: catching.clone(),
                    surgery: None,
                    treatments: Vec::new(),
                    outcome: None,
                })
            },
        )?;

        tracing::info!("Case created: {}", record.case_number);
        Ok(record)
    }

    /// Move a caught animal into a kennel
    pub fn admit_to_kennel(&self, case_number: &str) -> Result<CaseRecord> {
        self.store.update(case_number, |record| {
            if record.status != CaseStatus::Caught {
                return Err(Error::InvalidTransition(format!(
                    "{} is {}, only caught animals can be kennelled",
                    record.case_number, record.status
                )));
            }
            record.status = CaseStatus::InKennel;
            Ok(())
        })
    }

    /// Medicines the protocol prescribes for an animal, if it is in range
    ///
    /// Animals outside the surgical weight range get an empty plan; the vet
    /// records their medicines by hand.
    pub fn medicine_plan(&self, weight_kg: f64, gender: Gender) -> Result<DosageResult> {
        validate_weight(weight_kg)?;
        match self.calculator.surgery_plan(weight_kg, gender) {
            Ok(plan) => Ok(plan),
            Err(Error::InvalidInput(reason)) => {
                tracing::warn!("No automatic medicines: {}", reason);
                Ok(DosageResult::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Record the (possibly cancelled) surgery of a case
    ///
    /// Completed surgeries deduct their medicine plan from stock and log
    /// each deduction; cancelled ones deduct nothing.
    pub fn record_surgery(
        &mut self,
        case_number: &str,
        request: SurgeryRequest,
    ) -> Result<SurgeryOutcome> {
        let cancelled = request.cancellation_reason.is_some();
        let medicines_used = if cancelled {
            DosageResult::new()
        } else {
            self.medicine_plan(request.weight_kg, request.gender)?
        };

        let target = self.case_for(case_number)?;
        check_surgery_allowed(&target)?;

        let surgery = SurgeryRecord {
            surgery_number: None,
            recorded_at: request.recorded_at,
            weight_kg: request.weight_kg,
            gender: request.gender,
            surgery_type: SurgeryType::for_gender(request.gender),
            cancelled,
            cancellation_reason: request.cancellation_reason,
            medicines_used,
            remarks: request.remarks,
        };

        let apply = |record: &mut CaseRecord, surgery: SurgeryRecord| -> Result<()> {
            check_surgery_allowed(record)?;
            record.status = if surgery.cancelled {
                CaseStatus::SurgeryCancelled
            } else {
                CaseStatus::SurgeryCompleted
            };
            record.updated_at = surgery.recorded_at;
            record.surgery = Some(surgery);
            Ok(())
        };

        let plan = surgery.medicines_used.clone();
        let at = surgery.recorded_at;
        let numbered = self.surgery_sequence && !cancelled;

        let deduct = (!plan.is_empty()).then_some(
            |inventory: &mut Inventory| -> Result<Vec<StockMovement>> {
                Ok(inventory.deduct_plan(&plan, case_number, at))
            },
        );

        let (case, movements) = self.deduct_then(deduct, |service| {
            if !numbered {
                return service
                    .store
                    .update_by_id(target.id, |record| apply(record, surgery.clone()));
            }
            allocate_with_retry(
                &service.store,
                &service.scope,
                RecordType::Surgery,
                at.date_naive(),
                service.max_attempts,
                |number| {
                    let with_number = SurgeryRecord {
                        surgery_number: Some(number.to_string()),
                        ..surgery.clone()
                    };
                    service
                        .store
                        .update_by_id(target.id, |record| apply(record, with_number))
                },
            )
        })?;

        tracing::info!(
            "Surgery recorded for {} ({}), {} medicines deducted",
            case_number,
            case.status,
            movements.len()
        );
        Ok(SurgeryOutcome { case, movements })
    }

    /// Record a post-operative treatment round and deduct its medicines
    ///
    /// Allowed after a completed surgery; moves the case to Under Treatment.
    pub fn record_treatment(
        &mut self,
        case_number: &str,
        request: TreatmentRequest,
    ) -> Result<TreatmentOutcome> {
        for (drug, quantity) in request.medicines.iter() {
            if !quantity.is_finite() || quantity < 0.0 {
                return Err(Error::InvalidInput(format!(
                    "Quantity of {} must not be negative, got {}",
                    drug, quantity
                )));
            }
        }

        let target = self.case_for(case_number)?;
        let day_post_surgery = treatment_day(&target, request.recorded_at)?;

        let treatment = TreatmentRecord {
            recorded_at: request.recorded_at,
            day_post_surgery,
            wound_condition: request.wound_condition,
            medicines_used: request.medicines.retain_positive(),
            remarks: request.remarks,
        };
        let plan = treatment.medicines_used.clone();
        let at = treatment.recorded_at;

        let deduct = (!plan.is_empty()).then_some(
            |inventory: &mut Inventory| -> Result<Vec<StockMovement>> {
                Ok(inventory.deduct_plan(&plan, case_number, at))
            },
        );

        let (case, movements) = self.deduct_then(deduct, |service| {
            service.store.update_by_id(target.id, |record| {
                treatment_day(record, at)?;
                record.status = CaseStatus::UnderTreatment;
                record.treatments.push(treatment);
                Ok(())
            })
        })?;

        tracing::info!(
            "Treatment day {} recorded for {}, {} medicines deducted",
            day_post_surgery,
            case_number,
            movements.len()
        );
        Ok(TreatmentOutcome { case, movements })
    }

    /// Record a feeding round and deduct the food from stock
    ///
    /// Every food item must be stocked food; a round naming anything else is
    /// rejected whole.
    pub fn record_feeding(&mut self, request: FeedingRequest) -> Result<FeedingOutcome> {
        if request.kennel_numbers.is_empty() {
            return Err(Error::InvalidInput("A feeding round needs at least one kennel".into()));
        }
        if request.food_items.is_empty() {
            return Err(Error::InvalidInput("A feeding round needs at least one food item".into()));
        }

        let feeding = FeedingRecord {
            id: Uuid::new_v4(),
            fed_at: request.fed_at,
            meal_time: request.meal_time,
            kennel_numbers: request.kennel_numbers,
            food_items: request.food_items,
            remarks: request.remarks,
        };
        let note = format!(
            "{} feeding, kennels {}",
            feeding.meal_time,
            feeding.kennel_numbers.join(", ")
        );

        let ((), movements) = self.deduct_then(
            Some(|inventory: &mut Inventory| {
                inventory.deduct_food(&feeding.food_items, &note, feeding.fed_at)
            }),
            |service| service.feedings.append(&feeding),
        )?;

        tracing::info!(
            "{} feeding recorded for {} kennels",
            feeding.meal_time,
            feeding.kennel_numbers.len()
        );
        Ok(FeedingOutcome { feeding, movements })
    }

    /// Deduct stock, log it, then run `commit`
    ///
    /// `None` skips the inventory entirely. When logging or `commit` fails the
    /// deduction is put back; reversals are logged for whatever usage lines
    /// made it into the ledger.
    fn deduct_then<D, C, T>(
        &mut self,
        deduct: Option<D>,
        commit: C,
    ) -> Result<(T, Vec<StockMovement>)>
    where
        D: FnOnce(&mut Inventory) -> Result<Vec<StockMovement>>,
        C: FnOnce(&Self) -> Result<T>,
    {
        let usages = match deduct {
            Some(deduct) => Inventory::update(&self.inventory_path, deduct)?,
            None => Vec::new(),
        };

        for (logged, usage) in usages.iter().enumerate() {
            if let Err(e) = self.ledger.append(usage) {
                self.restore(&usages, logged);
                return Err(e);
            }
        }

        match commit(&*self) {
            Ok(value) => Ok((value, usages)),
            Err(e) => {
                tracing::warn!("Putting back {} deducted items: {}", usages.len(), e);
                self.restore(&usages, usages.len());
                Err(e)
            }
        }
    }

    /// Undo `usages` in the inventory and log reversals for the first
    /// `logged` of them
    fn restore(&mut self, usages: &[StockMovement], logged: usize) {
        if usages.is_empty() {
            return;
        }
        let reversals = match Inventory::update(&self.inventory_path, |inventory| {
            Ok(inventory.reverse_usage(usages))
        }) {
            Ok(reversals) => reversals,
            Err(e) => {
                tracing::error!("Stock not restored, {} usages stand: {}", usages.len(), e);
                return;
            }
        };

        for reversal in reversals.iter().take(logged) {
            if let Err(e) = self.ledger.append(reversal) {
                tracing::error!("Reversal of {} not logged: {}", reversal.item, e);
                return;
            }
        }
    }

    /// Put an operated animal back where it was caught
    pub fn record_release(
        &self,
        case_number: &str,
        released_at: DateTime<Utc>,
        remarks: Option<String>,
    ) -> Result<CaseRecord> {
        self.store.update(case_number, |record| {
            match record.status {
                CaseStatus::SurgeryCompleted
                | CaseStatus::SurgeryCancelled
                | CaseStatus::UnderTreatment => {}
                other => {
                    return Err(Error::InvalidTransition(format!(
                        "{} is {}, cannot release",
                        record.case_number, other
                    )))
                }
            }
            record.status = CaseStatus::Released;
            record.outcome = Some(Outcome::Released {
                released_at,
                remarks,
            });
            record.updated_at = released_at;
            Ok(())
        })
    }

    /// Close a case whose animal died
    pub fn record_mortality(
        &self,
        case_number: &str,
        died_at: DateTime<Utc>,
        cause: &str,
    ) -> Result<CaseRecord> {
        self.store.update(case_number, |record| {
            check_open(record)?;
            record.status = CaseStatus::Deceased;
            record.outcome = Some(Outcome::Deceased {
                died_at,
                cause: cause.to_string(),
            });
            record.updated_at = died_at;
            Ok(())
        })
    }

    pub fn load_inventory(&self) -> Result<Inventory> {
        Inventory::load(&self.inventory_path)
    }

    /// Add stock and log the restock
    pub fn restock(
        &mut self,
        item: &str,
        kind: StockKind,
        unit: &str,
        quantity: f64,
        at: DateTime<Utc>,
    ) -> Result<StockMovement> {
        let movement = Inventory::update(&self.inventory_path, |inventory| {
            inventory.restock(item, kind, unit, quantity, at)
        })?;
        self.ledger.append(&movement)?;
        Ok(movement)
    }

    /// Deduct stock used outside surgery and log it
    pub fn record_misc_use(
        &mut self,
        item: &str,
        quantity: f64,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<StockMovement> {
        let movement = Inventory::update(&self.inventory_path, |inventory| {
            inventory.record_misc_use(item, quantity, note, at)
        })?;
        self.ledger.append(&movement)?;
        Ok(movement)
    }

    /// Items a plan would overdraw from current stock
    pub fn shortfalls(&self, plan: &DosageResult) -> Result<Vec<Shortfall>> {
        Ok(self.load_inventory()?.shortfalls(plan))
    }

    /// Stock movement totals per item over `period`
    pub fn usage_report(&self, period: UsagePeriod) -> Result<UsageReport> {
        usage_report(self.ledger.path(), &self.load_inventory()?, period)
    }
}
