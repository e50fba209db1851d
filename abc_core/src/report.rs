//! Stock usage over a calendar period.
//!
//! A report reads the stock ledger for a month, a week of a month, or an
//! arbitrary date range and totals each item's movements. Reversals net
//! against usage so a rolled-back deduction does not count.

use crate::case_number::PeriodWindow;
use crate::inventory::Inventory;
use crate::ledger::movements_between;
use crate::{Error, MovementKind, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

/// Calendar span a report covers, both ends inclusive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsagePeriod {
    Month { year: i32, month: u32 },
    /// Week N of a month: days `(N-1)*7+1` through `N*7`, cut at month end
    Week { year: i32, month: u32, week: u32 },
    Custom { start: NaiveDate, end: NaiveDate },
}

impl UsagePeriod {
    /// Parse a `YYYY-MM` month
    pub fn month(spec: &str) -> Result<Self> {
        let (year, month) = parse_year_month(spec)?;
        Ok(UsagePeriod::Month { year, month })
    }

    /// Week `week` (1-5) of a `YYYY-MM` month
    pub fn week(spec: &str, week: u32) -> Result<Self> {
        let (year, month) = parse_year_month(spec)?;
        Ok(UsagePeriod::Week { year, month, week })
    }

    /// First and last day covered
    pub fn bounds(&self) -> Result<(NaiveDate, NaiveDate)> {
        match *self {
            UsagePeriod::Month { year, month } => {
                let window = month_window(year, month)?;
                Ok((window.start, last_day(&window)?))
            }
            UsagePeriod::Week { year, month, week } => {
                let window = month_window(year, month)?;
                let last = last_day(&window)?;
                if week == 0 {
                    return Err(Error::InvalidInput("Weeks are numbered from 1".into()));
                }
                let start = window.start + Duration::days(i64::from(week - 1) * 7);
                if start > last {
                    return Err(Error::InvalidInput(format!(
                        "{}-{:02} has no week {}",
                        year, month, week
                    )));
                }
                Ok((start, (start + Duration::days(6)).min(last)))
            }
            UsagePeriod::Custom { start, end } => {
                if start > end {
                    return Err(Error::InvalidInput(format!(
                        "Range starts after it ends: {} to {}",
                        start, end
                    )));
                }
                Ok((start, end))
            }
        }
    }
}

impl fmt::Display for UsagePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let month_name = |year: i32, month: u32| {
            NaiveDate::from_ymd_opt(year, month, 1)
                .map(|d| d.format("%B %Y").to_string())
                .unwrap_or_else(|| format!("{}-{:02}", year, month))
        };
        match *self {
            UsagePeriod::Month { year, month } => write!(f, "{}", month_name(year, month)),
            UsagePeriod::Week { year, month, week } => {
                write!(f, "Week {} of {}", week, month_name(year, month))
            }
            UsagePeriod::Custom { start, end } => write!(f, "{} to {}", start, end),
        }
    }
}

fn parse_year_month(spec: &str) -> Result<(i32, u32)> {
    let invalid = || Error::InvalidInput(format!("Expected YYYY-MM, got '{}'", spec));
    let (year, month) = spec.trim().split_once('-').ok_or_else(invalid)?;
    let year: i32 = year.parse().map_err(|_| invalid())?;
    let month: u32 = month.parse().map_err(|_| invalid())?;
    month_window(year, month).map_err(|_| invalid())?;
    Ok((year, month))
}

fn month_window(year: i32, month: u32) -> Result<PeriodWindow> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .map(PeriodWindow::month_of)
        .ok_or_else(|| Error::InvalidInput(format!("No such month {}-{:02}", year, month)))
}

fn last_day(window: &PeriodWindow) -> Result<NaiveDate> {
    window
        .end
        .pred_opt()
        .ok_or_else(|| Error::InvalidInput("Month out of range".into()))
}

fn start_of(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Totals for one item over the period
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemUsage {
    /// Stock unit, when the item is still in the inventory
    pub unit: Option<String>,
    pub current_stock: Option<f64>,
    pub restocked: f64,
    /// Usage net of reversals
    pub used: f64,
    pub adjusted: f64,
    /// Cases the item was used on
    pub cases: BTreeSet<String>,
}

/// Per-item stock movement totals for a period
#[derive(Clone, Debug)]
pub struct UsageReport {
    pub name: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub items: BTreeMap<String, ItemUsage>,
}

/// Total the ledger's movements over `period`
pub fn usage_report(
    ledger_path: &Path,
    inventory: &Inventory,
    period: UsagePeriod,
) -> Result<UsageReport> {
    let (start, end) = period.bounds()?;
    let until = end
        .succ_opt()
        .map(|next| start_of(next) - Duration::nanoseconds(1))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    let mut items: BTreeMap<String, ItemUsage> = BTreeMap::new();
    for movement in movements_between(ledger_path, start_of(start), until)? {
        let usage = items.entry(movement.item.clone()).or_insert_with(|| {
            let stocked = inventory.get(&movement.item);
            ItemUsage {
                unit: stocked.map(|i| i.unit.clone()),
                current_stock: stocked.map(|i| i.current_stock),
                ..ItemUsage::default()
            }
        });

        match movement.kind {
            MovementKind::Restock => usage.restocked += movement.quantity,
            MovementKind::Usage => {
                usage.used += movement.quantity;
                if let Some(case) = &movement.case_number {
                    usage.cases.insert(case.clone());
                }
            }
            MovementKind::Reversal => usage.used -= movement.quantity,
            MovementKind::Adjustment => usage.adjusted += movement.quantity,
        }
    }

    tracing::debug!("Usage report for {} covers {} items", period, items.len());
    Ok(UsageReport {
        name: period.to_string(),
        start,
        end,
        items,
    })
}
