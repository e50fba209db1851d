//! Case number formatting and parsing.
//!
//! Format: `{ORG}-{PROJECT}-{MON}-{T}{SEQ}`, e.g. `JS-TAL-JAN-C0001`.
//! `SEQ` is zero-padded to four digits and widened, never truncated, once it
//! passes 9999 (`JS-TAL-JAN-C10000`).

use crate::{Error, RecordType, Result};
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use std::fmt;
use std::str::FromStr;

/// Minimum zero-padded width of the sequence suffix
pub const SEQUENCE_WIDTH: usize = 4;

/// Organization and project a case belongs to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CaseScope {
    org: String,
    project: String,
}

impl CaseScope {
    pub fn new(org: &str, project: &str) -> Result<Self> {
        validate_code("organization", org)?;
        validate_code("project", project)?;
        Ok(Self {
            org: org.to_string(),
            project: project.to_string(),
        })
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Anchored prefix shared by every number of this scope, month and type
    pub fn prefix(&self, month_abbr: &str, record_type: RecordType) -> String {
        format!(
            "{}-{}-{}-{}",
            self.org,
            self.project,
            month_abbr,
            record_type.tag()
        )
    }
}

/// Org and project codes are 2-5 ASCII uppercase letters
fn validate_code(what: &str, code: &str) -> Result<()> {
    let valid = (2..=5).contains(&code.len()) && code.chars().all(|c| c.is_ascii_uppercase());
    if !valid {
        return Err(Error::InvalidInput(format!(
            "{} code must be 2-5 uppercase letters, got '{}'",
            what, code
        )));
    }
    Ok(())
}

/// Three-letter uppercase month name (`JAN` ... `DEC`)
pub fn month_abbr(date: NaiveDate) -> String {
    date.format("%b").to_string().to_uppercase()
}

fn month_from_abbr(abbr: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ];
    MONTHS.iter().position(|m| *m == abbr).map(|i| i as u32 + 1)
}

/// Half-open calendar month `[start, end)` in UTC
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeriodWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl PeriodWindow {
    pub fn month_of(date: NaiveDate) -> Self {
        // Day 1 of any month is always valid, and adding one month to it is too.
        let start = date.with_day(1).unwrap_or(date);
        let end = start
            .checked_add_months(Months::new(1))
            .unwrap_or(NaiveDate::MAX);
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let day = at.date_naive();
        self.start <= day && day < self.end
    }
}

/// Parse the all-digit sequence after `prefix`
///
/// Returns `None` for numbers of another prefix and for malformed suffixes
/// such as `CXXXX` or an empty tail.
pub fn sequence_suffix(prefix: &str, candidate: &str) -> Option<u32> {
    let tail = candidate.strip_prefix(prefix)?;
    if tail.is_empty() || !tail.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    tail.parse().ok()
}

/// A fully parsed case number
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CaseNumber {
    scope: CaseScope,
    month: u32,
    record_type: RecordType,
    sequence: u32,
}

impl CaseNumber {
    pub fn new(
        scope: CaseScope,
        period_start: NaiveDate,
        record_type: RecordType,
        sequence: u32,
    ) -> Result<Self> {
        if sequence == 0 {
            return Err(Error::InvalidInput("Sequence numbers start at 1".into()));
        }
        Ok(Self {
            scope,
            month: period_start.month(),
            record_type,
            sequence,
        })
    }

    pub fn scope(&self) -> &CaseScope {
        &self.scope
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// The prefix this number was allocated under
    pub fn prefix(&self) -> String {
        self.scope.prefix(&self.month_abbr(), self.record_type)
    }

    fn month_abbr(&self) -> String {
        // `month` is always 1..=12, so the fallback is unreachable.
        NaiveDate::from_ymd_opt(2000, self.month, 1)
            .map(month_abbr)
            .unwrap_or_default()
    }
}

impl fmt::Display for CaseNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:0width$}",
            self.prefix(),
            self.sequence,
            width = SEQUENCE_WIDTH
        )
    }
}

impl FromStr for CaseNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("Malformed case number '{}'", s));

        let parts: Vec<&str> = s.split('-').collect();
        let [org, project, month, tail] = parts.as_slice() else {
            return Err(invalid());
        };

        let scope = CaseScope::new(org, project).map_err(|_| invalid())?;
        let month = month_from_abbr(month).ok_or_else(invalid)?;

        let mut chars = tail.chars();
        let tag = chars.next().ok_or_else(invalid)?;
        let record_type = RecordType::from_tag(tag).map_err(|_| invalid())?;

        let digits = chars.as_str();
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let sequence: u32 = digits.parse().map_err(|_| invalid())?;
        if sequence == 0 {
            return Err(invalid());
        }

        Ok(Self {
            scope,
            month,
            record_type,
            sequence,
        })
    }
}
