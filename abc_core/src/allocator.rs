//! Case sequence allocation.
//!
//! Allocation is "max seen + 1" over a snapshot of existing numbers, scoped
//! by org, project, calendar month and record type. Gaps are never filled
//! and there is no separate counter, so the sequence heals itself after
//! manual edits to the store. The cost is an O(n) scan of the month's
//! numbers per allocation.
//!
//! The allocator is advisory, not authoritative: two callers reading the
//! same snapshot compute the same number. The store must reject the second
//! insert (`Error::AllocationRace`) and the caller recomputes, which is what
//! [`allocate_with_retry`] does.

use crate::case_number::{month_abbr, sequence_suffix, CaseNumber, CaseScope, PeriodWindow};
use crate::{Error, RecordType, Result};
use chrono::NaiveDate;

/// Query side of the case record store
pub trait CaseNumberSource {
    /// Every stored number starting with `prefix` whose record falls in `window`
    fn find_case_numbers_matching(&self, prefix: &str, window: &PeriodWindow)
        -> Result<Vec<String>>;
}

/// Compute the next number for `record_type` in the month of `period_start`
///
/// `existing` may contain anything: numbers of other months, scopes or
/// record types are ignored, and so are malformed legacy values.
pub fn next_case_number<S: AsRef<str>>(
    period_start: NaiveDate,
    org: &str,
    project: &str,
    record_type: RecordType,
    existing: &[S],
) -> Result<CaseNumber> {
    let scope = CaseScope::new(org, project)?;
    next_in_scope(&scope, period_start, record_type, existing)
}

/// Same as [`next_case_number`] for an already validated scope
pub fn next_in_scope<S: AsRef<str>>(
    scope: &CaseScope,
    period_start: NaiveDate,
    record_type: RecordType,
    existing: &[S],
) -> Result<CaseNumber> {
    let prefix = scope.prefix(&month_abbr(period_start), record_type);

    let max_seen = existing
        .iter()
        .filter_map(|n| sequence_suffix(&prefix, n.as_ref()))
        .max()
        .unwrap_or(0);

    let sequence = max_seen
        .checked_add(1)
        .ok_or_else(|| Error::Other(format!("Sequence exhausted for {}", prefix)))?;

    CaseNumber::new(scope.clone(), period_start, record_type, sequence)
}

/// Snapshot, compute and commit, retrying when the commit loses a race
///
/// `commit` receives each candidate number and should insert it with a
/// uniqueness check, returning `Error::AllocationRace` when it is taken.
/// Any other error is returned immediately.
pub fn allocate_with_retry<Src, T, F>(
    source: &Src,
    scope: &CaseScope,
    record_type: RecordType,
    period_start: NaiveDate,
    max_attempts: u32,
    mut commit: F,
) -> Result<T>
where
    Src: CaseNumberSource + ?Sized,
    F: FnMut(&CaseNumber) -> Result<T>,
{
    let window = PeriodWindow::month_of(period_start);
    let prefix = scope.prefix(&month_abbr(period_start), record_type);
    let attempts = max_attempts.max(1);

    let mut last_taken = String::new();
    for attempt in 1..=attempts {
        let existing = source.find_case_numbers_matching(&prefix, &window)?;
        let candidate = next_in_scope(scope, period_start, record_type, &existing)?;

        match commit(&candidate) {
            Ok(value) => {
                tracing::debug!("Allocated {} on attempt {}", candidate, attempt);
                return Ok(value);
            }
            Err(Error::AllocationRace(taken)) => {
                tracing::warn!(
                    "Case number {} taken concurrently (attempt {}/{}), retrying",
                    taken,
                    attempt,
                    attempts
                );
                last_taken = taken;
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::AllocationRace(format!(
        "{} (gave up after {} attempts)",
        last_taken, attempts
    )))
}
