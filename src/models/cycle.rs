//! Cycles, operations and their outcomes.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, FailureKind, Result};

/// A named unit of work.
///
/// Variant order is the fixed execution precedence, so a `BTreeSet<Operation>`
/// iterates in the order operations must run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Scraping,
    Converting,
    ApiUpdate,
    CleanDumpFiles,
    Publishing,
    CleanAllSourceData,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Scraping,
        Operation::Converting,
        Operation::ApiUpdate,
        Operation::CleanDumpFiles,
        Operation::Publishing,
        Operation::CleanAllSourceData,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Scraping => "scraping",
            Operation::Converting => "converting",
            Operation::ApiUpdate => "api_update",
            Operation::CleanDumpFiles => "clean_dump_files",
            Operation::Publishing => "publishing",
            Operation::CleanAllSourceData => "clean_all_source_data",
        }
    }

    /// Operations run on every cycle unless overridden.
    pub fn ongoing() -> BTreeSet<Operation> {
        [
            Operation::Scraping,
            Operation::Converting,
            Operation::ApiUpdate,
            Operation::CleanDumpFiles,
        ]
        .into_iter()
        .collect()
    }

    /// Operations run once per calendar day under the end-of-day stop condition.
    pub fn end_of_day() -> BTreeSet<Operation> {
        [Operation::Publishing, Operation::CleanAllSourceData]
            .into_iter()
            .collect()
    }

    /// Parse a comma-separated list such as `"publishing,scraping"`.
    pub fn parse_list(list: &str) -> Result<BTreeSet<Operation>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<Operation>())
            .collect()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| AppError::config(format!("invalid operation '{s}'")))
    }
}

/// One failure absorbed inside an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationFailure {
    pub kind: FailureKind,
    /// Chain, file or record the failure is scoped to
    pub scope: String,
    pub message: String,
}

impl OperationFailure {
    pub fn new(kind: FailureKind, scope: impl Into<String>, message: impl fmt::Display) -> Self {
        Self {
            kind,
            scope: scope.into(),
            message: message.to_string(),
        }
    }
}

/// How an operation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Succeeded,
    PartiallyFailed,
    Failed,
    /// Not attempted: a precondition did not hold
    Skipped(String),
}

impl OperationStatus {
    pub fn attempted(&self) -> bool {
        !matches!(self, OperationStatus::Skipped(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, OperationStatus::Succeeded)
    }
}

/// Result of one operation inside a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationReport {
    pub operation: Operation,
    pub status: OperationStatus,
    pub failures: Vec<OperationFailure>,
    pub finished_at: DateTime<Utc>,
}

impl OperationReport {
    /// Build a report, deriving the status from the failures.
    ///
    /// `units` is how many independent units (chains, files, records) the
    /// operation handled; the operation fails outright only when every unit
    /// failed.
    pub fn from_failures(
        operation: Operation,
        units: usize,
        failures: Vec<OperationFailure>,
    ) -> Self {
        let failed_units = failures
            .iter()
            .map(|f| f.scope.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        let status = if failures.is_empty() {
            OperationStatus::Succeeded
        } else if units > 0 && failed_units < units {
            OperationStatus::PartiallyFailed
        } else {
            OperationStatus::Failed
        };
        Self {
            operation,
            status,
            failures,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(operation: Operation, failure: OperationFailure) -> Self {
        Self {
            operation,
            status: OperationStatus::Failed,
            failures: vec![failure],
            finished_at: Utc::now(),
        }
    }

    pub fn skipped(operation: Operation, reason: impl Into<String>) -> Self {
        Self {
            operation,
            status: OperationStatus::Skipped(reason.into()),
            failures: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    /// First failure message, if any.
    pub fn error_message(&self) -> Option<String> {
        self.failures
            .first()
            .map(|f| format!("{} failure on {}: {}", f.kind, f.scope, f.message))
    }
}

/// Aggregated outcome of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Success,
    PartialFailure,
    Failure,
    /// No operation was attempted
    Idle,
}

impl CycleOutcome {
    pub fn had_failures(&self) -> bool {
        matches!(self, CycleOutcome::PartialFailure | CycleOutcome::Failure)
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleOutcome::Success => "success",
            CycleOutcome::PartialFailure => "partial failure",
            CycleOutcome::Failure => "failure",
            CycleOutcome::Idle => "idle",
        };
        f.write_str(name)
    }
}

/// One pass through the operation graph.
#[derive(Debug, Clone)]
pub struct Cycle {
    pub number: u64,
    pub started_at: DateTime<Utc>,
    /// Effective "now" for every operation in this cycle
    pub as_of: DateTime<Utc>,
    /// Whether `as_of` came from a fixed override rather than the wall clock
    pub fixed_as_of: bool,
    /// Zone whose calendar the scrape date follows
    pub timezone: Tz,
    pub operations: BTreeSet<Operation>,
    pub reports: Vec<OperationReport>,
}

impl Cycle {
    pub fn new(
        number: u64,
        as_of_override: Option<DateTime<Utc>>,
        operations: BTreeSet<Operation>,
    ) -> Self {
        let started_at = Utc::now();
        Self {
            number,
            started_at,
            as_of: as_of_override.unwrap_or(started_at),
            fixed_as_of: as_of_override.is_some(),
            timezone: crate::models::config::defaults::timezone(),
            operations,
            reports: Vec::new(),
        }
    }

    pub fn in_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Calendar date the cycle's data belongs to.
    pub fn scrape_date(&self) -> NaiveDate {
        local_date(self.as_of, self.timezone)
    }

    pub fn report(&self, operation: Operation) -> Option<&OperationReport> {
        self.reports.iter().find(|r| r.operation == operation)
    }

    pub fn attempted(&self) -> usize {
        self.reports.iter().filter(|r| r.status.attempted()).count()
    }

    pub fn outcome(&self) -> CycleOutcome {
        let attempted: Vec<_> = self
            .reports
            .iter()
            .filter(|r| r.status.attempted())
            .collect();
        if attempted.is_empty() {
            CycleOutcome::Idle
        } else if attempted.iter().all(|r| r.status.is_success()) {
            CycleOutcome::Success
        } else if attempted
            .iter()
            .all(|r| r.status == OperationStatus::Failed)
        {
            CycleOutcome::Failure
        } else {
            CycleOutcome::PartialFailure
        }
    }
}

/// Calendar date of `at` as seen in `timezone`.
pub fn local_date(at: DateTime<Utc>, timezone: Tz) -> NaiveDate {
    at.with_timezone(&timezone).date_naive()
}
