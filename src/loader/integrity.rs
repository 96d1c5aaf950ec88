//! Post-load integrity assertions.
//!
//! Every check runs and every violation is collected; a single call always
//! returns the full picture, even when some checks cannot execute at all.

use crate::error::LoaderError;
use crate::loader::sql::{quote_columns, quote_identifier};
use crate::loader::stats::OperationStats;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use std::fmt;

/// Every non-NULL `table.column` must exist in `ref_table.ref_column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyExpectation {
    /// Child table holding the reference
    pub table: String,
    /// Referencing column in the child table
    pub column: String,
    /// Parent table that must contain the referenced value
    pub ref_table: String,
    /// Referenced column in the parent table
    pub ref_column: String,
}

impl ForeignKeyExpectation {
    pub fn new(table: &str, column: &str, ref_table: &str, ref_column: &str) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
            ref_table: ref_table.to_string(),
            ref_column: ref_column.to_string(),
        }
    }
}

/// No two rows of `table` may share the same values for `columns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UniqueExpectation {
    /// Table to scan
    pub table: String,
    /// Column tuple that must be unique
    pub columns: Vec<String>,
}

impl UniqueExpectation {
    pub fn new(table: &str, columns: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// What the store must look like after a load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityExpectations {
    /// Minimum row count per table; more rows than expected is fine
    pub table_counts: BTreeMap<String, i64>,
    /// References that must resolve
    pub foreign_keys: Vec<ForeignKeyExpectation>,
    /// Column tuples that must not repeat
    pub unique_constraints: Vec<UniqueExpectation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    TableCount,
    ForeignKey,
    Unique,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::TableCount => write!(f, "table_count"),
            CheckKind::ForeignKey => write!(f, "foreign_key"),
            CheckKind::Unique => write!(f, "unique"),
        }
    }
}

/// Result of a single check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityCheck {
    /// Which kind of assertion ran
    pub kind: CheckKind,
    /// Table, reference or column tuple the check covered
    pub target: String,
    /// Whether the assertion held
    pub passed: bool,
    /// "ok", the violation found, or why the check could not run
    pub detail: String,
}

/// Aggregated result of one verification pass. `passed()` is true exactly when
/// `errors` is empty; the serialized form is `{passed, checks, errors}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Every check that ran, in execution order
    pub checks: Vec<IntegrityCheck>,
    /// One message per failed check
    pub errors: Vec<String>,
}

impl IntegrityReport {
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }

    fn record(&mut self, kind: CheckKind, target: String, outcome: Result<Option<String>, LoaderError>) {
        let (passed, detail) = match outcome {
            Ok(None) => (true, "ok".to_string()),
            Ok(Some(violation)) => (false, violation),
            Err(err) => (false, format!("check could not run: {err}")),
        };
        if !passed {
            self.errors.push(format!("{kind} {target}: {detail}"));
        }
        self.checks.push(IntegrityCheck {
            kind,
            target,
            passed,
            detail,
        });
    }

    /// Convert a failed report into `IntegrityFailure`.
    pub fn into_result(self) -> Result<IntegrityReport, LoaderError> {
        match self.errors.first() {
            None => Ok(self),
            Some(first) => Err(LoaderError::IntegrityFailure {
                failures: self.errors.len(),
                first: first.clone(),
            }),
        }
    }
}

impl Serialize for IntegrityReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut report = serializer.serialize_struct("IntegrityReport", 3)?;
        report.serialize_field("passed", &self.passed())?;
        report.serialize_field("checks", &self.checks)?;
        report.serialize_field("errors", &self.errors)?;
        report.end()
    }
}

async fn scalar_count(
    conn: &mut SqliteConnection,
    stats: &OperationStats,
    sql: &str,
) -> Result<i64, LoaderError> {
    stats.record_query();
    Ok(sqlx::query_scalar::<_, i64>(sql).fetch_one(&mut *conn).await?)
}

async fn check_table_count(
    conn: &mut SqliteConnection,
    stats: &OperationStats,
    table: &str,
    minimum: i64,
) -> Result<Option<String>, LoaderError> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table)?);
    let actual = scalar_count(conn, stats, &sql).await?;
    if actual < minimum {
        return Ok(Some(format!("expected at least {minimum} rows, found {actual}")));
    }
    Ok(None)
}

async fn check_foreign_key(
    conn: &mut SqliteConnection,
    stats: &OperationStats,
    fk: &ForeignKeyExpectation,
) -> Result<Option<String>, LoaderError> {
    let column = quote_identifier(&fk.column)?;
    let sql = format!(
        "SELECT COUNT(*) FROM {table} AS child WHERE child.{column} IS NOT NULL \
         AND NOT EXISTS (SELECT 1 FROM {ref_table} AS parent WHERE parent.{ref_column} = child.{column})",
        table = quote_identifier(&fk.table)?,
        ref_table = quote_identifier(&fk.ref_table)?,
        ref_column = quote_identifier(&fk.ref_column)?,
    );
    let orphans = scalar_count(conn, stats, &sql).await?;
    if orphans > 0 {
        return Ok(Some(format!(
            "{orphans} rows reference a missing {}.{}",
            fk.ref_table, fk.ref_column
        )));
    }
    Ok(None)
}

async fn check_unique(
    conn: &mut SqliteConnection,
    stats: &OperationStats,
    unique: &UniqueExpectation,
) -> Result<Option<String>, LoaderError> {
    if unique.columns.is_empty() {
        return Err(LoaderError::validation("unique check needs at least one column"));
    }
    let columns = quote_columns(unique.columns.iter().map(String::as_str))?;
    let sql = format!(
        "SELECT COUNT(*) FROM (SELECT 1 FROM {} GROUP BY {} HAVING COUNT(*) > 1)",
        quote_identifier(&unique.table)?,
        columns
    );
    let duplicate_groups = scalar_count(conn, stats, &sql).await?;
    if duplicate_groups > 0 {
        return Ok(Some(format!("{duplicate_groups} duplicate groups")));
    }
    Ok(None)
}

/// Run every expectation and collect the results into one report.
pub async fn verify_integrity(
    conn: &mut SqliteConnection,
    stats: &OperationStats,
    expectations: &IntegrityExpectations,
) -> IntegrityReport {
    let mut report = IntegrityReport::default();

    for (table, minimum) in &expectations.table_counts {
        let outcome = check_table_count(conn, stats, table, *minimum).await;
        report.record(CheckKind::TableCount, table.clone(), outcome);
    }

    for fk in &expectations.foreign_keys {
        let outcome = check_foreign_key(conn, stats, fk).await;
        let target = format!("{}.{} -> {}.{}", fk.table, fk.column, fk.ref_table, fk.ref_column);
        report.record(CheckKind::ForeignKey, target, outcome);
    }

    for unique in &expectations.unique_constraints {
        let outcome = check_unique(conn, stats, unique).await;
        let target = format!("{}({})", unique.table, unique.columns.join(", "));
        report.record(CheckKind::Unique, target, outcome);
    }

    if report.passed() {
        log::debug!("integrity verification passed {} checks", report.checks.len());
    } else {
        for error in &report.errors {
            log::warn!("integrity violation: {}", error);
            stats.record_error(error.clone());
        }
    }
    report
}
