//! Values, records and the result types returned by loader operations.

use serde::Serialize;
use std::fmt;

/// A single SQL value bound into generated statements.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Integer(i64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        SqlValue::Text(value.clone())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(v) => write!(f, "{v}"),
            SqlValue::Real(v) => write!(f, "{v}"),
            SqlValue::Text(v) => write!(f, "{v}"),
            SqlValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// One row tuple for a batch insert, positionally aligned with the column list.
pub type Row = Vec<SqlValue>;

/// Column to value mapping, kept in insertion order so generated SQL is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    columns: Vec<(String, SqlValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.set(column, value);
        self
    }

    /// Set a column, replacing any previous value for it.
    pub fn set(&mut self, column: &str, value: impl Into<SqlValue>) {
        let value = value.into();
        match self.columns.iter_mut().find(|(name, _)| name == column) {
            Some(entry) => entry.1 = value,
            None => self.columns.push((column.to_string(), value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Subset of this record restricted to `columns`, in the order given.
    pub fn project(&self, columns: &[&str]) -> Record {
        let mut projected = Record::new();
        for column in columns {
            if let Some(value) = self.get(column) {
                projected.set(column, value.clone());
            }
        }
        projected
    }

    /// Subset of this record excluding `columns`.
    pub fn without(&self, columns: &[&str]) -> Record {
        Record {
            columns: self
                .columns
                .iter()
                .filter(|(name, _)| !columns.contains(&name.as_str()))
                .cloned()
                .collect(),
        }
    }
}

/// Outcome of one `safe_batch_insert` call.
///
/// `inserted + skipped == processed <= total_rows` holds for every returned value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchInsertResult {
    /// Rows passed in
    pub total_rows: usize,
    /// Rows that went through a statement
    pub processed: usize,
    /// Rows actually stored
    pub inserted: usize,
    /// Rows rejected by a constraint under IGNORE
    pub skipped: usize,
    /// Row-level constraint failures absorbed under the IGNORE policy
    pub errors: Vec<String>,
    /// Statements the batch was split into
    pub chunks: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Inserted,
    Updated,
    Skipped,
}

impl fmt::Display for UpsertAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpsertAction::Inserted => write!(f, "inserted"),
            UpsertAction::Updated => write!(f, "updated"),
            UpsertAction::Skipped => write!(f, "skipped"),
        }
    }
}

/// Outcome of one `safe_upsert` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertResult {
    /// What happened to the record
    pub action: UpsertAction,
    /// Row id of the inserted or matched record
    pub id: Option<i64>,
    /// Why a skip happened; `None` for inserts and updates
    pub reason: Option<String>,
}

impl UpsertResult {
    pub fn inserted(id: i64) -> Self {
        Self {
            action: UpsertAction::Inserted,
            id: Some(id),
            reason: None,
        }
    }

    pub fn updated(id: Option<i64>) -> Self {
        Self {
            action: UpsertAction::Updated,
            id,
            reason: None,
        }
    }

    pub fn skipped(id: Option<i64>, reason: &str) -> Self {
        Self {
            action: UpsertAction::Skipped,
            id,
            reason: Some(reason.to_string()),
        }
    }
}

/// Outcome of one `check_record_exists` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExistenceResult {
    /// At least one row matched
    pub exists: bool,
    /// Number of matching rows
    pub count: i64,
    /// Lowest matching row id, if any row matched
    pub id: Option<i64>,
    /// Set when more than one row matched; never resolve this by picking a row
    pub has_conflict: bool,
}

impl ExistenceResult {
    pub fn from_count(count: i64, id: Option<i64>) -> Self {
        Self {
            exists: count > 0,
            count,
            id,
            has_conflict: count > 1,
        }
    }
}
