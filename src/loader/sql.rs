//! SQL text helpers shared by the writers: identifier validation and value binding.

use crate::error::LoaderError;
use crate::loader::data_structures::{Record, SqlValue};
use sqlx::{QueryBuilder, Sqlite};

/// Maximum number of host parameters SQLite accepts in one statement.
pub const SQLITE_MAX_VARIABLES: usize = 32_766;

/// Column holding the integer row id in every table the loader writes.
pub const ID_COLUMN: &str = "id";

/// Validate and double-quote a table or column name.
pub fn quote_identifier(name: &str) -> Result<String, LoaderError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if !valid {
        return Err(LoaderError::validation(format!(
            "invalid SQL identifier '{name}'"
        )));
    }

    Ok(format!("\"{name}\""))
}

/// Quote a list of column names and join them with commas.
pub fn quote_columns<'a>(
    columns: impl IntoIterator<Item = &'a str>,
) -> Result<String, LoaderError> {
    let quoted = columns
        .into_iter()
        .map(quote_identifier)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(quoted.join(", "))
}

/// Push one value as a bound parameter. `NULL` is emitted inline.
pub fn push_value(builder: &mut QueryBuilder<'_, Sqlite>, value: &SqlValue) {
    match value {
        SqlValue::Null => {
            builder.push("NULL");
        }
        SqlValue::Integer(v) => {
            builder.push_bind(*v);
        }
        SqlValue::Real(v) => {
            builder.push_bind(*v);
        }
        SqlValue::Text(v) => {
            builder.push_bind(v.clone());
        }
        SqlValue::Bool(v) => {
            builder.push_bind(*v);
        }
    }
}

/// Push a parenthesised tuple of values.
pub fn push_tuple<'v>(
    builder: &mut QueryBuilder<'_, Sqlite>,
    values: impl IntoIterator<Item = &'v SqlValue>,
) {
    builder.push("(");
    for (index, value) in values.into_iter().enumerate() {
        if index > 0 {
            builder.push(", ");
        }
        push_value(builder, value);
    }
    builder.push(")");
}

/// Push `"a" IS ? AND "b" IS ?` for every column of `filter`.
///
/// `IS` is SQLite's null-safe equality, so a `NULL` filter value matches stored `NULL`s.
pub fn push_filter(
    builder: &mut QueryBuilder<'_, Sqlite>,
    filter: &Record,
) -> Result<(), LoaderError> {
    if filter.is_empty() {
        return Err(LoaderError::validation("filter must name at least one column"));
    }

    for (index, (column, value)) in filter.iter().enumerate() {
        if index > 0 {
            builder.push(" AND ");
        }
        builder.push(quote_identifier(column)?);
        builder.push(" IS ");
        push_value(builder, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        assert_eq!(quote_identifier("events").unwrap(), "\"events\"");
        assert_eq!(quote_identifier("_tmp2").unwrap(), "\"_tmp2\"");
    }

    #[test]
    fn rejects_injection_attempts() {
        for name in ["", "1events", "events; DROP TABLE x", "a\"b", "key-name"] {
            assert!(
                matches!(quote_identifier(name), Err(LoaderError::Validation(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn filter_uses_null_safe_comparison() {
        let filter = Record::new().with("event_id", None::<i64>).with("key", "a.b");
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT 1 FROM t WHERE ");
        push_filter(&mut builder, &filter).unwrap();

        assert_eq!(
            builder.sql(),
            "SELECT 1 FROM t WHERE \"event_id\" IS NULL AND \"key\" IS ?"
        );
    }

    #[test]
    fn empty_filter_is_rejected() {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT 1 FROM t WHERE ");
        assert!(push_filter(&mut builder, &Record::new()).is_err());
    }
}
