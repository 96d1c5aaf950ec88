//! Single-record insert-or-update keyed by a set of match columns.
//!
//! The probe and the write are two statements. Run them inside a
//! `TransactionScope` when more than one writer may target the same key; on its
//! own the resolver assumes a single writer per key and recovers from the
//! insert race by re-probing when the unique constraint fires.

use crate::error::LoaderError;
use crate::loader::data_structures::{ExistenceResult, Record, UpsertResult};
use crate::loader::existence::{check_record_exists, ensure_unambiguous};
use crate::loader::sql::{
    ID_COLUMN, push_filter, push_tuple, push_value, quote_columns, quote_identifier,
};
use crate::loader::stats::OperationStats;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

/// Reason reported when an existing row is left untouched on request.
pub const REASON_EXISTS_NO_UPDATE: &str = "exists_no_update";
/// Reason reported when every column of the record is a match column.
pub const REASON_NOTHING_TO_UPDATE: &str = "nothing_to_update";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOptions {
    /// Update the matched row; when false an existing match is skipped
    pub update_on_conflict: bool,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            update_on_conflict: true,
        }
    }
}

/// Insert `data` into `table`, or update the row matching it on `match_columns`.
pub async fn safe_upsert(
    conn: &mut SqliteConnection,
    stats: &OperationStats,
    table: &str,
    data: &Record,
    match_columns: &[&str],
    options: &UpsertOptions,
) -> Result<UpsertResult, LoaderError> {
    if match_columns.is_empty() {
        return Err(LoaderError::validation(format!(
            "upsert into {table} requires at least one match column"
        )));
    }
    if let Some(missing) = match_columns.iter().find(|column| !data.contains(column)) {
        return Err(LoaderError::validation(format!(
            "upsert into {table} is missing match column '{missing}'"
        )));
    }

    let filter = data.project(match_columns);
    let existing = ensure_unambiguous(
        check_record_exists(conn, stats, table, &filter).await?,
        table,
    )?;

    if existing.exists {
        return resolve_existing(conn, stats, table, data, match_columns, options, existing).await;
    }
    insert_or_recover(conn, stats, table, data, match_columns, options).await
}

/// Insert after a probe that found no match.
///
/// A unique violation here means another writer created the key since the
/// probe. The key is probed again and, if the row is now visible, resolved as an
/// existing match; otherwise the violation is returned.
async fn insert_or_recover(
    conn: &mut SqliteConnection,
    stats: &OperationStats,
    table: &str,
    data: &Record,
    match_columns: &[&str],
    options: &UpsertOptions,
) -> Result<UpsertResult, LoaderError> {
    let err = match insert_record(conn, stats, table, data).await {
        Ok(id) => {
            stats.record_inserts(1);
            log::trace!("{}: inserted row {}", table, id);
            return Ok(UpsertResult::inserted(id));
        }
        Err(err) => err,
    };

    if !err.is_constraint_violation() {
        stats.record_error(err.to_string());
        return Err(err);
    }

    let filter = data.project(match_columns);
    let reprobe = ensure_unambiguous(
        check_record_exists(conn, stats, table, &filter).await?,
        table,
    )?;
    if !reprobe.exists {
        stats.record_error(err.to_string());
        return Err(err);
    }

    log::debug!("{}: insert raced with another writer, resolving as existing", table);
    resolve_existing(conn, stats, table, data, match_columns, options, reprobe).await
}

async fn resolve_existing(
    conn: &mut SqliteConnection,
    stats: &OperationStats,
    table: &str,
    data: &Record,
    match_columns: &[&str],
    options: &UpsertOptions,
    existing: ExistenceResult,
) -> Result<UpsertResult, LoaderError> {
    if !options.update_on_conflict {
        stats.record_skips(1);
        return Ok(UpsertResult::skipped(existing.id, REASON_EXISTS_NO_UPDATE));
    }

    let changes = data.without(match_columns);
    if changes.is_empty() {
        stats.record_skips(1);
        return Ok(UpsertResult::skipped(existing.id, REASON_NOTHING_TO_UPDATE));
    }

    let mut builder = QueryBuilder::<Sqlite>::new("UPDATE ");
    builder.push(quote_identifier(table)?);
    builder.push(" SET ");
    for (index, (column, value)) in changes.iter().enumerate() {
        if index > 0 {
            builder.push(", ");
        }
        builder.push(quote_identifier(column)?);
        builder.push(" = ");
        push_value(&mut builder, value);
    }
    builder.push(" WHERE ");
    match existing.id {
        Some(id) => {
            builder.push(quote_identifier(ID_COLUMN)?);
            builder.push(" = ");
            builder.push_bind(id);
        }
        None => {
            push_filter(&mut builder, &data.project(match_columns))?;
        }
    }

    stats.record_query();
    builder
        .build()
        .execute(&mut *conn)
        .await
        .map_err(|e| LoaderError::from_sqlx(e, table))?;
    stats.record_updates(1);

    Ok(UpsertResult::updated(existing.id))
}

async fn insert_record(
    conn: &mut SqliteConnection,
    stats: &OperationStats,
    table: &str,
    data: &Record,
) -> Result<i64, LoaderError> {
    let mut builder = QueryBuilder::<Sqlite>::new("INSERT INTO ");
    builder.push(quote_identifier(table)?);
    builder.push(" (");
    builder.push(quote_columns(data.iter().map(|(column, _)| column))?);
    builder.push(") VALUES ");
    push_tuple(&mut builder, data.iter().map(|(_, value)| value));

    stats.record_query();
    let done = builder
        .build()
        .execute(&mut *conn)
        .await
        .map_err(|e| LoaderError::from_sqlx(e, table))?;
    Ok(done.last_insert_rowid())
}
