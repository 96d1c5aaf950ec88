//! Chunked, conflict-aware bulk inserts.
//!
//! Rows are split into chunks and each chunk becomes one multi-row
//! `INSERT OR <policy>` statement. Chunks run sequentially on the caller's
//! connection, so wrapping the call in a transaction scope makes it all-or-nothing.

use crate::error::LoaderError;
use crate::loader::data_structures::{BatchInsertResult, Row};
use crate::loader::sql::{SQLITE_MAX_VARIABLES, push_tuple, quote_columns, quote_identifier};
use crate::loader::stats::OperationStats;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::fmt;
use std::str::FromStr;

/// Default number of rows per insert statement.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Behaviour when a row would violate a uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictAction {
    /// Count conflicting rows as skipped
    #[default]
    Ignore,
    /// Fail the whole call on the first violation
    Abort,
    /// Overwrite the conflicting row
    Replace,
}

impl ConflictAction {
    fn clause(self) -> &'static str {
        match self {
            ConflictAction::Ignore => "INSERT OR IGNORE INTO ",
            ConflictAction::Abort => "INSERT OR ABORT INTO ",
            ConflictAction::Replace => "INSERT OR REPLACE INTO ",
        }
    }
}

impl FromStr for ConflictAction {
    type Err = LoaderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "IGNORE" => Ok(ConflictAction::Ignore),
            "ABORT" => Ok(ConflictAction::Abort),
            "REPLACE" => Ok(ConflictAction::Replace),
            other => Err(LoaderError::validation(format!(
                "unknown conflict action '{other}', expected IGNORE, ABORT or REPLACE"
            ))),
        }
    }
}

impl fmt::Display for ConflictAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictAction::Ignore => write!(f, "IGNORE"),
            ConflictAction::Abort => write!(f, "ABORT"),
            ConflictAction::Replace => write!(f, "REPLACE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchInsertOptions {
    /// Rows per statement, clamped to SQLite's parameter limit
    pub chunk_size: usize,
    /// Policy for rows that hit a uniqueness constraint
    pub conflict_action: ConflictAction,
    /// Check every row's width before the first statement
    pub validate_data: bool,
}

impl Default for BatchInsertOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            conflict_action: ConflictAction::Ignore,
            validate_data: true,
        }
    }
}

/// Number of chunks a batch of `total_rows` is split into.
///
/// An empty batch still counts as one (empty) chunk.
pub fn chunk_count(total_rows: usize, chunk_size: usize) -> usize {
    if total_rows == 0 {
        return 1;
    }
    total_rows.div_ceil(chunk_size.max(1))
}

/// Chunk size actually used, bounded so a statement stays under SQLite's parameter limit.
fn effective_chunk_size(requested: usize, column_count: usize) -> usize {
    let ceiling = (SQLITE_MAX_VARIABLES / column_count.max(1)).max(1);
    if requested > ceiling {
        log::warn!(
            "chunk size {} exceeds the {} rows a {}-column statement can bind, using {}",
            requested,
            ceiling,
            column_count,
            ceiling
        );
        ceiling
    } else {
        requested
    }
}

fn validate_rows(table: &str, columns: &[&str], rows: &[Row]) -> Result<(), LoaderError> {
    for (index, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(LoaderError::ColumnCountMismatch {
                table: table.to_string(),
                row: index,
                expected: columns.len(),
                actual: row.len(),
            });
        }
    }
    Ok(())
}

/// Insert `rows` into `table` in chunks.
///
/// With `validate_data` every row is checked against the column count before any
/// statement runs, so a malformed batch inserts nothing. Under IGNORE a
/// constraint failure that SQLite does not resolve itself (a foreign key, for
/// instance) makes the chunk fall back to row-by-row inserts: only the offending
/// rows are skipped, each with an entry in `errors`. Under ABORT and REPLACE it
/// fails the call and no further chunks run.
pub async fn safe_batch_insert(
    conn: &mut SqliteConnection,
    stats: &OperationStats,
    table: &str,
    columns: &[&str],
    rows: &[Row],
    options: &BatchInsertOptions,
) -> Result<BatchInsertResult, LoaderError> {
    if columns.is_empty() {
        return Err(LoaderError::validation(format!(
            "batch insert into {table} requires at least one column"
        )));
    }
    if options.chunk_size == 0 {
        return Err(LoaderError::validation("chunk size must be at least 1"));
    }

    let target = InsertTarget {
        table,
        quoted_table: quote_identifier(table)?,
        quoted_columns: quote_columns(columns.iter().copied())?,
    };

    if options.validate_data {
        validate_rows(table, columns, rows)?;
    }

    let chunk_size = effective_chunk_size(options.chunk_size, columns.len());
    let mut result = BatchInsertResult {
        total_rows: rows.len(),
        chunks: chunk_count(rows.len(), chunk_size),
        ..Default::default()
    };

    if rows.is_empty() {
        return Ok(result);
    }

    for (chunk_index, chunk) in rows.chunks(chunk_size).enumerate() {
        stats.record_query();
        let outcome = execute_chunk(conn, options.conflict_action, &target, chunk).await;

        match outcome {
            Ok(affected) => {
                let inserted = (affected as usize).min(chunk.len());
                let skipped = chunk.len() - inserted;
                result.inserted += inserted;
                result.skipped += skipped;
                stats.record_inserts(inserted);
                stats.record_skips(skipped);

                if skipped > 0 {
                    log::debug!(
                        "{}: chunk {} inserted {} rows, {} skipped due to conflicts",
                        table,
                        chunk_index,
                        inserted,
                        skipped
                    );
                }
                log::trace!("{}: chunk {} wrote {} rows", table, chunk_index, inserted);
            }
            Err(err) => {
                let err = LoaderError::from_sqlx(err, table);
                if err.is_constraint_violation() && options.conflict_action == ConflictAction::Ignore
                {
                    log::debug!(
                        "{}: chunk {} rejected ({}), retrying row by row",
                        table,
                        chunk_index,
                        err
                    );
                    let start = chunk_index * chunk_size;
                    insert_rows_individually(conn, stats, &target, chunk, start, &mut result)
                        .await?;
                } else {
                    stats.record_error(format!("{table} chunk {chunk_index}: {err}"));
                    return Err(err);
                }
            }
        }
        result.processed += chunk.len();
    }

    log::debug!(
        "{}: batch insert processed {} rows in {} chunks ({} inserted, {} skipped)",
        table,
        result.processed,
        result.chunks,
        result.inserted,
        result.skipped
    );
    Ok(result)
}

/// Table and column list, validated and quoted once per call.
struct InsertTarget<'a> {
    table: &'a str,
    quoted_table: String,
    quoted_columns: String,
}

async fn execute_chunk(
    conn: &mut SqliteConnection,
    action: ConflictAction,
    target: &InsertTarget<'_>,
    chunk: &[Row],
) -> Result<u64, sqlx::Error> {
    let mut builder = QueryBuilder::<Sqlite>::new(action.clause());
    builder.push(&target.quoted_table);
    builder.push(" (");
    builder.push(&target.quoted_columns);
    builder.push(") VALUES ");
    for (index, row) in chunk.iter().enumerate() {
        if index > 0 {
            builder.push(", ");
        }
        push_tuple(&mut builder, row);
    }
    Ok(builder.build().execute(&mut *conn).await?.rows_affected())
}

/// Fallback for a chunk that SQLite rejected as a whole under IGNORE.
///
/// A failed statement leaves no rows behind, so each row is retried on its own
/// and only the rows that still violate a constraint are skipped.
async fn insert_rows_individually(
    conn: &mut SqliteConnection,
    stats: &OperationStats,
    target: &InsertTarget<'_>,
    chunk: &[Row],
    first_row: usize,
    result: &mut BatchInsertResult,
) -> Result<(), LoaderError> {
    let table = target.table;
    for (offset, row) in chunk.iter().enumerate() {
        stats.record_query();
        let outcome = execute_chunk(conn, ConflictAction::Ignore, target, std::slice::from_ref(row))
            .await
            .map_err(|e| LoaderError::from_sqlx(e, table));

        match outcome {
            Ok(affected) => {
                let inserted = (affected as usize).min(1);
                result.inserted += inserted;
                result.skipped += 1 - inserted;
                stats.record_inserts(inserted);
                stats.record_skips(1 - inserted);
            }
            Err(err) if err.is_constraint_violation() => {
                let message = format!("row {}: {err}", first_row + offset);
                log::warn!("{}: {}", table, message);
                result.skipped += 1;
                stats.record_skips(1);
                stats.record_error(message.clone());
                result.errors.push(message);
            }
            Err(err) => {
                stats.record_error(format!("{table} row {}: {err}", first_row + offset));
                return Err(err);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::data_structures::SqlValue;
    use crate::test_support::TestDatabase;

    async fn slugs_table(conn: &mut SqliteConnection) {
        sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY, slug TEXT NOT NULL UNIQUE, label TEXT)")
            .execute(&mut *conn)
            .await
            .unwrap();
    }

    fn rows(slugs: &[&str]) -> Vec<Row> {
        slugs
            .iter()
            .map(|slug| vec![SqlValue::from(*slug), SqlValue::from(format!("label {slug}"))])
            .collect()
    }

    async fn count(conn: &mut SqliteConnection) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(&mut *conn)
            .await
            .unwrap()
    }

    #[test]
    fn chunk_arithmetic() {
        assert_eq!(chunk_count(10_000, 100), 100);
        assert_eq!(chunk_count(3, 10), 1);
        assert_eq!(chunk_count(0, 10), 1);
        assert_eq!(chunk_count(501, 500), 2);
    }

    #[test]
    fn chunk_size_is_bounded_by_parameter_limit() {
        assert_eq!(effective_chunk_size(500, 3), 500);
        assert_eq!(effective_chunk_size(100_000, 2), SQLITE_MAX_VARIABLES / 2);
    }

    #[test]
    fn conflict_action_parses_case_insensitively() {
        assert_eq!("ignore".parse::<ConflictAction>().unwrap(), ConflictAction::Ignore);
        assert_eq!("ABORT".parse::<ConflictAction>().unwrap(), ConflictAction::Abort);
        assert_eq!(" Replace ".parse::<ConflictAction>().unwrap(), ConflictAction::Replace);
        assert!("UPSERT".parse::<ConflictAction>().is_err());
    }

    #[tokio::test]
    async fn inserts_across_multiple_chunks() {
        let db = TestDatabase::new().await;
        let mut conn = db.acquire().await;
        slugs_table(&mut conn).await;
        let stats = OperationStats::new();

        let slugs: Vec<String> = (0..25).map(|i| format!("item-{i}")).collect();
        let slug_refs: Vec<&str> = slugs.iter().map(String::as_str).collect();
        let options = BatchInsertOptions {
            chunk_size: 10,
            ..Default::default()
        };

        let result = safe_batch_insert(
            &mut conn,
            &stats,
            "items",
            &["slug", "label"],
            &rows(&slug_refs),
            &options,
        )
        .await
        .unwrap();

        assert_eq!(result.total_rows, 25);
        assert_eq!(result.chunks, 3);
        assert_eq!(result.inserted, 25);
        assert_eq!(result.processed, 25);
        assert_eq!(stats.snapshot().queries, 3);
        assert_eq!(count(&mut conn).await, 25);
    }

    #[tokio::test]
    async fn ignore_counts_duplicates_as_skipped() {
        let db = TestDatabase::new().await;
        let mut conn = db.acquire().await;
        slugs_table(&mut conn).await;
        let stats = OperationStats::new();
        let options = BatchInsertOptions::default();

        let first = safe_batch_insert(&mut conn, &stats, "items", &["slug", "label"], &rows(&["x"]), &options)
            .await
            .unwrap();
        let second = safe_batch_insert(&mut conn, &stats, "items", &["slug", "label"], &rows(&["x"]), &options)
            .await
            .unwrap();

        assert_eq!(first.inserted, 1);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(second.inserted + second.skipped, second.processed);
        assert_eq!(count(&mut conn).await, 1);
    }

    #[tokio::test]
    async fn abort_fails_on_first_violation_and_stops() {
        let db = TestDatabase::new().await;
        let mut conn = db.acquire().await;
        slugs_table(&mut conn).await;
        let stats = OperationStats::new();

        safe_batch_insert(
            &mut conn,
            &stats,
            "items",
            &["slug", "label"],
            &rows(&["b"]),
            &BatchInsertOptions::default(),
        )
        .await
        .unwrap();

        let options = BatchInsertOptions {
            chunk_size: 1,
            conflict_action: ConflictAction::Abort,
            validate_data: true,
        };
        let err = safe_batch_insert(
            &mut conn,
            &stats,
            "items",
            &["slug", "label"],
            &rows(&["a", "b", "c"]),
            &options,
        )
        .await
        .unwrap_err();

        assert!(err.is_constraint_violation());
        // "a" landed before the violation, "c" never ran
        assert_eq!(count(&mut conn).await, 2);
    }

    #[tokio::test]
    async fn replace_overwrites_conflicting_rows() {
        let db = TestDatabase::new().await;
        let mut conn = db.acquire().await;
        slugs_table(&mut conn).await;
        let stats = OperationStats::new();
        let options = BatchInsertOptions {
            conflict_action: ConflictAction::Replace,
            ..Default::default()
        };

        safe_batch_insert(&mut conn, &stats, "items", &["slug", "label"], &rows(&["x"]), &options)
            .await
            .unwrap();
        let replacement = vec![vec![SqlValue::from("x"), SqlValue::from("new label")]];
        let result = safe_batch_insert(&mut conn, &stats, "items", &["slug", "label"], &replacement, &options)
            .await
            .unwrap();

        assert_eq!(result.inserted, 1);
        let label: String = sqlx::query_scalar("SELECT label FROM items WHERE slug = 'x'")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(label, "new label");
        assert_eq!(count(&mut conn).await, 1);
    }

    #[tokio::test]
    async fn column_mismatch_inserts_nothing() {
        let db = TestDatabase::new().await;
        let mut conn = db.acquire().await;
        slugs_table(&mut conn).await;
        let stats = OperationStats::new();

        let mut batch = rows(&["a", "b"]);
        batch.push(vec![SqlValue::from("c")]);

        let err = safe_batch_insert(
            &mut conn,
            &stats,
            "items",
            &["slug", "label"],
            &batch,
            &BatchInsertOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            LoaderError::ColumnCountMismatch { row: 2, expected: 2, actual: 1, .. }
        ));
        assert_eq!(count(&mut conn).await, 0);
        assert_eq!(stats.snapshot().queries, 0);
    }

    #[tokio::test]
    async fn empty_batch_issues_no_statement() {
        let db = TestDatabase::new().await;
        let mut conn = db.acquire().await;
        let stats = OperationStats::new();

        let result = safe_batch_insert(
            &mut conn,
            &stats,
            "items",
            &["slug"],
            &[],
            &BatchInsertOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.total_rows, 0);
        assert_eq!(result.inserted, 0);
        assert_eq!(result.processed, 0);
        assert_eq!(result.chunks, 1);
        assert_eq!(stats.snapshot().queries, 0);
    }

    #[tokio::test]
    async fn ignore_absorbs_foreign_key_failures() {
        let db = TestDatabase::new().await;
        let mut conn = db.acquire().await;
        let stats = OperationStats::new();

        let batch = vec![vec![
            SqlValue::from(999_i64),
            SqlValue::from("theme.color"),
            SqlValue::from("red"),
        ]];
        let result = safe_batch_insert(
            &mut conn,
            &stats,
            "event_settings",
            &["event_id", "key", "value"],
            &batch,
            &BatchInsertOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.inserted, 0);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("row 0:"), "{}", result.errors[0]);
        assert_eq!(stats.snapshot().errors.len(), 1);
    }

    #[tokio::test]
    async fn orphan_row_does_not_drop_valid_rows_in_its_chunk() {
        let db = TestDatabase::new().await;
        let mut conn = db.acquire().await;
        let stats = OperationStats::new();

        let event_id = sqlx::query("INSERT INTO events (slug, name, event_type) VALUES ('fest', 'Fest', 'gig')")
            .execute(&mut *conn)
            .await
            .unwrap()
            .last_insert_rowid();

        let setting = |event_id: i64, key: &str| {
            vec![SqlValue::from(event_id), SqlValue::from(key), SqlValue::from("on")]
        };
        let batch = vec![
            setting(event_id, "good.key"),
            setting(999, "orphan.key"),
            setting(event_id, "other.key"),
            setting(event_id, "last.key"),
        ];
        let options = BatchInsertOptions {
            chunk_size: 3,
            ..Default::default()
        };

        let result = safe_batch_insert(
            &mut conn,
            &stats,
            "event_settings",
            &["event_id", "key", "value"],
            &batch,
            &options,
        )
        .await
        .unwrap();

        assert_eq!(result.chunks, 2);
        assert_eq!(result.inserted, 3);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.processed, 4);
        assert_eq!(result.inserted + result.skipped, result.processed);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("row 1:"), "{}", result.errors[0]);

        let stored: Vec<String> = sqlx::query_scalar("SELECT key FROM event_settings ORDER BY key")
            .fetch_all(&mut *conn)
            .await
            .unwrap();
        assert_eq!(stored, vec!["good.key", "last.key", "other.key"]);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.inserts, 3);
        assert_eq!(snapshot.skips, 1);
        // failed chunk, three single-row retries, second chunk
        assert_eq!(snapshot.queries, 5);
    }

    #[tokio::test]
    async fn duplicates_and_orphans_in_one_chunk_are_both_skipped() {
        let db = TestDatabase::new().await;
        let mut conn = db.acquire().await;
        let stats = OperationStats::new();

        let event_id = sqlx::query("INSERT INTO events (slug, name, event_type) VALUES ('fest', 'Fest', 'gig')")
            .execute(&mut *conn)
            .await
            .unwrap()
            .last_insert_rowid();
        sqlx::query("INSERT INTO event_settings (event_id, key, value) VALUES (?, 'taken.key', 'old')")
            .bind(event_id)
            .execute(&mut *conn)
            .await
            .unwrap();

        let batch = vec![
            vec![SqlValue::from(event_id), SqlValue::from("taken.key"), SqlValue::from("new")],
            vec![SqlValue::from(999_i64), SqlValue::from("orphan.key"), SqlValue::from("x")],
            vec![SqlValue::from(event_id), SqlValue::from("fresh.key"), SqlValue::from("y")],
        ];
        let result = safe_batch_insert(
            &mut conn,
            &stats,
            "event_settings",
            &["event_id", "key", "value"],
            &batch,
            &BatchInsertOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.inserted, 1);
        assert_eq!(result.skipped, 2);
        // only the foreign key failure is an error, the duplicate is a plain skip
        assert_eq!(result.errors.len(), 1);

        let taken: String = sqlx::query_scalar("SELECT value FROM event_settings WHERE key = 'taken.key'")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(taken, "old");
    }
}
