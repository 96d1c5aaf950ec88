//! Existence probing for upsert keys.

use crate::error::LoaderError;
use crate::loader::data_structures::{ExistenceResult, Record};
use crate::loader::sql::{ID_COLUMN, push_filter, quote_identifier};
use crate::loader::stats::OperationStats;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

/// Count the rows of `table` matching every column of `filter`.
///
/// Uniqueness is not assumed: all matches are counted and `has_conflict` is set
/// when more than one row matches. Callers must treat that as an error, see
/// [`ensure_unambiguous`].
pub async fn check_record_exists(
    conn: &mut SqliteConnection,
    stats: &OperationStats,
    table: &str,
    filter: &Record,
) -> Result<ExistenceResult, LoaderError> {
    let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*), MIN(");
    builder.push(quote_identifier(ID_COLUMN)?);
    builder.push(") FROM ");
    builder.push(quote_identifier(table)?);
    builder.push(" WHERE ");
    push_filter(&mut builder, filter)?;

    stats.record_query();
    let (count, id): (i64, Option<i64>) = builder
        .build_query_as()
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| LoaderError::from_sqlx(e, table))?;

    let result = ExistenceResult::from_count(count, id);
    if result.has_conflict {
        log::warn!(
            "{} rows in {} match a filter expected to be unique",
            count,
            table
        );
    }
    Ok(result)
}

/// Turn a conflicted probe into an `AmbiguousMatch` error.
pub fn ensure_unambiguous(
    result: ExistenceResult,
    table: &str,
) -> Result<ExistenceResult, LoaderError> {
    if result.has_conflict {
        return Err(LoaderError::AmbiguousMatch {
            table: table.to_string(),
            count: result.count,
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestDatabase;

    async fn tags_table(conn: &mut SqliteConnection) {
        sqlx::query("CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT, scope TEXT)")
            .execute(&mut *conn)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_record_reports_absent() {
        let db = TestDatabase::new().await;
        let mut conn = db.acquire().await;
        tags_table(&mut conn).await;
        let stats = OperationStats::new();

        let result = check_record_exists(
            &mut conn,
            &stats,
            "tags",
            &Record::new().with("label", "vip"),
        )
        .await
        .unwrap();

        assert_eq!(result, ExistenceResult::from_count(0, None));
        assert_eq!(stats.snapshot().queries, 1);
    }

    #[tokio::test]
    async fn duplicate_rows_are_flagged_as_conflict() {
        let db = TestDatabase::new().await;
        let mut conn = db.acquire().await;
        tags_table(&mut conn).await;
        sqlx::query("INSERT INTO tags (label) VALUES ('vip'), ('vip'), ('crew')")
            .execute(&mut *conn)
            .await
            .unwrap();
        let stats = OperationStats::new();

        let result = check_record_exists(
            &mut conn,
            &stats,
            "tags",
            &Record::new().with("label", "vip"),
        )
        .await
        .unwrap();

        assert!(result.exists);
        assert_eq!(result.count, 2);
        assert!(result.has_conflict);
        assert!(matches!(
            ensure_unambiguous(result, "tags"),
            Err(LoaderError::AmbiguousMatch { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn null_filter_values_match_null_columns() {
        let db = TestDatabase::new().await;
        let mut conn = db.acquire().await;
        tags_table(&mut conn).await;
        sqlx::query("INSERT INTO tags (label, scope) VALUES ('vip', NULL)")
            .execute(&mut *conn)
            .await
            .unwrap();
        let stats = OperationStats::new();

        let filter = Record::new()
            .with("label", "vip")
            .with("scope", None::<String>);
        let result = check_record_exists(&mut conn, &stats, "tags", &filter)
            .await
            .unwrap();

        assert!(result.exists);
        assert_eq!(result.id, Some(1));
        assert!(!result.has_conflict);
    }
}
