//! SQLite pool helpers shared across the workspace

use crate::Result;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;

/// Initialize the destination database connection pool.
///
/// Connects with `mode=rwc` (read, write, create) and enables WAL journaling
/// so the merge engine's bulk appends do not block readers.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;

    sqlx::query("PRAGMA journal_mode=WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=NORMAL")
        .execute(&pool)
        .await?;

    Ok(pool)
}

/// Check whether a table exists in the destination database.
pub async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let row = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Row count of a table. Returns 0 when the table does not exist.
pub async fn count_rows(pool: &SqlitePool, table: &str) -> Result<i64> {
    if !table_exists(pool, table).await? {
        return Ok(0);
    }
    let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", quote_ident(table)))
        .fetch_one(pool)
        .await?;
    Ok(row.get::<i64, _>("n"))
}

/// Quote an identifier for use in dynamically built DDL/DML.
///
/// Table and column names in this pipeline come from scanned sheet headers,
/// never from query strings, but they still must be quoted: headers may carry
/// spaces, CJK characters, or quote characters.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("金额"), "\"金额\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[tokio::test]
    async fn pool_init_and_table_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let pool = init_database_pool(&db_path).await.unwrap();

        assert!(!table_exists(&pool, "missing").await.unwrap());
        assert_eq!(count_rows(&pool, "missing").await.unwrap(), 0);

        sqlx::query("CREATE TABLE t (\"发票代码\", \"金额\")")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO t VALUES ('A1', 100.0)")
            .execute(&pool)
            .await
            .unwrap();

        assert!(table_exists(&pool, "t").await.unwrap());
        assert_eq!(count_rows(&pool, "t").await.unwrap(), 1);
    }
}
