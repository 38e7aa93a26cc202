//! SQLite schema for the durable tier.

use rusqlite::Connection;

use super::StoreError;

/// Version written to `PRAGMA user_version` and to every metadata row.
pub const SCHEMA_VERSION: i32 = 1;

/// Apply connection pragmas and create the three collections with their
/// indexes. Idempotent.
pub(crate) fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS reviews (
            app_id       TEXT PRIMARY KEY,
            territory    TEXT NOT NULL,
            reviews      TEXT NOT NULL,
            last_updated INTEGER NOT NULL,
            review_count INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS metadata (
            app_id         TEXT PRIMARY KEY,
            territory      TEXT NOT NULL,
            last_updated   INTEGER NOT NULL,
            review_count   INTEGER NOT NULL,
            oldest_review  INTEGER,
            newest_review  INTEGER,
            schema_version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS analysis (
            key        TEXT PRIMARY KEY,
            app_id     TEXT,
            data       TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_reviews_last_updated ON reviews(last_updated);
        CREATE INDEX IF NOT EXISTS idx_reviews_territory ON reviews(territory);
        CREATE INDEX IF NOT EXISTS idx_analysis_app_id ON analysis(app_id);
        CREATE INDEX IF NOT EXISTS idx_analysis_created_at ON analysis(created_at);
        "#,
    )?;

    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    } else if current > SCHEMA_VERSION {
        tracing::warn!(
            found = current,
            expected = SCHEMA_VERSION,
            "durable store was written by a newer schema version"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn creates_tables_and_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        for table in ["reviews", "metadata", "analysis"] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn creates_secondary_indexes() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let indexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexes, 4);
    }
}
