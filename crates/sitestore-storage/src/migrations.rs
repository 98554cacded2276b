//! Database migrations
//!
//! v1: documents table with timestamp indexes
//! v2: optional owner column for cloud sync

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use crate::error::{upgrade_blocked, EngineError};

type Result<T> = std::result::Result<T, EngineError>;

pub(crate) const SCHEMA_VERSION: i32 = 2;

/// Bring the schema up to [`SCHEMA_VERSION`].
///
/// Up-to-date databases are only read. Upgrades take the write lock up front; if
/// another connection holds it the upgrade fails as `UpgradeBlocked`.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    upgrade(conn).map_err(upgrade_blocked)
}

fn upgrade(conn: &mut Connection) -> Result<()> {
    if get_schema_version(conn)? >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    tx.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    // Another connection may have finished the upgrade while we waited.
    let current_version = get_schema_version(&tx)?;

    if current_version < 1 {
        migrate_v1(&tx)?;
    }
    if current_version < 2 {
        migrate_v2(&tx)?;
    }

    if current_version < SCHEMA_VERSION {
        set_schema_version(&tx, SCHEMA_VERSION)?;
    }
    tx.commit()?;
    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    let has_table: bool = conn.query_row(
        "SELECT EXISTS (
             SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'
         )",
        [],
        |row| row.get(0),
    )?;
    if !has_table {
        return Ok(0);
    }

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    tracing::info!("Running migration v1: documents");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            config TEXT NOT NULL DEFAULT '{}',
            prompt_history TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_documents_created ON documents(created_at);
        CREATE INDEX IF NOT EXISTS idx_documents_updated ON documents(updated_at DESC);
    "#,
    )?;

    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    tracing::info!("Running migration v2: document owner");

    conn.execute_batch(
        r#"
        ALTER TABLE documents ADD COLUMN user_id TEXT;

        CREATE INDEX IF NOT EXISTS idx_documents_user ON documents(user_id);
    "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'index' AND tbl_name = 'documents'
                 ORDER BY name",
            )
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn test_fresh_database_reaches_latest_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert_eq!(
            index_names(&conn),
            vec![
                "idx_documents_created".to_string(),
                "idx_documents_updated".to_string(),
                "idx_documents_user".to_string(),
            ]
        );
    }

    #[test]
    fn test_v1_database_upgrades_in_place() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE schema_version (version INTEGER NOT NULL)",
            [],
        )
        .unwrap();
        migrate_v1(&conn).unwrap();
        set_schema_version(&conn, 1).unwrap();
        conn.execute(
            "INSERT INTO documents (id, label, created_at, updated_at) VALUES ('a', 'A', 't', 't')",
            [],
        )
        .unwrap();

        run_migrations(&mut conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), 2);
        let user_id: Option<String> = conn
            .query_row("SELECT user_id FROM documents WHERE id = 'a'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(user_id, None);
    }

    #[test]
    fn test_rerun_is_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_upgrade_blocked_by_other_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocked.db");

        let holder = Connection::open(&path).unwrap();
        holder.execute_batch("BEGIN EXCLUSIVE;").unwrap();

        let mut conn = Connection::open(&path).unwrap();
        conn.busy_timeout(std::time::Duration::from_millis(10)).unwrap();
        let err = run_migrations(&mut conn).unwrap_err();
        assert!(matches!(err, EngineError::UpgradeBlocked(_)));

        holder.execute_batch("ROLLBACK;").unwrap();
        run_migrations(&mut conn).unwrap();
    }
}
