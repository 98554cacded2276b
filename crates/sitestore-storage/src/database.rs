//! Database connection and operations
//!
//! Every logical operation opens its own connection and closes it when done, so no
//! connection or lock outlives one operation and schema upgrades from other
//! windows never wait on us.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{upgrade_blocked, EngineError};
use crate::migrations::run_migrations;

type Result<T> = std::result::Result<T, EngineError>;

const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    quota_bytes: Option<u64>,
}

impl Database {
    /// Open (creating if needed) and upgrade the database at `path`.
    ///
    /// Fails if the engine is unusable here. Busy or locked failures while opening
    /// come back as `UpgradeBlocked`, since another connection is mid-upgrade or
    /// holding the write lock.
    pub fn open<P: AsRef<Path>>(path: P, quota_bytes: Option<u64>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Self { path, quota_bytes };

        let mut conn = db.connect().map_err(upgrade_blocked)?;
        run_migrations(&mut conn)?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL mode for better concurrent performance
        let _: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        if let Some(limit) = self.quota_bytes {
            let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
            let max_pages = (limit as i64 / page_size.max(1)).max(1);
            let _: i64 = conn.pragma_update_and_check(None, "max_page_count", max_pages, |row| {
                row.get(0)
            })?;
        }

        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    /// Run `f` in a single transaction on a fresh connection. Any error rolls back.
    pub fn transaction<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Connection) -> std::result::Result<T, E>,
        E: From<EngineError>,
    {
        let mut conn = self.connect()?;
        let tx = conn.transaction().map_err(EngineError::from)?;
        let result = f(&tx)?;
        tx.commit().map_err(EngineError::from)?;
        Ok(result)
    }
}
