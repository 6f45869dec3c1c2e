//! SQLite persistence for grid state, the trade ledger and equity history

use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{BotError, BotResult};

pub mod grid;
pub mod market;
pub mod settings;
pub mod trade;

pub use grid::GridStatus;
pub use market::{EquitySnapshot, MarketSnapshot, PruneReport};
pub use trade::{PairTradeStats, TradeRecord};

/// Shared handle over one SQLite connection.
///
/// Every method takes the lock for a single short statement or transaction,
/// so the trading and telemetry loops never wait on each other for long.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file, creating its directory if needed
    pub fn new<P: AsRef<Path>>(path: P) -> BotResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        // journal_mode returns a row, so it cannot go through execute_batch
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;

        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> BotResult<Self> {
        let conn = Connection::open_in_memory()?;

        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a file database with the schema in place
    pub fn open<P: AsRef<Path>>(path: P) -> BotResult<Self> {
        let db = Self::new(path)?;
        db.run_migrations()?;
        Ok(db)
    }

    /// Run migrations to set up or update the schema
    pub fn run_migrations(&self) -> BotResult<()> {
        let conn = self.lock()?;
        let migration_sql = include_str!("migrations/V1__initial_schema.sql");
        conn.execute_batch(migration_sql)?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> BotResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| BotError::Internal("database lock poisoned".to_string()))
    }

    /// Check database health
    pub fn health_check(&self) -> BotResult<bool> {
        let conn = self.lock()?;
        let result: i32 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
        Ok(result == 1)
    }
}

/// Seconds since the epoch, as stored in `updated_at` columns.
pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
pub(crate) fn test_db() -> Database {
    let db = Database::new_in_memory().unwrap();
    db.run_migrations().unwrap();
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_creation() {
        let db = Database::new_in_memory().unwrap();
        assert!(db.health_check().unwrap());
    }

    #[test]
    fn test_migrations() {
        let db = test_db();

        let conn = db.lock().unwrap();
        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_eq!(count, 5); // market_data, grid_status, trade_history, balance_history, bot_info
    }

    #[test]
    fn test_migrations_are_repeatable() {
        let db = test_db();
        db.run_migrations().unwrap();
        assert!(db.health_check().unwrap());
    }

    #[test]
    fn test_file_database_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bot.db");
        let db = Database::open(&path).unwrap();

        assert!(path.exists());
        assert!(db.health_check().unwrap());
    }
}
