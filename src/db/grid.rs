//! Per-pair grid state: cached ladder, open-order snapshot and setup flag

use rusqlite::{params, OptionalExtension, Result as SqlResult, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{now_secs, Database};
use crate::error::BotResult;
use crate::exchange::OpenOrder;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridStatus {
    pub symbol: String,
    pub open_orders: Vec<OpenOrder>,
    pub levels: Vec<f64>,
    pub setup_done: bool,
    pub updated_at: i64,
}

impl GridStatus {
    fn from_row(row: &Row) -> SqlResult<Self> {
        let orders_json: String = row.get(1)?;
        let levels_json: String = row.get(2)?;
        Ok(GridStatus {
            symbol: row.get(0)?,
            // a corrupt snapshot reads as empty rather than failing the caller
            open_orders: serde_json::from_str(&orders_json).unwrap_or_default(),
            levels: serde_json::from_str(&levels_json).unwrap_or_default(),
            setup_done: row.get::<_, i32>(3)? == 1,
            updated_at: row.get(4)?,
        })
    }
}

impl Database {
    /// Persist the ladder for a pair, keeping its setup flag and order snapshot
    pub fn save_grid_levels(&self, symbol: &str, levels: &[f64]) -> BotResult<()> {
        let levels_json = serde_json::to_string(levels)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO grid_status (symbol, grid_levels_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(symbol) DO UPDATE SET
                grid_levels_json = excluded.grid_levels_json,
                updated_at = excluded.updated_at",
            params![symbol, levels_json, now_secs()],
        )?;
        Ok(())
    }

    /// Persist the latest open-order snapshot for a pair
    pub fn save_open_orders(&self, symbol: &str, orders: &[OpenOrder]) -> BotResult<()> {
        let orders_json = serde_json::to_string(orders)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO grid_status (symbol, open_orders_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(symbol) DO UPDATE SET
                open_orders_json = excluded.open_orders_json,
                updated_at = excluded.updated_at",
            params![symbol, orders_json, now_secs()],
        )?;
        Ok(())
    }

    pub fn set_setup_done(&self, symbol: &str, done: bool) -> BotResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO grid_status (symbol, setup_done, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(symbol) DO UPDATE SET
                setup_done = excluded.setup_done,
                updated_at = excluded.updated_at",
            params![symbol, done as i32, now_secs()],
        )?;
        Ok(())
    }

    pub fn is_setup_done(&self, symbol: &str) -> BotResult<bool> {
        let conn = self.lock()?;
        let done: Option<i32> = conn
            .query_row(
                "SELECT setup_done FROM grid_status WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        Ok(done == Some(1))
    }

    pub fn grid_status(&self, symbol: &str) -> BotResult<Option<GridStatus>> {
        let conn = self.lock()?;
        let status = conn
            .query_row(
                "SELECT symbol, open_orders_json, grid_levels_json, setup_done, updated_at
                 FROM grid_status WHERE symbol = ?1",
                params![symbol],
                GridStatus::from_row,
            )
            .optional()?;
        Ok(status)
    }

    /// Ladders persisted by previous runs, for restoring on startup
    pub fn stored_grids(&self) -> BotResult<HashMap<String, Vec<f64>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, open_orders_json, grid_levels_json, setup_done, updated_at
             FROM grid_status",
        )?;
        let rows = stmt.query_map([], GridStatus::from_row)?;

        let mut grids = HashMap::new();
        for status in rows {
            let status = status?;
            if !status.levels.is_empty() {
                grids.insert(status.symbol, status.levels);
            }
        }
        Ok(grids)
    }

    /// Forget a pair's ladder so the next cycle regenerates it
    pub fn clear_grid_levels(&self, symbol: &str) -> BotResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE grid_status SET grid_levels_json = '[]', updated_at = ?2 WHERE symbol = ?1",
            params![symbol, now_secs()],
        )?;
        Ok(())
    }

    /// Wipe the cached open-order snapshots of every pair
    pub fn clear_open_orders_cache(&self) -> BotResult<usize> {
        let conn = self.lock()?;
        let cleared = conn.execute(
            "UPDATE grid_status SET open_orders_json = '[]', updated_at = ?1",
            params![now_secs()],
        )?;
        Ok(cleared)
    }

    /// Drop every ladder, snapshot and setup flag (new account context)
    pub fn reset_grid_state(&self) -> BotResult<usize> {
        let conn = self.lock()?;
        let cleared = conn.execute("DELETE FROM grid_status", [])?;
        Ok(cleared)
    }
}
