//! Market snapshots, equity history and retention

use rusqlite::{params, OptionalExtension, Result as SqlResult, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{now_secs, Database};
use crate::error::BotResult;
use crate::exchange::Candle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: f64,
    pub candles: Vec<Candle>,
    pub updated_at: i64,
}

impl MarketSnapshot {
    fn from_row(row: &Row) -> SqlResult<Self> {
        let candles_json: String = row.get(2)?;
        Ok(MarketSnapshot {
            symbol: row.get(0)?,
            price: row.get(1)?,
            candles: serde_json::from_str(&candles_json).unwrap_or_default(),
            updated_at: row.get(3)?,
        })
    }
}

/// One equity sample, timestamp in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub timestamp: i64,
    pub equity: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub trades: usize,
    pub equity_samples: usize,
    pub market_rows: usize,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.trades + self.equity_samples + self.market_rows
    }
}

impl Database {
    pub fn save_market_snapshot(&self, symbol: &str, price: f64, candles: &[Candle]) -> BotResult<()> {
        let candles_json = serde_json::to_string(candles)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO market_data (symbol, price, candles_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(symbol) DO UPDATE SET
                price = excluded.price,
                candles_json = excluded.candles_json,
                updated_at = excluded.updated_at",
            params![symbol, price, candles_json, now_secs()],
        )?;
        Ok(())
    }

    pub fn market_snapshot(&self, symbol: &str) -> BotResult<Option<MarketSnapshot>> {
        let conn = self.lock()?;
        let snapshot = conn
            .query_row(
                "SELECT symbol, price, candles_json, updated_at FROM market_data WHERE symbol = ?1",
                params![symbol],
                MarketSnapshot::from_row,
            )
            .optional()?;
        Ok(snapshot)
    }

    /// Last stored price of every pair
    pub fn all_prices(&self) -> BotResult<HashMap<String, f64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT symbol, price FROM market_data")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let prices = rows.collect::<SqlResult<HashMap<String, f64>>>()?;
        Ok(prices)
    }

    /// Record total equity; one sample per second at most
    pub fn log_equity_snapshot(&self, timestamp: i64, equity: f64) -> BotResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO balance_history (timestamp, equity) VALUES (?1, ?2)",
            params![timestamp, equity],
        )?;
        Ok(())
    }

    /// Oldest first
    pub fn equity_history(&self, since: Option<i64>) -> BotResult<Vec<EquitySnapshot>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, equity FROM balance_history
             WHERE timestamp >= ?1 ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![since.unwrap_or(0)], |row| {
            Ok(EquitySnapshot {
                timestamp: row.get(0)?,
                equity: row.get(1)?,
            })
        })?;
        let history = rows.collect::<SqlResult<Vec<_>>>()?;
        Ok(history)
    }

    pub fn clear_balance_history(&self) -> BotResult<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM balance_history", [])?;
        Ok(deleted)
    }

    /// Delete trades, equity samples and market rows older than `retention_days`
    pub fn prune_old_data(&self, retention_days: u32, now: i64) -> BotResult<PruneReport> {
        let cutoff_secs = now - i64::from(retention_days) * 86_400;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let report = PruneReport {
            trades: tx.execute(
                "DELETE FROM trade_history WHERE timestamp_ms < ?1",
                params![cutoff_secs * 1000],
            )?,
            equity_samples: tx.execute(
                "DELETE FROM balance_history WHERE timestamp < ?1",
                params![cutoff_secs],
            )?,
            market_rows: tx.execute(
                "DELETE FROM market_data WHERE updated_at < ?1",
                params![cutoff_secs],
            )?,
        };

        tx.commit()?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, TradeRecord};
    use crate::exchange::Side;

    #[test]
    fn test_market_snapshot_upsert() {
        let db = test_db();
        db.save_market_snapshot("BTC/USDC", 100.0, &[]).unwrap();
        db.save_market_snapshot("BTC/USDC", 101.0, &[]).unwrap();

        assert_eq!(db.market_snapshot("BTC/USDC").unwrap().unwrap().price, 101.0);
        assert_eq!(db.all_prices().unwrap().len(), 1);
    }

    #[test]
    fn test_equity_history_ordering() {
        let db = test_db();
        db.log_equity_snapshot(20, 1010.0).unwrap();
        db.log_equity_snapshot(10, 1000.0).unwrap();
        db.log_equity_snapshot(20, 1020.0).unwrap();

        let history = db.equity_history(None).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].timestamp, 10);
        assert_eq!(history[1].equity, 1020.0);
        assert_eq!(db.equity_history(Some(15)).unwrap().len(), 1);
    }

    #[test]
    fn test_prune_old_data() {
        let db = test_db();
        let now = 100 * 86_400;
        db.log_equity_snapshot(now - 40 * 86_400, 900.0).unwrap();
        db.log_equity_snapshot(now - 86_400, 1000.0).unwrap();
        db.insert_trade_if_absent(&TradeRecord {
            id: "old".to_string(),
            symbol: "BTC/USDC".to_string(),
            side: Side::Buy,
            price: 100.0,
            amount: 0.1,
            cost: 10.0,
            fee_quote: 0.0,
            timestamp_ms: (now - 31 * 86_400) * 1000,
            buy_id: Some(1),
        })
        .unwrap();

        let report = db.prune_old_data(30, now).unwrap();
        assert_eq!(report.trades, 1);
        assert_eq!(report.equity_samples, 1);
        assert_eq!(db.equity_history(None).unwrap().len(), 1);
    }
}
