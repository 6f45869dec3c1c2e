//! Trade ledger operations

use rusqlite::{params, OptionalExtension, Result as SqlResult, Row};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::Database;
use crate::error::BotResult;
use crate::exchange::Side;

/// Upper bound of the cyclic buy sequence id.
pub const BUY_ID_CEILING: u32 = 1000;

const BUY_ID_KEY: &str = "buy_id_counter";

/// A fill as stored in `trade_history`. Price, amount and cost never change
/// after the first insert; only a missing `buy_id` may be backfilled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub amount: f64,
    pub cost: f64,
    /// Fee normalized to the quote currency
    pub fee_quote: f64,
    pub timestamp_ms: i64,
    pub buy_id: Option<u32>,
}

impl TradeRecord {
    fn from_row(row: &Row) -> SqlResult<Self> {
        let side: String = row.get(2)?;
        Ok(TradeRecord {
            id: row.get(0)?,
            symbol: row.get(1)?,
            side: Side::parse(&side).unwrap_or(Side::Buy),
            price: row.get(3)?,
            amount: row.get(4)?,
            cost: row.get(5)?,
            fee_quote: row.get(6)?,
            timestamp_ms: row.get(7)?,
            buy_id: row.get(8)?,
        })
    }
}

const TRADE_COLUMNS: &str =
    "id, symbol, side, price, amount, cost, fee_quote, timestamp_ms, buy_id";

/// Per-pair aggregates over a time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PairTradeStats {
    pub buy_count: i64,
    pub sell_count: i64,
    pub quote_spent: f64,
    pub quote_received: f64,
    pub fees_quote: f64,
    pub base_bought: f64,
    pub base_sold: f64,
}

impl PairTradeStats {
    /// Realized quote cash flow net of fees
    pub fn net_cash_flow(&self) -> f64 {
        self.quote_received - self.quote_spent - self.fees_quote
    }

    pub fn total_trades(&self) -> i64 {
        self.buy_count + self.sell_count
    }
}

impl Database {
    /// Insert a fill unless the (id, symbol) pair is already in the ledger.
    ///
    /// Buys get the next sequence id in the same transaction. Returns the
    /// stored record only when it was newly inserted. A known buy whose
    /// `buy_id` is missing gets one backfilled instead.
    pub fn record_trade(&self, trade: &TradeRecord) -> BotResult<Option<TradeRecord>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let existing: Option<Option<u32>> = tx
            .query_row(
                "SELECT buy_id FROM trade_history WHERE id = ?1 AND symbol = ?2",
                params![trade.id, trade.symbol],
                |row| row.get(0),
            )
            .optional()?;

        let inserted = match existing {
            Some(Some(_)) => None,
            Some(None) => {
                if trade.side == Side::Buy {
                    let buy_id = next_buy_id_in(&tx)?;
                    tx.execute(
                        "UPDATE trade_history SET buy_id = ?1 WHERE id = ?2 AND symbol = ?3",
                        params![buy_id, trade.id, trade.symbol],
                    )?;
                }
                None
            }
            None => {
                let mut stored = trade.clone();
                stored.buy_id = match trade.side {
                    Side::Buy => Some(next_buy_id_in(&tx)?),
                    Side::Sell => None,
                };
                tx.execute(
                    "INSERT OR IGNORE INTO trade_history (
                        id, symbol, side, price, amount, cost, fee_quote, timestamp_ms, buy_id
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        stored.id,
                        stored.symbol,
                        stored.side.as_str(),
                        stored.price,
                        stored.amount,
                        stored.cost,
                        stored.fee_quote,
                        stored.timestamp_ms,
                        stored.buy_id,
                    ],
                )?;
                Some(stored)
            }
        };

        tx.commit()?;
        Ok(inserted)
    }

    /// Raw insert-if-absent without sequence allocation. Returns true when a row was added.
    pub fn insert_trade_if_absent(&self, trade: &TradeRecord) -> BotResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO trade_history (
                id, symbol, side, price, amount, cost, fee_quote, timestamp_ms, buy_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                trade.id,
                trade.symbol,
                trade.side.as_str(),
                trade.price,
                trade.amount,
                trade.cost,
                trade.fee_quote,
                trade.timestamp_ms,
                trade.buy_id,
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn find_trade(&self, id: &str, symbol: &str) -> BotResult<Option<TradeRecord>> {
        let conn = self.lock()?;
        let trade = conn
            .query_row(
                &format!("SELECT {} FROM trade_history WHERE id = ?1 AND symbol = ?2", TRADE_COLUMNS),
                params![id, symbol],
                TradeRecord::from_row,
            )
            .optional()?;
        Ok(trade)
    }

    /// Advance the cyclic sequence counter (1..=1000, then back to 1)
    pub fn next_buy_id(&self) -> BotResult<u32> {
        let conn = self.lock()?;
        let id = next_buy_id_in(&conn)?;
        Ok(id)
    }

    /// Price of the most recent buy on a pair
    pub fn last_buy_price(&self, symbol: &str) -> BotResult<Option<f64>> {
        let conn = self.lock()?;
        let price = conn
            .query_row(
                "SELECT price FROM trade_history
                 WHERE symbol = ?1 AND side = 'buy'
                 ORDER BY timestamp_ms DESC, rowid DESC LIMIT 1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        Ok(price)
    }

    /// Most recent buy within `tolerance` (fractional) of `implied_price`,
    /// no later than `before_ms`.
    pub fn find_linked_buy(
        &self,
        symbol: &str,
        implied_price: f64,
        tolerance: f64,
        before_ms: i64,
    ) -> BotResult<Option<TradeRecord>> {
        let conn = self.lock()?;
        let trade = conn
            .query_row(
                &format!(
                    "SELECT {} FROM trade_history
                     WHERE symbol = ?1 AND side = 'buy'
                       AND price BETWEEN ?2 AND ?3
                       AND timestamp_ms <= ?4
                     ORDER BY timestamp_ms DESC, rowid DESC LIMIT 1",
                    TRADE_COLUMNS
                ),
                params![
                    symbol,
                    implied_price * (1.0 - tolerance),
                    implied_price * (1.0 + tolerance),
                    before_ms
                ],
                TradeRecord::from_row,
            )
            .optional()?;
        Ok(trade)
    }

    /// Newest first
    pub fn recent_trades(&self, symbol: Option<&str>, limit: usize) -> BotResult<Vec<TradeRecord>> {
        let conn = self.lock()?;
        let limit = limit as i64;
        let trades = match symbol {
            Some(symbol) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM trade_history WHERE symbol = ?1
                     ORDER BY timestamp_ms DESC, rowid DESC LIMIT ?2",
                    TRADE_COLUMNS
                ))?;
                let rows = stmt.query_map(params![symbol, limit], TradeRecord::from_row)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM trade_history ORDER BY timestamp_ms DESC, rowid DESC LIMIT ?1",
                    TRADE_COLUMNS
                ))?;
                let rows = stmt.query_map(params![limit], TradeRecord::from_row)?;
                rows.collect::<SqlResult<Vec<_>>>()?
            }
        };
        Ok(trades)
    }

    /// Aggregates per pair for trades at or after `since_ms`
    pub fn trade_stats_since(&self, since_ms: i64) -> BotResult<HashMap<String, PairTradeStats>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT symbol,
                SUM(CASE WHEN side = 'buy' THEN 1 ELSE 0 END),
                SUM(CASE WHEN side = 'sell' THEN 1 ELSE 0 END),
                COALESCE(SUM(CASE WHEN side = 'buy' THEN cost ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN side = 'sell' THEN cost ELSE 0 END), 0),
                COALESCE(SUM(fee_quote), 0),
                COALESCE(SUM(CASE WHEN side = 'buy' THEN amount ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN side = 'sell' THEN amount ELSE 0 END), 0)
             FROM trade_history
             WHERE timestamp_ms >= ?1
             GROUP BY symbol",
        )?;

        let rows = stmt.query_map(params![since_ms], |row| {
            Ok((
                row.get::<_, String>(0)?,
                PairTradeStats {
                    buy_count: row.get(1)?,
                    sell_count: row.get(2)?,
                    quote_spent: row.get(3)?,
                    quote_received: row.get(4)?,
                    fees_quote: row.get(5)?,
                    base_bought: row.get(6)?,
                    base_sold: row.get(7)?,
                },
            ))
        })?;

        let stats = rows.collect::<SqlResult<HashMap<_, _>>>()?;
        Ok(stats)
    }

    pub fn pair_trade_stats(&self, symbol: &str, since_ms: i64) -> BotResult<PairTradeStats> {
        Ok(self
            .trade_stats_since(since_ms)?
            .remove(symbol)
            .unwrap_or_default())
    }

    /// Delete every trade except the listed (id, symbol) keys
    pub fn delete_trades_except(&self, keep: &HashSet<(String, String)>) -> BotResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let all: Vec<(String, String)> = {
            let mut stmt = tx.prepare("SELECT id, symbol FROM trade_history")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<SqlResult<Vec<_>>>()?
        };

        let mut deleted = 0;
        for key in all.into_iter().filter(|k| !keep.contains(k)) {
            deleted += tx.execute(
                "DELETE FROM trade_history WHERE id = ?1 AND symbol = ?2",
                params![key.0, key.1],
            )?;
        }

        tx.commit()?;
        Ok(deleted)
    }

    /// Clear the ledger for one pair, or entirely
    pub fn clear_trade_history(&self, symbol: Option<&str>) -> BotResult<usize> {
        let conn = self.lock()?;
        let deleted = match symbol {
            Some(symbol) => conn.execute("DELETE FROM trade_history WHERE symbol = ?1", params![symbol])?,
            None => conn.execute("DELETE FROM trade_history", [])?,
        };
        Ok(deleted)
    }
}

fn next_buy_id_in(conn: &rusqlite::Connection) -> SqlResult<u32> {
    let current: Option<String> = conn
        .query_row(
            "SELECT value FROM bot_info WHERE key = ?1",
            params![BUY_ID_KEY],
            |row| row.get(0),
        )
        .optional()?;

    let current = current.and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);
    let next = current % BUY_ID_CEILING + 1;

    conn.execute(
        "INSERT INTO bot_info (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![BUY_ID_KEY, next.to_string()],
    )?;
    Ok(next)
}
