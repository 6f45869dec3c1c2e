//! Named scalars in `bot_info`: baselines, session markers, per-pair anchors

use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;

use super::Database;
use crate::config::Network;
use crate::error::BotResult;

const SESSION_BASELINE: &str = "session_start_balance";
const GLOBAL_BASELINE: &str = "global_start_balance";
const SESSION_START: &str = "session_start_time";
const COIN_INITIALS: &str = "coin_initial_balances";
const PAIR_SESSION_PREFIX: &str = "pair_session_start:";
const NETWORK_MARKER: &str = "network";
const FIRST_RUN: &str = "first_run_time";
const LAST_PRUNE: &str = "last_prune_day";
const BUY_ID_COUNTER: &str = "buy_id_counter";

impl Database {
    pub fn get_setting(&self, key: &str) -> BotResult<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM bot_info WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> BotResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO bot_info (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> BotResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM bot_info WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn get_f64(&self, key: &str) -> BotResult<Option<f64>> {
        Ok(self.get_setting(key)?.and_then(|v| v.parse().ok()))
    }

    fn get_i64(&self, key: &str) -> BotResult<Option<i64>> {
        Ok(self.get_setting(key)?.and_then(|v| v.parse().ok()))
    }

    pub fn session_baseline(&self) -> BotResult<Option<f64>> {
        self.get_f64(SESSION_BASELINE)
    }

    pub fn set_session_baseline(&self, equity: f64) -> BotResult<()> {
        self.set_setting(SESSION_BASELINE, &equity.to_string())
    }

    pub fn global_baseline(&self) -> BotResult<Option<f64>> {
        self.get_f64(GLOBAL_BASELINE)
    }

    pub fn set_global_baseline(&self, equity: f64) -> BotResult<()> {
        self.set_setting(GLOBAL_BASELINE, &equity.to_string())
    }

    /// Shift both baselines by a deposit (positive) or withdrawal (negative)
    pub fn adjust_balance_baselines(&self, delta: f64) -> BotResult<()> {
        if let Some(session) = self.session_baseline()? {
            self.set_session_baseline(session + delta)?;
        }
        if let Some(global) = self.global_baseline()? {
            self.set_global_baseline(global + delta)?;
        }
        Ok(())
    }

    /// Session start, milliseconds since the epoch
    pub fn session_start_ms(&self) -> BotResult<Option<i64>> {
        self.get_i64(SESSION_START)
    }

    pub fn set_session_start_ms(&self, ms: i64) -> BotResult<()> {
        self.set_setting(SESSION_START, &ms.to_string())
    }

    /// First time this database saw the bot run; set once
    pub fn ensure_first_run_ms(&self, ms: i64) -> BotResult<i64> {
        if let Some(existing) = self.get_i64(FIRST_RUN)? {
            return Ok(existing);
        }
        self.set_setting(FIRST_RUN, &ms.to_string())?;
        Ok(ms)
    }

    /// Holding value per pair captured at session start
    pub fn coin_initial_balances(&self) -> BotResult<HashMap<String, f64>> {
        match self.get_setting(COIN_INITIALS)? {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_default()),
            None => Ok(HashMap::new()),
        }
    }

    pub fn set_coin_initial_balances(&self, values: &HashMap<String, f64>) -> BotResult<()> {
        let json = serde_json::to_string(values)?;
        self.set_setting(COIN_INITIALS, &json)
    }

    pub fn set_coin_initial_balance(&self, symbol: &str, value: f64) -> BotResult<()> {
        let mut values = self.coin_initial_balances()?;
        values.insert(symbol.to_string(), value);
        self.set_coin_initial_balances(&values)
    }

    pub fn pair_session_start_ms(&self, symbol: &str) -> BotResult<Option<i64>> {
        self.get_i64(&format!("{}{}", PAIR_SESSION_PREFIX, symbol))
    }

    pub fn set_pair_session_start_ms(&self, symbol: &str, ms: i64) -> BotResult<()> {
        self.set_setting(&format!("{}{}", PAIR_SESSION_PREFIX, symbol), &ms.to_string())
    }

    /// Fall back to the engine session start for this pair
    pub fn clear_pair_session_start_ms(&self, symbol: &str) -> BotResult<()> {
        self.delete_setting(&format!("{}{}", PAIR_SESSION_PREFIX, symbol))
    }

    /// Network the stored statistics belong to
    pub fn network_marker(&self) -> BotResult<Option<Network>> {
        Ok(self.get_setting(NETWORK_MARKER)?.and_then(|v| Network::parse(&v)))
    }

    pub fn set_network_marker(&self, network: Network) -> BotResult<()> {
        self.set_setting(NETWORK_MARKER, network.as_str())
    }

    pub fn last_prune_day(&self) -> BotResult<Option<String>> {
        self.get_setting(LAST_PRUNE)
    }

    pub fn set_last_prune_day(&self, day: &str) -> BotResult<()> {
        self.set_setting(LAST_PRUNE, day)
    }

    /// Wipe trades, equity history, baselines and per-pair anchors.
    /// The network marker and grid state are left alone.
    pub fn reset_all_statistics(&self) -> BotResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM trade_history", [])?;
        tx.execute("DELETE FROM balance_history", [])?;
        tx.execute(
            "DELETE FROM bot_info WHERE key IN (?1, ?2, ?3, ?4, ?5)",
            params![SESSION_BASELINE, GLOBAL_BASELINE, SESSION_START, COIN_INITIALS, BUY_ID_COUNTER],
        )?;
        tx.execute(
            "DELETE FROM bot_info WHERE key LIKE ?1",
            params![format!("{}%", PAIR_SESSION_PREFIX)],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_baselines_and_adjustment() {
        let db = test_db();
        assert!(db.session_baseline().unwrap().is_none());

        db.set_session_baseline(1000.0).unwrap();
        db.set_global_baseline(800.0).unwrap();
        db.adjust_balance_baselines(-100.0).unwrap();

        assert_eq!(db.session_baseline().unwrap(), Some(900.0));
        assert_eq!(db.global_baseline().unwrap(), Some(700.0));
    }

    #[test]
    fn test_coin_initial_balances() {
        let db = test_db();
        db.set_coin_initial_balance("BTC/USDC", 25.0).unwrap();
        db.set_coin_initial_balance("ETH/USDC", 10.0).unwrap();
        db.set_coin_initial_balance("BTC/USDC", 30.0).unwrap();

        let values = db.coin_initial_balances().unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["BTC/USDC"], 30.0);
    }

    #[test]
    fn test_pair_session_start_can_be_cleared() {
        let db = test_db();
        db.set_pair_session_start_ms("BTC/USDC", 1_000).unwrap();
        db.set_pair_session_start_ms("ETH/USDC", 2_000).unwrap();

        db.clear_pair_session_start_ms("BTC/USDC").unwrap();
        assert_eq!(db.pair_session_start_ms("BTC/USDC").unwrap(), None);
        assert_eq!(db.pair_session_start_ms("ETH/USDC").unwrap(), Some(2_000));
    }

    #[test]
    fn test_first_run_is_sticky() {
        let db = test_db();
        assert_eq!(db.ensure_first_run_ms(10).unwrap(), 10);
        assert_eq!(db.ensure_first_run_ms(20).unwrap(), 10);
    }

    #[test]
    fn test_reset_keeps_network_marker() {
        let db = test_db();
        db.set_network_marker(Network::Live).unwrap();
        db.set_session_baseline(1.0).unwrap();
        db.set_pair_session_start_ms("BTC/USDC", 5).unwrap();
        db.next_buy_id().unwrap();

        db.reset_all_statistics().unwrap();

        assert_eq!(db.network_marker().unwrap(), Some(Network::Live));
        assert!(db.session_baseline().unwrap().is_none());
        assert!(db.pair_session_start_ms("BTC/USDC").unwrap().is_none());
        assert_eq!(db.next_buy_id().unwrap(), 1);
    }
}
