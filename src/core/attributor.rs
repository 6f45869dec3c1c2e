// Trade attribution: sequence ids for buys, linked buys and profit for sells

use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::warn;

use crate::config::ActivePair;
use crate::db::{Database, TradeRecord};
use crate::error::BotResult;
use crate::exchange::{Fill, Side};

/// Price band around the implied buy price searched for the originating buy
pub const LINK_TOLERANCE: f64 = 0.01;

/// Quote prices of fee currencies other than the pair's own assets
pub type FeeRates = HashMap<String, f64>;

/// Fee of a fill expressed in the quote currency.
///
/// Fees charged in the base asset are valued at the fill price, fees in a
/// third currency at its rate from `rates`. A third-currency fee without a
/// rate cannot be valued and counts as zero.
pub fn fee_in_quote(fill: &Fill, base: &str, quote: &str, rates: &FeeRates) -> f64 {
    match &fill.fee {
        Some(fee) if fee.currency == quote => fee.cost,
        Some(fee) if fee.currency == base => fee.cost * fill.price,
        Some(fee) => match rates.get(&fee.currency) {
            Some(rate) => fee.cost * rate,
            None => {
                warn!(
                    "⚠️  {} fee of {} {} has no {} price; profit excludes it",
                    fill.pair, fee.cost, fee.currency, quote
                );
                0.0
            }
        },
        None => 0.0,
    }
}

/// Fee currencies in `fills` that need a quote rate to be valued
pub fn foreign_fee_currencies(fills: &[Fill], base: &str, quote: &str) -> Vec<String> {
    let mut currencies: Vec<String> = fills
        .iter()
        .filter_map(|f| f.fee.as_ref())
        .map(|fee| fee.currency.clone())
        .filter(|c| c != base && c != quote)
        .collect();
    currencies.sort();
    currencies.dedup();
    currencies
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SellProfit {
    pub implied_buy_price: f64,
    pub gross: f64,
    /// Gross minus the round-trip fee estimate; may be negative
    pub net: f64,
    /// `net` floored at zero, for operator-facing output only
    pub display: f64,
}

/// Profit of a grid sell against the level one spread below it.
pub fn sell_profit(sell_price: f64, quantity: f64, spread_pct: f64, fee_quote: f64) -> SellProfit {
    let implied_buy_price = sell_price / (1.0 + spread_pct / 100.0);
    let gross = (sell_price - implied_buy_price) * quantity;
    let net = gross - 2.0 * fee_quote;
    SellProfit {
        implied_buy_price,
        gross,
        net,
        display: net.max(0.0),
    }
}

/// A newly observed fill, ready to be reported.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribution {
    Buy {
        trade: TradeRecord,
        buy_id: Option<u32>,
        /// First buy of the session on this pair
        initial_entry: bool,
    },
    Sell {
        trade: TradeRecord,
        linked_buy_id: Option<u32>,
        profit: SellProfit,
    },
}

impl Attribution {
    pub fn trade(&self) -> &TradeRecord {
        match self {
            Attribution::Buy { trade, .. } | Attribution::Sell { trade, .. } => trade,
        }
    }
}

impl fmt::Display for Attribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribution::Buy { trade, buy_id, initial_entry } => {
                let label = if *initial_entry { "INITIAL ENTRY" } else { "BUY" };
                let id = buy_id.map(|id| format!("#{}", id)).unwrap_or_else(|| "?".to_string());
                write!(
                    f,
                    "🟢 {} {} {} {} @ {:.4} ({:.2})",
                    label, id, trade.symbol, trade.amount, trade.price, trade.cost
                )
            }
            Attribution::Sell { trade, linked_buy_id, profit } => {
                let link = linked_buy_id.map(|id| format!("#{}", id)).unwrap_or_else(|| "?".to_string());
                write!(
                    f,
                    "🔴 SELL {} closes {} {} @ {:.4} | profit {:.4}",
                    trade.symbol, link, trade.amount, trade.price, profit.display
                )
            }
        }
    }
}

/// Turns polled fills into ledger rows and reportable attributions.
///
/// Re-ingesting a known trade is a no-op: the ledger insert is
/// insert-if-absent and seen ids are remembered for the session.
#[derive(Debug, Default)]
pub struct TradeAttributor {
    processed: HashSet<(String, String)>,
    session_trades: HashMap<String, u32>,
    session_buys: HashSet<String>,
    session_start_ms: i64,
}

impl TradeAttributor {
    pub fn new(session_start_ms: i64) -> Self {
        Self {
            session_start_ms,
            ..Self::default()
        }
    }

    /// Forget everything seen so far and start a new session
    pub fn reset(&mut self, session_start_ms: i64) {
        *self = Self::new(session_start_ms);
    }

    pub fn session_start_ms(&self) -> i64 {
        self.session_start_ms
    }

    pub fn session_trade_count(&self, pair: &str) -> u32 {
        self.session_trades.get(pair).copied().unwrap_or(0)
    }

    pub fn reset_pair(&mut self, pair: &str) {
        self.session_trades.remove(pair);
        self.session_buys.remove(pair);
    }

    pub fn ingest(&mut self, db: &Database, pair: &ActivePair, fills: &[Fill]) -> BotResult<Vec<Attribution>> {
        self.ingest_with_rates(db, pair, fills, &FeeRates::new())
    }

    /// Like [`ingest`](Self::ingest), valuing third-currency fees at `rates`
    pub fn ingest_with_rates(
        &mut self,
        db: &Database,
        pair: &ActivePair,
        fills: &[Fill],
        rates: &FeeRates,
    ) -> BotResult<Vec<Attribution>> {
        let mut fills: Vec<&Fill> = fills.iter().filter(|f| f.pair == pair.symbol).collect();
        fills.sort_by_key(|f| f.timestamp_ms);

        let mut attributions = Vec::new();
        for fill in fills {
            let key = (fill.id.clone(), fill.pair.clone());
            if self.processed.contains(&key) {
                continue;
            }

            let record = TradeRecord {
                id: fill.id.clone(),
                symbol: fill.pair.clone(),
                side: fill.side,
                price: fill.price,
                amount: fill.quantity,
                cost: fill.cost,
                fee_quote: fee_in_quote(fill, &pair.base, &pair.quote, rates),
                timestamp_ms: fill.timestamp_ms,
                buy_id: None,
            };

            let stored = db.record_trade(&record)?;
            self.processed.insert(key);

            // known from an earlier run, or older than this session
            let Some(trade) = stored else { continue };
            if trade.timestamp_ms < self.session_start_ms {
                continue;
            }

            *self.session_trades.entry(pair.symbol.clone()).or_insert(0) += 1;
            attributions.push(self.attribute(db, pair, trade));
        }

        Ok(attributions)
    }

    fn attribute(&mut self, db: &Database, pair: &ActivePair, trade: TradeRecord) -> Attribution {
        match trade.side {
            Side::Buy => {
                let initial_entry = self.session_buys.insert(pair.symbol.clone());
                Attribution::Buy {
                    buy_id: trade.buy_id,
                    initial_entry,
                    trade,
                }
            }
            Side::Sell => {
                let profit = sell_profit(trade.price, trade.amount, pair.params.spread_pct, trade.fee_quote);
                // a failed lookup only costs the link, never the report
                let linked_buy_id = db
                    .find_linked_buy(&trade.symbol, profit.implied_buy_price, LINK_TOLERANCE, trade.timestamp_ms)
                    .ok()
                    .flatten()
                    .and_then(|buy| buy.buy_id);
                Attribution::Sell {
                    trade,
                    linked_buy_id,
                    profit,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyParams;
    use crate::db::test_db;
    use crate::exchange::Fee;

    fn pair() -> ActivePair {
        ActivePair {
            symbol: "BTC/USDC".to_string(),
            base: "BTC".to_string(),
            quote: "USDC".to_string(),
            params: StrategyParams { spread_pct: 1.0, ..StrategyParams::default() },
        }
    }

    fn fill(id: &str, side: Side, price: f64, timestamp_ms: i64) -> Fill {
        Fill {
            id: id.to_string(),
            order_id: format!("o-{}", id),
            pair: "BTC/USDC".to_string(),
            side,
            price,
            quantity: 0.1,
            cost: price * 0.1,
            fee: Some(Fee { cost: 0.01, currency: "USDC".to_string() }),
            timestamp_ms,
        }
    }

    #[test]
    fn test_fee_normalization() {
        let rates = FeeRates::from([("BNB".to_string(), 300.0)]);
        let mut f = fill("t", Side::Buy, 200.0, 1);
        assert_eq!(fee_in_quote(&f, "BTC", "USDC", &rates), 0.01);

        f.fee = Some(Fee { cost: 0.001, currency: "BTC".to_string() });
        assert!((fee_in_quote(&f, "BTC", "USDC", &rates) - 0.2).abs() < 1e-12);

        f.fee = Some(Fee { cost: 0.002, currency: "BNB".to_string() });
        assert!((fee_in_quote(&f, "BTC", "USDC", &rates) - 0.6).abs() < 1e-12);

        // no rate known: the fee cannot be valued
        assert_eq!(fee_in_quote(&f, "BTC", "USDC", &FeeRates::new()), 0.0);
    }

    #[test]
    fn test_foreign_fee_currencies() {
        let mut bnb = fill("a", Side::Buy, 100.0, 1);
        bnb.fee = Some(Fee { cost: 0.001, currency: "BNB".to_string() });
        let fills = vec![bnb.clone(), bnb, fill("b", Side::Sell, 101.0, 2)];

        assert_eq!(foreign_fee_currencies(&fills, "BTC", "USDC"), vec!["BNB".to_string()]);
    }

    #[test]
    fn test_sell_profit_clamps_display_only() {
        let profit = sell_profit(101.0, 1.0, 1.0, 0.1);
        assert!((profit.implied_buy_price - 100.0).abs() < 1e-9);
        assert!((profit.gross - 1.0).abs() < 1e-9);
        assert!((profit.net - 0.8).abs() < 1e-9);

        let losing = sell_profit(101.0, 0.01, 1.0, 0.1);
        assert!(losing.net < 0.0);
        assert_eq!(losing.display, 0.0);
    }

    #[test]
    fn test_sell_links_to_buy_one_spread_below() {
        let db = test_db();
        let mut attributor = TradeAttributor::new(0);

        let fills = vec![fill("b1", Side::Buy, 100.0, 10), fill("s1", Side::Sell, 101.0, 20)];
        let out = attributor.ingest(&db, &pair(), &fills).unwrap();

        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Attribution::Buy { buy_id: Some(1), initial_entry: true, .. }));
        assert!(matches!(out[1], Attribution::Sell { linked_buy_id: Some(1), .. }));
    }

    #[test]
    fn test_unlinked_sell() {
        let db = test_db();
        let mut attributor = TradeAttributor::new(0);

        let out = attributor.ingest(&db, &pair(), &[fill("s1", Side::Sell, 150.0, 20)]).unwrap();
        assert!(matches!(out[0], Attribution::Sell { linked_buy_id: None, .. }));
        assert!(out[0].to_string().contains('?'));
    }

    #[test]
    fn test_reingest_is_idempotent() {
        let db = test_db();
        let mut attributor = TradeAttributor::new(0);
        let fills = vec![fill("b1", Side::Buy, 100.0, 10)];

        assert_eq!(attributor.ingest(&db, &pair(), &fills).unwrap().len(), 1);
        assert!(attributor.ingest(&db, &pair(), &fills).unwrap().is_empty());

        // a fresh attributor over the same ledger stays silent as well
        let mut restarted = TradeAttributor::new(0);
        assert!(restarted.ingest(&db, &pair(), &fills).unwrap().is_empty());

        assert_eq!(attributor.session_trade_count("BTC/USDC"), 1);
        assert_eq!(db.find_trade("b1", "BTC/USDC").unwrap().unwrap().buy_id, Some(1));
    }

    #[test]
    fn test_pre_session_trades_recorded_silently() {
        let db = test_db();
        let mut attributor = TradeAttributor::new(1_000);

        let out = attributor.ingest(&db, &pair(), &[fill("old", Side::Buy, 100.0, 10)]).unwrap();
        assert!(out.is_empty());
        assert!(db.find_trade("old", "BTC/USDC").unwrap().is_some());
    }

    #[test]
    fn test_second_buy_is_not_initial_entry() {
        let db = test_db();
        let mut attributor = TradeAttributor::new(0);
        let fills = vec![fill("b1", Side::Buy, 100.0, 10), fill("b2", Side::Buy, 99.0, 11)];

        let out = attributor.ingest(&db, &pair(), &fills).unwrap();
        assert!(matches!(out[1], Attribution::Buy { buy_id: Some(2), initial_entry: false, .. }));
    }
}
