// Per-pair reconciliation of live orders against the target ladder

use tracing::{debug, info, warn};

use crate::config::{ActivePair, StartMode, StrategyParams};
use crate::core::levels::generate_levels;
use crate::core::state::EngineState;
use crate::db::Database;
use crate::error::BotResult;
use crate::exchange::{prices_match, ExchangeGateway, GatewayResult, OpenOrder, Side};

/// Dead zone half-width as a fraction of one spread step
pub const DEAD_ZONE_FACTOR: f64 = 0.1;
/// Minimum markup over the last buy for a new sell, in spread steps
pub const WASH_GUARD_FACTOR: f64 = 0.5;
/// Breakout buffer above the top level before trailing, in spread steps
pub const TRAILING_BUFFER_FACTOR: f64 = 0.2;
/// Share of the sized quantity that must be sellable
pub const SELL_TOLERANCE: f64 = 0.99;
/// Holding value under which a pair counts as unseeded
pub const BOOTSTRAP_FLOOR: f64 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub enum OrderAction {
    Cancel { order_id: String, side: Side, price: f64 },
    Place { side: Side, price: f64, quantity: f64 },
}

impl OrderAction {
    pub fn is_place(&self, side: Side) -> bool {
        matches!(self, OrderAction::Place { side: s, .. } if *s == side)
    }
}

/// What one pair cycle did.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No usable price; nothing touched
    NoPrice,
    /// Start-mode entry handled; placement deferred
    SetupCompleted,
    /// Seed inventory bought; placement deferred
    Bootstrapped,
    /// Ladder shifted up; placement deferred
    Trailed { dropped: f64, added: f64 },
    Reconciled(Vec<OrderAction>),
}

/// Everything the planner reads about one pair at one instant.
#[derive(Debug, Clone, Default)]
pub struct PairSnapshot {
    pub price: f64,
    pub open_orders: Vec<OpenOrder>,
    pub free_quote: f64,
    pub free_base: f64,
    pub reserved_base: f64,
    pub last_buy_price: Option<f64>,
}

/// Diff the ladder against the live orders.
///
/// Funding budgets are drawn down as actions are planned, so one cycle never
/// commits more quote or base than the snapshot shows as free.
pub fn plan_actions(
    gateway: &dyn ExchangeGateway,
    pair: &str,
    params: &StrategyParams,
    levels: &[f64],
    snapshot: &PairSnapshot,
) -> GatewayResult<Vec<OrderAction>> {
    let price = snapshot.price;
    let spread = params.spread_fraction();
    let margin = price * spread * DEAD_ZONE_FACTOR;
    let min_quantity = gateway.min_order_quantity(pair)?;
    let wash_floor = snapshot
        .last_buy_price
        .filter(|p| *p > 0.0)
        .map(|p| p * (1.0 + spread * WASH_GUARD_FACTOR));

    let mut free_quote = snapshot.free_quote;
    let mut free_base = snapshot.free_base;
    let mut actions = Vec::new();

    for &level in levels {
        let side = if level > price + margin {
            Side::Sell
        } else if level < price - margin {
            Side::Buy
        } else {
            continue;
        };

        let resting: Vec<&OpenOrder> = snapshot
            .open_orders
            .iter()
            .filter(|o| prices_match(o.price, level))
            .collect();
        if resting.iter().any(|o| o.side == side) {
            continue;
        }

        // price crossed this level: the resting order is on the wrong side
        for order in resting {
            match order.side {
                Side::Buy => free_quote += order.quantity * order.price,
                Side::Sell => free_base += order.quantity,
            }
            actions.push(OrderAction::Cancel {
                order_id: order.id.clone(),
                side: order.side,
                price: order.price,
            });
        }

        let quantity = gateway.round_quantity(pair, params.stake_per_level / level)?;
        if quantity <= 0.0 || quantity < min_quantity {
            debug!(pair, level, quantity, "level below minimum order size");
            continue;
        }

        match side {
            Side::Buy => {
                let cost = quantity * level;
                if free_quote < cost {
                    debug!(pair, level, cost, free_quote, "not enough quote for buy level");
                    continue;
                }
                free_quote -= cost;
                actions.push(OrderAction::Place { side, price: level, quantity });
            }
            Side::Sell => {
                if let Some(floor) = wash_floor {
                    if level < floor {
                        debug!(pair, level, floor, "sell level too close to last buy");
                        continue;
                    }
                }

                let available = free_base - snapshot.reserved_base;
                if available < quantity * SELL_TOLERANCE {
                    debug!(pair, level, available, "not enough unreserved base for sell level");
                    continue;
                }

                let quantity = if available < quantity {
                    gateway.round_quantity(pair, available)?
                } else {
                    quantity
                };
                if quantity < min_quantity {
                    continue;
                }

                free_base -= quantity;
                actions.push(OrderAction::Place { side, price: level, quantity });
            }
        }
    }

    Ok(actions)
}

/// Runs one pair through setup, bootstrap, trailing and reconciliation.
pub struct Reconciler<'a> {
    gateway: &'a dyn ExchangeGateway,
    db: &'a Database,
}

impl<'a> Reconciler<'a> {
    pub fn new(gateway: &'a dyn ExchangeGateway, db: &'a Database) -> Self {
        Self { gateway, db }
    }

    pub async fn run_pair(&self, pair: &ActivePair, state: &mut EngineState) -> BotResult<CycleOutcome> {
        let symbol = pair.symbol.as_str();
        let params = &pair.params;

        let price = self.gateway.current_price(symbol).await?;
        if !(price > 0.0) {
            return Ok(CycleOutcome::NoPrice);
        }

        if !self.db.is_setup_done(symbol)? {
            let outcome = self.run_setup(pair).await;
            self.db.set_setup_done(symbol, true)?;
            if let Some(outcome) = outcome {
                return Ok(outcome);
            }
        }

        if params.start_mode != StartMode::Wait && self.bootstrap(pair, price).await? {
            return Ok(CycleOutcome::Bootstrapped);
        }

        if state.ladder(symbol).is_none() {
            let levels = generate_levels(
                self.gateway,
                symbol,
                price,
                params.grid_count,
                params.spread_fraction(),
            )?;
            info!("🎯 {} ladder built around {:.4}: {:?}", symbol, price, levels);
            self.db.save_grid_levels(symbol, &levels)?;
            state.set_ladder(symbol, levels);
        }

        if params.trailing {
            if let Some((dropped, added)) = self.trail_up(symbol, params, price, state).await? {
                return Ok(CycleOutcome::Trailed { dropped, added });
            }
        }

        let snapshot = PairSnapshot {
            price,
            open_orders: self.gateway.open_orders(symbol).await?,
            free_quote: self.gateway.free_balance(&pair.quote).await?,
            free_base: self.gateway.free_balance(&pair.base).await?,
            reserved_base: state.reserved_for(&pair.base),
            last_buy_price: self.db.last_buy_price(symbol)?,
        };

        let levels = state.ladder(symbol).unwrap_or_default().to_vec();
        let actions = plan_actions(self.gateway, symbol, params, &levels, &snapshot)?;
        self.execute(symbol, &actions).await;

        Ok(CycleOutcome::Reconciled(actions))
    }

    /// One-shot start-mode entry. `None` means carry on with the cycle.
    async fn run_setup(&self, pair: &ActivePair) -> Option<CycleOutcome> {
        let multiplier = pair.params.start_mode.stake_multiplier()?;
        let amount = pair.params.stake_per_level * multiplier;

        info!("🚀 {} initial entry: market buy for {:.2} {}", pair.symbol, amount, pair.quote);
        match self.gateway.place_market_buy(&pair.symbol, amount).await {
            Ok(fill) => info!(
                "✅ {} initial entry filled: {} @ {:.4}",
                pair.symbol, fill.quantity, fill.average_price
            ),
            // not retried: a second attempt could double the position
            Err(e) => warn!("⚠️  {} initial entry failed: {}", pair.symbol, e),
        }
        Some(CycleOutcome::SetupCompleted)
    }

    /// Seed an empty position. Returns true when a buy went through.
    async fn bootstrap(&self, pair: &ActivePair, price: f64) -> BotResult<bool> {
        let held = self.gateway.total_balance(&pair.base).await?;
        if held * price >= BOOTSTRAP_FLOOR {
            return Ok(false);
        }

        let stake = pair.params.stake_per_level;
        let free_quote = self.gateway.free_balance(&pair.quote).await?;
        if free_quote <= stake {
            warn!("⚠️  {} has no inventory and only {:.2} {} to seed it", pair.symbol, free_quote, pair.quote);
            return Ok(false);
        }

        warn!("⚠️  {} has no inventory ({:.2} {}); seeding with a market buy", pair.symbol, held * price, pair.quote);
        match self.gateway.place_market_buy(&pair.symbol, stake).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_skip() => {
                debug!(pair = %pair.symbol, error = %e, "seed buy skipped");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Shift the ladder one step up when price has broken above it.
    async fn trail_up(
        &self,
        symbol: &str,
        params: &StrategyParams,
        price: f64,
        state: &mut EngineState,
    ) -> BotResult<Option<(f64, f64)>> {
        let spread = params.spread_fraction();
        let mut levels = match state.ladder(symbol) {
            Some(levels) if !levels.is_empty() => levels.to_vec(),
            _ => return Ok(None),
        };

        let highest = levels[levels.len() - 1];
        if price <= highest * (1.0 + spread * TRAILING_BUFFER_FACTOR) {
            return Ok(None);
        }

        let dropped = levels.remove(0);
        let added = self.gateway.round_price(symbol, highest * (1.0 + spread))?;
        levels.push(added);

        for order in self.gateway.open_orders(symbol).await? {
            if prices_match(order.price, dropped) {
                if let Err(e) = self.gateway.cancel_order(&order.id, symbol).await {
                    warn!("⚠️  {} failed to cancel trailing order {}: {}", symbol, order.id, e);
                }
            }
        }

        info!("📈 {} trailing up: dropped {:.4}, added {:.4}", symbol, dropped, added);
        self.db.save_grid_levels(symbol, &levels)?;
        state.set_ladder(symbol, levels);
        Ok(Some((dropped, added)))
    }

    /// Fire each action once. Failures are logged; the next cycle re-plans.
    async fn execute(&self, symbol: &str, actions: &[OrderAction]) {
        for action in actions {
            match action {
                OrderAction::Cancel { order_id, side, price } => {
                    info!("🔄 {} canceling crossed {} @ {:.4}", symbol, side, price);
                    if let Err(e) = self.gateway.cancel_order(order_id, symbol).await {
                        warn!("⚠️  {} cancel {} failed: {}", symbol, order_id, e);
                    }
                }
                OrderAction::Place { side, price, quantity } => {
                    info!("📝 {} placing {} {} @ {:.4}", symbol, side, quantity, price);
                    match self.gateway.place_limit_order(symbol, *side, *quantity, *price).await {
                        Ok(_) => {}
                        Err(e) if e.is_skip() => debug!(pair = symbol, error = %e, "order skipped"),
                        Err(e) => warn!("⚠️  {} {} @ {:.4} failed: {}", symbol, side, price, e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{OrderStatus, PaperExchange};

    fn params() -> StrategyParams {
        StrategyParams {
            grid_count: 4,
            spread_pct: 1.0,
            stake_per_level: 10.0,
            start_mode: StartMode::Wait,
            trailing: false,
        }
    }

    fn venue() -> PaperExchange {
        let venue = PaperExchange::new("USDC");
        venue.list_market("BTC/USDC", 100.0);
        venue
    }

    fn order(id: &str, side: Side, price: f64, quantity: f64) -> OpenOrder {
        OpenOrder {
            id: id.to_string(),
            pair: "BTC/USDC".to_string(),
            side,
            price,
            quantity,
            status: OrderStatus::Open,
        }
    }

    const LADDER: [f64; 4] = [98.0, 99.0, 101.0, 102.0];

    #[test]
    fn test_buys_only_without_base() {
        let snapshot = PairSnapshot { price: 100.0, free_quote: 1000.0, ..Default::default() };
        let actions = plan_actions(&venue(), "BTC/USDC", &params(), &LADDER, &snapshot).unwrap();

        assert_eq!(actions.len(), 2);
        assert!(actions.iter().all(|a| a.is_place(Side::Buy)));
    }

    #[test]
    fn test_matching_orders_are_left_alone() {
        let snapshot = PairSnapshot {
            price: 100.0,
            free_quote: 1000.0,
            free_base: 1.0,
            open_orders: vec![
                order("a", Side::Buy, 98.0, 0.10204),
                order("b", Side::Buy, 99.0, 0.10101),
                order("c", Side::Sell, 101.0, 0.09900),
                order("d", Side::Sell, 102.0, 0.09803),
            ],
            ..Default::default()
        };
        let actions = plan_actions(&venue(), "BTC/USDC", &params(), &LADDER, &snapshot).unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn test_crossed_order_is_canceled_and_replaced() {
        // price fell through 99: the buy resting there should now be a sell
        let snapshot = PairSnapshot {
            price: 98.5,
            free_quote: 0.0,
            free_base: 1.0,
            open_orders: vec![order("x", Side::Buy, 99.0, 0.1)],
            ..Default::default()
        };
        let actions = plan_actions(&venue(), "BTC/USDC", &params(), &[99.0], &snapshot).unwrap();

        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], OrderAction::Cancel { order_id, .. } if order_id == "x"));
        assert!(actions[1].is_place(Side::Sell));
    }

    #[test]
    fn test_dead_zone_takes_no_action() {
        let snapshot = PairSnapshot {
            price: 100.0,
            free_quote: 1000.0,
            free_base: 1.0,
            open_orders: vec![order("z", Side::Sell, 100.05, 0.1)],
            ..Default::default()
        };
        // margin is 0.1 around 100; both levels sit inside it
        let actions = plan_actions(&venue(), "BTC/USDC", &params(), &[99.95, 100.05], &snapshot).unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn test_reserved_inventory_limits_sells() {
        let snapshot = PairSnapshot {
            price: 100.0,
            free_base: 0.25,
            reserved_base: 0.1,
            ..Default::default()
        };
        let actions = plan_actions(&venue(), "BTC/USDC", &params(), &LADDER, &snapshot).unwrap();

        let sold: f64 = actions
            .iter()
            .filter_map(|a| match a {
                OrderAction::Place { side: Side::Sell, quantity, .. } => Some(*quantity),
                _ => None,
            })
            .sum();
        assert!(sold > 0.0);
        assert!(snapshot.free_base - sold - snapshot.reserved_base >= -1e-12);
    }

    #[test]
    fn test_sell_clamped_to_available() {
        // 0.09851 of the 0.099 sized is within tolerance: clamp instead of skip
        let snapshot = PairSnapshot { price: 100.0, free_base: 0.09851, ..Default::default() };
        let actions = plan_actions(&venue(), "BTC/USDC", &params(), &[101.0], &snapshot).unwrap();

        assert_eq!(actions, vec![OrderAction::Place { side: Side::Sell, price: 101.0, quantity: 0.09851 }]);
    }

    #[test]
    fn test_wash_guard_suppresses_close_sell() {
        let snapshot = PairSnapshot {
            price: 100.0,
            free_base: 1.0,
            last_buy_price: Some(100.8),
            ..Default::default()
        };
        let actions = plan_actions(&venue(), "BTC/USDC", &params(), &LADDER, &snapshot).unwrap();

        // floor is 100.8 * 1.005 = 101.304: 101 is suppressed, 102 is not
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], OrderAction::Place { side: Side::Sell, price, .. } if price == 102.0));
    }

    #[test]
    fn test_budget_is_drawn_down() {
        let snapshot = PairSnapshot { price: 100.0, free_quote: 15.0, ..Default::default() };
        let actions = plan_actions(&venue(), "BTC/USDC", &params(), &LADDER, &snapshot).unwrap();
        assert_eq!(actions.len(), 1);
    }
}
