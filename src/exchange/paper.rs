//! Paper venue: an in-memory spot exchange.
//!
//! Backs the simulated network and doubles as the gateway fake in tests.
//! Resting limit orders fill at their own price once the market price
//! crosses them; buy fees are charged in the base asset and sell fees in
//! the quote asset, like most spot venues.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Candle, ExchangeGateway, Fee, Fill, GatewayConnector, GatewayError, GatewayResult,
    MarketFill, MarketRules, OpenOrder, OrderStatus, Side,
};
use crate::config::{split_symbol, Network, SimulationConfig};

const BALANCE_EPSILON: f64 = 1e-9;
const MAX_HISTORY: usize = 1_000;

/// Observable side effects, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum PaperEvent {
    LimitPlaced { pair: String, side: Side, price: f64, quantity: f64 },
    Canceled { pair: String, order_id: String, price: f64 },
    MarketBuy { pair: String, quantity: f64, cost: f64 },
    MarketSell { pair: String, quantity: f64, proceeds: f64 },
    Filled { pair: String, side: Side, price: f64, quantity: f64 },
}

#[derive(Debug, Clone, Copy, Default)]
struct Balance {
    free: f64,
    locked: f64,
}

#[derive(Debug)]
struct PaperMarket {
    price: f64,
    rules: MarketRules,
    history: Vec<(i64, f64)>,
}

#[derive(Debug)]
struct PaperState {
    markets: HashMap<String, PaperMarket>,
    balances: HashMap<String, Balance>,
    orders: Vec<OpenOrder>,
    trades: Vec<Fill>,
    events: Vec<PaperEvent>,
    fee_rate: f64,
    volatility_pct: f64,
    offline: bool,
    latency: Duration,
    last_timestamp_ms: i64,
}

pub struct PaperExchange {
    quote_asset: String,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(quote_asset: &str) -> Self {
        Self {
            quote_asset: quote_asset.to_string(),
            state: Mutex::new(PaperState {
                markets: HashMap::new(),
                balances: HashMap::new(),
                orders: Vec::new(),
                trades: Vec::new(),
                events: Vec::new(),
                fee_rate: 0.0,
                volatility_pct: 0.0,
                offline: false,
                latency: Duration::ZERO,
                last_timestamp_ms: 0,
            }),
        }
    }

    /// Venue seeded from the `[simulation]` config section.
    pub fn from_simulation(quote_asset: &str, simulation: &SimulationConfig) -> Self {
        let venue = Self::new(quote_asset);
        venue.set_fee_rate(simulation.fee_rate);
        venue.set_volatility(simulation.volatility_pct);
        venue.deposit(quote_asset, simulation.initial_quote_balance);
        for (pair, price) in &simulation.prices {
            venue.list_market(pair, *price);
        }
        venue
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn quote_asset(&self) -> &str {
        &self.quote_asset
    }

    pub fn list_market(&self, pair: &str, price: f64) {
        self.list_market_with_rules(pair, price, MarketRules::default());
    }

    pub fn list_market_with_rules(&self, pair: &str, price: f64, rules: MarketRules) {
        let mut state = self.lock();
        let now = next_timestamp(&mut state);
        state.markets.insert(
            pair.to_string(),
            PaperMarket { price, rules, history: vec![(now, price)] },
        );
    }

    /// Move the market and fill every order the new price crosses.
    pub fn set_price(&self, pair: &str, price: f64) {
        let mut state = self.lock();
        apply_price(&mut state, pair, price);
    }

    pub fn deposit(&self, asset: &str, amount: f64) {
        let mut state = self.lock();
        state.balances.entry(asset.to_string()).or_default().free += amount;
    }

    pub fn set_free_balance(&self, asset: &str, amount: f64) {
        let mut state = self.lock();
        state.balances.entry(asset.to_string()).or_default().free = amount;
    }

    pub fn set_fee_rate(&self, fee_rate: f64) {
        self.lock().fee_rate = fee_rate;
    }

    /// Random walk amplitude applied on every price read, in percent.
    pub fn set_volatility(&self, volatility_pct: f64) {
        self.lock().volatility_pct = volatility_pct.max(0.0);
    }

    /// Simulate a dropped session: every call fails with `Disconnected`.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn events(&self) -> Vec<PaperEvent> {
        self.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    pub fn resting_orders(&self, pair: &str) -> Vec<OpenOrder> {
        self.lock().orders.iter().filter(|o| o.pair == pair).cloned().collect()
    }

    /// (free, locked) holdings of an asset.
    pub fn balance(&self, asset: &str) -> (f64, f64) {
        let state = self.lock();
        state
            .balances
            .get(asset)
            .map(|b| (b.free, b.locked))
            .unwrap_or((0.0, 0.0))
    }

    pub fn trades(&self) -> Vec<Fill> {
        self.lock().trades.clone()
    }

    /// Inject a fill that happened outside the engine's orders.
    pub fn record_external_fill(&self, fill: Fill) {
        self.lock().trades.push(fill);
    }

    async fn enter(&self) -> GatewayResult<()> {
        let (offline, latency) = {
            let state = self.lock();
            (state.offline, state.latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if offline {
            return Err(GatewayError::Disconnected("paper venue offline".to_string()));
        }
        Ok(())
    }

    fn rules(&self, pair: &str) -> GatewayResult<MarketRules> {
        self.lock()
            .markets
            .get(pair)
            .map(|m| m.rules)
            .ok_or_else(|| GatewayError::UnknownPair(pair.to_string()))
    }
}

fn next_timestamp(state: &mut PaperState) -> i64 {
    let now = Utc::now().timestamp_millis().max(state.last_timestamp_ms + 1);
    state.last_timestamp_ms = now;
    now
}

fn assets_of(pair: &str) -> GatewayResult<(String, String)> {
    split_symbol(pair)
        .map(|(b, q)| (b.to_string(), q.to_string()))
        .ok_or_else(|| GatewayError::UnknownPair(pair.to_string()))
}

fn apply_price(state: &mut PaperState, pair: &str, price: f64) {
    let now = next_timestamp(state);
    let Some(market) = state.markets.get_mut(pair) else {
        return;
    };
    market.price = price;
    market.history.push((now, price));
    if market.history.len() > MAX_HISTORY {
        market.history.remove(0);
    }

    let crossed: Vec<OpenOrder> = state
        .orders
        .iter()
        .filter(|o| o.pair == pair)
        .filter(|o| match o.side {
            Side::Buy => price <= o.price,
            Side::Sell => price >= o.price,
        })
        .cloned()
        .collect();

    for order in crossed {
        state.orders.retain(|o| o.id != order.id);
        settle_limit_fill(state, &order);
    }
}

fn settle_limit_fill(state: &mut PaperState, order: &OpenOrder) {
    let Ok((base, quote)) = assets_of(&order.pair) else {
        return;
    };
    let cost = order.quantity * order.price;
    let fee_rate = state.fee_rate;

    let fee = match order.side {
        Side::Buy => {
            let quote_balance = state.balances.entry(quote).or_default();
            quote_balance.locked = (quote_balance.locked - cost).max(0.0);
            let fee = order.quantity * fee_rate;
            state.balances.entry(base.clone()).or_default().free += order.quantity - fee;
            Fee { cost: fee, currency: base }
        }
        Side::Sell => {
            let base_balance = state.balances.entry(base).or_default();
            base_balance.locked = (base_balance.locked - order.quantity).max(0.0);
            let fee = cost * fee_rate;
            state.balances.entry(quote.clone()).or_default().free += cost - fee;
            Fee { cost: fee, currency: quote }
        }
    };

    let timestamp_ms = next_timestamp(state);
    state.trades.push(Fill {
        id: Uuid::new_v4().to_string(),
        order_id: order.id.clone(),
        pair: order.pair.clone(),
        side: order.side,
        price: order.price,
        quantity: order.quantity,
        cost,
        fee: Some(fee),
        timestamp_ms,
    });
    state.events.push(PaperEvent::Filled {
        pair: order.pair.clone(),
        side: order.side,
        price: order.price,
        quantity: order.quantity,
    });
    debug!(pair = %order.pair, side = %order.side, price = order.price, "paper order filled");
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn ping(&self) -> GatewayResult<()> {
        self.enter().await
    }

    async fn current_price(&self, pair: &str) -> GatewayResult<f64> {
        self.enter().await?;
        let mut state = self.lock();
        let volatility = state.volatility_pct;
        let price = state
            .markets
            .get(pair)
            .map(|m| m.price)
            .ok_or_else(|| GatewayError::UnknownPair(pair.to_string()))?;

        if volatility > 0.0 {
            let step = rand::thread_rng().gen_range(-volatility..volatility) / 100.0;
            let next = price * (1.0 + step);
            apply_price(&mut state, pair, next);
            return Ok(next);
        }

        Ok(price)
    }

    async fn open_orders(&self, pair: &str) -> GatewayResult<Vec<OpenOrder>> {
        self.enter().await?;
        Ok(self.resting_orders(pair))
    }

    async fn place_limit_order(
        &self,
        pair: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> GatewayResult<OpenOrder> {
        self.enter().await?;
        let rules = self.rules(pair)?;
        let (base, quote) = assets_of(pair)?;

        if quantity < rules.min_quantity {
            return Err(GatewayError::BelowMinimum { quantity, minimum: rules.min_quantity });
        }
        if price <= 0.0 {
            return Err(GatewayError::Rejected(format!("invalid price {}", price)));
        }

        let mut state = self.lock();
        let (asset, required) = match side {
            Side::Buy => (quote, quantity * price),
            Side::Sell => (base, quantity),
        };
        let balance = state.balances.entry(asset).or_default();
        if balance.free + BALANCE_EPSILON < required {
            return Err(GatewayError::InsufficientFunds { required, available: balance.free });
        }
        balance.free = (balance.free - required).max(0.0);
        balance.locked += required;

        let order = OpenOrder {
            id: Uuid::new_v4().to_string(),
            pair: pair.to_string(),
            side,
            price,
            quantity,
            status: OrderStatus::Open,
        };
        state.orders.push(order.clone());
        state.events.push(PaperEvent::LimitPlaced {
            pair: pair.to_string(),
            side,
            price,
            quantity,
        });

        // marketable orders fill on arrival
        if let Some(current) = state.markets.get(pair).map(|m| m.price) {
            apply_price(&mut state, pair, current);
        }

        Ok(order)
    }

    async fn place_market_buy(&self, pair: &str, quote_amount: f64) -> GatewayResult<MarketFill> {
        self.enter().await?;
        let rules = self.rules(pair)?;
        let (base, quote) = assets_of(pair)?;

        let mut state = self.lock();
        let price = state
            .markets
            .get(pair)
            .map(|m| m.price)
            .ok_or_else(|| GatewayError::UnknownPair(pair.to_string()))?;
        let quantity = rules.round_quantity(quote_amount / price);
        if quantity < rules.min_quantity {
            return Err(GatewayError::BelowMinimum { quantity, minimum: rules.min_quantity });
        }

        let cost = quantity * price;
        let quote_balance = state.balances.entry(quote).or_default();
        if quote_balance.free + BALANCE_EPSILON < cost {
            return Err(GatewayError::InsufficientFunds { required: cost, available: quote_balance.free });
        }
        quote_balance.free = (quote_balance.free - cost).max(0.0);

        let fee = quantity * state.fee_rate;
        state.balances.entry(base.clone()).or_default().free += quantity - fee;

        let order_id = Uuid::new_v4().to_string();
        let timestamp_ms = next_timestamp(&mut state);
        state.trades.push(Fill {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.clone(),
            pair: pair.to_string(),
            side: Side::Buy,
            price,
            quantity,
            cost,
            fee: Some(Fee { cost: fee, currency: base }),
            timestamp_ms,
        });
        state.events.push(PaperEvent::MarketBuy { pair: pair.to_string(), quantity, cost });

        Ok(MarketFill {
            order_id,
            pair: pair.to_string(),
            side: Side::Buy,
            quantity,
            average_price: price,
            cost,
        })
    }

    async fn place_market_sell(&self, pair: &str, quantity: f64) -> GatewayResult<MarketFill> {
        self.enter().await?;
        let rules = self.rules(pair)?;
        let (base, quote) = assets_of(pair)?;
        let quantity = rules.round_quantity(quantity);
        if quantity < rules.min_quantity {
            return Err(GatewayError::BelowMinimum { quantity, minimum: rules.min_quantity });
        }

        let mut state = self.lock();
        let price = state
            .markets
            .get(pair)
            .map(|m| m.price)
            .ok_or_else(|| GatewayError::UnknownPair(pair.to_string()))?;

        let base_balance = state.balances.entry(base).or_default();
        if base_balance.free + BALANCE_EPSILON < quantity {
            return Err(GatewayError::InsufficientFunds { required: quantity, available: base_balance.free });
        }
        base_balance.free = (base_balance.free - quantity).max(0.0);

        let proceeds = quantity * price;
        let fee = proceeds * state.fee_rate;
        state.balances.entry(quote.clone()).or_default().free += proceeds - fee;

        let order_id = Uuid::new_v4().to_string();
        let timestamp_ms = next_timestamp(&mut state);
        state.trades.push(Fill {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.clone(),
            pair: pair.to_string(),
            side: Side::Sell,
            price,
            quantity,
            cost: proceeds,
            fee: Some(Fee { cost: fee, currency: quote }),
            timestamp_ms,
        });
        state.events.push(PaperEvent::MarketSell { pair: pair.to_string(), quantity, proceeds });

        Ok(MarketFill {
            order_id,
            pair: pair.to_string(),
            side: Side::Sell,
            quantity,
            average_price: price,
            cost: proceeds,
        })
    }

    async fn cancel_order(&self, order_id: &str, pair: &str) -> GatewayResult<()> {
        self.enter().await?;
        let (base, quote) = assets_of(pair)?;
        let mut state = self.lock();

        let position = state
            .orders
            .iter()
            .position(|o| o.id == order_id && o.pair == pair)
            .ok_or_else(|| GatewayError::OrderNotFound(order_id.to_string()))?;
        let order = state.orders.remove(position);

        let (asset, amount) = match order.side {
            Side::Buy => (quote, order.quantity * order.price),
            Side::Sell => (base, order.quantity),
        };
        let balance = state.balances.entry(asset).or_default();
        balance.locked = (balance.locked - amount).max(0.0);
        balance.free += amount;

        state.events.push(PaperEvent::Canceled {
            pair: pair.to_string(),
            order_id: order.id,
            price: order.price,
        });
        Ok(())
    }

    async fn cancel_all_orders(&self, pair: &str) -> GatewayResult<usize> {
        let ids: Vec<String> = self.resting_orders(pair).into_iter().map(|o| o.id).collect();
        let mut canceled = 0;
        for id in ids {
            self.cancel_order(&id, pair).await?;
            canceled += 1;
        }
        Ok(canceled)
    }

    async fn total_balance(&self, asset: &str) -> GatewayResult<f64> {
        self.enter().await?;
        let (free, locked) = self.balance(asset);
        Ok(free + locked)
    }

    async fn free_balance(&self, asset: &str) -> GatewayResult<f64> {
        self.enter().await?;
        Ok(self.balance(asset).0)
    }

    fn round_price(&self, pair: &str, price: f64) -> GatewayResult<f64> {
        Ok(self.rules(pair)?.round_price(price))
    }

    fn round_quantity(&self, pair: &str, quantity: f64) -> GatewayResult<f64> {
        Ok(self.rules(pair)?.round_quantity(quantity))
    }

    fn min_order_quantity(&self, pair: &str) -> GatewayResult<f64> {
        Ok(self.rules(pair)?.min_quantity)
    }

    async fn recent_trades(&self, pair: &str, limit: usize) -> GatewayResult<Vec<Fill>> {
        self.enter().await?;
        let state = self.lock();
        let trades: Vec<Fill> = state.trades.iter().filter(|t| t.pair == pair).cloned().collect();
        let skip = trades.len().saturating_sub(limit);
        Ok(trades.into_iter().skip(skip).collect())
    }

    async fn recent_candles(&self, pair: &str, _timeframe: &str, limit: usize) -> GatewayResult<Vec<Candle>> {
        self.enter().await?;
        let state = self.lock();
        let market = state
            .markets
            .get(pair)
            .ok_or_else(|| GatewayError::UnknownPair(pair.to_string()))?;

        let mut candles = Vec::with_capacity(market.history.len());
        let mut open = market.history.first().map(|(_, p)| *p).unwrap_or(market.price);
        for (timestamp_ms, close) in &market.history {
            candles.push(Candle {
                timestamp_ms: *timestamp_ms,
                open,
                high: open.max(*close),
                low: open.min(*close),
                close: *close,
                volume: 0.0,
            });
            open = *close;
        }

        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }
}

/// Connector bundled with the binary: the simulated network runs on a
/// process-wide paper venue; no live venue is compiled in.
pub struct PaperConnector {
    quote_asset: String,
    simulation: SimulationConfig,
    venue: Mutex<Option<Arc<PaperExchange>>>,
}

impl PaperConnector {
    pub fn new(quote_asset: &str, simulation: SimulationConfig) -> Self {
        Self {
            quote_asset: quote_asset.to_string(),
            simulation,
            venue: Mutex::new(None),
        }
    }
}

#[async_trait]
impl GatewayConnector for PaperConnector {
    async fn connect(&self, network: Network) -> GatewayResult<Arc<dyn ExchangeGateway>> {
        match network {
            Network::Simulated => {
                let mut venue = self.venue.lock().unwrap_or_else(PoisonError::into_inner);
                let exchange = venue
                    .get_or_insert_with(|| {
                        info!("📡 Opening paper venue ({} quote)", self.quote_asset);
                        Arc::new(PaperExchange::from_simulation(&self.quote_asset, &self.simulation))
                    })
                    .clone();
                Ok(exchange)
            }
            Network::Live => Err(GatewayError::Authentication(
                "no live exchange connector is configured".to_string(),
            )),
        }
    }

    fn is_process_local(&self, network: Network) -> bool {
        network == Network::Simulated
    }
}
