//! Exchange gateway capability set consumed by the engine.
//!
//! The engine never talks to a venue directly. Everything goes through
//! [`ExchangeGateway`], so tests and the simulated network can swap in
//! [`PaperExchange`], and [`TimedGateway`] can bound every call.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Network;

pub mod paper;
pub mod timed;

pub use paper::{PaperConnector, PaperEvent, PaperExchange};
pub use timed::TimedGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
}

/// A resting order as reported by the venue. The engine only reads these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub pair: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub status: OrderStatus,
}

/// Outcome of a market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketFill {
    pub order_id: String,
    pub pair: String,
    pub side: Side,
    pub quantity: f64,
    pub average_price: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fee {
    pub cost: f64,
    pub currency: String,
}

/// A realized trade on the account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub id: String,
    pub order_id: String,
    pub pair: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub cost: f64,
    pub fee: Option<Fee>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Precision and size limits of a market.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketRules {
    pub price_tick: f64,
    pub quantity_step: f64,
    pub min_quantity: f64,
}

impl Default for MarketRules {
    fn default() -> Self {
        Self {
            price_tick: 0.01,
            quantity_step: 0.00001,
            min_quantity: 0.00001,
        }
    }
}

impl MarketRules {
    pub fn round_price(&self, price: f64) -> f64 {
        round_to_decimals((price / self.price_tick).round() * self.price_tick, decimals_of(self.price_tick))
    }

    /// Quantities truncate toward zero so an order never exceeds what was sized.
    pub fn round_quantity(&self, quantity: f64) -> f64 {
        let decimals = decimals_of(self.quantity_step);
        // absorb float noise like 0.29999999 before flooring
        let steps = round_to_decimals(quantity / self.quantity_step, 6).floor();
        round_to_decimals(steps * self.quantity_step, decimals)
    }
}

fn decimals_of(step: f64) -> i32 {
    if step >= 1.0 {
        0
    } else {
        (-step.log10()).ceil() as i32
    }
}

fn round_to_decimals(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Not connected: {0}")]
    Disconnected(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("Quantity {quantity} below minimum {minimum}")]
    BelowMinimum { quantity: f64, minimum: f64 },

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Unknown pair: {0}")]
    UnknownPair(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Exchange error: {0}")]
    Other(String),
}

impl GatewayError {
    /// Errors the next cycle is expected to get past on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_) | GatewayError::RateLimited(_) | GatewayError::Disconnected(_)
        )
    }

    /// Steady-state skip conditions, not failures.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            GatewayError::InsufficientFunds { .. } | GatewayError::BelowMinimum { .. }
        )
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Exchange operations used by the engine. Implementations must return an
/// error value on failure, never panic.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Cheap round trip used to validate the session
    async fn ping(&self) -> GatewayResult<()>;

    async fn current_price(&self, pair: &str) -> GatewayResult<f64>;

    async fn open_orders(&self, pair: &str) -> GatewayResult<Vec<OpenOrder>>;

    async fn place_limit_order(
        &self,
        pair: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> GatewayResult<OpenOrder>;

    /// Buy spending `quote_amount` of the quote asset at market
    async fn place_market_buy(&self, pair: &str, quote_amount: f64) -> GatewayResult<MarketFill>;

    async fn place_market_sell(&self, pair: &str, quantity: f64) -> GatewayResult<MarketFill>;

    async fn cancel_order(&self, order_id: &str, pair: &str) -> GatewayResult<()>;

    /// Returns the number of orders canceled
    async fn cancel_all_orders(&self, pair: &str) -> GatewayResult<usize>;

    async fn total_balance(&self, asset: &str) -> GatewayResult<f64>;

    async fn free_balance(&self, asset: &str) -> GatewayResult<f64>;

    fn round_price(&self, pair: &str, price: f64) -> GatewayResult<f64>;

    fn round_quantity(&self, pair: &str, quantity: f64) -> GatewayResult<f64>;

    fn min_order_quantity(&self, pair: &str) -> GatewayResult<f64>;

    async fn recent_trades(&self, pair: &str, limit: usize) -> GatewayResult<Vec<Fill>>;

    async fn recent_candles(&self, pair: &str, timeframe: &str, limit: usize) -> GatewayResult<Vec<Candle>>;
}

/// Builds a gateway session for a network target.
#[async_trait]
pub trait GatewayConnector: Send + Sync {
    async fn connect(&self, network: Network) -> GatewayResult<Arc<dyn ExchangeGateway>>;

    /// True when the account behind `network` exists only inside this
    /// process, so a fresh connection cannot see what another process traded.
    fn is_process_local(&self, _network: Network) -> bool {
        false
    }
}

/// Relative float comparison used to match order prices against levels.
pub fn prices_match(a: f64, b: f64) -> bool {
    const REL_TOL: f64 = 1e-5;
    (a - b).abs() <= REL_TOL * a.abs().max(b.abs())
}
