//! Bounded-time wrapper around any gateway.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use super::{
    Candle, ExchangeGateway, Fill, GatewayError, GatewayResult, MarketFill, OpenOrder, Side,
};

/// Every async call on the inner gateway either finishes within `limit`
/// or resolves to [`GatewayError::Timeout`].
pub struct TimedGateway {
    inner: Arc<dyn ExchangeGateway>,
    limit: Duration,
}

impl TimedGateway {
    pub fn new(inner: Arc<dyn ExchangeGateway>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    async fn bounded<T, F>(&self, operation: &str, call: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>> + Send,
    {
        match timeout(self.limit, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(format!(
                "{} exceeded {:?}", operation, self.limit
            ))),
        }
    }
}

#[async_trait]
impl ExchangeGateway for TimedGateway {
    async fn ping(&self) -> GatewayResult<()> {
        self.bounded("ping", self.inner.ping()).await
    }

    async fn current_price(&self, pair: &str) -> GatewayResult<f64> {
        self.bounded("current_price", self.inner.current_price(pair)).await
    }

    async fn open_orders(&self, pair: &str) -> GatewayResult<Vec<OpenOrder>> {
        self.bounded("open_orders", self.inner.open_orders(pair)).await
    }

    async fn place_limit_order(
        &self,
        pair: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> GatewayResult<OpenOrder> {
        self.bounded(
            "place_limit_order",
            self.inner.place_limit_order(pair, side, quantity, price),
        )
        .await
    }

    async fn place_market_buy(&self, pair: &str, quote_amount: f64) -> GatewayResult<MarketFill> {
        self.bounded("place_market_buy", self.inner.place_market_buy(pair, quote_amount)).await
    }

    async fn place_market_sell(&self, pair: &str, quantity: f64) -> GatewayResult<MarketFill> {
        self.bounded("place_market_sell", self.inner.place_market_sell(pair, quantity)).await
    }

    async fn cancel_order(&self, order_id: &str, pair: &str) -> GatewayResult<()> {
        self.bounded("cancel_order", self.inner.cancel_order(order_id, pair)).await
    }

    async fn cancel_all_orders(&self, pair: &str) -> GatewayResult<usize> {
        self.bounded("cancel_all_orders", self.inner.cancel_all_orders(pair)).await
    }

    async fn total_balance(&self, asset: &str) -> GatewayResult<f64> {
        self.bounded("total_balance", self.inner.total_balance(asset)).await
    }

    async fn free_balance(&self, asset: &str) -> GatewayResult<f64> {
        self.bounded("free_balance", self.inner.free_balance(asset)).await
    }

    fn round_price(&self, pair: &str, price: f64) -> GatewayResult<f64> {
        self.inner.round_price(pair, price)
    }

    fn round_quantity(&self, pair: &str, quantity: f64) -> GatewayResult<f64> {
        self.inner.round_quantity(pair, quantity)
    }

    fn min_order_quantity(&self, pair: &str) -> GatewayResult<f64> {
        self.inner.min_order_quantity(pair)
    }

    async fn recent_trades(&self, pair: &str, limit: usize) -> GatewayResult<Vec<Fill>> {
        self.bounded("recent_trades", self.inner.recent_trades(pair, limit)).await
    }

    async fn recent_candles(&self, pair: &str, timeframe: &str, limit: usize) -> GatewayResult<Vec<Candle>> {
        self.bounded(
            "recent_candles",
            self.inner.recent_candles(pair, timeframe, limit),
        )
        .await
    }
}
