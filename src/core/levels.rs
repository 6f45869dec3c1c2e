// Ladder generation around a reference price

use crate::exchange::{ExchangeGateway, GatewayResult};

/// Unrounded ladder: `count / 2` steps on each side of `price`, ascending.
///
/// An odd `count` loses its last level to integer division. Levels that
/// would land at or below zero are dropped.
pub fn raw_levels(price: f64, count: usize, spread: f64) -> Vec<f64> {
    let mut levels = Vec::with_capacity(count);
    for i in 1..=count / 2 {
        let step = spread * i as f64;
        levels.push(price * (1.0 - step));
        levels.push(price * (1.0 + step));
    }
    levels.retain(|level| *level > 0.0);
    levels.sort_by(|a, b| a.total_cmp(b));
    levels
}

/// Ladder rounded to the pair's price precision.
///
/// Levels that collapse onto the same tick are kept once, so the result is
/// strictly ascending.
pub fn generate_levels(
    gateway: &dyn ExchangeGateway,
    pair: &str,
    price: f64,
    count: usize,
    spread: f64,
) -> GatewayResult<Vec<f64>> {
    let mut levels = raw_levels(price, count, spread)
        .into_iter()
        .map(|level| gateway.round_price(pair, level))
        .collect::<GatewayResult<Vec<f64>>>()?;

    levels.sort_by(|a, b| a.total_cmp(b));
    levels.dedup();
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MarketRules, PaperExchange};

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len(), "{:?} vs {:?}", actual, expected);
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{:?} vs {:?}", actual, expected);
        }
    }

    #[test]
    fn test_symmetric_ladder() {
        assert_close(&raw_levels(100.0, 4, 0.01), &[98.0, 99.0, 101.0, 102.0]);
    }

    #[test]
    fn test_even_count_is_exact_and_sorted() {
        for count in [2usize, 4, 10, 20] {
            let levels = raw_levels(250.0, count, 0.015);
            assert_eq!(levels.len(), count);
            assert!(levels.windows(2).all(|w| w[0] < w[1]));

            let below = levels.iter().filter(|l| **l < 250.0).count();
            assert_eq!(below, count / 2);
        }
    }

    #[test]
    fn test_odd_count_truncates() {
        assert_eq!(raw_levels(100.0, 5, 0.01).len(), 4);
    }

    #[test]
    fn test_non_positive_levels_dropped() {
        let levels = raw_levels(100.0, 6, 0.5);
        assert!(levels.iter().all(|l| *l > 0.0));
        assert_eq!(levels.len(), 4);
    }

    #[test]
    fn test_rounding_through_gateway() {
        let paper = PaperExchange::new("USDC");
        paper.list_market_with_rules(
            "BTC/USDC",
            100.0,
            MarketRules { price_tick: 1.0, quantity_step: 0.001, min_quantity: 0.001 },
        );

        let levels = generate_levels(&paper, "BTC/USDC", 100.0, 4, 0.003).unwrap();
        // 99.7 and 100.3 both round to 100
        assert_eq!(levels, vec![99.0, 100.0, 101.0]);
    }
}
