// Integration tests for trade attribution across sessions

mod common;

use spot_grid_bot::core::TradeAttributor;
use spot_grid_bot::exchange::{Fee, Fill, Side};
use spot_grid_bot::{ActivePair, Attribution, Database};

use common::{create_temp_db_dir, test_params, PAIR};

fn pair() -> ActivePair {
    ActivePair {
        symbol: PAIR.to_string(),
        base: "BTC".to_string(),
        quote: "USDC".to_string(),
        params: test_params(),
    }
}

fn fill(id: &str, side: Side, price: f64, timestamp_ms: i64, fee: Fee) -> Fill {
    Fill {
        id: id.to_string(),
        order_id: format!("order-{}", id),
        pair: PAIR.to_string(),
        side,
        price,
        quantity: 0.1,
        cost: price * 0.1,
        fee: Some(fee),
        timestamp_ms,
    }
}

fn usdc(cost: f64) -> Fee {
    Fee { cost, currency: "USDC".to_string() }
}

#[test]
fn test_sell_links_to_buy_from_previous_session() {
    let (_temp_dir, db_path) = create_temp_db_dir();
    let db = Database::open(&db_path).unwrap();

    let mut first = TradeAttributor::new(0);
    first.ingest(&db, &pair(), &[fill("b1", Side::Buy, 100.0, 1_000, usdc(0.01))]).unwrap();

    // restart: new session, same ledger
    let mut second = TradeAttributor::new(5_000);
    let fills = vec![
        fill("b1", Side::Buy, 100.0, 1_000, usdc(0.01)),
        fill("s1", Side::Sell, 101.0, 6_000, usdc(0.01)),
    ];
    let out = second.ingest(&db, &pair(), &fills).unwrap();

    assert_eq!(out.len(), 1);
    match &out[0] {
        Attribution::Sell { linked_buy_id, profit, trade } => {
            assert_eq!(*linked_buy_id, Some(1));
            assert_eq!(trade.id, "s1");
            assert!((profit.gross - 0.1).abs() < 1e-9);
            assert!((profit.net - 0.08).abs() < 1e-9);
        }
        other => panic!("expected a sell, got {:?}", other),
    }
    assert_eq!(second.session_trade_count(PAIR), 1);
}

#[test]
fn test_buy_ids_wrap_after_ceiling() {
    let (_temp_dir, db_path) = create_temp_db_dir();
    let db = Database::open(&db_path).unwrap();
    db.set_setting("buy_id_counter", "999").unwrap();

    let mut attributor = TradeAttributor::new(0);
    let fills = vec![
        fill("b1", Side::Buy, 100.0, 10, usdc(0.01)),
        fill("b2", Side::Buy, 99.0, 20, usdc(0.01)),
    ];
    let out = attributor.ingest(&db, &pair(), &fills).unwrap();

    let ids: Vec<Option<u32>> = out
        .iter()
        .map(|a| match a {
            Attribution::Buy { buy_id, .. } => *buy_id,
            Attribution::Sell { .. } => None,
        })
        .collect();
    assert_eq!(ids, vec![Some(1000), Some(1)]);
}

#[test]
fn test_base_currency_fee_is_valued_at_fill_price() {
    let (_temp_dir, db_path) = create_temp_db_dir();
    let db = Database::open(&db_path).unwrap();

    let mut attributor = TradeAttributor::new(0);
    let base_fee = Fee { cost: 0.0001, currency: "BTC".to_string() };
    attributor.ingest(&db, &pair(), &[fill("b1", Side::Buy, 100.0, 10, base_fee)]).unwrap();

    let stored = db.find_trade("b1", PAIR).unwrap().unwrap();
    assert!((stored.fee_quote - 0.01).abs() < 1e-12);
}

#[test]
fn test_fills_for_other_pairs_are_ignored() {
    let (_temp_dir, db_path) = create_temp_db_dir();
    let db = Database::open(&db_path).unwrap();

    let mut other = fill("e1", Side::Buy, 3000.0, 10, usdc(0.1));
    other.pair = "ETH/USDC".to_string();

    let mut attributor = TradeAttributor::new(0);
    assert!(attributor.ingest(&db, &pair(), &[other]).unwrap().is_empty());
    assert!(db.recent_trades(None, 10).unwrap().is_empty());
}
