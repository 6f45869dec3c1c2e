// Integration tests for database operations

mod common;

use std::collections::{HashMap, HashSet};

use spot_grid_bot::exchange::{OpenOrder, OrderStatus, Side};
use spot_grid_bot::{Database, Network, TradeRecord};

use common::{create_temp_db_dir, PAIR};

fn trade(id: &str, side: Side, price: f64, timestamp_ms: i64) -> TradeRecord {
    TradeRecord {
        id: id.to_string(),
        symbol: PAIR.to_string(),
        side,
        price,
        amount: 0.1,
        cost: price * 0.1,
        fee_quote: 0.01,
        timestamp_ms,
        buy_id: None,
    }
}

#[test]
fn test_database_creation() {
    let (_temp_dir, db_path) = create_temp_db_dir();

    let db = Database::open(&db_path);
    assert!(db.is_ok(), "Database creation should succeed");
    assert!(db.unwrap().health_check().unwrap());
}

#[test]
fn test_state_survives_reopen() {
    let (_temp_dir, db_path) = create_temp_db_dir();

    {
        let db = Database::open(&db_path).expect("Failed to create database");
        db.save_grid_levels(PAIR, &[98.0, 99.0, 101.0, 102.0]).unwrap();
        db.set_setup_done(PAIR, true).unwrap();
        db.set_session_baseline(1000.0).unwrap();
        db.set_network_marker(Network::Live).unwrap();
        db.record_trade(&trade("t1", Side::Buy, 99.0, 10)).unwrap();
    }

    let db = Database::open(&db_path).expect("Failed to reopen database");
    let grid = db.grid_status(PAIR).unwrap().expect("grid row should persist");
    assert_eq!(grid.levels, vec![98.0, 99.0, 101.0, 102.0]);
    assert!(grid.setup_done);
    assert_eq!(db.session_baseline().unwrap(), Some(1000.0));
    assert_eq!(db.network_marker().unwrap(), Some(Network::Live));

    // buy ids continue from the persisted counter
    let second = db.record_trade(&trade("t2", Side::Buy, 98.0, 20)).unwrap().unwrap();
    assert_eq!(second.buy_id, Some(2));
}

#[test]
fn test_open_order_snapshot_keeps_levels() {
    let (_temp_dir, db_path) = create_temp_db_dir();
    let db = Database::open(&db_path).unwrap();

    db.save_grid_levels(PAIR, &[98.0, 99.0]).unwrap();
    db.save_open_orders(
        PAIR,
        &[OpenOrder {
            id: "o1".to_string(),
            pair: PAIR.to_string(),
            side: Side::Buy,
            price: 98.0,
            quantity: 0.1,
            status: OrderStatus::Open,
        }],
    )
    .unwrap();

    let grid = db.grid_status(PAIR).unwrap().unwrap();
    assert_eq!(grid.levels, vec![98.0, 99.0]);
    assert_eq!(grid.open_orders.len(), 1);

    db.clear_open_orders_cache().unwrap();
    let grid = db.grid_status(PAIR).unwrap().unwrap();
    assert!(grid.open_orders.is_empty());
    assert_eq!(grid.levels, vec![98.0, 99.0]);
}

#[test]
fn test_sell_links_to_buy_within_tolerance() {
    let (_temp_dir, db_path) = create_temp_db_dir();
    let db = Database::open(&db_path).unwrap();

    db.record_trade(&trade("b1", Side::Buy, 100.0, 10)).unwrap();
    db.record_trade(&trade("b2", Side::Buy, 110.0, 20)).unwrap();

    let linked = db.find_linked_buy(PAIR, 100.5, 0.01, 30).unwrap().unwrap();
    assert_eq!(linked.id, "b1");
    assert!(db.find_linked_buy(PAIR, 105.0, 0.01, 30).unwrap().is_none());
    // a buy after the sell cannot be its origin
    assert!(db.find_linked_buy(PAIR, 110.0, 0.01, 15).unwrap().is_none());
}

#[test]
fn test_stats_and_cleanup() {
    let (_temp_dir, db_path) = create_temp_db_dir();
    let db = Database::open(&db_path).unwrap();

    db.record_trade(&trade("b1", Side::Buy, 100.0, 10)).unwrap();
    db.record_trade(&trade("s1", Side::Sell, 101.0, 20)).unwrap();
    db.record_trade(&trade("old", Side::Buy, 90.0, 1)).unwrap();

    let stats = db.pair_trade_stats(PAIR, 5).unwrap();
    assert_eq!(stats.buy_count, 1);
    assert_eq!(stats.sell_count, 1);
    assert!((stats.net_cash_flow() - (10.1 - 10.0 - 0.02)).abs() < 1e-9);

    let keep: HashSet<(String, String)> = [("b1".to_string(), PAIR.to_string())].into_iter().collect();
    assert_eq!(db.delete_trades_except(&keep).unwrap(), 2);
    assert_eq!(db.recent_trades(None, 10).unwrap().len(), 1);
}

#[test]
fn test_reset_all_statistics() {
    let (_temp_dir, db_path) = create_temp_db_dir();
    let db = Database::open(&db_path).unwrap();

    db.record_trade(&trade("b1", Side::Buy, 100.0, 10)).unwrap();
    db.log_equity_snapshot(100, 1000.0).unwrap();
    db.set_session_baseline(1000.0).unwrap();
    db.set_global_baseline(900.0).unwrap();
    db.set_coin_initial_balances(&HashMap::from([(PAIR.to_string(), 50.0)])).unwrap();
    db.set_network_marker(Network::Simulated).unwrap();
    db.save_grid_levels(PAIR, &[98.0, 102.0]).unwrap();

    db.reset_all_statistics().unwrap();

    assert!(db.recent_trades(None, 10).unwrap().is_empty());
    assert!(db.equity_history(None).unwrap().is_empty());
    assert_eq!(db.session_baseline().unwrap(), None);
    assert_eq!(db.global_baseline().unwrap(), None);
    assert!(db.coin_initial_balances().unwrap().is_empty());
    assert_eq!(db.next_buy_id().unwrap(), 1);
    assert_eq!(db.network_marker().unwrap(), Some(Network::Simulated));
    assert_eq!(db.stored_grids().unwrap().len(), 1);
}
