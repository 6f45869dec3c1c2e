// Integration tests for configuration loading and validation

mod common;

use std::fs;

use spot_grid_bot::config::ConfigWatcher;
use spot_grid_bot::{Config, ConfigError, Network, StartMode};
use tempfile::TempDir;

use common::{create_test_config, test_params, PAIR};

#[test]
fn test_bundled_example_is_valid() {
    let config = Config::from_toml_str(include_str!("../config.toml.example"))
        .expect("Example config should parse");
    config.validate().expect("Example config should validate");

    assert_eq!(config.system.network, Network::Simulated);
    assert_eq!(config.active_pairs().len(), 2);

    let eth = config.active_pair("ETH/USDC").unwrap();
    assert_eq!(eth.params.start_mode, StartMode::Buy1);
    assert!(eth.params.trailing);

    // BTC falls back to the default strategy
    let btc = config.active_pair("BTC/USDC").unwrap();
    assert_eq!(btc.params, config.default_strategy);
}

#[test]
fn test_config_file_round_trip() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("config.toml");

    let config = create_test_config(test_params());
    config.to_file(&config_path).expect("Failed to write config");

    let loaded = Config::from_file(&config_path).expect("Failed to load config");
    assert_eq!(loaded, config);
}

#[test]
fn test_missing_sections_use_defaults() {
    let config = Config::from_toml_str(
        r#"
        [[pairs]]
        symbol = "ETH/USDC"
        enabled = true
        "#,
    )
    .unwrap();

    assert_eq!(config.system.cycle_delay_secs, 10);
    assert_eq!(config.system.quote_asset, "USDC");
    assert_eq!(config.default_strategy.grid_count, 10);
    assert_eq!(config.active_symbols().len(), 1);
}

#[test]
fn test_disabled_pairs_are_inactive() {
    let mut config = create_test_config(test_params());
    config.pairs[0].enabled = false;

    assert!(config.active_pairs().is_empty());
    // strategy is still resolvable for wind-down
    assert_eq!(config.strategy_for(PAIR), Some(test_params()));
}

#[test]
fn test_validation_rejects_bad_values() {
    let mut config = create_test_config(test_params());
    config.system.cycle_delay_secs = 0;
    assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

    let mut config = create_test_config(test_params());
    config.default_strategy.stake_per_level = -1.0;
    assert!(config.validate().is_err());

    let mut config = create_test_config(test_params());
    config.pairs[0].symbol = "BTCUSDC".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_unparseable_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("broken.toml");
    fs::write(&config_path, "[system\nnetwork = ").unwrap();

    assert!(matches!(Config::from_file(&config_path), Err(ConfigError::Parse(_))));
    assert!(matches!(
        Config::from_file(temp_dir.path().join("absent.toml")),
        Err(ConfigError::FileRead(_))
    ));
}

#[test]
fn test_watcher_ignores_unchanged_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    create_test_config(test_params()).to_file(&config_path).unwrap();

    let mut watcher = ConfigWatcher::new(&config_path);
    assert!(watcher.poll().is_none());
    assert_eq!(watcher.path(), config_path.as_path());
}
