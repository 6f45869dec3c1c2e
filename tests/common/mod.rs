// Common test utilities and helpers
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use spot_grid_bot::config::{PairConfig, SimulationConfig, SystemConfig};
use spot_grid_bot::core::ManualClock;
use spot_grid_bot::exchange::GatewayResult;
use spot_grid_bot::{
    Config, Database, ExchangeGateway, GatewayConnector, GridEngine, Network, Notification, Notifier,
    PaperExchange, StartMode, StrategyParams,
};

pub const PAIR: &str = "BTC/USDC";

/// Strategy used across the engine tests: 4 levels, 1% apart, 10 USDC each
pub fn test_params() -> StrategyParams {
    StrategyParams {
        grid_count: 4,
        spread_pct: 1.0,
        stake_per_level: 10.0,
        start_mode: StartMode::Wait,
        trailing: false,
    }
}

/// Create a test configuration with one active pair
pub fn create_test_config(params: StrategyParams) -> Config {
    Config {
        system: SystemConfig::default(),
        simulation: SimulationConfig::default(),
        default_strategy: params,
        pairs: vec![PairConfig {
            symbol: PAIR.to_string(),
            enabled: true,
            strategy: None,
        }],
    }
}

/// Create a temporary directory for test databases
pub fn create_temp_db_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let db_path = temp_dir.path().join("test.db");
    (temp_dir, db_path)
}

pub fn venue(price: f64, quote: f64) -> Arc<PaperExchange> {
    let venue = PaperExchange::new("USDC");
    venue.list_market(PAIR, price);
    venue.deposit("USDC", quote);
    Arc::new(venue)
}

/// Hands out one fixed venue per network
pub struct TestConnector {
    pub simulated: Arc<PaperExchange>,
    pub live: Arc<PaperExchange>,
}

#[async_trait]
impl GatewayConnector for TestConnector {
    async fn connect(&self, network: Network) -> GatewayResult<Arc<dyn ExchangeGateway>> {
        let venue: Arc<dyn ExchangeGateway> = match network {
            Network::Simulated => self.simulated.clone(),
            Network::Live => self.live.clone(),
        };
        Ok(venue)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }

    pub fn trades(&self) -> usize {
        self.all().iter().filter(|n| matches!(n, Notification::Trade(_))).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) {
        self.seen.lock().unwrap().push(notification.clone());
    }
}

pub struct Harness {
    pub engine: GridEngine,
    pub db: Database,
    pub simulated: Arc<PaperExchange>,
    pub live: Arc<PaperExchange>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    _dir: TempDir,
}

impl Harness {
    /// Engine over a simulated venue at `price` holding `quote` USDC, and a
    /// separate live venue with 500 USDC
    pub fn new(config: Config, price: f64, quote: f64) -> Self {
        let (dir, db_path) = create_temp_db_dir();
        let db = Database::open(&db_path).expect("Failed to open database");

        let simulated = venue(price, quote);
        let live = venue(price, 500.0);
        let connector = Arc::new(TestConnector {
            simulated: Arc::clone(&simulated),
            live: Arc::clone(&live),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::new(chrono::Utc::now().timestamp_millis() - 60_000));

        let engine = GridEngine::new(config, db.clone(), connector, notifier.clone(), clock.clone());
        engine.set_settle_delay(Duration::ZERO);

        Self { engine, db, simulated, live, notifier, clock, _dir: dir }
    }

    pub fn standard() -> Self {
        Self::new(create_test_config(test_params()), 100.0, 1000.0)
    }

    pub fn dir(&self) -> &std::path::Path {
        self._dir.path()
    }
}
