// Spot Grid Bot Library
//
// Grid trading engine for spot markets: ladder generation, order
// reconciliation, trade attribution and a persistent session orchestrator

pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod exchange;

// Re-export engine types
pub use core::{
    Attribution, Clock, CycleOutcome, EngineStatus, GridEngine, LogNotifier, Notification, Notifier,
    OrderAction, SystemClock,
};

// Re-export error types
pub use error::{BotError, BotResult};

// Re-export configuration
pub use config::{ActivePair, Config, ConfigError, Network, StartMode, StrategyParams};

// Re-export database types
pub use db::{Database, TradeRecord};

// Re-export exchange types
pub use exchange::{ExchangeGateway, GatewayConnector, GatewayError, PaperConnector, PaperExchange};
