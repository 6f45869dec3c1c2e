// Configuration management for the grid engine

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Trading venue the engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Simulated,
    Live,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Simulated => "simulated",
            Network::Live => "live",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "simulated" | "testnet" | "sandbox" => Some(Network::Simulated),
            "live" | "real" | "mainnet" => Some(Network::Live),
            _ => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the engine does the first time it sees a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StartMode {
    /// Let the buy side of the ladder build inventory.
    #[default]
    #[serde(rename = "wait")]
    Wait,
    #[serde(rename = "buy_1")]
    Buy1,
    #[serde(rename = "buy_2")]
    Buy2,
}

impl StartMode {
    /// Multiple of the per-level stake bought at market on setup.
    pub fn stake_multiplier(&self) -> Option<f64> {
        match self {
            StartMode::Wait => None,
            StartMode::Buy1 => Some(1.0),
            StartMode::Buy2 => Some(2.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Total number of ladder levels (half below, half above)
    pub grid_count: usize,
    /// Distance between levels, in percent of the reference price
    pub spread_pct: f64,
    /// Quote currency committed per level
    pub stake_per_level: f64,
    #[serde(default)]
    pub start_mode: StartMode,
    #[serde(default)]
    pub trailing: bool,
}

impl StrategyParams {
    /// Spread as a fraction (1.0% -> 0.01).
    pub fn spread_fraction(&self) -> f64 {
        self.spread_pct / 100.0
    }

    fn validate(&self, owner: &str) -> Result<(), ConfigError> {
        if self.grid_count < 2 {
            return Err(ConfigError::Validation(format!(
                "{}: grid_count must be at least 2", owner
            )));
        }

        if !(self.spread_pct > 0.0 && self.spread_pct <= 50.0) {
            return Err(ConfigError::Validation(format!(
                "{}: spread_pct must be in (0, 50]", owner
            )));
        }

        if !(self.stake_per_level > 0.0) || !self.stake_per_level.is_finite() {
            return Err(ConfigError::Validation(format!(
                "{}: stake_per_level must be positive", owner
            )));
        }

        Ok(())
    }
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            grid_count: 10,
            spread_pct: 1.0,
            stake_per_level: 20.0,
            start_mode: StartMode::Wait,
            trailing: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairConfig {
    pub symbol: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides `default_strategy` when present
    #[serde(default)]
    pub strategy: Option<StrategyParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub network: Network,
    #[serde(default = "default_cycle_delay")]
    pub cycle_delay_secs: u64,
    #[serde(default = "default_telemetry_delay")]
    pub telemetry_delay_secs: u64,
    #[serde(default = "default_gateway_timeout")]
    pub gateway_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    #[serde(default = "default_true")]
    pub reserve_on_strategy_change: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

/// Parameters of the bundled paper venue used on the simulated network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_initial_quote")]
    pub initial_quote_balance: f64,
    #[serde(default = "default_volatility")]
    pub volatility_pct: f64,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    #[serde(default)]
    pub prices: HashMap<String, f64>,
}

fn default_true() -> bool { true }
fn default_cycle_delay() -> u64 { 10 }
fn default_telemetry_delay() -> u64 { 3 }
fn default_gateway_timeout() -> u64 { 10 }
fn default_log_level() -> String { "info".to_string() }
fn default_db_path() -> String { "data/grid_bot.db".to_string() }
fn default_quote_asset() -> String { "USDC".to_string() }
fn default_retention_days() -> u32 { 30 }
fn default_initial_quote() -> f64 { 1000.0 }
fn default_volatility() -> f64 { 0.2 }
fn default_fee_rate() -> f64 { 0.001 }

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            network: Network::Simulated,
            cycle_delay_secs: default_cycle_delay(),
            telemetry_delay_secs: default_telemetry_delay(),
            gateway_timeout_secs: default_gateway_timeout(),
            log_level: default_log_level(),
            db_path: default_db_path(),
            quote_asset: default_quote_asset(),
            reserve_on_strategy_change: true,
            retention_days: default_retention_days(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_quote_balance: default_initial_quote(),
            volatility_pct: default_volatility(),
            fee_rate: default_fee_rate(),
            prices: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub default_strategy: StrategyParams,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system: SystemConfig::default(),
            simulation: SimulationConfig::default(),
            default_strategy: StrategyParams::default(),
            pairs: vec![PairConfig {
                symbol: "BTC/USDC".to_string(),
                enabled: true,
                strategy: None,
            }],
        }
    }
}

/// An enabled pair with its effective strategy resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivePair {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub params: StrategyParams,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(e.to_string()))?;

        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::FileWrite(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.system.cycle_delay_secs == 0 {
            return Err(ConfigError::Validation("cycle_delay_secs must be greater than 0".to_string()));
        }

        if self.system.telemetry_delay_secs == 0 {
            return Err(ConfigError::Validation("telemetry_delay_secs must be greater than 0".to_string()));
        }

        if self.system.gateway_timeout_secs == 0 {
            return Err(ConfigError::Validation("gateway_timeout_secs must be greater than 0".to_string()));
        }

        if self.system.quote_asset.trim().is_empty() {
            return Err(ConfigError::Validation("quote_asset must not be empty".to_string()));
        }

        if self.simulation.initial_quote_balance < 0.0 {
            return Err(ConfigError::Validation("initial_quote_balance must be non-negative".to_string()));
        }

        if !(0.0..1.0).contains(&self.simulation.fee_rate) {
            return Err(ConfigError::Validation("fee_rate must be in [0, 1)".to_string()));
        }

        self.default_strategy.validate("default_strategy")?;

        let mut seen = HashSet::new();
        for pair in &self.pairs {
            if split_symbol(&pair.symbol).is_none() {
                return Err(ConfigError::Validation(format!(
                    "invalid symbol '{}', expected BASE/QUOTE", pair.symbol
                )));
            }

            if !seen.insert(pair.symbol.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate pair '{}'", pair.symbol
                )));
            }

            if let Some(strategy) = &pair.strategy {
                strategy.validate(&pair.symbol)?;
            }
        }

        Ok(())
    }

    /// Enabled pairs, in configuration order, with their effective strategy.
    pub fn active_pairs(&self) -> Vec<ActivePair> {
        self.pairs
            .iter()
            .filter(|p| p.enabled)
            .filter_map(|p| {
                let (base, quote) = split_symbol(&p.symbol)?;
                Some(ActivePair {
                    symbol: p.symbol.clone(),
                    base: base.to_string(),
                    quote: quote.to_string(),
                    params: p.strategy.clone().unwrap_or_else(|| self.default_strategy.clone()),
                })
            })
            .collect()
    }

    pub fn active_symbols(&self) -> HashSet<String> {
        self.active_pairs().into_iter().map(|p| p.symbol).collect()
    }

    pub fn active_pair(&self, symbol: &str) -> Option<ActivePair> {
        self.active_pairs().into_iter().find(|p| p.symbol == symbol)
    }

    /// Effective strategy of a pair, enabled or not.
    pub fn strategy_for(&self, symbol: &str) -> Option<StrategyParams> {
        self.pairs
            .iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.strategy.clone().unwrap_or_else(|| self.default_strategy.clone()))
    }

    pub fn cycle_delay(&self) -> Duration {
        Duration::from_secs(self.system.cycle_delay_secs)
    }

    pub fn telemetry_delay(&self) -> Duration {
        Duration::from_secs(self.system.telemetry_delay_secs)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.system.gateway_timeout_secs)
    }
}

/// Split `BASE/QUOTE` into its assets.
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    let (base, quote) = symbol.split_once('/')?;
    let (base, quote) = (base.trim(), quote.trim());
    if base.is_empty() || quote.is_empty() || quote.contains('/') {
        return None;
    }
    Some((base, quote))
}

/// Detects configuration changes by file modification time.
pub struct ConfigWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Start watching; the file's current state counts as already loaded.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let last_modified = modified_at(&path);
        Self { path, last_modified }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the freshly parsed config when the file changed since the last poll.
    pub fn poll(&mut self) -> Option<Result<Config, ConfigError>> {
        let current = modified_at(&self.path)?;
        let changed = match self.last_modified {
            Some(previous) => current > previous,
            None => true,
        };

        if !changed {
            return None;
        }

        self.last_modified = Some(current);
        Some(Config::from_file(&self.path))
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(String),

    #[error("Failed to write config file: {0}")]
    FileWrite(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [system]
        network = "simulated"
        cycle_delay_secs = 5

        [default_strategy]
        grid_count = 4
        spread_pct = 1.0
        stake_per_level = 10.0

        [[pairs]]
        symbol = "BTC/USDC"

        [[pairs]]
        symbol = "ETH/USDC"
        enabled = false

        [[pairs]]
        symbol = "SOL/USDC"

        [pairs.strategy]
        grid_count = 6
        spread_pct = 2.0
        stake_per_level = 5.0
        start_mode = "buy_2"
        trailing = true
    "#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let active = config.active_pairs();

        assert_eq!(active.len(), 2);
        assert_eq!(active[0].symbol, "BTC/USDC");
        assert_eq!(active[0].base, "BTC");
        assert_eq!(active[0].quote, "USDC");
        assert_eq!(active[0].params.grid_count, 4);
        assert_eq!(active[0].params.start_mode, StartMode::Wait);
        assert_eq!(active[1].params.start_mode, StartMode::Buy2);
        assert!(active[1].params.trailing);
        assert_eq!(config.system.gateway_timeout_secs, 10);
    }

    #[test]
    fn test_rejects_bad_spread() {
        let bad = SAMPLE.replace("spread_pct = 2.0", "spread_pct = 0.0");
        let err = Config::from_toml_str(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_duplicate_and_malformed_symbols() {
        let dup = SAMPLE.replace("ETH/USDC", "BTC/USDC");
        assert!(matches!(Config::from_toml_str(&dup), Err(ConfigError::Validation(_))));

        let malformed = SAMPLE.replace("ETH/USDC", "ETHUSDC");
        assert!(matches!(Config::from_toml_str(&malformed), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_split_symbol() {
        assert_eq!(split_symbol("BTC/USDC"), Some(("BTC", "USDC")));
        assert_eq!(split_symbol("BTC"), None);
        assert_eq!(split_symbol("/USDC"), None);
        assert_eq!(split_symbol("A/B/C"), None);
    }

    #[test]
    fn test_start_mode_multiplier() {
        assert_eq!(StartMode::Wait.stake_multiplier(), None);
        assert_eq!(StartMode::Buy1.stake_multiplier(), Some(1.0));
        assert_eq!(StartMode::Buy2.stake_multiplier(), Some(2.0));
    }

    #[test]
    fn test_network_parse() {
        assert_eq!(Network::parse("TESTNET"), Some(Network::Simulated));
        assert_eq!(Network::parse("live"), Some(Network::Live));
        assert_eq!(Network::parse("moon"), None);
    }
}
