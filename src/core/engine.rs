// Grid engine: session lifecycle, trading and telemetry loops, reloads and
// operator controls

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ActivePair, Config, ConfigWatcher, Network};
use crate::core::attributor::{foreign_fee_currencies, FeeRates, TradeAttributor, LINK_TOLERANCE};
use crate::core::clock::{Clock, Ticker};
use crate::core::notify::{Notification, Notifier};
use crate::core::reconciler::{CycleOutcome, Reconciler};
use crate::core::state::EngineState;
use crate::db::{Database, EquitySnapshot};
use crate::error::{BotError, BotResult};
use crate::exchange::{
    ExchangeGateway, GatewayConnector, GatewayError, OpenOrder, Side, TimedGateway,
};

/// Seconds between equity samples
pub const EQUITY_LOG_INTERVAL_SECS: i64 = 60;
/// Holding value under which panic liquidation leaves a pair alone
pub const LIQUIDATION_FLOOR: f64 = 2.0;
/// Candles kept in each market snapshot
pub const SNAPSHOT_CANDLES: usize = 100;
pub const SNAPSHOT_TIMEFRAME: &str = "15m";
/// Fills fetched per pair on each telemetry pass
pub const RECENT_TRADES_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Stopped,
    Running,
    Paused,
    Disconnected,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            EngineStatus::Stopped => "stopped",
            EngineStatus::Running => "running",
            EngineStatus::Paused => "paused",
            EngineStatus::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Result of applying a new configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ReloadOutcome {
    /// Network target changed: everything was reset for the new account
    NetworkChanged(Network),
    Reloaded {
        added: Vec<String>,
        removed: Vec<String>,
        changed: Vec<String>,
    },
}

/// What one trading cycle did, per pair
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub outcomes: Vec<(String, CycleOutcome)>,
    pub failures: Vec<(String, String)>,
    pub reload: Option<ReloadOutcome>,
    pub skipped: bool,
}

impl CycleReport {
    pub fn outcome(&self, pair: &str) -> Option<&CycleOutcome> {
        self.outcomes.iter().find(|(p, _)| p == pair).map(|(_, o)| o)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiquidationReport {
    pub orders_canceled: usize,
    pub pairs_sold: usize,
    pub proceeds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairStatus {
    pub symbol: String,
    pub price: Option<f64>,
    pub ladder: Vec<f64>,
    pub open_orders: Vec<OpenOrder>,
    pub reserved: f64,
    /// Unknown without an exchange session
    pub holding_value: Option<f64>,
    pub initial_value: f64,
    pub net_cash_flow: f64,
    /// (holding_value - initial_value) + net_cash_flow
    pub profit: Option<f64>,
    pub session_trades: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: EngineStatus,
    pub network: Network,
    pub uptime_secs: i64,
    pub equity: Option<f64>,
    pub session_baseline: Option<f64>,
    pub global_baseline: Option<f64>,
    pub session_pnl: Option<f64>,
    pub global_pnl: Option<f64>,
    /// Pair with the highest profit, if any made money
    pub best_pair: Option<String>,
    pub pairs: Vec<PairStatus>,
}

struct EngineInner {
    db: Database,
    connector: Arc<dyn GatewayConnector>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: RwLock<Config>,
    watcher: Mutex<Option<ConfigWatcher>>,
    gateway: RwLock<Option<Arc<dyn ExchangeGateway>>>,
    state: tokio::sync::Mutex<EngineState>,
    attributor: Mutex<TradeAttributor>,
    running: AtomicBool,
    paused: AtomicBool,
    session_start_ms: AtomicI64,
    last_equity_log: AtomicI64,
    settle_delay: Mutex<Duration>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a grid engine. Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct GridEngine {
    inner: Arc<EngineInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Errors after which the gateway session cannot be trusted
fn is_session_loss(err: &BotError) -> bool {
    matches!(
        err,
        BotError::Disconnected(_) | BotError::Gateway(GatewayError::Authentication(_))
    )
}

impl GridEngine {
    pub fn new(
        config: Config,
        db: Database,
        connector: Arc<dyn GatewayConnector>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let now = clock.now_ms();
        Self {
            inner: Arc::new(EngineInner {
                db,
                connector,
                notifier,
                clock,
                config: RwLock::new(config),
                watcher: Mutex::new(None),
                gateway: RwLock::new(None),
                state: tokio::sync::Mutex::new(EngineState::new()),
                attributor: Mutex::new(TradeAttributor::new(now)),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                session_start_ms: AtomicI64::new(now),
                last_equity_log: AtomicI64::new(0),
                settle_delay: Mutex::new(Duration::from_secs(2)),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Reload the configuration from this file whenever it changes
    pub fn watch_config<P: AsRef<Path>>(&self, path: P) {
        *lock(&self.inner.watcher) = Some(ConfigWatcher::new(path));
    }

    /// Pause between panic cancel-all and the market sells
    pub fn set_settle_delay(&self, delay: Duration) {
        *lock(&self.inner.settle_delay) = delay;
    }

    pub fn config(&self) -> Config {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn status(&self) -> EngineStatus {
        if !self.inner.running.load(Ordering::SeqCst) {
            EngineStatus::Stopped
        } else if self.gateway().is_none() {
            EngineStatus::Disconnected
        } else if self.is_paused() {
            EngineStatus::Paused
        } else {
            EngineStatus::Running
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.gateway().is_some()
    }

    pub fn session_start_ms(&self) -> i64 {
        self.inner.session_start_ms.load(Ordering::SeqCst)
    }

    /// Copy of the cached ladders and reserved inventory
    pub async fn state_snapshot(&self) -> EngineState {
        self.inner.state.lock().await.clone()
    }

    pub async fn ladder(&self, pair: &str) -> Option<Vec<f64>> {
        self.inner.state.lock().await.ladder(pair).map(<[f64]>::to_vec)
    }

    /// Replace a pair's cached ladder and persist it
    pub async fn set_ladder(&self, pair: &str, levels: Vec<f64>) -> BotResult<()> {
        self.inner.db.save_grid_levels(pair, &levels)?;
        self.inner.state.lock().await.set_ladder(pair, levels);
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        self.inner.notifier.notify(&notification);
    }

    fn gateway(&self) -> Option<Arc<dyn ExchangeGateway>> {
        self.inner
            .gateway
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_gateway(&self, gateway: Option<Arc<dyn ExchangeGateway>>) {
        *self.inner.gateway.write().unwrap_or_else(PoisonError::into_inner) = gateway;
    }

    fn drop_session(&self, reason: &str) {
        if self.gateway().is_some() {
            warn!("🔌 Exchange session lost: {}", reason);
            self.set_gateway(None);
            self.notify(Notification::Disconnected(reason.to_string()));
        }
    }

    /// Open a gateway session for the configured network and validate it
    pub async fn connect(&self) -> BotResult<Arc<dyn ExchangeGateway>> {
        let config = self.config();
        let raw = self.inner.connector.connect(config.system.network).await?;
        let gateway: Arc<dyn ExchangeGateway> = Arc::new(TimedGateway::new(raw, config.gateway_timeout()));
        gateway.ping().await?;

        info!("✅ Connected to {} exchange session", config.system.network);
        self.set_gateway(Some(Arc::clone(&gateway)));
        Ok(gateway)
    }

    /// True when the configured account lives only inside this process, so
    /// a fresh engine sees none of the orders or balances a running one has.
    pub fn account_is_process_local(&self) -> bool {
        self.inner.connector.is_process_local(self.config().system.network)
    }

    /// Gateway for operator actions. Refuses to open a fresh session on a
    /// process-local account: it would act on an empty venue.
    async fn account_gateway(&self) -> BotResult<Arc<dyn ExchangeGateway>> {
        if let Some(gateway) = self.gateway() {
            return Ok(gateway);
        }
        if self.account_is_process_local() {
            return Err(BotError::AccountUnreachable(format!(
                "the {} account belongs to the running engine",
                self.config().system.network
            )));
        }
        self.connect().await
    }

    // ---- session ----------------------------------------------------------

    /// Connect, measure equity, record baselines and restore persisted
    /// ladders. Safe to call without starting the loops.
    pub async fn initialize_session(&self) -> BotResult<()> {
        let config = self.config();
        let db = &self.inner.db;
        let now = self.inner.clock.now_ms();
        db.ensure_first_run_ms(now)?;

        if let Some(previous) = db.network_marker()? {
            if previous != config.system.network {
                warn!(
                    "🚨 Stored statistics belong to the {} network; starting fresh on {}",
                    previous, config.system.network
                );
                db.reset_all_statistics()?;
                db.reset_grid_state()?;
            }
        }
        db.set_network_marker(config.system.network)?;

        self.inner.session_start_ms.store(now, Ordering::SeqCst);
        db.set_session_start_ms(now)?;
        lock(&self.inner.attributor).reset(now);

        let gateway = match self.connect().await {
            Ok(gateway) => gateway,
            Err(e) => {
                warn!("⚠️  Starting without an exchange session: {}", e.user_message());
                self.notify(Notification::Disconnected(e.to_string()));
                return Ok(());
            }
        };

        let equity = self.capture_baselines(gateway.as_ref(), true).await?;
        info!("💰 Initial equity: {:.2} {}", equity, config.system.quote_asset);

        info!("🧹 Canceling stale orders on {} pairs", config.active_pairs().len());
        for pair in config.active_pairs() {
            if let Err(e) = gateway.cancel_all_orders(&pair.symbol).await {
                warn!("⚠️  {} stale order cleanup failed: {}", pair.symbol, e);
            }
        }

        let stored = db.stored_grids()?;
        let active = config.active_symbols();
        let mut state = self.inner.state.lock().await;
        for (symbol, levels) in stored.into_iter().filter(|(s, _)| active.contains(s)) {
            debug!(pair = %symbol, levels = levels.len(), "restored persisted ladder");
            state.set_ladder(&symbol, levels);
        }

        Ok(())
    }

    /// Record baselines and per-pair holding values. With `new_session`
    /// the session baseline and every pair anchor are overwritten; otherwise
    /// only missing values are filled in. Returns the measured equity.
    async fn capture_baselines(&self, gateway: &dyn ExchangeGateway, new_session: bool) -> BotResult<f64> {
        let db = &self.inner.db;
        let equity = self.calculate_total_equity(gateway).await?;

        if new_session || db.session_baseline()?.is_none() {
            db.set_session_baseline(equity)?;
        }
        if db.global_baseline()?.is_none() {
            db.set_global_baseline(equity)?;
        }
        self.capture_initial_snapshots(gateway, new_session).await?;
        Ok(equity)
    }

    /// Quote balance plus every active pair's base holdings at market
    pub async fn calculate_total_equity(&self, gateway: &dyn ExchangeGateway) -> BotResult<f64> {
        let config = self.config();
        let quote = config.system.quote_asset.as_str();
        let mut total = gateway.total_balance(quote).await?;

        let mut seen = HashSet::new();
        for pair in config.active_pairs() {
            if pair.quote != quote || !seen.insert(pair.base.clone()) {
                continue;
            }
            let held = match gateway.total_balance(&pair.base).await {
                Ok(held) => held,
                Err(e) => {
                    debug!(pair = %pair.symbol, error = %e, "balance unavailable for equity");
                    continue;
                }
            };
            if held > 0.0 {
                match gateway.current_price(&pair.symbol).await {
                    Ok(price) => total += held * price,
                    Err(e) => debug!(pair = %pair.symbol, error = %e, "price unavailable for equity"),
                }
            }
        }
        Ok(total)
    }

    /// Store active pairs' current holding values as their profit anchors.
    /// Pairs that already have an anchor keep it unless `overwrite` is set.
    pub async fn capture_initial_snapshots(&self, gateway: &dyn ExchangeGateway, overwrite: bool) -> BotResult<()> {
        let mut values = if overwrite {
            HashMap::new()
        } else {
            self.inner.db.coin_initial_balances()?
        };
        for pair in self.config().active_pairs() {
            if values.contains_key(&pair.symbol) {
                continue;
            }
            match self.holding_value(gateway, &pair).await {
                Ok(value) => {
                    values.insert(pair.symbol.clone(), value);
                }
                Err(e) => error!("❌ Initial snapshot failed for {}: {}", pair.symbol, e),
            }
        }
        self.inner.db.set_coin_initial_balances(&values)?;
        Ok(())
    }

    async fn holding_value(&self, gateway: &dyn ExchangeGateway, pair: &ActivePair) -> BotResult<f64> {
        let held = gateway.total_balance(&pair.base).await?;
        if held <= 0.0 {
            return Ok(0.0);
        }
        let price = gateway.current_price(&pair.symbol).await?;
        Ok(held * price)
    }

    // ---- lifecycle --------------------------------------------------------

    pub async fn start(&self) -> BotResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(BotError::AlreadyRunning);
        }

        if let Err(e) = self.initialize_session().await {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(false);

        let config = self.config();
        let trading = tokio::spawn(self.clone().trading_loop());
        let telemetry = tokio::spawn(self.clone().telemetry_loop());
        lock(&self.inner.tasks).extend([trading, telemetry]);

        let equity = self.inner.db.session_baseline()?.unwrap_or(0.0);
        info!(
            "🚀 Grid engine running on {} with {} pairs",
            config.system.network,
            config.active_pairs().len()
        );
        self.notify(Notification::Started {
            network: config.system.network,
            pairs: config.active_pairs().len(),
            equity,
        });
        Ok(())
    }

    /// Signal both loops and wait for them to finish their current pass
    pub async fn stop(&self) -> BotResult<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Err(BotError::NotRunning);
        }

        info!("🛑 Stopping grid engine...");
        self.inner.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("❌ Engine task ended abnormally: {}", e);
            }
        }

        if let Err(e) = self.inner.db.clear_open_orders_cache() {
            warn!("⚠️  Cached order snapshots not cleared: {}", e);
        }
        self.notify(Notification::Stopped);
        info!("✅ Grid engine stopped");
        Ok(())
    }

    async fn trading_loop(self) {
        let mut ticker = Ticker::new(
            Arc::clone(&self.inner.clock),
            self.config().cycle_delay(),
            self.inner.shutdown.subscribe(),
        );

        loop {
            let report = self.run_cycle().await;
            for (pair, failure) in &report.failures {
                warn!("⚠️  {} cycle failed: {}", pair, failure);
            }

            ticker.set_period(self.config().cycle_delay());
            if !ticker.tick().await {
                break;
            }
        }
        debug!("trading loop exited");
    }

    async fn telemetry_loop(self) {
        let mut ticker = Ticker::new(
            Arc::clone(&self.inner.clock),
            self.config().telemetry_delay(),
            self.inner.shutdown.subscribe(),
        );

        loop {
            if !self.is_paused() && self.is_connected() {
                if let Err(e) = self.collect_telemetry().await {
                    warn!("⚠️  Telemetry pass failed: {}", e);
                }
            }

            ticker.set_period(self.config().telemetry_delay());
            if !ticker.tick().await {
                break;
            }
        }
        debug!("telemetry loop exited");
    }

    // ---- trading cycle ----------------------------------------------------

    /// One pass of the trading loop: reload check, reconnect, reconcile.
    ///
    /// Never fails as a whole; per-pair failures are collected in the report.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let polled = lock(&self.inner.watcher).as_mut().and_then(ConfigWatcher::poll);
        match polled {
            Some(Ok(config)) => match self.apply_config(config).await {
                Ok(outcome) => report.reload = Some(outcome),
                Err(e) => error!("❌ Configuration reload rejected: {}", e),
            },
            Some(Err(e)) => error!("❌ Configuration reload rejected, keeping previous: {}", e),
            None => {}
        }

        let gateway = match self.gateway() {
            Some(gateway) => gateway,
            None => match self.connect().await {
                Ok(gateway) => {
                    self.notify(Notification::Reconnected);
                    if let Err(e) = self.capture_baselines(gateway.as_ref(), false).await {
                        warn!("⚠️  Baseline capture after reconnect failed: {}", e);
                    }
                    gateway
                }
                Err(e) => {
                    debug!(error = %e, "still disconnected");
                    report.skipped = true;
                    return report;
                }
            },
        };

        if self.is_paused() {
            report.skipped = true;
            return report;
        }

        let reconciler = Reconciler::new(gateway.as_ref(), &self.inner.db);
        for pair in self.config().active_pairs() {
            let mut state = self.inner.state.lock().await;
            match reconciler.run_pair(&pair, &mut state).await {
                Ok(outcome) => report.outcomes.push((pair.symbol.clone(), outcome)),
                Err(e) => {
                    let lost = is_session_loss(&e);
                    report.failures.push((pair.symbol.clone(), e.to_string()));
                    if lost {
                        drop(state);
                        self.drop_session(&e.to_string());
                        break;
                    }
                }
            }
        }

        report
    }

    // ---- telemetry --------------------------------------------------------

    /// Refresh market/grid snapshots, attribute new fills, sample equity and
    /// prune old data once a day. Reads trading state, never writes it.
    pub async fn collect_telemetry(&self) -> BotResult<usize> {
        let gateway = match self.gateway() {
            Some(gateway) => gateway,
            None => return Err(BotError::Disconnected("no exchange session".to_string())),
        };
        let config = self.config();
        let db = &self.inner.db;
        let mut reported = 0;

        for pair in config.active_pairs() {
            match self.collect_pair(gateway.as_ref(), &pair).await {
                Ok(count) => reported += count,
                Err(e) if is_session_loss(&e) => {
                    self.drop_session(&e.to_string());
                    return Err(e);
                }
                Err(e) => warn!("⚠️  {} telemetry failed: {}", pair.symbol, e),
            }
        }

        let now = self.inner.clock.now_secs();
        let last = self.inner.last_equity_log.load(Ordering::SeqCst);
        if now - last >= EQUITY_LOG_INTERVAL_SECS {
            let equity = self.calculate_total_equity(gateway.as_ref()).await?;
            if equity > 0.0 {
                db.log_equity_snapshot(now, equity)?;
                self.inner.last_equity_log.store(now, Ordering::SeqCst);
            }
        }

        let today = Utc
            .timestamp_opt(now, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        if db.last_prune_day()?.as_deref() != Some(today.as_str()) {
            let pruned = db.prune_old_data(config.system.retention_days, now)?;
            if pruned.total() > 0 {
                info!("🧹 Pruned {} rows older than {} days", pruned.total(), config.system.retention_days);
            }
            db.set_last_prune_day(&today)?;
        }

        Ok(reported)
    }

    async fn collect_pair(&self, gateway: &dyn ExchangeGateway, pair: &ActivePair) -> BotResult<usize> {
        let db = &self.inner.db;
        let symbol = pair.symbol.as_str();

        let price = gateway.current_price(symbol).await?;
        let candles = gateway
            .recent_candles(symbol, SNAPSHOT_TIMEFRAME, SNAPSHOT_CANDLES)
            .await
            .unwrap_or_default();
        db.save_market_snapshot(symbol, price, &candles)?;

        let orders = gateway.open_orders(symbol).await?;
        db.save_open_orders(symbol, &orders)?;

        let fills = gateway.recent_trades(symbol, RECENT_TRADES_LIMIT).await?;
        let mut rates = FeeRates::new();
        for currency in foreign_fee_currencies(&fills, &pair.base, &pair.quote) {
            let market = format!("{}/{}", currency, pair.quote);
            match gateway.current_price(&market).await {
                Ok(price) => {
                    rates.insert(currency, price);
                }
                Err(e) => debug!(market = %market, error = %e, "fee currency price unavailable"),
            }
        }
        let attributions = lock(&self.inner.attributor).ingest_with_rates(db, pair, &fills, &rates)?;

        let count = attributions.len();
        for attribution in attributions {
            info!("💱 {}", attribution);
            self.notify(Notification::Trade(attribution));
        }
        Ok(count)
    }

    // ---- configuration ----------------------------------------------------

    /// Validate and apply a new configuration. An invalid one is rejected
    /// and the current configuration stays in force.
    pub async fn apply_config(&self, new_config: Config) -> BotResult<ReloadOutcome> {
        new_config.validate()?;
        info!("🔄 Configuration updated, analysing changes...");

        let old_config = self.config();
        *self.inner.config.write().unwrap_or_else(PoisonError::into_inner) = new_config.clone();

        let outcome = if old_config.system.network != new_config.system.network {
            self.hard_reset(new_config.system.network).await?;
            ReloadOutcome::NetworkChanged(new_config.system.network)
        } else {
            self.soft_reload(&old_config, &new_config).await?
        };

        self.notify(Notification::ConfigReloaded);
        Ok(outcome)
    }

    /// New network, new account: nothing cached or measured carries over
    async fn hard_reset(&self, network: Network) -> BotResult<()> {
        warn!("🚨 Network changed to {}: resetting session", network);
        self.notify(Notification::NetworkChanged(network));

        let db = &self.inner.db;
        self.inner.state.lock().await.clear();
        self.set_gateway(None);

        let now = self.inner.clock.now_ms();
        lock(&self.inner.attributor).reset(now);
        self.inner.session_start_ms.store(now, Ordering::SeqCst);
        self.inner.last_equity_log.store(0, Ordering::SeqCst);

        db.reset_all_statistics()?;
        db.reset_grid_state()?;
        db.set_network_marker(network)?;
        db.set_session_start_ms(now)?;

        match self.connect().await {
            Ok(gateway) => {
                let equity = self.capture_baselines(gateway.as_ref(), true).await?;
                info!("✅ Session restarted on {} with equity {:.2}", network, equity);
            }
            Err(e) => warn!("⚠️  {} network unavailable, baselines deferred: {}", network, e),
        }
        Ok(())
    }

    async fn soft_reload(&self, old_config: &Config, new_config: &Config) -> BotResult<ReloadOutcome> {
        let db = &self.inner.db;
        let gateway = self.gateway();
        let mut state = self.inner.state.lock().await;

        let new_symbols = new_config.active_symbols();
        let running: BTreeSet<String> = old_config
            .active_symbols()
            .into_iter()
            .chain(state.ladder_pairs().cloned())
            .collect();

        let removed: Vec<String> = running.iter().filter(|s| !new_symbols.contains(*s)).cloned().collect();
        let added: Vec<String> = {
            let mut added: Vec<String> = new_symbols.iter().filter(|s| !running.contains(*s)).cloned().collect();
            added.sort();
            added
        };
        let changed: Vec<String> = running
            .iter()
            .filter(|s| new_symbols.contains(*s))
            .filter(|s| old_config.strategy_for(s) != new_config.strategy_for(s))
            .cloned()
            .collect();

        for symbol in &removed {
            info!("⛔ Stopping {}: canceling its orders", symbol);
            if let Some(gateway) = &gateway {
                if let Err(e) = gateway.cancel_all_orders(symbol).await {
                    warn!("⚠️  {} cancel-all failed: {}", symbol, e);
                }
            }
            state.remove_ladder(symbol);
            if let Some((base, _)) = crate::config::split_symbol(symbol) {
                state.release(base);
            }
            db.clear_grid_levels(symbol)?;
        }

        for symbol in &added {
            info!("✨ Activating {}", symbol);
        }

        for symbol in &changed {
            info!("🔧 {} strategy changed: rebuilding its ladder", symbol);
            if let Some(gateway) = &gateway {
                if new_config.system.reserve_on_strategy_change {
                    if let Some((base, _)) = crate::config::split_symbol(symbol) {
                        match gateway.total_balance(base).await {
                            Ok(held) if held > 0.0 => {
                                info!("🔒 Reserving {} {} held under the previous strategy", held, base);
                                state.reserve(base, held);
                            }
                            Ok(_) => {}
                            Err(e) => warn!("⚠️  Could not read {} balance to reserve: {}", base, e),
                        }
                    }
                }
                if let Err(e) = gateway.cancel_all_orders(symbol).await {
                    warn!("⚠️  {} cancel-all failed: {}", symbol, e);
                }
            }
            state.remove_ladder(symbol);
            db.clear_grid_levels(symbol)?;
        }

        info!("✅ Reload complete");
        Ok(ReloadOutcome::Reloaded { added, removed, changed })
    }

    // ---- operator controls ------------------------------------------------

    pub fn pause(&self) {
        warn!("⏸️  Operator action: pausing trading");
        self.inner.paused.store(true, Ordering::SeqCst);
        self.notify(Notification::Paused);
    }

    pub fn resume(&self) {
        info!("▶️  Operator action: resuming trading");
        self.inner.paused.store(false, Ordering::SeqCst);
        self.notify(Notification::Resumed);
    }

    /// Cancel every open order on the active pairs. Ladders are kept.
    pub async fn panic_cancel_all(&self) -> BotResult<usize> {
        warn!("⛔ Panic: canceling all open orders");
        let gateway = self.account_gateway().await?;
        let mut canceled = 0;

        for pair in self.config().active_pairs() {
            match gateway.cancel_all_orders(&pair.symbol).await {
                Ok(count) => canceled += count,
                Err(e) => error!("❌ {} cancel-all failed: {}", pair.symbol, e),
            }
            if let Err(e) = self.inner.db.save_open_orders(&pair.symbol, &[]) {
                warn!("⚠️  {} order snapshot not cleared: {}", pair.symbol, e);
            }
        }

        self.notify(Notification::OrdersCanceled(canceled));
        Ok(canceled)
    }

    /// Cancel everything, let balances settle, then market-sell every
    /// holding worth more than the liquidation floor.
    pub async fn panic_sell_all(&self) -> BotResult<LiquidationReport> {
        warn!("🔥 Panic: liquidating all holdings");
        let orders_canceled = self.panic_cancel_all().await?;
        let gateway = self.account_gateway().await?;
        self.settle().await;

        let mut report = LiquidationReport { orders_canceled, ..Default::default() };
        let mut sold_assets = HashSet::new();
        for pair in self.config().active_pairs() {
            if sold_assets.contains(&pair.base) {
                continue;
            }
            match self.sell_holdings(gateway.as_ref(), &pair).await {
                Ok(Some(proceeds)) => {
                    sold_assets.insert(pair.base.clone());
                    report.pairs_sold += 1;
                    report.proceeds += proceeds;
                }
                Ok(None) => {}
                Err(e) => error!("❌ {} liquidation failed: {}", pair.symbol, e),
            }
        }

        self.notify(Notification::Liquidated { pairs: report.pairs_sold, proceeds: report.proceeds });
        Ok(report)
    }

    /// Cancel one pair's orders and market-sell everything it holds.
    /// Returns the proceeds, or `None` when the holding is below the floor.
    pub async fn liquidate_pair(&self, symbol: &str) -> BotResult<Option<f64>> {
        let pair = self
            .config()
            .active_pair(symbol)
            .ok_or_else(|| BotError::UnknownPair(symbol.to_string()))?;
        warn!("🔥 Manual liquidation of {}", symbol);
        let gateway = self.account_gateway().await?;

        let canceled = gateway.cancel_all_orders(symbol).await?;
        debug!(pair = %symbol, canceled, "orders canceled before liquidation");
        if let Err(e) = self.inner.db.save_open_orders(symbol, &[]) {
            warn!("⚠️  {} order snapshot not cleared: {}", symbol, e);
        }
        self.settle().await;

        let proceeds = self.sell_holdings(gateway.as_ref(), &pair).await?;
        match proceeds {
            Some(proceeds) => self.notify(Notification::Liquidated { pairs: 1, proceeds }),
            None => info!("💤 Nothing worth selling on {}", symbol),
        }
        Ok(proceeds)
    }

    async fn settle(&self) {
        let settle = *lock(&self.inner.settle_delay);
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
    }

    async fn sell_holdings(&self, gateway: &dyn ExchangeGateway, pair: &ActivePair) -> BotResult<Option<f64>> {
        let amount = gateway.free_balance(&pair.base).await?;
        let price = gateway.current_price(&pair.symbol).await?;
        if amount * price <= LIQUIDATION_FLOOR {
            return Ok(None);
        }

        warn!("🔥 Selling {} {} at market", amount, pair.base);
        let fill = gateway.place_market_sell(&pair.symbol, amount).await?;
        Ok(Some(fill.cost))
    }

    /// Cancel one order by hand. Closing a sell also market-sells the
    /// quantity it was offering.
    pub async fn manual_close_order(&self, symbol: &str, order_id: &str) -> BotResult<Option<f64>> {
        warn!("✋ Manual close of order {} on {}", order_id, symbol);
        if self.config().active_pair(symbol).is_none() {
            return Err(BotError::UnknownPair(symbol.to_string()));
        }
        let gateway = self.account_gateway().await?;

        let order = gateway
            .open_orders(symbol)
            .await?
            .into_iter()
            .find(|o| o.id == order_id)
            .ok_or_else(|| BotError::Gateway(GatewayError::OrderNotFound(order_id.to_string())))?;

        gateway.cancel_order(order_id, symbol).await?;
        match order.side {
            Side::Buy => {
                info!("🗑️  Buy order {} canceled, quote released", order_id);
                Ok(None)
            }
            Side::Sell => {
                let fill = gateway.place_market_sell(symbol, order.quantity).await?;
                info!("🔥 Sold {} {} at market after closing {}", fill.quantity, symbol, order_id);
                Ok(Some(fill.cost))
            }
        }
    }

    // ---- reporting and resets --------------------------------------------

    pub async fn status_report(&self) -> BotResult<StatusReport> {
        let config = self.config();
        let db = &self.inner.db;
        let gateway = self.gateway();
        let state = self.state_snapshot().await;

        let session_start = self.session_start_ms();
        let stats = db.trade_stats_since(session_start)?;
        let initials = db.coin_initial_balances()?;
        let stored_prices = db.all_prices()?;

        let mut pairs = Vec::new();
        for pair in config.active_pairs() {
            let symbol = pair.symbol.clone();
            let (price, open_orders, holding_value) = match &gateway {
                Some(gateway) => {
                    let price = gateway.current_price(&symbol).await.ok();
                    let orders = gateway.open_orders(&symbol).await.unwrap_or_default();
                    let held = gateway.total_balance(&pair.base).await.ok();
                    (price, orders, held.zip(price).map(|(held, price)| held * price))
                }
                None => {
                    let orders = db.grid_status(&symbol)?.map(|g| g.open_orders).unwrap_or_default();
                    (stored_prices.get(&symbol).copied(), orders, None)
                }
            };

            let since = db.pair_session_start_ms(&symbol)?.unwrap_or(session_start);
            let pair_stats = if since == session_start {
                stats.get(&symbol).cloned().unwrap_or_default()
            } else {
                db.pair_trade_stats(&symbol, since)?
            };
            let initial_value = initials.get(&symbol).copied().unwrap_or(0.0);
            let net_cash_flow = pair_stats.net_cash_flow();

            pairs.push(PairStatus {
                price,
                ladder: state.ladder(&symbol).map(<[f64]>::to_vec).unwrap_or_default(),
                open_orders,
                reserved: state.reserved_for(&pair.base),
                holding_value,
                initial_value,
                net_cash_flow,
                profit: holding_value.map(|held| (held - initial_value) + net_cash_flow),
                session_trades: pair_stats.total_trades(),
                symbol,
            });
        }

        let equity = match &gateway {
            Some(gateway) => self.calculate_total_equity(gateway.as_ref()).await.ok(),
            None => None,
        };
        let session_baseline = db.session_baseline()?;
        let global_baseline = db.global_baseline()?;
        let best_pair = pairs
            .iter()
            .filter_map(|p| p.profit.filter(|profit| *profit > 0.0).map(|profit| (profit, &p.symbol)))
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, symbol)| symbol.clone());

        Ok(StatusReport {
            status: self.status(),
            network: config.system.network,
            uptime_secs: (self.inner.clock.now_ms() - session_start).max(0) / 1000,
            equity,
            session_pnl: equity.zip(session_baseline).map(|(e, b)| e - b),
            global_pnl: equity.zip(global_baseline).map(|(e, b)| e - b),
            session_baseline,
            global_baseline,
            best_pair,
            pairs,
        })
    }

    pub fn equity_history(&self, since: Option<i64>) -> BotResult<Vec<EquitySnapshot>> {
        self.inner.db.equity_history(since)
    }

    /// Wipe all statistics and start counting from the current equity
    pub async fn reset_statistics(&self) -> BotResult<()> {
        warn!("♻️  Resetting all statistics");
        self.inner.db.reset_all_statistics()?;

        let now = self.inner.clock.now_ms();
        lock(&self.inner.attributor).reset(now);
        self.inner.session_start_ms.store(now, Ordering::SeqCst);
        self.inner.db.set_session_start_ms(now)?;

        if let Some(gateway) = self.gateway() {
            self.capture_baselines(gateway.as_ref(), true).await?;
        }
        Ok(())
    }

    /// Trim the ledger down to the buys that still back a resting sell.
    ///
    /// Each open sell is matched to its originating buy the same way fills
    /// are attributed; everything else is deleted. Returns the rows removed.
    pub async fn cleanup_trade_history(&self) -> BotResult<usize> {
        let gateway = self.account_gateway().await?;
        let db = &self.inner.db;
        let mut keep = HashSet::new();

        for pair in self.config().active_pairs() {
            let orders = gateway.open_orders(&pair.symbol).await?;
            for order in orders.iter().filter(|o| o.side == Side::Sell) {
                let implied = order.price / (1.0 + pair.params.spread_pct / 100.0);
                let before = self.inner.clock.now_ms();
                if let Some(buy) = db.find_linked_buy(&pair.symbol, implied, LINK_TOLERANCE, before)? {
                    keep.insert((buy.id, buy.symbol));
                }
            }
        }

        let deleted = db.delete_trades_except(&keep)?;
        info!("🧹 Trade history cleaned: {} removed, {} kept", deleted, keep.len());
        Ok(deleted)
    }

    /// Delete the recorded equity history. Baselines are left alone.
    pub fn reset_global_chart(&self) -> BotResult<usize> {
        let deleted = self.inner.db.clear_balance_history()?;
        self.inner.last_equity_log.store(0, Ordering::SeqCst);
        info!("🧹 Equity chart cleared ({} samples)", deleted);
        Ok(deleted)
    }

    /// Start a new session now: session P&L and trade counts are measured
    /// from this point and the current equity.
    pub async fn reset_session_chart(&self) -> BotResult<()> {
        let now = self.inner.clock.now_ms();
        self.inner.session_start_ms.store(now, Ordering::SeqCst);
        self.inner.db.set_session_start_ms(now)?;
        lock(&self.inner.attributor).reset(now);

        match self.account_gateway().await {
            Ok(gateway) => {
                let equity = self.calculate_total_equity(gateway.as_ref()).await?;
                self.inner.db.set_session_baseline(equity)?;
                info!("♻️  Session restarted at equity {:.2}", equity);
            }
            Err(e) => warn!("⚠️  Session restarted without a new baseline: {}", e),
        }
        Ok(())
    }

    /// Account for a deposit (positive) or withdrawal (negative) so it does
    /// not show up as profit or loss
    pub fn adjust_capital(&self, delta: f64) -> BotResult<()> {
        info!("🏦 Capital adjustment of {:+.2}", delta);
        self.inner.db.adjust_balance_baselines(delta)
    }

    /// Restart one pair's profit accounting from its current holding value
    pub async fn reset_pair_session(&self, symbol: &str) -> BotResult<()> {
        let pair = self
            .config()
            .active_pair(symbol)
            .ok_or_else(|| BotError::UnknownPair(symbol.to_string()))?;
        let gateway = self.account_gateway().await?;

        let value = self.holding_value(gateway.as_ref(), &pair).await?;
        let now = self.inner.clock.now_ms();
        self.inner.db.set_coin_initial_balance(symbol, value)?;
        self.inner.db.set_pair_session_start_ms(symbol, now)?;
        lock(&self.inner.attributor).reset_pair(symbol);
        info!("♻️  {} session reset at holding value {:.2}", symbol, value);
        Ok(())
    }

    /// Forget one pair's whole trade history and re-anchor its profit at the
    /// current holding value when the account is reachable. Returns the
    /// number of trades deleted.
    pub async fn reset_pair_global(&self, symbol: &str) -> BotResult<usize> {
        let pair = self
            .config()
            .active_pair(symbol)
            .ok_or_else(|| BotError::UnknownPair(symbol.to_string()))?;

        let deleted = self.inner.db.clear_trade_history(Some(symbol))?;
        self.inner.db.clear_pair_session_start_ms(symbol)?;
        lock(&self.inner.attributor).reset_pair(symbol);

        match self.account_gateway().await {
            Ok(gateway) => {
                let value = self.holding_value(gateway.as_ref(), &pair).await?;
                self.inner.db.set_coin_initial_balance(symbol, value)?;
            }
            Err(e) => warn!("⚠️  {} holding anchor kept: {}", symbol, e),
        }
        warn!("♻️  {} trade history cleared ({} trades)", symbol, deleted);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_loss_classification() {
        assert!(is_session_loss(&BotError::Disconnected("gone".to_string())));
        assert!(is_session_loss(&BotError::Gateway(GatewayError::Authentication("bad key".to_string()))));
        assert!(!is_session_loss(&BotError::Gateway(GatewayError::Timeout("slow".to_string()))));
        assert!(!is_session_loss(&BotError::UnknownPair("X/Y".to_string())));
    }

    #[test]
    fn test_cycle_report_lookup() {
        let report = CycleReport {
            outcomes: vec![("BTC/USDC".to_string(), CycleOutcome::NoPrice)],
            ..Default::default()
        };
        assert_eq!(report.outcome("BTC/USDC"), Some(&CycleOutcome::NoPrice));
        assert!(report.outcome("ETH/USDC").is_none());
        assert_eq!(EngineStatus::Disconnected.to_string(), "disconnected");
    }
}
