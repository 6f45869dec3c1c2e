// Spot Grid Bot - command line entry point
// Runs the engine and exposes the operator controls

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use spot_grid_bot::core::engine::StatusReport;
use spot_grid_bot::{Config, ConfigError, Database, GridEngine, LogNotifier, PaperConnector, SystemClock};

#[derive(Parser)]
#[command(name = "grid-bot")]
#[command(version = "0.3.0")]
#[command(about = "Spot grid trading engine", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    #[command(flatten)]
    Engine(EngineCommand),
}

/// Commands that need a configured engine
#[derive(Subcommand)]
enum EngineCommand {
    /// Run the engine until Ctrl+C
    Run,

    /// Show equity, baselines and per-pair state
    Status,

    /// Cancel every open order on the active pairs
    CancelAll,

    /// Cancel every order and market-sell all holdings
    SellAll,

    /// Cancel one pair's orders and market-sell what it holds
    LiquidatePair {
        /// Trading pair (e.g., BTC/USDC)
        pair: String,
    },

    /// Cancel one order; a sell order is also closed at market
    CloseOrder {
        /// Trading pair (e.g., BTC/USDC)
        pair: String,
        /// Exchange order id
        order_id: String,
    },

    /// Record a deposit (positive) or withdrawal (negative)
    AdjustCapital {
        #[arg(allow_hyphen_values = true)]
        delta: f64,
    },

    /// Restart one pair's profit accounting from its current holdings
    ResetPair {
        pair: String,
    },

    /// Delete one pair's entire trade history
    ResetPairHistory {
        pair: String,
    },

    /// Start a new session: session P&L counts from now
    ResetSession,

    /// Delete the recorded equity history
    ClearChart,

    /// Print the equity history
    History {
        /// Only samples from the last N hours
        #[arg(long)]
        hours: Option<i64>,
    },

    /// Delete trades, equity samples and market snapshots older than N days
    Prune {
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// Wipe all statistics and start counting from current equity
    ResetStats,

    /// Delete trade history except buys backing open sell orders
    CleanupHistory,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Init { force } => {
            init_logging("info", cli.verbose);
            return init_config(&cli.config, force);
        }
        Commands::Engine(command) => command,
    };

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            init_logging("info", cli.verbose);
            report_config_error(&cli.config, &e);
            std::process::exit(1);
        }
    };
    init_logging(&config.system.log_level, cli.verbose);

    info!("🚀 Spot Grid Bot v0.3.0");
    info!("📁 Config: {} ({} network)", cli.config, config.system.network);

    let db = Database::open(&config.system.db_path)?;
    let connector = Arc::new(PaperConnector::new(
        &config.system.quote_asset,
        config.simulation.clone(),
    ));
    let engine = GridEngine::new(
        config.clone(),
        db,
        connector,
        Arc::new(LogNotifier),
        Arc::new(SystemClock),
    );

    // a process-local venue is not the one a running engine trades on
    let account_reachable = !engine.account_is_process_local();

    match command {
        EngineCommand::Run => run(engine, &cli.config).await?,
        EngineCommand::Status => {
            if account_reachable {
                engine.connect().await.ok();
            } else {
                info!("💡 Paper account lives inside `grid-bot run`; showing stored snapshots");
            }
            print_status(&engine.status_report().await?);
        }
        EngineCommand::CancelAll => {
            let canceled = engine.panic_cancel_all().await?;
            info!("✅ Canceled {} orders", canceled);
        }
        EngineCommand::SellAll => {
            let report = engine.panic_sell_all().await?;
            info!(
                "✅ Canceled {} orders, sold {} pairs for {:.2} {}",
                report.orders_canceled, report.pairs_sold, report.proceeds, config.system.quote_asset
            );
        }
        EngineCommand::LiquidatePair { pair } => match engine.liquidate_pair(&pair).await? {
            Some(proceeds) => info!("✅ {} liquidated for {:.2} {}", pair, proceeds, config.system.quote_asset),
            None => info!("💤 {} holds nothing worth selling", pair),
        },
        EngineCommand::CloseOrder { pair, order_id } => match engine.manual_close_order(&pair, &order_id).await? {
            Some(proceeds) => info!("✅ Order {} closed, sold for {:.2}", order_id, proceeds),
            None => info!("✅ Order {} canceled", order_id),
        },
        EngineCommand::AdjustCapital { delta } => {
            engine.adjust_capital(delta)?;
            info!("✅ Baselines adjusted by {:+.2}", delta);
        }
        EngineCommand::ResetPair { pair } => {
            engine.reset_pair_session(&pair).await?;
        }
        EngineCommand::ResetPairHistory { pair } => {
            let removed = engine.reset_pair_global(&pair).await?;
            info!("✅ Removed {} {} trades", removed, pair);
        }
        EngineCommand::ResetSession => {
            if account_reachable {
                engine.connect().await.ok();
            }
            engine.reset_session_chart().await?;
        }
        EngineCommand::ClearChart => {
            let removed = engine.reset_global_chart()?;
            info!("✅ Removed {} equity samples", removed);
        }
        EngineCommand::History { hours } => {
            let since = hours.map(|h| chrono::Utc::now().timestamp() - h * 3600);
            for sample in engine.equity_history(since)? {
                let at = chrono::DateTime::from_timestamp(sample.timestamp, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| sample.timestamp.to_string());
                println!("{}  {:>12.2}", at, sample.equity);
            }
        }
        EngineCommand::Prune { days } => {
            let days = days.unwrap_or(config.system.retention_days);
            let report = engine.database().prune_old_data(days, chrono::Utc::now().timestamp())?;
            info!(
                "🧹 Pruned {} trades, {} equity samples, {} market snapshots",
                report.trades, report.equity_samples, report.market_rows
            );
        }
        EngineCommand::CleanupHistory => {
            let removed = engine.cleanup_trade_history().await?;
            info!("✅ Removed {} trades", removed);
        }
        EngineCommand::ResetStats => {
            if account_reachable {
                engine.connect().await.ok();
            }
            engine.reset_statistics().await?;
            info!("✅ Statistics reset");
        }
    }

    Ok(())
}

fn init_logging(level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn report_config_error(path: &str, e: &ConfigError) {
    error!("❌ Configuration Error");
    error!("{}", e);

    if !Path::new(path).exists() {
        error!("");
        error!("💡 Quick fix:");
        error!("   1. Run: grid-bot init");
        error!("   2. Edit {} with your pairs", path);
        error!("   3. Try again");
    }
}

fn init_config(path: &str, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if Path::new(path).exists() && !force {
        warn!("⚠️  {} already exists, skipping (use --force to overwrite)", path);
        return Ok(());
    }

    let default_config = include_str!("../../config.toml.example");
    Config::from_toml_str(default_config)?;
    std::fs::write(path, default_config)?;

    info!("📝 Created {}", path);
    info!("💡 Next steps:");
    info!("   1. Edit {} to choose pairs and strategy", path);
    info!("   2. Run: grid-bot run");
    Ok(())
}

async fn run(engine: GridEngine, config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    engine.watch_config(config_path);
    engine.start().await?;
    info!("✅ Engine started. Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("");
    engine.stop().await?;
    Ok(())
}

fn print_status(report: &StatusReport) {
    println!("📊 Status: {} on {} network", report.status, report.network);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let money = |v: Option<f64>| v.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".to_string());
    println!("💰 Equity:           {}", money(report.equity));
    println!("   Session baseline: {}  (P&L {})", money(report.session_baseline), money(report.session_pnl));
    println!("   Global baseline:  {}  (P&L {})", money(report.global_baseline), money(report.global_pnl));
    if let Some(best) = &report.best_pair {
        println!("🏆 Best pair: {}", best);
    }

    for pair in &report.pairs {
        println!();
        println!("📈 {}  price {}", pair.symbol, money(pair.price));
        println!(
            "   ladder: {}",
            pair.ladder.iter().map(|l| format!("{:.4}", l)).collect::<Vec<_>>().join(" ")
        );
        println!("   open orders: {}", pair.open_orders.len());
        for order in &pair.open_orders {
            println!("     {} {} {} @ {:.4}", order.id, order.side, order.quantity, order.price);
        }
        if pair.reserved > 0.0 {
            println!("   reserved: {}", pair.reserved);
        }
        let signed = |v: Option<f64>| v.map(|v| format!("{:+.2}", v)).unwrap_or_else(|| "-".to_string());
        println!(
            "   holding {} vs initial {:.2}, cash flow {:+.2} → profit {} ({} trades)",
            money(pair.holding_value),
            pair.initial_value,
            pair.net_cash_flow,
            signed(pair.profit),
            pair.session_trades
        );
    }
}
