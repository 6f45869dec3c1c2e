// Core trading logic modules

pub mod attributor;
pub mod clock;
pub mod engine;
pub mod levels;
pub mod notify;
pub mod reconciler;
pub mod state;

// Re-export commonly used types
pub use attributor::{Attribution, FeeRates, SellProfit, TradeAttributor};
pub use clock::{Clock, ManualClock, SystemClock, Ticker};
pub use engine::{CycleReport, EngineStatus, GridEngine, LiquidationReport, ReloadOutcome, StatusReport};
pub use levels::generate_levels;
pub use notify::{LogNotifier, Notification, Notifier};
pub use reconciler::{CycleOutcome, OrderAction, Reconciler};
pub use state::EngineState;
