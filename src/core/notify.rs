// Operator notifications

use std::fmt;

use tracing::info;

use crate::config::Network;
use crate::core::attributor::Attribution;

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Started { network: Network, pairs: usize, equity: f64 },
    Stopped,
    Trade(Attribution),
    ConfigReloaded,
    NetworkChanged(Network),
    Paused,
    Resumed,
    OrdersCanceled(usize),
    Liquidated { pairs: usize, proceeds: f64 },
    Disconnected(String),
    Reconnected,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Started { network, pairs, equity } => write!(
                f,
                "🤖 Grid bot started on {} with {} pairs | equity {:.2}",
                network, pairs, equity
            ),
            Notification::Stopped => write!(f, "🛑 Grid bot stopped"),
            Notification::Trade(attribution) => write!(f, "{}", attribution),
            Notification::ConfigReloaded => write!(f, "⚙️ Configuration updated, new parameters applied"),
            Notification::NetworkChanged(network) => write!(f, "🔄 Network changed to {}", network),
            Notification::Paused => write!(f, "⏸️ Trading paused"),
            Notification::Resumed => write!(f, "▶️ Trading resumed"),
            Notification::OrdersCanceled(count) => write!(f, "🚨 Canceled {} open orders", count),
            Notification::Liquidated { pairs, proceeds } => {
                write!(f, "🚨 Liquidated {} pairs for {:.2}", pairs, proceeds)
            }
            Notification::Disconnected(reason) => write!(f, "🔌 Exchange disconnected: {}", reason),
            Notification::Reconnected => write!(f, "🔌 Exchange session restored"),
        }
    }
}

/// Delivery channel for operator messages. Must not block the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) {
        info!("📣 {}", notification);
    }
}
