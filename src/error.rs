//! Unified error type for the grid engine.
//!
//! Gateway failures stay as [`GatewayError`] values inside a cycle; this
//! type is what crosses module boundaries and reaches the CLI.

use std::fmt;
use std::io;

use crate::config::ConfigError;
use crate::exchange::GatewayError;

#[derive(Debug)]
pub enum BotError {
    // Configuration
    ConfigNotFound(String),
    Config(String),

    // Persistence
    Database(String),
    DatabaseConstraint(String),

    // Exchange session
    Gateway(GatewayError),
    Disconnected(String),

    // Lifecycle
    AlreadyRunning,
    NotRunning,
    UnknownPair(String),
    AccountUnreachable(String),

    // IO
    Io(String),
    Serialization(String),

    Internal(String),
}

impl BotError {
    /// Message with a hint for the operator
    pub fn user_message(&self) -> String {
        match self {
            BotError::ConfigNotFound(path) => {
                format!(
                    "Configuration file not found: {}\n\n\
                    💡 Quick fix:\n\
                    1. Run: grid-bot init\n\
                    2. Edit config.toml with your pairs\n\
                    3. Try again",
                    path
                )
            }
            BotError::Config(msg) => {
                format!(
                    "Configuration error: {}\n\n\
                    💡 Check config.toml for:\n\
                    - grid_count of at least 2\n\
                    - spread_pct between 0 and 50\n\
                    - positive stake_per_level",
                    msg
                )
            }
            BotError::Database(msg) => {
                format!(
                    "Database error: {}\n\n\
                    💡 Try:\n\
                    1. Check the data/ directory permissions\n\
                    2. Ensure disk space is available",
                    msg
                )
            }
            BotError::Disconnected(msg) => {
                format!(
                    "Exchange session unavailable: {}\n\n\
                    💡 The bot stays up and reconnects on the next cycle.\n\
                    Check the network setting in config.toml",
                    msg
                )
            }
            BotError::Gateway(GatewayError::Authentication(msg)) => {
                format!(
                    "Exchange authentication failed: {}\n\n\
                    💡 Check that the configured network has a connector",
                    msg
                )
            }
            BotError::AccountUnreachable(msg) => {
                format!(
                    "Trading account not reachable: {}\n\n\
                    💡 The paper venue only lives inside the `grid-bot run` process,\n\
                    so orders and balances cannot be changed from another command",
                    msg
                )
            }
            _ => self.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            BotError::Gateway(err) => err.is_transient(),
            BotError::Disconnected(_) => true,
            _ => false,
        }
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            BotError::ConfigNotFound(_) | BotError::Config(_) => "config",
            BotError::Database(_) | BotError::DatabaseConstraint(_) => "database",
            BotError::Gateway(_) | BotError::Disconnected(_) => "exchange",
            BotError::AlreadyRunning
            | BotError::NotRunning
            | BotError::UnknownPair(_)
            | BotError::AccountUnreachable(_) => "engine",
            BotError::Io(_) | BotError::Serialization(_) => "io",
            BotError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for BotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotError::ConfigNotFound(path) => write!(f, "Configuration file not found: {}", path),
            BotError::Config(msg) => write!(f, "Configuration error: {}", msg),
            BotError::Database(msg) => write!(f, "Database error: {}", msg),
            BotError::DatabaseConstraint(msg) => write!(f, "Database constraint violation: {}", msg),
            BotError::Gateway(err) => write!(f, "{}", err),
            BotError::Disconnected(msg) => write!(f, "Not connected: {}", msg),
            BotError::AlreadyRunning => write!(f, "Engine is already running"),
            BotError::NotRunning => write!(f, "Engine is not running"),
            BotError::UnknownPair(pair) => write!(f, "Pair is not configured: {}", pair),
            BotError::AccountUnreachable(msg) => write!(f, "Trading account not reachable: {}", msg),
            BotError::Io(msg) => write!(f, "IO error: {}", msg),
            BotError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            BotError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for BotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BotError::Gateway(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for BotError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => BotError::ConfigNotFound(err.to_string()),
            _ => BotError::Io(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for BotError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("constraint") => {
                BotError::DatabaseConstraint(msg)
            }
            rusqlite::Error::SqliteFailure(_, Some(msg)) => BotError::Database(msg),
            _ => BotError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<GatewayError> for BotError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Disconnected(msg) => BotError::Disconnected(msg),
            other => BotError::Gateway(other),
        }
    }
}

impl From<ConfigError> for BotError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::FileRead(msg) if msg.contains("No such file") => BotError::ConfigNotFound(msg),
            other => BotError::Config(other.to_string()),
        }
    }
}

impl From<String> for BotError {
    fn from(msg: String) -> Self {
        BotError::Internal(msg)
    }
}

impl From<&str> for BotError {
    fn from(msg: &str) -> Self {
        BotError::Internal(msg.to_string())
    }
}

pub type BotResult<T> = Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category() {
        assert_eq!(BotError::Config("test".to_string()).category(), "config");
        assert_eq!(BotError::Database("test".to_string()).category(), "database");
        assert_eq!(BotError::from(GatewayError::Timeout("ticker".into())).category(), "exchange");
        assert_eq!(BotError::AlreadyRunning.category(), "engine");
        assert_eq!(BotError::AccountUnreachable("paper".to_string()).category(), "engine");
    }

    #[test]
    fn test_retryable() {
        assert!(BotError::from(GatewayError::RateLimited("slow down".into())).is_retryable());
        assert!(BotError::from(GatewayError::Disconnected("gone".into())).is_retryable());
        assert!(!BotError::Config("bad".into()).is_retryable());
    }

    #[test]
    fn test_disconnected_conversion() {
        let err: BotError = GatewayError::Disconnected("socket closed".into()).into();
        assert!(matches!(err, BotError::Disconnected(_)));
    }

    #[test]
    fn test_user_message() {
        let msg = BotError::ConfigNotFound("config.toml".to_string()).user_message();
        assert!(msg.contains("grid-bot init"));
        assert!(msg.contains("💡"));
    }

    #[test]
    fn test_rusqlite_conversion() {
        let err: BotError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, BotError::Database(_)));
    }
}
