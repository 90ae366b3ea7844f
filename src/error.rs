//! Error handling for the grid trading engine
//!
//! Module-level errors (`ConfigError`, `MarketDataError`, `GatewayError`,
//! `NotifyError`) convert into the crate-wide `TradingError`, which carries the
//! helpers the orchestrator and CLI use to decide whether to skip, retry or abort.

use std::io;

use crate::clients::{GatewayError, MarketDataError, NotifyError};
use crate::config::ConfigError;

/// Main error type for the grid trading engine
#[derive(Debug, thiserror::Error)]
pub enum TradingError {
    // Configuration errors (fatal at load)
    #[error("Configuration file not found: {0}")]
    ConfigNotFound(String),
    #[error("Configuration parse error: {0}")]
    ConfigParse(String),
    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),
    #[error("Invalid grid configuration: {0}")]
    InvalidGridConfig(String),

    // Per-pair, per-cycle recoverable
    #[error("Insufficient history: {required} candles required, {available} available")]
    InsufficientHistory { required: usize, available: usize },
    #[error("Market data unavailable: {0}")]
    MarketDataUnavailable(String),
    #[error("Market data timeout: {0}")]
    MarketDataTimeout(String),
    #[error("Stale market data: {0}")]
    StaleMarketData(String),

    // Control signals and execution
    #[error("Risk limit breached: {0}")]
    RiskLimitBreach(String),
    #[error("Execution failure: {0}")]
    ExecutionFailure(String),
    #[error("Position error: {0}")]
    PositionError(String),
    #[error("Unknown pair: {0}")]
    UnknownPair(String),

    #[error("Notification failed: {0}")]
    NotificationFailed(String),

    // IO errors
    #[error("File read error: {0}")]
    FileRead(String),
    #[error("File write error: {0}")]
    FileWrite(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TradingError {
    /// Get a user-friendly error message with helpful context
    pub fn user_message(&self) -> String {
        match self {
            TradingError::ConfigNotFound(path) => {
                format!(
                    "Configuration file not found: {}\n\n\
                    💡 Quick fix:\n\
                    1. Run: grid-bot init\n\
                    2. Edit the grid_settings section for your pairs\n\
                    3. Try again",
                    path
                )
            }
            TradingError::ConfigValidation(msg) => {
                format!(
                    "Configuration validation error: {}\n\n\
                    💡 Run: grid-bot validate\n\
                    It lists every failing check and every overridden risk value",
                    msg
                )
            }
            TradingError::InsufficientHistory { required, available } => {
                format!(
                    "Not enough candles to evaluate indicators\n\
                    Required: {}\n\
                    Available: {}\n\n\
                    💡 Increase engine.history_window or shorten indicator periods",
                    required, available
                )
            }
            TradingError::RiskLimitBreach(msg) => {
                format!(
                    "Risk limit breached: {}\n\n\
                    💡 New entries stay blocked until the daily reset\n\
                    Exits and protective stops keep running",
                    msg
                )
            }
            _ => self.to_string(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TradingError::MarketDataTimeout(_)
                | TradingError::MarketDataUnavailable(_)
                | TradingError::StaleMarketData(_)
                | TradingError::InsufficientHistory { .. }
                | TradingError::ExecutionFailure(_)
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TradingError::ConfigNotFound(_)
            | TradingError::ConfigParse(_)
            | TradingError::ConfigValidation(_)
            | TradingError::InvalidGridConfig(_) => "config",

            TradingError::InsufficientHistory { .. }
            | TradingError::MarketDataUnavailable(_)
            | TradingError::MarketDataTimeout(_)
            | TradingError::StaleMarketData(_) => "market_data",

            TradingError::RiskLimitBreach(_) => "risk",

            TradingError::ExecutionFailure(_)
            | TradingError::PositionError(_)
            | TradingError::UnknownPair(_) => "trading",

            TradingError::NotificationFailed(_) => "notification",

            TradingError::FileRead(_) | TradingError::FileWrite(_) => "io",

            TradingError::Internal(_) => "internal",
        }
    }
}

// Conversion implementations for common error types

impl From<io::Error> for TradingError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => TradingError::ConfigNotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => TradingError::FileRead(err.to_string()),
            _ => TradingError::Internal(format!("IO error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for TradingError {
    fn from(err: serde_json::Error) -> Self {
        TradingError::ConfigParse(format!("JSON parse error: {}", err))
    }
}

impl From<toml::de::Error> for TradingError {
    fn from(err: toml::de::Error) -> Self {
        TradingError::ConfigParse(format!("TOML parse error: {}", err))
    }
}

impl From<reqwest::Error> for TradingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TradingError::MarketDataTimeout(err.to_string())
        } else {
            TradingError::MarketDataUnavailable(err.to_string())
        }
    }
}

impl From<ConfigError> for TradingError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::FileRead(msg) => TradingError::ConfigNotFound(msg),
            ConfigError::FileWrite(msg) => TradingError::FileWrite(msg),
            ConfigError::Parse(msg) => TradingError::ConfigParse(msg),
            ConfigError::Serialize(msg) => TradingError::Internal(msg),
            ConfigError::Validation(msg) => TradingError::ConfigValidation(msg),
        }
    }
}

impl From<MarketDataError> for TradingError {
    fn from(err: MarketDataError) -> Self {
        match err {
            MarketDataError::Timeout(msg) => TradingError::MarketDataTimeout(msg),
            MarketDataError::Stale { .. } => TradingError::StaleMarketData(err.to_string()),
            MarketDataError::UnknownPair(pair) => TradingError::UnknownPair(pair),
            MarketDataError::Unavailable(msg) => TradingError::MarketDataUnavailable(msg),
        }
    }
}

impl From<GatewayError> for TradingError {
    fn from(err: GatewayError) -> Self {
        TradingError::ExecutionFailure(err.to_string())
    }
}

impl From<NotifyError> for TradingError {
    fn from(err: NotifyError) -> Self {
        TradingError::NotificationFailed(err.to_string())
    }
}

impl From<String> for TradingError {
    fn from(msg: String) -> Self {
        TradingError::Internal(msg)
    }
}

/// Result type alias using TradingError
pub type TradingResult<T> = Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TradingError::ConfigNotFound("config.toml".to_string());
        assert!(err.to_string().contains("config.toml"));

        let err = TradingError::InsufficientHistory { required: 40, available: 12 };
        assert_eq!(err.to_string(), "Insufficient history: 40 candles required, 12 available");
    }

    #[test]
    fn test_error_category() {
        assert_eq!(TradingError::ConfigValidation("x".into()).category(), "config");
        assert_eq!(TradingError::MarketDataTimeout("x".into()).category(), "market_data");
        assert_eq!(TradingError::RiskLimitBreach("x".into()).category(), "risk");
        assert_eq!(TradingError::ExecutionFailure("x".into()).category(), "trading");
    }

    #[test]
    fn test_retryable() {
        assert!(TradingError::MarketDataTimeout("slow".into()).is_retryable());
        assert!(TradingError::InsufficientHistory { required: 2, available: 1 }.is_retryable());
        assert!(!TradingError::ConfigNotFound("missing".into()).is_retryable());
        assert!(!TradingError::InvalidGridConfig("bad".into()).is_retryable());
    }

    #[test]
    fn test_user_message() {
        let msg = TradingError::InsufficientHistory { required: 40, available: 12 }.user_message();
        assert!(msg.contains("40"));
        assert!(msg.contains("💡"));
    }

    #[test]
    fn test_config_error_conversion() {
        let err: TradingError = ConfigError::Validation("grid_count".to_string()).into();
        assert!(matches!(err, TradingError::ConfigValidation(_)));
    }

    #[test]
    fn test_market_data_conversion() {
        let err: TradingError = MarketDataError::Timeout("BTC/USDT".to_string()).into();
        assert!(matches!(err, TradingError::MarketDataTimeout(_)));
    }
}
