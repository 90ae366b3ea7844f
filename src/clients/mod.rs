// Collaborator interfaces consumed by the engine and their reference adapters

use async_trait::async_trait;

use crate::core::monitoring::Alert;
use crate::core::types::{Candle, OrderIntent, OrderResult};

pub mod kraken;
pub mod notify;
pub mod paper;

pub use kraken::{normalize_pair_name, KrakenMarketData};
pub use notify::{LogNotifier, TelegramNotifier};
pub use paper::{PaperGateway, PaperSettings};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MarketDataError {
    #[error("market data unavailable: {0}")]
    Unavailable(String),

    #[error("stale market data for {pair}: last candle {age_secs}s old")]
    Stale { pair: String, age_secs: i64 },

    #[error("market data request timed out: {0}")]
    Timeout(String),

    #[error("unknown trading pair: {0}")]
    UnknownPair(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("order not known to the venue: {0}")]
    UnknownOrder(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NotifyError {
    #[error("notification transport error: {0}")]
    Transport(String),

    #[error("notification sink not configured: {0}")]
    NotConfigured(String),
}

/// Source of candles and last-trade prices
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Most recent `window` candles, oldest first
    async fn get_candles(&self, pair: &str, window: usize) -> Result<Vec<Candle>, MarketDataError>;

    async fn get_current_price(&self, pair: &str) -> Result<f64, MarketDataError>;
}

/// Places orders. Ownership of the intent passes to the gateway on submission.
///
/// A `Pending` result leaves the order resting at the venue; the engine polls it
/// with `order_status` until it reports a final state, or withdraws it with
/// `cancel_order`. Both report the executed quantity, so a cancel that races a
/// fill still returns the fill.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderResult, GatewayError>;

    async fn order_status(&self, intent: &OrderIntent) -> Result<OrderResult, GatewayError>;

    async fn cancel_order(&self, intent: &OrderIntent) -> Result<OrderResult, GatewayError>;
}

/// Delivery of alert events. Failures are logged by the caller and never retried.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}
