// Grid Trading Decision Engine
//
// Turns market data and a layered configuration into risk-gated grid orders,
// with dynamic grid recentring, position scaling and daily risk limits

pub mod core;
pub mod clients;
pub mod config;
pub mod error;       // Unified error handling
pub mod validation;  // Pre-flight validation

// Re-export engine types
pub use core::{
    Alert, Collaborators, CycleReport, Direction, EngineSnapshot, GridEngine, GridPlanner, GridSnapshot,
    OrderIntent, OrderReason, OrderResult, RiskLevel, Signal,
};

// Re-export error types
pub use error::{TradingError, TradingResult};

// Re-export validation types
pub use validation::{PreFlightValidator, ValidationResult, ValidationCheck, ValidationLevel};

// Re-export client types
pub use clients::{ExecutionGateway, KrakenMarketData, MarketDataSource, NotificationSink, PaperGateway, PaperSettings};

// Re-export configuration
pub use config::{Config, ConfigError, ConfigHandle, PairConfig, RiskLimits};
