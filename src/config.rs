// Configuration management for the grid trading engine
//
// The document holds per-pair grid settings plus several overlapping risk
// sections. Risk values are resolved with a fixed precedence, most specific first:
//
//   grid_settings.<pair>  >  advanced_trading  >  advanced_settings.risk_control  >  risk_management

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,
    pub grid_settings: BTreeMap<String, PairConfig>,
    #[serde(default)]
    pub risk_management: RiskManagementConfig,
    #[serde(default)]
    pub advanced_settings: AdvancedSettings,
    #[serde(default)]
    pub advanced_trading: AdvancedTradingConfig,
    #[serde(default)]
    pub position_management: PositionManagementConfig,
    #[serde(default)]
    pub technical_indicators: IndicatorConfig,
    #[serde(default)]
    pub market_analysis: MarketAnalysisConfig,
    #[serde(default)]
    pub ai_settings: AiSettings,
    #[serde(default)]
    pub exit_targets: ExitTargetsConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,            // Seconds between evaluation cycles
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,          // Market data fetch budget per pair
    #[serde(default = "default_candle_interval")]
    pub candle_interval_minutes: u32,
    #[serde(default = "default_history_window")]
    pub history_window: usize,          // Candles requested per cycle
    #[serde(default = "default_reprice_attempts")]
    pub max_reprice_attempts: u32,      // Re-submissions after a gateway rejection
}

/// Grid parameters for one trading pair. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairConfig {
    #[serde(default)]
    pub symbol: String,
    pub grid_count: usize,
    pub price_range_percentage: f64,
    pub investment_amount: f64,
    #[serde(default = "default_min_profit")]
    pub min_profit_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_profit_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loss_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing_stop: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing_stop_percentage: Option<f64>,
    #[serde(default = "default_grid_levels")]
    pub grid_levels: usize,             // Steps away from centre that force a recompute
    #[serde(default = "default_price_deviation")]
    pub price_deviation: f64,           // Fraction of centre price that forces a recompute
    #[serde(default = "default_leverage")]
    pub leverage: f64,
}

/// Base risk layer. Every field is concrete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskManagementConfig {
    #[serde(default = "default_max_position_size")]
    pub max_position_size: f64,         // Quote notional per pair
    #[serde(default = "default_position_size_limit")]
    pub position_size_limit: f64,       // Quote notional per order
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,      // Across all pairs
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,          // Quote amount across all pairs
    #[serde(default = "default_max_daily_drawdown")]
    pub max_daily_drawdown: f64,        // Percent
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,
    #[serde(default = "default_stop_loss")]
    pub stop_loss_percentage: f64,
    #[serde(default = "default_take_profit")]
    pub take_profit_percentage: f64,
    #[serde(default = "default_true")]
    pub trailing_stop: bool,
    #[serde(default = "default_trailing_stop")]
    pub trailing_stop_percentage: f64,
    #[serde(default = "default_true")]
    pub volatility_adjustment: bool,
    #[serde(default = "default_true")]
    pub dynamic_risk_adjustment: bool,
}

/// Optional risk values layered over `risk_management`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_position_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_size_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_leverage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_open_positions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_loss_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_daily_drawdown: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_daily_trades: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing_stop: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trailing_stop_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volatility_adjustment: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_risk_adjustment: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvancedSettings {
    #[serde(default)]
    pub risk_control: RiskOverrides,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedTradingConfig {
    #[serde(default = "default_true")]
    pub dynamic_grid_adjustment: bool,
    #[serde(default)]
    pub dynamic_position_sizing: bool,
    #[serde(flatten)]
    pub risk: RiskOverrides,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionManagementConfig {
    #[serde(default = "default_true")]
    pub position_scaling: bool,
    #[serde(default = "default_scale_in_threshold")]
    pub scale_in_threshold: f64,        // Percent retrace from the peak
    #[serde(default = "default_scale_out_threshold")]
    pub scale_out_threshold: f64,       // Percent adverse move from entry
    #[serde(default = "default_max_positions_per_symbol")]
    pub max_positions_per_symbol: usize,
    #[serde(default = "default_true")]
    pub profit_protection: bool,
    #[serde(default = "default_profit_protection_threshold")]
    pub profit_protection_threshold: f64,
    #[serde(default = "default_scale_size_ratio")]
    pub scale_size_ratio: f64,          // Fraction of the current size added/removed
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RsiSettings {
    #[serde(default = "default_rsi_period")]
    pub period: usize,
    #[serde(default = "default_rsi_overbought")]
    pub overbought: f64,
    #[serde(default = "default_rsi_oversold")]
    pub oversold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacdSettings {
    #[serde(default = "default_macd_fast")]
    pub fast_period: usize,
    #[serde(default = "default_macd_slow")]
    pub slow_period: usize,
    #[serde(default = "default_macd_signal")]
    pub signal_period: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BollingerSettings {
    #[serde(default = "default_bollinger_period")]
    pub period: usize,
    #[serde(default = "default_bollinger_std_dev")]
    pub std_dev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KdjSettings {
    #[serde(default = "default_kdj_k_period")]
    pub k_period: usize,
    #[serde(default = "default_kdj_d_period")]
    pub d_period: usize,
    #[serde(default = "default_kdj_overbought")]
    pub overbought: f64,
    #[serde(default = "default_kdj_oversold")]
    pub oversold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSettings {
    #[serde(default = "default_trend_short")]
    pub short_period: usize,
    #[serde(default = "default_trend_long")]
    pub long_period: usize,
    #[serde(default = "default_momentum_period")]
    pub momentum_period: usize,
    #[serde(default = "default_volume_window")]
    pub volume_window: usize,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default)]
    pub rsi: RsiSettings,
    #[serde(default)]
    pub macd: MacdSettings,
    #[serde(default)]
    pub bollinger: BollingerSettings,
    #[serde(default)]
    pub kdj: KdjSettings,
    #[serde(default)]
    pub trend: TrendSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketAnalysisConfig {
    #[serde(default = "default_sentiment_weight")]
    pub sentiment_weight: f64,
    #[serde(default = "default_technical_weight")]
    pub technical_weight: f64,
    #[serde(default = "default_trend_weight")]
    pub trend_weight: f64,
    #[serde(default = "default_min_confirmations")]
    pub minimum_confirmation_signals: usize,
    /// Original weight sum when the loader had to normalize
    #[serde(skip)]
    pub normalized_from: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_ai_technical_weight")]
    pub technical_weight: f64,
    #[serde(default = "default_ai_fundamental_weight")]
    pub fundamental_weight: f64,
    #[serde(default = "default_ai_sentiment_weight")]
    pub sentiment_weight: f64,
    #[serde(skip)]
    pub normalized_from: Option<f64>,
}

/// Volatility-aware stop-loss and take-profit distances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitTargetsConfig {
    #[serde(default)]
    pub atr_targets: bool,              // Derive exits from ATR instead of fixed percentages
    #[serde(default = "default_tp_atr_ratio")]
    pub take_profit_atr_ratio: f64,
    #[serde(default = "default_sl_atr_ratio")]
    pub stop_loss_atr_ratio: f64,
    #[serde(default = "default_strong_trend")]
    pub strong_trend_threshold: f64,
    #[serde(default = "default_high_volatility")]
    pub high_volatility_threshold: f64,
    #[serde(default = "default_volatility_reference")]
    pub volatility_reference_pct: f64,  // ATR percent that counts as full volatility
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_profit_alert")]
    pub profit_alert_threshold: f64,    // Percent unrealized gain
    #[serde(default = "default_loss_alert")]
    pub loss_alert_threshold: f64,      // Percent unrealized loss
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_bot_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telegram_chat_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub enable_price_logging: bool,
    #[serde(default = "default_true")]
    pub enable_signal_logging: bool,
    #[serde(default = "default_true")]
    pub enable_state_change_logging: bool,
}

/// Risk limits for one pair after precedence resolution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskLimits {
    pub max_position_size: f64,
    pub position_size_limit: f64,
    pub max_leverage: f64,
    pub max_open_positions: usize,
    pub daily_loss_limit: f64,
    pub max_daily_drawdown: f64,
    pub max_daily_trades: u32,
    pub stop_loss_percentage: f64,
    pub take_profit_percentage: f64,
    pub trailing_stop: bool,
    pub trailing_stop_percentage: f64,
    pub volatility_adjustment: bool,
    pub dynamic_risk_adjustment: bool,
    pub targets: ExitTargetsConfig,
}

/// A value replaced by a more specific layer during resolution
#[derive(Debug, Clone, PartialEq)]
pub struct OverrideNote {
    pub field: &'static str,
    pub layer: &'static str,
    pub value: String,
    pub replaced: String,
}

// Default value functions
fn default_check_interval() -> u64 { 60 }
fn default_fetch_timeout() -> u64 { 5_000 }
fn default_candle_interval() -> u32 { 60 }
fn default_history_window() -> usize { 100 }
fn default_reprice_attempts() -> u32 { 1 }
fn default_min_profit() -> f64 { 0.5 }
fn default_grid_levels() -> usize { 5 }
fn default_price_deviation() -> f64 { 0.05 }
fn default_leverage() -> f64 { 1.0 }
fn default_max_position_size() -> f64 { 100.0 }
fn default_position_size_limit() -> f64 { 20.0 }
fn default_max_leverage() -> f64 { 3.0 }
fn default_max_open_positions() -> usize { 10 }
fn default_daily_loss_limit() -> f64 { 50.0 }
fn default_max_daily_drawdown() -> f64 { 10.0 }
fn default_max_daily_trades() -> u32 { 100 }
fn default_stop_loss() -> f64 { 5.0 }
fn default_take_profit() -> f64 { 10.0 }
fn default_trailing_stop() -> f64 { 1.0 }
fn default_scale_in_threshold() -> f64 { 2.0 }
fn default_scale_out_threshold() -> f64 { 3.0 }
fn default_max_positions_per_symbol() -> usize { 3 }
fn default_profit_protection_threshold() -> f64 { 4.0 }
fn default_scale_size_ratio() -> f64 { 0.5 }
fn default_rsi_period() -> usize { 14 }
fn default_rsi_overbought() -> f64 { 70.0 }
fn default_rsi_oversold() -> f64 { 30.0 }
fn default_macd_fast() -> usize { 12 }
fn default_macd_slow() -> usize { 26 }
fn default_macd_signal() -> usize { 9 }
fn default_bollinger_period() -> usize { 20 }
fn default_bollinger_std_dev() -> f64 { 2.0 }
fn default_kdj_k_period() -> usize { 9 }
fn default_kdj_d_period() -> usize { 3 }
fn default_kdj_overbought() -> f64 { 80.0 }
fn default_kdj_oversold() -> f64 { 20.0 }
fn default_trend_short() -> usize { 10 }
fn default_trend_long() -> usize { 30 }
fn default_momentum_period() -> usize { 10 }
fn default_volume_window() -> usize { 20 }
fn default_atr_period() -> usize { 14 }
fn default_tp_atr_ratio() -> f64 { 3.0 }
fn default_sl_atr_ratio() -> f64 { 2.0 }
fn default_strong_trend() -> f64 { 0.7 }
fn default_high_volatility() -> f64 { 0.8 }
fn default_volatility_reference() -> f64 { 5.0 }
fn default_sentiment_weight() -> f64 { 0.2 }
fn default_technical_weight() -> f64 { 0.5 }
fn default_trend_weight() -> f64 { 0.3 }
fn default_min_confirmations() -> usize { 2 }
fn default_confidence_threshold() -> f64 { 0.7 }
fn default_ai_technical_weight() -> f64 { 0.4 }
fn default_ai_fundamental_weight() -> f64 { 0.3 }
fn default_ai_sentiment_weight() -> f64 { 0.3 }
fn default_profit_alert() -> f64 { 5.0 }
fn default_loss_alert() -> f64 { 3.0 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            fetch_timeout_ms: default_fetch_timeout(),
            candle_interval_minutes: default_candle_interval(),
            history_window: default_history_window(),
            max_reprice_attempts: default_reprice_attempts(),
        }
    }
}

impl Default for RiskManagementConfig {
    fn default() -> Self {
        Self {
            max_position_size: default_max_position_size(),
            position_size_limit: default_position_size_limit(),
            max_leverage: default_max_leverage(),
            max_open_positions: default_max_open_positions(),
            daily_loss_limit: default_daily_loss_limit(),
            max_daily_drawdown: default_max_daily_drawdown(),
            max_daily_trades: default_max_daily_trades(),
            stop_loss_percentage: default_stop_loss(),
            take_profit_percentage: default_take_profit(),
            trailing_stop: true,
            trailing_stop_percentage: default_trailing_stop(),
            volatility_adjustment: true,
            dynamic_risk_adjustment: true,
        }
    }
}

impl Default for AdvancedTradingConfig {
    fn default() -> Self {
        Self {
            dynamic_grid_adjustment: true,
            dynamic_position_sizing: false,
            risk: RiskOverrides::default(),
        }
    }
}

impl Default for PositionManagementConfig {
    fn default() -> Self {
        Self {
            position_scaling: true,
            scale_in_threshold: default_scale_in_threshold(),
            scale_out_threshold: default_scale_out_threshold(),
            max_positions_per_symbol: default_max_positions_per_symbol(),
            profit_protection: true,
            profit_protection_threshold: default_profit_protection_threshold(),
            scale_size_ratio: default_scale_size_ratio(),
        }
    }
}

impl Default for RsiSettings {
    fn default() -> Self {
        Self {
            period: default_rsi_period(),
            overbought: default_rsi_overbought(),
            oversold: default_rsi_oversold(),
        }
    }
}

impl Default for MacdSettings {
    fn default() -> Self {
        Self {
            fast_period: default_macd_fast(),
            slow_period: default_macd_slow(),
            signal_period: default_macd_signal(),
        }
    }
}

impl Default for BollingerSettings {
    fn default() -> Self {
        Self { period: default_bollinger_period(), std_dev: default_bollinger_std_dev() }
    }
}

impl Default for KdjSettings {
    fn default() -> Self {
        Self {
            k_period: default_kdj_k_period(),
            d_period: default_kdj_d_period(),
            overbought: default_kdj_overbought(),
            oversold: default_kdj_oversold(),
        }
    }
}

impl Default for TrendSettings {
    fn default() -> Self {
        Self {
            short_period: default_trend_short(),
            long_period: default_trend_long(),
            momentum_period: default_momentum_period(),
            volume_window: default_volume_window(),
            atr_period: default_atr_period(),
        }
    }
}

impl Default for ExitTargetsConfig {
    fn default() -> Self {
        Self {
            atr_targets: false,
            take_profit_atr_ratio: default_tp_atr_ratio(),
            stop_loss_atr_ratio: default_sl_atr_ratio(),
            strong_trend_threshold: default_strong_trend(),
            high_volatility_threshold: default_high_volatility(),
            volatility_reference_pct: default_volatility_reference(),
        }
    }
}

impl Default for MarketAnalysisConfig {
    fn default() -> Self {
        Self {
            sentiment_weight: default_sentiment_weight(),
            technical_weight: default_technical_weight(),
            trend_weight: default_trend_weight(),
            minimum_confirmation_signals: default_min_confirmations(),
            normalized_from: None,
        }
    }
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            confidence_threshold: default_confidence_threshold(),
            technical_weight: default_ai_technical_weight(),
            fundamental_weight: default_ai_fundamental_weight(),
            sentiment_weight: default_ai_sentiment_weight(),
            normalized_from: None,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            profit_alert_threshold: default_profit_alert(),
            loss_alert_threshold: default_loss_alert(),
            telegram_bot_token: None,
            telegram_chat_id: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_price_logging: true,
            enable_signal_logging: true,
            enable_state_change_logging: true,
        }
    }
}

impl PairConfig {
    pub fn new(symbol: &str, grid_count: usize, price_range_percentage: f64, investment_amount: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            grid_count,
            price_range_percentage,
            investment_amount,
            min_profit_percentage: default_min_profit(),
            max_profit_percentage: None,
            max_loss_percentage: None,
            trailing_stop: None,
            trailing_stop_percentage: None,
            grid_levels: default_grid_levels(),
            price_deviation: default_price_deviation(),
            leverage: default_leverage(),
        }
    }

    /// The per-pair fields that take part in risk precedence
    pub fn risk_overrides(&self) -> RiskOverrides {
        RiskOverrides {
            stop_loss_percentage: self.max_loss_percentage,
            take_profit_percentage: self.max_profit_percentage,
            trailing_stop: self.trailing_stop,
            trailing_stop_percentage: self.trailing_stop_percentage,
            ..RiskOverrides::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let pair = &self.symbol;
        if self.grid_count < 2 {
            return Err(ConfigError::Validation(format!("{}: grid_count must be at least 2", pair)));
        }
        if self.price_range_percentage <= 0.0 || self.price_range_percentage >= 200.0 {
            return Err(ConfigError::Validation(format!(
                "{}: price_range_percentage must be in (0, 200) so grid bounds stay positive and ordered",
                pair
            )));
        }
        if self.investment_amount <= 0.0 {
            return Err(ConfigError::Validation(format!("{}: investment_amount must be positive", pair)));
        }
        if self.min_profit_percentage < 0.0 {
            return Err(ConfigError::Validation(format!("{}: min_profit_percentage must be non-negative", pair)));
        }
        if self.price_deviation <= 0.0 || self.price_deviation >= 1.0 {
            return Err(ConfigError::Validation(format!("{}: price_deviation must be a fraction in (0, 1)", pair)));
        }
        if self.grid_levels == 0 {
            return Err(ConfigError::Validation(format!("{}: grid_levels must be greater than 0", pair)));
        }
        if self.leverage < 1.0 {
            return Err(ConfigError::Validation(format!("{}: leverage must be at least 1.0", pair)));
        }
        for (name, value) in [
            ("max_profit_percentage", self.max_profit_percentage),
            ("max_loss_percentage", self.max_loss_percentage),
            ("trailing_stop_percentage", self.trailing_stop_percentage),
        ] {
            if matches!(value, Some(v) if v <= 0.0) {
                return Err(ConfigError::Validation(format!("{}: {} must be positive", pair, name)));
            }
        }
        Ok(())
    }
}

// Applies each `Some` field of an override layer and records what it replaced
macro_rules! apply_layer {
    ($limits:ident, $layer:expr, $name:expr, $notes:ident; $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $layer.$field {
                if value != $limits.$field {
                    $notes.push(OverrideNote {
                        field: stringify!($field),
                        layer: $name,
                        value: format!("{:?}", value),
                        replaced: format!("{:?}", $limits.$field),
                    });
                }
                $limits.$field = value;
            }
        )+
    };
}

impl RiskLimits {
    fn from_base(base: &RiskManagementConfig, targets: &ExitTargetsConfig) -> Self {
        Self {
            max_position_size: base.max_position_size,
            position_size_limit: base.position_size_limit,
            max_leverage: base.max_leverage,
            max_open_positions: base.max_open_positions,
            daily_loss_limit: base.daily_loss_limit,
            max_daily_drawdown: base.max_daily_drawdown,
            max_daily_trades: base.max_daily_trades,
            stop_loss_percentage: base.stop_loss_percentage,
            take_profit_percentage: base.take_profit_percentage,
            trailing_stop: base.trailing_stop,
            trailing_stop_percentage: base.trailing_stop_percentage,
            volatility_adjustment: base.volatility_adjustment,
            dynamic_risk_adjustment: base.dynamic_risk_adjustment,
            targets: targets.clone(),
        }
    }

    fn overlay(&mut self, layer: &RiskOverrides, name: &'static str, notes: &mut Vec<OverrideNote>) {
        let limits = self;
        apply_layer!(limits, layer, name, notes;
            max_position_size,
            position_size_limit,
            max_leverage,
            max_open_positions,
            daily_loss_limit,
            max_daily_drawdown,
            max_daily_trades,
            stop_loss_percentage,
            take_profit_percentage,
            trailing_stop,
            trailing_stop_percentage,
            volatility_adjustment,
            dynamic_risk_adjustment,
        );
    }

    /// Whether entries may be shrunk instead of rejected outright
    pub fn allows_scaling(&self) -> bool {
        self.volatility_adjustment || self.dynamic_risk_adjustment
    }

    fn validate(&self, pair: &str) -> Result<(), ConfigError> {
        let positive = [
            ("max_position_size", self.max_position_size),
            ("position_size_limit", self.position_size_limit),
            ("daily_loss_limit", self.daily_loss_limit),
            ("stop_loss_percentage", self.stop_loss_percentage),
            ("take_profit_percentage", self.take_profit_percentage),
        ];
        for (name, value) in positive {
            if value <= 0.0 {
                return Err(ConfigError::Validation(format!("{}: resolved {} must be positive", pair, name)));
            }
        }
        if self.max_leverage < 1.0 {
            return Err(ConfigError::Validation(format!("{}: resolved max_leverage must be at least 1.0", pair)));
        }
        if self.max_open_positions == 0 {
            return Err(ConfigError::Validation(format!("{}: resolved max_open_positions must be greater than 0", pair)));
        }
        if self.max_daily_drawdown <= 0.0 || self.max_daily_drawdown > 100.0 {
            return Err(ConfigError::Validation(format!("{}: resolved max_daily_drawdown must be in (0, 100]", pair)));
        }
        if self.trailing_stop_percentage <= 0.0 || self.trailing_stop_percentage >= 100.0 {
            return Err(ConfigError::Validation(format!("{}: resolved trailing_stop_percentage must be in (0, 100)", pair)));
        }
        Ok(())
    }
}

impl IndicatorConfig {
    /// Minimum number of candles needed to compute every indicator
    pub fn required_history(&self) -> usize {
        [
            self.rsi.period + 1,
            self.macd.slow_period + self.macd.signal_period - 1,
            self.bollinger.period,
            self.kdj.k_period,
            self.trend.long_period,
            self.trend.momentum_period + 1,
            self.trend.volume_window * 2,
            self.trend.atr_period + 1,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("rsi.period", self.rsi.period),
            ("macd.fast_period", self.macd.fast_period),
            ("macd.slow_period", self.macd.slow_period),
            ("macd.signal_period", self.macd.signal_period),
            ("bollinger.period", self.bollinger.period),
            ("kdj.k_period", self.kdj.k_period),
            ("kdj.d_period", self.kdj.d_period),
            ("trend.short_period", self.trend.short_period),
            ("trend.long_period", self.trend.long_period),
            ("trend.momentum_period", self.trend.momentum_period),
            ("trend.volume_window", self.trend.volume_window),
            ("trend.atr_period", self.trend.atr_period),
        ];
        for (name, period) in periods {
            if period == 0 {
                return Err(ConfigError::Validation(format!("technical_indicators.{} must be greater than 0", name)));
            }
        }
        if self.macd.fast_period >= self.macd.slow_period {
            return Err(ConfigError::Validation("macd.fast_period must be below macd.slow_period".to_string()));
        }
        if self.trend.short_period >= self.trend.long_period {
            return Err(ConfigError::Validation("trend.short_period must be below trend.long_period".to_string()));
        }
        if self.rsi.oversold >= self.rsi.overbought {
            return Err(ConfigError::Validation("rsi.oversold must be below rsi.overbought".to_string()));
        }
        if self.kdj.oversold >= self.kdj.overbought {
            return Err(ConfigError::Validation("kdj.oversold must be below kdj.overbought".to_string()));
        }
        if self.bollinger.std_dev <= 0.0 {
            return Err(ConfigError::Validation("bollinger.std_dev must be positive".to_string()));
        }
        Ok(())
    }
}

/// Rescales non-negative weights to sum to 1. Returns the original sum when it changed anything.
fn normalize_weights(section: &str, weights: &mut [&mut f64]) -> Result<Option<f64>, ConfigError> {
    if weights.iter().any(|w| **w < 0.0 || !w.is_finite()) {
        return Err(ConfigError::Validation(format!("{} weights must be non-negative", section)));
    }
    let sum: f64 = weights.iter().map(|w| **w).sum();
    if sum <= 0.0 {
        return Err(ConfigError::Validation(format!("{} weights must not all be zero", section)));
    }
    if (sum - 1.0).abs() <= WEIGHT_TOLERANCE {
        return Ok(None);
    }
    for weight in weights.iter_mut() {
        **weight /= sum;
    }
    Ok(Some(sum))
}

impl ExitTargetsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("take_profit_atr_ratio", self.take_profit_atr_ratio),
            ("stop_loss_atr_ratio", self.stop_loss_atr_ratio),
            ("volatility_reference_pct", self.volatility_reference_pct),
        ];
        for (name, value) in positive {
            if value <= 0.0 {
                return Err(ConfigError::Validation(format!("exit_targets.{} must be positive", name)));
            }
        }
        for (name, value) in [
            ("strong_trend_threshold", self.strong_trend_threshold),
            ("high_volatility_threshold", self.high_volatility_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Validation(format!("exit_targets.{} must be in [0, 1]", name)));
            }
        }
        Ok(())
    }
}

impl MarketAnalysisConfig {
    pub fn weight_sum(&self) -> f64 {
        self.sentiment_weight + self.technical_weight + self.trend_weight
    }

    fn normalize(&mut self) -> Result<(), ConfigError> {
        let original = normalize_weights(
            "market_analysis",
            &mut [&mut self.sentiment_weight, &mut self.technical_weight, &mut self.trend_weight],
        )?;
        if original.is_some() {
            self.normalized_from = original;
        }
        Ok(())
    }
}

impl AiSettings {
    fn normalize(&mut self) -> Result<(), ConfigError> {
        let original = normalize_weights(
            "ai_settings",
            &mut [&mut self.technical_weight, &mut self.fundamental_weight, &mut self.sentiment_weight],
        )?;
        if original.is_some() {
            self.normalized_from = original;
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut grid_settings = BTreeMap::new();
        let mut btc = PairConfig::new("BTC/USDT", 15, 15.0, 60.0);
        btc.trailing_stop = Some(true);
        btc.trailing_stop_percentage = Some(1.0);
        btc.max_loss_percentage = Some(5.0);
        btc.max_profit_percentage = Some(10.0);
        grid_settings.insert(btc.symbol.clone(), btc);

        let mut eth = PairConfig::new("ETH/USDT", 10, 12.0, 40.0);
        eth.trailing_stop_percentage = Some(1.5);
        grid_settings.insert(eth.symbol.clone(), eth);

        Self {
            engine: EngineSettings::default(),
            grid_settings,
            risk_management: RiskManagementConfig::default(),
            advanced_settings: AdvancedSettings::default(),
            advanced_trading: AdvancedTradingConfig::default(),
            position_management: PositionManagementConfig::default(),
            technical_indicators: IndicatorConfig::default(),
            market_analysis: MarketAnalysisConfig::default(),
            ai_settings: AiSettings::default(),
            exit_targets: ExitTargetsConfig::default(),
            notification: NotificationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, or JSON when the extension is `.json`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(format!("{}: {}", path.display(), e)))?;

        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.prepare()
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.prepare()
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::FileWrite(e.to_string()))?;

        Ok(())
    }

    /// Load configuration from file, or create default if file doesn't exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            let config = Self::default().prepare()?;
            config.to_file(&path)?;
            info!("📁 Created default config file: {}", path.as_ref().display());
            Ok(config)
        }
    }

    /// Fill symbols from map keys, validate, then normalize weights.
    /// Idempotent, so reloaded documents go through the same path.
    pub fn prepare(mut self) -> Result<Self, ConfigError> {
        for (key, pair) in self.grid_settings.iter_mut() {
            if pair.symbol.is_empty() {
                pair.symbol = key.clone();
            } else if pair.symbol != *key {
                return Err(ConfigError::Validation(format!(
                    "grid_settings key '{}' does not match symbol '{}'",
                    key, pair.symbol
                )));
            }
        }
        self.validate()?;
        self.market_analysis.normalize()?;
        self.ai_settings.normalize()?;
        Ok(self)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid_settings.is_empty() {
            return Err(ConfigError::Validation("grid_settings must define at least one pair".to_string()));
        }
        if self.engine.check_interval == 0 {
            return Err(ConfigError::Validation("engine.check_interval must be greater than 0".to_string()));
        }
        if self.engine.fetch_timeout_ms == 0 {
            return Err(ConfigError::Validation("engine.fetch_timeout_ms must be greater than 0".to_string()));
        }

        self.technical_indicators.validate()?;
        self.exit_targets.validate()?;
        let required = self.technical_indicators.required_history();
        if self.engine.history_window < required {
            return Err(ConfigError::Validation(format!(
                "engine.history_window ({}) is shorter than the {} candles the indicators need",
                self.engine.history_window, required
            )));
        }

        for pair in self.grid_settings.values() {
            pair.validate()?;
            let limits = self.risk_limits_for(pair);
            limits.validate(&pair.symbol)?;
            if pair.leverage > limits.max_leverage {
                return Err(ConfigError::Validation(format!(
                    "{}: leverage {} exceeds resolved max_leverage {}",
                    pair.symbol, pair.leverage, limits.max_leverage
                )));
            }
        }

        let confirmations = self.market_analysis.minimum_confirmation_signals;
        if confirmations == 0 || confirmations > 4 {
            return Err(ConfigError::Validation(
                "market_analysis.minimum_confirmation_signals must be between 1 and 4".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.ai_settings.confidence_threshold) {
            return Err(ConfigError::Validation("ai_settings.confidence_threshold must be in [0, 1]".to_string()));
        }

        let pm = &self.position_management;
        if pm.scale_in_threshold <= 0.0 || pm.scale_out_threshold <= 0.0 || pm.profit_protection_threshold <= 0.0 {
            return Err(ConfigError::Validation("position_management thresholds must be positive".to_string()));
        }
        if pm.scale_size_ratio <= 0.0 || pm.scale_size_ratio > 1.0 {
            return Err(ConfigError::Validation("position_management.scale_size_ratio must be in (0, 1]".to_string()));
        }
        if pm.max_positions_per_symbol == 0 {
            return Err(ConfigError::Validation(
                "position_management.max_positions_per_symbol must be greater than 0".to_string(),
            ));
        }

        let notify = &self.notification;
        if notify.profit_alert_threshold <= 0.0 || notify.loss_alert_threshold <= 0.0 {
            return Err(ConfigError::Validation("notification alert thresholds must be positive".to_string()));
        }

        Ok(())
    }

    pub fn pair(&self, symbol: &str) -> Option<&PairConfig> {
        self.grid_settings.get(symbol)
    }

    pub fn pairs(&self) -> impl Iterator<Item = &PairConfig> {
        self.grid_settings.values()
    }

    /// Resolve risk limits for a pair, most specific layer winning
    pub fn risk_limits_for(&self, pair: &PairConfig) -> RiskLimits {
        self.resolve_risk(pair).0
    }

    /// Same as `risk_limits_for`, also reporting every value a layer replaced
    pub fn resolve_risk(&self, pair: &PairConfig) -> (RiskLimits, Vec<OverrideNote>) {
        let mut notes = Vec::new();
        let mut limits = RiskLimits::from_base(&self.risk_management, &self.exit_targets);
        limits.overlay(&self.advanced_settings.risk_control, "advanced_settings.risk_control", &mut notes);
        limits.overlay(&self.advanced_trading.risk, "advanced_trading", &mut notes);
        limits.overlay(&pair.risk_overrides(), "grid_settings", &mut notes);
        (limits, notes)
    }
}

/// Shared, swappable configuration reference.
///
/// Cycles clone the inner `Arc` when they start, so a reload never changes the
/// settings a cycle is already running with.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self { inner: Arc::new(RwLock::new(Arc::new(config))) }
    }

    pub fn current(&self) -> Arc<Config> {
        let guard = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Validate and atomically install a new configuration
    pub fn replace(&self, config: Config) -> Result<Arc<Config>, ConfigError> {
        let prepared = Arc::new(config.prepare()?);
        let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::clone(&prepared);
        Ok(prepared)
    }
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
