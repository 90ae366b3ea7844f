// Common test utilities and helpers: scripted collaborators and candle builders
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use grid_trading_engine::clients::{
    ExecutionGateway, GatewayError, MarketDataError, MarketDataSource, NotificationSink, NotifyError,
};
use grid_trading_engine::config::LoggingConfig;
use grid_trading_engine::core::{Alert, Candle, ConfidenceProvider, FixedClock, NoConfidence, OrderIntent, OrderResult};
use grid_trading_engine::{Collaborators, Config, GridEngine};

pub const BTC: &str = "BTC/USDT";
pub const ETH: &str = "ETH/USDT";

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Default configuration with BTC/USDT only and quiet per-cycle logging
pub fn create_test_config() -> Config {
    let mut config = Config::default();
    config.grid_settings.remove(ETH);
    config.logging = LoggingConfig {
        log_level: "warn".to_string(),
        enable_price_logging: false,
        enable_signal_logging: false,
        enable_state_change_logging: false,
    };
    config
}

/// Both default pairs, quiet logging
pub fn create_two_pair_config() -> Config {
    let mut config = Config::default();
    config.logging = create_test_config().logging;
    config
}

/// Constant candles: every indicator abstains, so the signal is neutral
pub fn flat_candles(price: f64, count: usize, end: DateTime<Utc>) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let timestamp = end - Duration::hours((count - 1 - i) as i64);
            Candle::new(timestamp, price, price, price, price, 10.0)
        })
        .collect()
}

/// Candles moving by `step` per hour and ending at `last`
pub fn trending_candles(last: f64, step: f64, count: usize, end: DateTime<Utc>) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let back = (count - 1 - i) as f64;
            let close = last - step * back;
            let open = close - step;
            let timestamp = end - Duration::hours(back as i64);
            Candle::new(timestamp, open, open.max(close), open.min(close), close, 10.0)
        })
        .collect()
}

/// Market data with per-pair prices, scripted price sequences, failures and delays
#[derive(Default)]
pub struct ScriptedMarket {
    prices: Mutex<HashMap<String, f64>>,
    queued: Mutex<HashMap<String, VecDeque<f64>>>,
    candles: Mutex<HashMap<String, Vec<Candle>>>,
    failures: Mutex<HashMap<String, MarketDataError>>,
    delays: Mutex<HashMap<String, std::time::Duration>>,
}

impl ScriptedMarket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, pair: &str, price: f64) {
        self.prices.lock().unwrap().insert(pair.to_string(), price);
    }

    /// Prices returned by the next `get_current_price` calls, before falling back to `set_price`
    pub fn queue_prices(&self, pair: &str, prices: &[f64]) {
        self.queued
            .lock()
            .unwrap()
            .entry(pair.to_string())
            .or_default()
            .extend(prices.iter().copied());
    }

    pub fn set_candles(&self, pair: &str, candles: Vec<Candle>) {
        self.candles.lock().unwrap().insert(pair.to_string(), candles);
    }

    pub fn fail(&self, pair: &str, error: MarketDataError) {
        self.failures.lock().unwrap().insert(pair.to_string(), error);
    }

    pub fn recover(&self, pair: &str) {
        self.failures.lock().unwrap().remove(pair);
    }

    pub fn delay(&self, pair: &str, delay: std::time::Duration) {
        self.delays.lock().unwrap().insert(pair.to_string(), delay);
    }

    fn check(&self, pair: &str) -> Result<Option<std::time::Duration>, MarketDataError> {
        if let Some(error) = self.failures.lock().unwrap().get(pair) {
            return Err(error.clone());
        }
        Ok(self.delays.lock().unwrap().get(pair).copied())
    }

    fn price(&self, pair: &str) -> Result<f64, MarketDataError> {
        self.prices
            .lock()
            .unwrap()
            .get(pair)
            .copied()
            .ok_or_else(|| MarketDataError::UnknownPair(pair.to_string()))
    }
}

#[async_trait]
impl MarketDataSource for ScriptedMarket {
    async fn get_candles(&self, pair: &str, window: usize) -> Result<Vec<Candle>, MarketDataError> {
        if let Some(delay) = self.check(pair)? {
            tokio::time::sleep(delay).await;
        }
        if let Some(candles) = self.candles.lock().unwrap().get(pair) {
            return Ok(candles.clone());
        }
        Ok(flat_candles(self.price(pair)?, window, start_time()))
    }

    async fn get_current_price(&self, pair: &str) -> Result<f64, MarketDataError> {
        self.check(pair)?;
        if let Some(price) = self.queued.lock().unwrap().get_mut(pair).and_then(VecDeque::pop_front) {
            return Ok(price);
        }
        self.price(pair)
    }
}

/// Fills everything at the intent price unless a scripted response is queued.
/// Status polls stay pending until a status response is queued.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Result<OrderResult, GatewayError>>>,
    status_script: Mutex<VecDeque<Result<OrderResult, GatewayError>>>,
    submitted: Mutex<Vec<OrderIntent>>,
    polled: Mutex<Vec<uuid::Uuid>>,
    cancelled: Mutex<Vec<uuid::Uuid>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: Result<OrderResult, GatewayError>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn push_status(&self, response: Result<OrderResult, GatewayError>) {
        self.status_script.lock().unwrap().push_back(response);
    }

    pub fn submitted(&self) -> Vec<OrderIntent> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn polled(&self) -> Vec<uuid::Uuid> {
        self.polled.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<uuid::Uuid> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionGateway for ScriptedGateway {
    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderResult, GatewayError> {
        self.submitted.lock().unwrap().push(intent.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(OrderResult::filled(intent.price, intent.quantity)),
        }
    }

    async fn order_status(&self, intent: &OrderIntent) -> Result<OrderResult, GatewayError> {
        self.polled.lock().unwrap().push(intent.id);
        match self.status_script.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(OrderResult::pending()),
        }
    }

    async fn cancel_order(&self, intent: &OrderIntent) -> Result<OrderResult, GatewayError> {
        self.cancelled.lock().unwrap().push(intent.id);
        Ok(OrderResult::cancelled())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Scripted collaborators wired around a fixed clock
pub struct Harness {
    pub market: Arc<ScriptedMarket>,
    pub gateway: Arc<ScriptedGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<FixedClock>,
    pub confidence: Arc<dyn ConfidenceProvider>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            market: Arc::new(ScriptedMarket::new()),
            gateway: Arc::new(ScriptedGateway::new()),
            notifier: Arc::new(RecordingNotifier::default()),
            clock: Arc::new(FixedClock::new(start_time())),
            confidence: Arc::new(NoConfidence),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            market_data: self.market.clone(),
            gateway: self.gateway.clone(),
            notifier: self.notifier.clone(),
            confidence: Arc::clone(&self.confidence),
            clock: self.clock.clone(),
        }
    }

    pub fn engine(&self, config: Config) -> GridEngine {
        GridEngine::new(config, self.collaborators()).expect("valid test configuration")
    }
}
