// Alert events, edge-triggered P&L alerts and fire-and-forget dispatch

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::clients::NotificationSink;
use crate::core::position_manager::Position;
use crate::core::types::PositionKey;

const MAX_ALERT_HISTORY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    ProfitThreshold,
    LossThreshold,
    RiskWarning,
    RiskBreach,
    ExecutionFailure,
    TradeExecuted,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AlertKind::ProfitThreshold => "profit alert",
            AlertKind::LossThreshold => "loss alert",
            AlertKind::RiskWarning => "risk warning",
            AlertKind::RiskBreach => "risk breach",
            AlertKind::ExecutionFailure => "execution failure",
            AlertKind::TradeExecuted => "trade",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertContext {
    pub daily_pnl: f64,
    pub drawdown_pct: f64,
    pub open_positions: usize,
    pub risk_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub pair: Option<String>,
    pub message: String,
    pub context: AlertContext,
}

impl Alert {
    pub fn new(
        timestamp: DateTime<Utc>,
        level: AlertLevel,
        kind: AlertKind,
        pair: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            level,
            kind,
            pair: pair.map(str::to_string),
            message: message.into(),
            context: AlertContext::default(),
        }
    }

    pub fn with_context(mut self, context: AlertContext) -> Self {
        self.context = context;
        self
    }

    /// One-line rendering used by log and chat sinks
    pub fn headline(&self) -> String {
        let icon = match self.level {
            AlertLevel::Info => "ℹ️",
            AlertLevel::Warning => "⚠️",
            AlertLevel::Critical => "🚨",
            AlertLevel::Emergency => "🛑",
        };
        match &self.pair {
            Some(pair) => format!("{} [{}] {}: {}", icon, pair, self.kind, self.message),
            None => format!("{} {}: {}", icon, self.kind, self.message),
        }
    }
}

/// Records alerts and hands them to the sink without waiting on delivery
#[derive(Clone)]
pub struct AlertDispatcher {
    sink: Arc<dyn NotificationSink>,
    history: Arc<Mutex<VecDeque<Alert>>>,
}

impl AlertDispatcher {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink, history: Arc::new(Mutex::new(VecDeque::new())) }
    }

    pub fn dispatch(&self, alert: Alert) {
        {
            let mut history = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            history.push_back(alert.clone());
            if history.len() > MAX_ALERT_HISTORY {
                history.pop_front();
            }
        }

        match alert.level {
            AlertLevel::Emergency | AlertLevel::Critical => error!("{}", alert.headline()),
            AlertLevel::Warning => warn!("{}", alert.headline()),
            AlertLevel::Info => info!("{}", alert.headline()),
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, alert not delivered: {}", alert.message);
            return;
        };
        let sink = Arc::clone(&self.sink);
        handle.spawn(async move {
            if let Err(e) = sink.notify(&alert).await {
                warn!("Notification delivery failed: {}", e);
            }
        });
    }

    pub fn history(&self) -> Vec<Alert> {
        let history = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        history.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PnlZone {
    Inside,
    AboveProfit,
    BelowLoss,
}

/// Fires once when a position crosses a P&L threshold, again only after it re-enters the band
#[derive(Debug, Default)]
pub struct PnlAlertTracker {
    zones: HashMap<PositionKey, PnlZone>,
}

impl PnlAlertTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(
        &mut self,
        position: &Position,
        price: f64,
        profit_threshold_pct: f64,
        loss_threshold_pct: f64,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let gain = position.gain_pct_at(price);
        let zone = if gain >= profit_threshold_pct {
            PnlZone::AboveProfit
        } else if -gain >= loss_threshold_pct {
            PnlZone::BelowLoss
        } else {
            PnlZone::Inside
        };

        let previous = self.zones.insert(position.key.clone(), zone).unwrap_or(PnlZone::Inside);
        if previous == zone {
            return None;
        }

        let pair = Some(position.key.pair.as_str());
        match zone {
            PnlZone::AboveProfit => Some(Alert::new(
                now,
                AlertLevel::Info,
                AlertKind::ProfitThreshold,
                pair,
                format!("{} up {:.2}% at {:.4} (entry {:.4})", position.key, gain, price, position.entry_price),
            )),
            PnlZone::BelowLoss => Some(Alert::new(
                now,
                AlertLevel::Warning,
                AlertKind::LossThreshold,
                pair,
                format!("{} down {:.2}% at {:.4} (entry {:.4})", position.key, -gain, price, position.entry_price),
            )),
            PnlZone::Inside => None,
        }
    }

    pub fn forget(&mut self, key: &PositionKey) {
        self.zones.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::config::PositionManagementConfig;
    use crate::core::position_manager::PositionManager;
    use crate::core::types::{LevelId, OrderIntent, OrderReason, Side};

    fn open_position() -> Position {
        let mut pm = PositionManager::new("BTC/USDT", PositionManagementConfig::default());
        let intent = OrderIntent::new("BTC/USDT", Side::Buy, 100.0, 1.0, OrderReason::GridLevel)
            .with_level(LevelId::new(1, 0));
        pm.apply_fill(&intent, 100.0, 1.0, Utc::now()).unwrap();
        let position = pm.positions().next().cloned().unwrap();
        position
    }

    #[test]
    fn test_pnl_alert_is_edge_triggered() {
        let position = open_position();
        let mut tracker = PnlAlertTracker::new();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        assert!(tracker.evaluate(&position, 102.0, 5.0, 3.0, now).is_none());
        let alert = tracker.evaluate(&position, 106.0, 5.0, 3.0, now).expect("crossed profit threshold");
        assert_eq!(alert.kind, AlertKind::ProfitThreshold);
        assert_eq!(alert.timestamp, now);
        assert!(tracker.evaluate(&position, 107.0, 5.0, 3.0, now).is_none());

        // Back inside, then down through the loss threshold
        assert!(tracker.evaluate(&position, 100.0, 5.0, 3.0, now).is_none());
        let alert = tracker.evaluate(&position, 96.0, 5.0, 3.0, now).expect("crossed loss threshold");
        assert_eq!(alert.kind, AlertKind::LossThreshold);
        assert_eq!(alert.level, AlertLevel::Warning);
    }

    #[test]
    fn test_headline_includes_pair() {
        let alert = Alert::new(Utc::now(), AlertLevel::Critical, AlertKind::RiskBreach, Some("ETH/USDT"), "halted");
        assert!(alert.headline().contains("[ETH/USDT] risk breach: halted"));
    }
}
