//! Risk governance
//!
//! The governor is the only gate between proposed order intents and the
//! execution gateway. Exits always pass; entries are checked against halts,
//! leverage, daily trade count, open-position slots and notional limits, and
//! may be scaled down instead of rejected.
//!
//! Global counters live behind a single mutex shared by all pairs. Per-pair
//! state is owned by the pair's runtime and passed in by reference.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::RiskLimits;
use crate::core::clock::Clock;
use crate::core::indicators::MarketConditions;
use crate::core::position_manager::Position;
use crate::core::types::{OrderIntent, OrderReason};

/// Fraction of a limit at which a pair enters Warning
pub const WARNING_UTILIZATION: f64 = 0.8;

const NOTIONAL_EPSILON: f64 = 1e-9;

/// Most a past gain can pull the stop-loss in, in percent
const MAX_PROFIT_TIGHTENING_PCT: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RiskLevel {
    Normal,
    Warning,   // At least 80% of a limit used
    Halted,    // A limit reached; entries blocked until the daily reset
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Normal => write!(f, "normal"),
            RiskLevel::Warning => write!(f, "warning"),
            RiskLevel::Halted => write!(f, "halted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Accept,
    Scale(f64),      // Adjusted base quantity
    Reject(String),
}

impl RiskDecision {
    pub fn is_rejected(&self) -> bool {
        matches!(self, RiskDecision::Reject(_))
    }
}

/// Stop-loss and take-profit distances from the entry, in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExitThresholds {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskTransition {
    pub from: RiskLevel,
    pub to: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairRiskState {
    pub pair: String,
    pub day: NaiveDate,
    pub base_capital: f64,
    pub daily_realized_pnl: f64,
    pub daily_trades: u32,
    pub equity: f64,
    pub peak_equity: f64,
    pub drawdown_pct: f64,
    pub utilization: f64,
    pub level: RiskLevel,
    pub manual_halt: bool,
}

impl PairRiskState {
    pub fn new(pair: &str, base_capital: f64, day: NaiveDate) -> Self {
        Self {
            pair: pair.to_string(),
            day,
            base_capital,
            daily_realized_pnl: 0.0,
            daily_trades: 0,
            equity: base_capital,
            peak_equity: base_capital,
            drawdown_pct: 0.0,
            utilization: 0.0,
            level: RiskLevel::Normal,
            manual_halt: false,
        }
    }

    pub fn blocks_entries(&self) -> bool {
        self.manual_halt || self.level == RiskLevel::Halted
    }

    fn reset_day(&mut self, day: NaiveDate) {
        self.day = day;
        self.daily_realized_pnl = 0.0;
        self.daily_trades = 0;
        self.peak_equity = self.equity;
        self.drawdown_pct = 0.0;
        self.utilization = 0.0;
        self.level = RiskLevel::Normal;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalRiskCounters {
    pub day: NaiveDate,
    pub base_capital: f64,
    pub daily_realized_pnl: f64,
    pub daily_trades: u32,
    pub open_positions: usize,
    pub reserved_slots: usize,
    pub pair_pnl: HashMap<String, f64>,
    pub peak_equity: f64,
    pub drawdown_pct: f64,
    pub resets: u32,
}

impl GlobalRiskCounters {
    fn new(base_capital: f64, day: NaiveDate) -> Self {
        Self {
            day,
            base_capital,
            daily_realized_pnl: 0.0,
            daily_trades: 0,
            open_positions: 0,
            reserved_slots: 0,
            pair_pnl: HashMap::new(),
            peak_equity: base_capital,
            drawdown_pct: 0.0,
            resets: 0,
        }
    }

    pub fn daily_loss(&self) -> f64 {
        (-self.daily_realized_pnl).max(0.0)
    }

    pub fn equity(&self) -> f64 {
        self.base_capital + self.pair_pnl.values().sum::<f64>()
    }

    fn refresh_drawdown(&mut self) {
        let equity = self.equity();
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        self.drawdown_pct = drawdown_pct(self.peak_equity, equity);
    }
}

fn drawdown_pct(peak: f64, equity: f64) -> f64 {
    if peak <= 0.0 {
        0.0
    } else {
        ((peak - equity) / peak * 100.0).max(0.0)
    }
}

/// Shared gate for every pair
#[derive(Clone)]
pub struct RiskGovernor {
    global: Arc<Mutex<GlobalRiskCounters>>,
    clock: Arc<dyn Clock>,
}

impl RiskGovernor {
    pub fn new(base_capital: f64, clock: Arc<dyn Clock>) -> Self {
        let day = clock.today();
        Self {
            global: Arc::new(Mutex::new(GlobalRiskCounters::new(base_capital, day))),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GlobalRiskCounters> {
        self.global.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn new_pair_state(&self, pair: &str, base_capital: f64) -> PairRiskState {
        PairRiskState::new(pair, base_capital, self.clock.today())
    }

    /// Copy of the global counters
    pub fn global_snapshot(&self) -> GlobalRiskCounters {
        self.lock().clone()
    }

    pub fn set_base_capital(&self, base_capital: f64) {
        let mut global = self.lock();
        global.base_capital = base_capital;
        global.refresh_drawdown();
    }

    /// Reset daily counters when the calendar day changed.
    /// Returns true when the pair state was reset.
    pub fn roll_over(&self, pair: &mut PairRiskState) -> bool {
        let today = self.clock.today();
        {
            let mut global = self.lock();
            if global.day != today {
                global.day = today;
                global.daily_realized_pnl = 0.0;
                global.daily_trades = 0;
                global.peak_equity = global.equity();
                global.drawdown_pct = 0.0;
                global.resets += 1;
            }
        }
        if pair.day != today {
            pair.reset_day(today);
            true
        } else {
            false
        }
    }

    /// Accept, scale or reject an intent. `opens_position` reserves a slot on acceptance.
    pub fn evaluate(
        &self,
        intent: &OrderIntent,
        pair: &PairRiskState,
        limits: &RiskLimits,
        pair_exposure: f64,
        opens_position: bool,
    ) -> RiskDecision {
        self.evaluate_queued(intent, pair, limits, pair_exposure, 0, opens_position)
    }

    /// Like `evaluate`, with `queued_entries` approved or in-flight entries that
    /// have not reached the daily trade counter yet. `pair_exposure` must already
    /// include their notional.
    pub fn evaluate_queued(
        &self,
        intent: &OrderIntent,
        pair: &PairRiskState,
        limits: &RiskLimits,
        pair_exposure: f64,
        queued_entries: u32,
        opens_position: bool,
    ) -> RiskDecision {
        if !intent.is_entry() {
            return RiskDecision::Accept;
        }
        if pair.manual_halt {
            return RiskDecision::Reject(format!("{} is manually halted", pair.pair));
        }
        if pair.level == RiskLevel::Halted {
            return RiskDecision::Reject(format!("{} is halted by risk limits", pair.pair));
        }
        if intent.leverage > limits.max_leverage {
            return RiskDecision::Reject(format!(
                "leverage {} exceeds max_leverage {}",
                intent.leverage, limits.max_leverage
            ));
        }

        let mut global = self.lock();
        if global.daily_trades + queued_entries >= limits.max_daily_trades {
            return RiskDecision::Reject(format!(
                "daily trade limit {} reached ({} done, {} queued)",
                limits.max_daily_trades, global.daily_trades, queued_entries
            ));
        }
        if opens_position && global.open_positions + global.reserved_slots >= limits.max_open_positions {
            return RiskDecision::Reject(format!(
                "max_open_positions {} reached ({} open, {} in flight)",
                limits.max_open_positions, global.open_positions, global.reserved_slots
            ));
        }

        let mut allowed = limits.position_size_limit.min(limits.max_position_size - pair_exposure);
        if pair.level == RiskLevel::Warning && limits.dynamic_risk_adjustment {
            allowed *= 0.5;
        }

        let decision = if intent.notional() <= allowed + NOTIONAL_EPSILON {
            RiskDecision::Accept
        } else if limits.allows_scaling() && allowed > NOTIONAL_EPSILON && intent.price > 0.0 {
            RiskDecision::Scale(allowed / intent.price)
        } else {
            RiskDecision::Reject(format!(
                "notional {:.2} exceeds allowed {:.2} (exposure {:.2} of {:.2})",
                intent.notional(),
                allowed.max(0.0),
                pair_exposure,
                limits.max_position_size
            ))
        };

        if opens_position && !decision.is_rejected() {
            global.reserved_slots += 1;
        }
        decision
    }

    /// The reserved slot became an open position
    pub fn commit_slot(&self) {
        let mut global = self.lock();
        global.reserved_slots = global.reserved_slots.saturating_sub(1);
        global.open_positions += 1;
    }

    /// The reserving order did not fill
    pub fn release_slot(&self) {
        let mut global = self.lock();
        global.reserved_slots = global.reserved_slots.saturating_sub(1);
    }

    pub fn position_closed(&self) {
        let mut global = self.lock();
        global.open_positions = global.open_positions.saturating_sub(1);
    }

    /// Count an execution and its realized P&L against the daily limits
    pub fn record_fill(&self, pair: &mut PairRiskState, realized_pnl: f64) {
        pair.daily_trades += 1;
        pair.daily_realized_pnl += realized_pnl;
        let mut global = self.lock();
        global.daily_trades += 1;
        global.daily_realized_pnl += realized_pnl;
    }

    /// Refresh equity and drawdown for a pair, then move its state machine.
    /// `pair_pnl` is realized plus unrealized P&L since start.
    pub fn update_equity(&self, pair: &mut PairRiskState, pair_pnl: f64, limits: &RiskLimits) -> Option<RiskTransition> {
        pair.equity = pair.base_capital + pair_pnl;
        if pair.equity > pair.peak_equity {
            pair.peak_equity = pair.equity;
        }
        pair.drawdown_pct = drawdown_pct(pair.peak_equity, pair.equity);

        let (daily_loss, global_drawdown) = {
            let mut global = self.lock();
            global.pair_pnl.insert(pair.pair.clone(), pair_pnl);
            global.refresh_drawdown();
            (global.daily_loss(), global.drawdown_pct)
        };

        pair.utilization = [
            daily_loss / limits.daily_loss_limit,
            pair.drawdown_pct / limits.max_daily_drawdown,
            global_drawdown / limits.max_daily_drawdown,
        ]
        .into_iter()
        .fold(0.0, f64::max);

        let next = if pair.utilization >= 1.0 || pair.level == RiskLevel::Halted {
            RiskLevel::Halted
        } else if pair.utilization >= WARNING_UTILIZATION {
            RiskLevel::Warning
        } else {
            RiskLevel::Normal
        };

        if next == pair.level {
            return None;
        }
        let transition = RiskTransition { from: pair.level, to: next };
        pair.level = next;
        Some(transition)
    }

    /// Exit distances for a position under current market conditions.
    ///
    /// With `atr_targets` the distances are ATR multiples, stretched in strong
    /// trends and pulled in under high volatility, then kept within half and twice
    /// the configured percentages. Otherwise `volatility_adjustment` widens the
    /// stop by the volatility level. `dynamic_risk_adjustment` tightens the stop of
    /// a position that has been in profit, never below half the configured stop.
    pub fn exit_thresholds(
        &self,
        position: &Position,
        limits: &RiskLimits,
        market: Option<&MarketConditions>,
    ) -> ExitThresholds {
        let base_stop = limits.stop_loss_percentage;
        let base_take = limits.take_profit_percentage;
        let targets = &limits.targets;

        let (mut stop, take) = match market {
            Some(m) if targets.atr_targets && m.atr_pct > 0.0 => {
                let (take_ratio, stop_ratio) = if m.trend_strength > targets.strong_trend_threshold {
                    (targets.take_profit_atr_ratio * 1.5, targets.stop_loss_atr_ratio * 0.8)
                } else if m.volatility_level > targets.high_volatility_threshold {
                    (targets.take_profit_atr_ratio * 0.8, targets.stop_loss_atr_ratio * 0.6)
                } else {
                    (targets.take_profit_atr_ratio, targets.stop_loss_atr_ratio)
                };
                (
                    (stop_ratio * m.atr_pct).clamp(0.5 * base_stop, 2.0 * base_stop),
                    (take_ratio * m.atr_pct).clamp(0.5 * base_take, 2.0 * base_take),
                )
            }
            Some(m) if limits.volatility_adjustment => (base_stop * (1.0 + m.volatility_level), base_take),
            _ => (base_stop, base_take),
        };

        let peak_gain = position.peak_gain_pct();
        if limits.dynamic_risk_adjustment && peak_gain > 0.0 {
            stop = (stop - peak_gain.min(MAX_PROFIT_TIGHTENING_PCT)).max(0.5 * base_stop);
        }
        ExitThresholds { stop_loss_pct: stop, take_profit_pct: take }
    }

    /// At most one protective exit, by priority: stop-loss, trailing stop, take-profit
    pub fn protective_exit(
        &self,
        position: &Position,
        price: f64,
        limits: &RiskLimits,
        market: Option<&MarketConditions>,
    ) -> Option<OrderReason> {
        let thresholds = self.exit_thresholds(position, limits, market);
        let gain = position.gain_pct_at(price);
        if -gain >= thresholds.stop_loss_pct {
            Some(OrderReason::StopLoss)
        } else if limits.trailing_stop && position.trailing_stop_hit(price) {
            Some(OrderReason::TrailingStop)
        } else if gain >= thresholds.take_profit_pct {
            Some(OrderReason::TakeProfit)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PairConfig};
    use crate::core::clock::FixedClock;
    use crate::core::types::{LevelId, Side};
    use chrono::{TimeZone, Utc};

    fn limits() -> RiskLimits {
        let config = Config::default();
        config.risk_limits_for(&PairConfig::new("BTC/USDT", 10, 10.0, 100.0))
    }

    fn governor() -> RiskGovernor {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        RiskGovernor::new(1000.0, clock)
    }

    fn buy(notional: f64) -> OrderIntent {
        OrderIntent::new("BTC/USDT", Side::Buy, 100.0, notional / 100.0, OrderReason::GridLevel)
            .with_level(LevelId::new(1, 0))
    }

    #[test]
    fn test_exits_always_accepted() {
        let gov = governor();
        let mut state = gov.new_pair_state("BTC/USDT", 100.0);
        state.level = RiskLevel::Halted;
        state.manual_halt = true;
        let exit = OrderIntent::new("BTC/USDT", Side::Sell, 100.0, 5.0, OrderReason::StopLoss);
        assert_eq!(gov.evaluate(&exit, &state, &limits(), 1e9, false), RiskDecision::Accept);
    }

    #[test]
    fn test_scales_to_position_size_limit() {
        let gov = governor();
        let state = gov.new_pair_state("BTC/USDT", 100.0);
        // position_size_limit defaults to 20 quote
        match gov.evaluate(&buy(50.0), &state, &limits(), 0.0, true) {
            RiskDecision::Scale(q) => assert!((q - 0.2).abs() < 1e-12),
            other => panic!("expected scale, got {:?}", other),
        }
        assert_eq!(gov.global_snapshot().reserved_slots, 1);
    }

    #[test]
    fn test_rejects_without_partial_sizing() {
        let gov = governor();
        let state = gov.new_pair_state("BTC/USDT", 100.0);
        let mut limits = limits();
        limits.volatility_adjustment = false;
        limits.dynamic_risk_adjustment = false;
        assert!(gov.evaluate(&buy(50.0), &state, &limits, 0.0, true).is_rejected());
        assert_eq!(gov.global_snapshot().reserved_slots, 0);
    }

    #[test]
    fn test_warning_halves_allowed_notional() {
        let gov = governor();
        let mut state = gov.new_pair_state("BTC/USDT", 100.0);
        state.level = RiskLevel::Warning;
        match gov.evaluate(&buy(15.0), &state, &limits(), 0.0, false) {
            RiskDecision::Scale(q) => assert!((q - 0.1).abs() < 1e-12),
            other => panic!("expected scale, got {:?}", other),
        }
    }

    #[test]
    fn test_state_machine_transitions() {
        let gov = governor();
        let mut state = gov.new_pair_state("BTC/USDT", 100.0);
        let limits = limits();

        // 8.5% drawdown of a 10% limit
        let t = gov.update_equity(&mut state, -8.5, &limits).unwrap();
        assert_eq!((t.from, t.to), (RiskLevel::Normal, RiskLevel::Warning));

        let t = gov.update_equity(&mut state, -2.0, &limits).unwrap();
        assert_eq!(t.to, RiskLevel::Normal);

        let t = gov.update_equity(&mut state, -10.0, &limits).unwrap();
        assert_eq!(t.to, RiskLevel::Halted);

        // Recovery does not clear a halt
        assert!(gov.update_equity(&mut state, 0.0, &limits).is_none());
        assert_eq!(state.level, RiskLevel::Halted);
    }

    #[test]
    fn test_protective_priority() {
        use crate::config::PositionManagementConfig;
        use crate::core::position_manager::PositionManager;

        let gov = governor();
        let mut pm = PositionManager::new("BTC/USDT", PositionManagementConfig::default());
        pm.apply_fill(&buy(100.0), 100.0, 1.0, Utc::now()).unwrap();
        pm.update_price(100.0, Some(1.0), Utc::now());
        let position = pm.positions().next().cloned().unwrap();

        // Both stop-loss (5%) and trailing stop (99.0) are hit: stop-loss wins
        assert_eq!(gov.protective_exit(&position, 94.0, &limits(), None), Some(OrderReason::StopLoss));
        assert_eq!(gov.protective_exit(&position, 98.9, &limits(), None), Some(OrderReason::TrailingStop));
        assert_eq!(gov.protective_exit(&position, 99.5, &limits(), None), None);
    }

    #[test]
    fn test_queued_entries_count_toward_daily_trades() {
        let gov = governor();
        let state = gov.new_pair_state("BTC/USDT", 100.0);
        let mut limits = limits();
        limits.max_daily_trades = 2;

        assert_eq!(gov.evaluate_queued(&buy(5.0), &state, &limits, 5.0, 1, false), RiskDecision::Accept);
        assert!(gov.evaluate_queued(&buy(5.0), &state, &limits, 10.0, 2, false).is_rejected());
    }
}
