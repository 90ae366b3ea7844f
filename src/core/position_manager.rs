// Position tracking, scaling rules and P&L for one trading pair

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::config::PositionManagementConfig;
use crate::core::types::{OrderIntent, OrderReason, PositionKey, Side};
use crate::error::{TradingError, TradingResult};

const SIZE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that grows the position
    pub fn opening_side(self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    fn sign(self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScaleKind {
    In,
    Out,
    ProfitProtection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleEvent {
    pub kind: ScaleKind,
    pub price: f64,
    pub quantity: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub key: PositionKey,
    pub side: PositionSide,
    pub entry_price: f64,       // Average across legs
    pub size: f64,              // Base quantity
    pub initial_size: f64,
    pub leverage: f64,
    pub legs: usize,
    pub opened_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub scale_history: Vec<ScaleEvent>,
    pub peak_price: f64,        // Most favourable price since open or last scale-in
    pub trailing_stop: Option<f64>,
    pub last_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub scaled_out: bool,
    pub profit_protected: bool,
}

impl Position {
    fn open(key: PositionKey, side: PositionSide, price: f64, size: f64, leverage: f64, now: DateTime<Utc>) -> Self {
        Self {
            key,
            side,
            entry_price: price,
            size,
            initial_size: size,
            leverage,
            legs: 1,
            opened_at: now,
            last_updated: now,
            scale_history: Vec::new(),
            peak_price: price,
            trailing_stop: None,
            last_price: price,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            scaled_out: false,
            profit_protected: false,
        }
    }

    /// Signed percent gain of `price` against the average entry
    pub fn gain_pct_at(&self, price: f64) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / self.entry_price * 100.0
    }

    pub fn peak_gain_pct(&self) -> f64 {
        self.gain_pct_at(self.peak_price)
    }

    /// Percent given back from the peak favourable price
    pub fn retrace_pct(&self, price: f64) -> f64 {
        if self.peak_price == 0.0 {
            return 0.0;
        }
        self.side.sign() * (self.peak_price - price) / self.peak_price * 100.0
    }

    /// Cost-basis notional of the open size
    pub fn notional(&self) -> f64 {
        self.size * self.entry_price
    }

    pub fn pnl_at(&self, price: f64) -> f64 {
        self.side.sign() * (price - self.entry_price) * self.size
    }

    fn is_more_favourable(&self, price: f64) -> bool {
        match self.side {
            PositionSide::Long => price > self.peak_price,
            PositionSide::Short => price < self.peak_price,
        }
    }

    /// Move the trailing stop with price. It never loosens.
    pub fn ratchet_trailing_stop(&mut self, price: f64, trailing_pct: f64) {
        let fraction = trailing_pct / 100.0;
        let candidate = match self.side {
            PositionSide::Long => price * (1.0 - fraction),
            PositionSide::Short => price * (1.0 + fraction),
        };
        self.trailing_stop = Some(match (self.side, self.trailing_stop) {
            (_, None) => candidate,
            (PositionSide::Long, Some(current)) => current.max(candidate),
            (PositionSide::Short, Some(current)) => current.min(candidate),
        });
    }

    pub fn trailing_stop_hit(&self, price: f64) -> bool {
        match (self.side, self.trailing_stop) {
            (PositionSide::Long, Some(stop)) => price <= stop,
            (PositionSide::Short, Some(stop)) => price >= stop,
            (_, None) => false,
        }
    }

    fn closing_side(&self) -> Side {
        self.side.opening_side().opposite()
    }
}

/// Result of applying one execution to the book
#[derive(Debug, Clone, PartialEq)]
pub struct FillOutcome {
    pub key: PositionKey,
    pub opened: bool,
    pub closed: bool,
    pub realized_pnl: f64,
    pub remaining_size: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub pair: String,
    pub open_positions: usize,
    pub exposure: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub positions: Vec<Position>,
}

/// Book of open positions for one pair
#[derive(Debug, Clone)]
pub struct PositionManager {
    pair: String,
    positions: BTreeMap<PositionKey, Position>,
    config: PositionManagementConfig,
    realized_pnl: f64,
}

impl PositionManager {
    pub fn new(pair: &str, config: PositionManagementConfig) -> Self {
        Self {
            pair: pair.to_string(),
            positions: BTreeMap::new(),
            config,
            realized_pnl: 0.0,
        }
    }

    pub fn set_config(&mut self, config: PositionManagementConfig) {
        self.config = config;
    }

    pub fn get(&self, key: &PositionKey) -> Option<&Position> {
        self.positions.get(key)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn keys(&self) -> Vec<PositionKey> {
        self.positions.keys().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    /// Aggregate cost-basis notional of every open position
    pub fn exposure(&self) -> f64 {
        self.positions.values().map(Position::notional).sum()
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    /// Mark every position to `price`, track peaks and ratchet trailing stops
    pub fn update_price(&mut self, price: f64, trailing_pct: Option<f64>, now: DateTime<Utc>) {
        for position in self.positions.values_mut() {
            position.last_price = price;
            position.unrealized_pnl = position.pnl_at(price);
            if position.is_more_favourable(price) {
                position.peak_price = price;
            }
            if let Some(pct) = trailing_pct {
                position.ratchet_trailing_stop(price, pct);
            }
            position.last_updated = now;
        }
    }

    /// Open long grid position to be closed by a sell level at `level_price`.
    /// Picks the nearest entry below that clears `min_profit_pct`, skipping `exclude`.
    pub fn closable_below(&self, level_price: f64, min_profit_pct: f64, exclude: &[PositionKey]) -> Option<&Position> {
        self.positions
            .values()
            .filter(|p| p.side == PositionSide::Long && !exclude.contains(&p.key))
            .filter(|p| p.entry_price < level_price && p.gain_pct_at(level_price) >= min_profit_pct)
            .max_by(|a, b| a.entry_price.total_cmp(&b.entry_price))
    }

    /// Full close of a position
    pub fn exit_intent(&self, key: &PositionKey, price: f64, reason: OrderReason) -> Option<OrderIntent> {
        let position = self.positions.get(key)?;
        Some(
            OrderIntent::new(&self.pair, position.closing_side(), price, position.size, reason)
                .with_position(key.clone())
                .with_leverage(position.leverage),
        )
    }

    /// Propose an add after a retrace on a position that is still in profit
    pub fn scale_in(&self, key: &PositionKey, price: f64) -> Option<OrderIntent> {
        if !self.config.position_scaling {
            return None;
        }
        let position = self.positions.get(key)?;
        if position.legs >= self.config.max_positions_per_symbol {
            return None;
        }
        if position.gain_pct_at(price) <= 0.0 || position.retrace_pct(price) < self.config.scale_in_threshold {
            return None;
        }

        let quantity = position.initial_size * self.config.scale_size_ratio;
        debug!(
            "{} scale-in proposal: retrace {:.2}% from peak {:.4}",
            key, position.retrace_pct(price), position.peak_price
        );
        Some(
            OrderIntent::new(&self.pair, position.side.opening_side(), price, quantity, OrderReason::ScaleIn)
                .with_position(key.clone())
                .with_leverage(position.leverage),
        )
    }

    /// Propose a reduction on an adverse move or after giving back half the peak gain.
    /// Each kind fires at most once per position.
    pub fn scale_out(&self, key: &PositionKey, price: f64) -> Option<OrderIntent> {
        if !self.config.position_scaling {
            return None;
        }
        let position = self.positions.get(key)?;
        let gain = position.gain_pct_at(price);

        let reason = if !position.scaled_out && -gain >= self.config.scale_out_threshold {
            OrderReason::ScaleOut
        } else if self.config.profit_protection
            && !position.profit_protected
            && position.peak_gain_pct() >= self.config.profit_protection_threshold
            && gain <= position.peak_gain_pct() / 2.0
        {
            OrderReason::ProfitProtection
        } else {
            return None;
        };

        let quantity = position.size * self.config.scale_size_ratio;
        Some(
            OrderIntent::new(&self.pair, position.closing_side(), price, quantity, reason)
                .with_position(key.clone())
                .with_leverage(position.leverage),
        )
    }

    /// Apply an execution using the quantity actually filled
    pub fn apply_fill(
        &mut self,
        intent: &OrderIntent,
        fill_price: f64,
        filled_quantity: f64,
        now: DateTime<Utc>,
    ) -> TradingResult<FillOutcome> {
        if filled_quantity <= 0.0 || !fill_price.is_finite() || fill_price <= 0.0 {
            return Err(TradingError::PositionError(format!(
                "invalid execution {} @ {} for intent {}",
                filled_quantity, fill_price, intent.id
            )));
        }

        let key = match (&intent.position, intent.level) {
            (Some(key), _) => key.clone(),
            (None, Some(level)) if intent.reason == OrderReason::GridLevel && intent.side == Side::Buy => {
                PositionKey::new(&self.pair, level)
            }
            _ => {
                return Err(TradingError::PositionError(format!(
                    "intent {} ({}) refers to no position",
                    intent.id, intent.reason
                )))
            }
        };

        match self.positions.get_mut(&key) {
            None if intent.is_entry() => {
                let side = if intent.side == Side::Buy { PositionSide::Long } else { PositionSide::Short };
                let position = Position::open(key.clone(), side, fill_price, filled_quantity, intent.leverage, now);
                self.positions.insert(key.clone(), position);
                Ok(FillOutcome { key, opened: true, closed: false, realized_pnl: 0.0, remaining_size: filled_quantity })
            }
            None => Err(TradingError::PositionError(format!("no open position {}", key))),
            Some(position) if intent.side == position.side.opening_side() => {
                let total = position.size + filled_quantity;
                position.entry_price = (position.entry_price * position.size + fill_price * filled_quantity) / total;
                position.size = total;
                position.last_updated = now;
                if intent.reason == OrderReason::ScaleIn {
                    position.legs += 1;
                    position.peak_price = fill_price;
                    position.scale_history.push(ScaleEvent {
                        kind: ScaleKind::In,
                        price: fill_price,
                        quantity: filled_quantity,
                        at: now,
                    });
                }
                Ok(FillOutcome { key, opened: false, closed: false, realized_pnl: 0.0, remaining_size: total })
            }
            Some(position) => {
                let quantity = if filled_quantity > position.size {
                    warn!(
                        "{} fill {} exceeds open size {}, clamping",
                        key, filled_quantity, position.size
                    );
                    position.size
                } else {
                    filled_quantity
                };

                let realized = position.side.sign() * (fill_price - position.entry_price) * quantity;
                position.size = (position.size - quantity).max(0.0);
                position.realized_pnl += realized;
                position.last_updated = now;

                let kind = match intent.reason {
                    OrderReason::ScaleOut => {
                        position.scaled_out = true;
                        Some(ScaleKind::Out)
                    }
                    OrderReason::ProfitProtection => {
                        position.profit_protected = true;
                        Some(ScaleKind::ProfitProtection)
                    }
                    _ => None,
                };
                if let Some(kind) = kind {
                    position.scale_history.push(ScaleEvent { kind, price: fill_price, quantity, at: now });
                }

                let remaining = position.size;
                self.realized_pnl += realized;
                let closed = remaining <= SIZE_EPSILON;
                if closed {
                    self.positions.remove(&key);
                }
                Ok(FillOutcome { key, opened: false, closed, realized_pnl: realized, remaining_size: if closed { 0.0 } else { remaining } })
            }
        }
    }

    pub fn summary(&self) -> PositionSummary {
        PositionSummary {
            pair: self.pair.clone(),
            open_positions: self.positions.len(),
            exposure: self.exposure(),
            unrealized_pnl: self.unrealized_pnl(),
            realized_pnl: self.realized_pnl,
            positions: self.positions.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::LevelId;

    fn manager() -> PositionManager {
        PositionManager::new("BTC/USDT", PositionManagementConfig::default())
    }

    fn entry(level: usize, price: f64, qty: f64) -> OrderIntent {
        OrderIntent::new("BTC/USDT", Side::Buy, price, qty, OrderReason::GridLevel)
            .with_level(LevelId::new(1, level))
    }

    #[test]
    fn test_open_on_filled_buy() {
        let mut pm = manager();
        let outcome = pm.apply_fill(&entry(3, 100.0, 1.0), 100.0, 1.0, Utc::now()).unwrap();

        assert!(outcome.opened);
        assert_eq!(pm.open_count(), 1);
        assert_eq!(pm.exposure(), 100.0);
    }

    #[test]
    fn test_partial_fill_uses_filled_quantity() {
        let mut pm = manager();
        pm.apply_fill(&entry(3, 100.0, 1.0), 100.0, 0.4, Utc::now()).unwrap();
        let key = PositionKey::new("BTC/USDT", LevelId::new(1, 3));
        assert_eq!(pm.get(&key).map(|p| p.size), Some(0.4));
    }

    #[test]
    fn test_close_realizes_pnl_and_removes() {
        let mut pm = manager();
        pm.apply_fill(&entry(3, 100.0, 2.0), 100.0, 2.0, Utc::now()).unwrap();
        let key = PositionKey::new("BTC/USDT", LevelId::new(1, 3));

        let exit = pm.exit_intent(&key, 105.0, OrderReason::TakeProfit).unwrap();
        assert_eq!(exit.side, Side::Sell);
        let outcome = pm.apply_fill(&exit, 105.0, 5.0, Utc::now()).unwrap();

        assert!(outcome.closed);
        assert_eq!(outcome.realized_pnl, 10.0);
        assert_eq!(pm.open_count(), 0);
        assert_eq!(pm.realized_pnl(), 10.0);
    }

    #[test]
    fn test_trailing_stop_only_tightens() {
        let mut pm = manager();
        pm.apply_fill(&entry(3, 100.0, 1.0), 100.0, 1.0, Utc::now()).unwrap();
        let key = PositionKey::new("BTC/USDT", LevelId::new(1, 3));

        pm.update_price(110.0, Some(1.0), Utc::now());
        let stop = pm.get(&key).and_then(|p| p.trailing_stop).unwrap();
        assert!((stop - 108.9).abs() < 1e-9);

        pm.update_price(105.0, Some(1.0), Utc::now());
        assert_eq!(pm.get(&key).and_then(|p| p.trailing_stop), Some(stop));
    }

    #[test]
    fn test_scale_in_after_retrace() {
        let mut pm = manager();
        pm.apply_fill(&entry(3, 100.0, 1.0), 100.0, 1.0, Utc::now()).unwrap();
        let key = PositionKey::new("BTC/USDT", LevelId::new(1, 3));

        pm.update_price(110.0, None, Utc::now());
        assert!(pm.scale_in(&key, 109.0).is_none());

        let add = pm.scale_in(&key, 107.5).expect("retraced more than 2%");
        assert_eq!(add.reason, OrderReason::ScaleIn);
        assert_eq!(add.quantity, 0.5);

        pm.apply_fill(&add, 107.5, 0.5, Utc::now()).unwrap();
        let position = pm.get(&key).unwrap();
        assert_eq!(position.legs, 2);
        assert_eq!(position.peak_price, 107.5);
        // (100 * 1.0 + 107.5 * 0.5) / 1.5
        assert!((position.entry_price - 102.5).abs() < 1e-9);
    }

    #[test]
    fn test_scale_in_respects_leg_limit() {
        let config = PositionManagementConfig { max_positions_per_symbol: 1, ..PositionManagementConfig::default() };
        let mut pm = PositionManager::new("BTC/USDT", config);
        pm.apply_fill(&entry(3, 100.0, 1.0), 100.0, 1.0, Utc::now()).unwrap();
        pm.update_price(110.0, None, Utc::now());
        let key = PositionKey::new("BTC/USDT", LevelId::new(1, 3));
        assert!(pm.scale_in(&key, 107.0).is_none());
    }

    #[test]
    fn test_adverse_scale_out_fires_once() {
        let mut pm = manager();
        pm.apply_fill(&entry(3, 100.0, 1.0), 100.0, 1.0, Utc::now()).unwrap();
        let key = PositionKey::new("BTC/USDT", LevelId::new(1, 3));

        assert!(pm.scale_out(&key, 98.0).is_none());
        let cut = pm.scale_out(&key, 96.5).expect("3% adverse");
        assert_eq!(cut.reason, OrderReason::ScaleOut);
        pm.apply_fill(&cut, 96.5, cut.quantity, Utc::now()).unwrap();

        assert!(pm.scale_out(&key, 95.0).is_none());
        assert_eq!(pm.get(&key).map(|p| p.size), Some(0.5));
    }

    #[test]
    fn test_profit_protection_after_giveback() {
        let mut pm = manager();
        pm.apply_fill(&entry(3, 100.0, 1.0), 100.0, 1.0, Utc::now()).unwrap();
        let key = PositionKey::new("BTC/USDT", LevelId::new(1, 3));

        pm.update_price(106.0, None, Utc::now());
        assert!(pm.scale_out(&key, 104.0).is_none());
        let protect = pm.scale_out(&key, 102.5).expect("gave back half of 6%");
        assert_eq!(protect.reason, OrderReason::ProfitProtection);
    }

    #[test]
    fn test_closable_below_picks_nearest_profitable_entry() {
        let mut pm = manager();
        pm.apply_fill(&entry(1, 95.0, 1.0), 95.0, 1.0, Utc::now()).unwrap();
        pm.apply_fill(&entry(2, 99.8, 1.0), 99.8, 1.0, Utc::now()).unwrap();

        // 99.8 -> 100.0 is only 0.2%, below the 0.5% minimum
        let chosen = pm.closable_below(100.0, 0.5, &[]).unwrap();
        assert_eq!(chosen.entry_price, 95.0);
        let chosen = pm.closable_below(101.0, 0.5, &[]).unwrap();
        assert_eq!(chosen.entry_price, 99.8);

        let taken = [chosen.key.clone()];
        let next = pm.closable_below(101.0, 0.5, &taken).unwrap();
        assert_eq!(next.entry_price, 95.0);
    }

    #[test]
    fn test_exit_without_position_is_error() {
        let mut pm = manager();
        let key = PositionKey::new("BTC/USDT", LevelId::new(1, 3));
        let exit = OrderIntent::new("BTC/USDT", Side::Sell, 100.0, 1.0, OrderReason::StopLoss).with_position(key);
        assert!(matches!(pm.apply_fill(&exit, 100.0, 1.0, Utc::now()), Err(TradingError::PositionError(_))));
    }
}
