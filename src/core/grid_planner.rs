// Grid geometry, per-level sizing and dynamic recompute rules

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::config::PairConfig;
use crate::core::signal::Signal;
use crate::core::types::{Direction, LevelId};
use crate::error::{TradingError, TradingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LevelSide {
    Buy,        // Below the centre
    Sell,       // Above the centre
    Reference,  // The centre itself, never traded
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LevelStatus {
    Pending,
    Submitted,  // Order resting at the venue, cannot re-trigger
    Filled,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridLevel {
    pub id: LevelId,
    pub price: f64,
    pub side: LevelSide,
    pub allocation: f64,  // Quote notional
    pub status: LevelStatus,
}

impl GridLevel {
    pub fn is_pending(&self) -> bool {
        self.status == LevelStatus::Pending
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, LevelStatus::Pending | LevelStatus::Submitted)
    }
}

/// Immutable, versioned grid for one pair.
///
/// Status changes produce a new snapshot of the same generation; a recompute
/// produces generation + 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridSnapshot {
    pub pair: String,
    pub generation: u64,
    pub centre: f64,
    pub lower: f64,
    pub upper: f64,
    pub step: f64,
    pub levels: Vec<GridLevel>,
    pub created_at: DateTime<Utc>,
}

impl GridSnapshot {
    pub fn level(&self, id: LevelId) -> Option<&GridLevel> {
        if id.generation != self.generation {
            return None;
        }
        self.levels.get(id.index)
    }

    pub fn buy_levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.iter().filter(|l| l.side == LevelSide::Buy)
    }

    pub fn sell_levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.iter().filter(|l| l.side == LevelSide::Sell)
    }

    pub fn buy_allocation_total(&self) -> f64 {
        self.buy_levels().map(|l| l.allocation).sum()
    }

    pub fn contains(&self, price: f64) -> bool {
        price >= self.lower && price <= self.upper
    }

    /// Pending or submitted tradable levels that a recompute would cancel
    pub fn pending_ids(&self) -> Vec<LevelId> {
        self.levels
            .iter()
            .filter(|l| l.side != LevelSide::Reference && l.is_open())
            .map(|l| l.id)
            .collect()
    }

    /// Copy with the given levels moved to `status`. Levels of other generations are ignored.
    pub fn with_status(&self, ids: &[LevelId], status: LevelStatus) -> GridSnapshot {
        let mut next = self.clone();
        for id in ids.iter().filter(|id| id.generation == self.generation) {
            if let Some(level) = next.levels.get_mut(id.index) {
                if level.side != LevelSide::Reference {
                    level.status = status;
                }
            }
        }
        next
    }

    /// Copy with every filled sell level re-armed
    pub fn with_sells_rearmed(&self) -> GridSnapshot {
        let mut next = self.clone();
        for level in next.levels.iter_mut() {
            if level.side == LevelSide::Sell && level.status == LevelStatus::Filled {
                level.status = LevelStatus::Pending;
            }
        }
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecomputeReason {
    Initial,
    Forced,
    PriceDeviation,
    StepDistance,
    OutOfBounds,
}

impl fmt::Display for RecomputeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RecomputeReason::Initial => "initial grid",
            RecomputeReason::Forced => "forced",
            RecomputeReason::PriceDeviation => "price deviation from centre",
            RecomputeReason::StepDistance => "price moved grid_levels steps",
            RecomputeReason::OutOfBounds => "price left grid bounds",
        };
        f.write_str(text)
    }
}

/// Result of a recompute: the replacement grid and the pending levels it cancelled
#[derive(Debug, Clone)]
pub struct Recompute {
    pub snapshot: GridSnapshot,
    pub cancelled: Vec<LevelId>,
    pub reason: RecomputeReason,
}

#[derive(Debug, Clone, Copy)]
pub struct GridPlanner {
    dynamic_adjustment: bool,
    dynamic_sizing: bool,
}

impl GridPlanner {
    pub fn new(dynamic_adjustment: bool, dynamic_sizing: bool) -> Self {
        Self { dynamic_adjustment, dynamic_sizing }
    }

    /// Centred grid: `grid_count` equally spaced levels over P·(1 ± R/2)
    pub fn plan(
        &self,
        pair: &PairConfig,
        price: f64,
        generation: u64,
        signal: Option<&Signal>,
        now: DateTime<Utc>,
    ) -> TradingResult<GridSnapshot> {
        if pair.grid_count < 2 {
            return Err(TradingError::InvalidGridConfig(format!(
                "{}: grid_count {} is below 2",
                pair.symbol, pair.grid_count
            )));
        }
        if pair.price_range_percentage <= 0.0 {
            return Err(TradingError::InvalidGridConfig(format!(
                "{}: price_range_percentage must be positive",
                pair.symbol
            )));
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(TradingError::InvalidGridConfig(format!(
                "{}: cannot centre a grid on price {}",
                pair.symbol, price
            )));
        }

        let n = pair.grid_count;
        let half_range = pair.price_range_percentage / 100.0 / 2.0;
        let lower = price * (1.0 - half_range);
        let upper = price * (1.0 + half_range);
        let step = (upper - lower) / (n - 1) as f64;

        let side_of = |index: usize| -> LevelSide {
            // Compare 2i with n-1 to classify around the centre without float equality
            match (2 * index).cmp(&(n - 1)) {
                std::cmp::Ordering::Less => LevelSide::Buy,
                std::cmp::Ordering::Equal => LevelSide::Reference,
                std::cmp::Ordering::Greater => LevelSide::Sell,
            }
        };

        let buy_count = (0..n).filter(|&i| side_of(i) == LevelSide::Buy).count();
        let multiplier = match (self.dynamic_sizing, signal) {
            (true, Some(signal)) => 0.5 + 0.5 * signal.long_strength().clamp(0.0, 1.0),
            (true, None) => 0.75,
            (false, _) => 1.0,
        };
        let allocation = pair.investment_amount / buy_count.max(1) as f64 * multiplier;

        let levels = (0..n)
            .map(|index| {
                let side = side_of(index);
                let level_price = match side {
                    LevelSide::Reference => price,
                    _ if index == n - 1 => upper,
                    _ => lower + step * index as f64,
                };
                GridLevel {
                    id: LevelId::new(generation, index),
                    price: level_price,
                    side,
                    allocation: if side == LevelSide::Reference { 0.0 } else { allocation },
                    status: LevelStatus::Pending,
                }
            })
            .collect();

        Ok(GridSnapshot {
            pair: pair.symbol.clone(),
            generation,
            centre: price,
            lower,
            upper,
            step,
            levels,
            created_at: now,
        })
    }

    /// Why the current grid should be replaced at `price`, if it should
    pub fn recompute_reason(
        &self,
        pair: &PairConfig,
        current: Option<&GridSnapshot>,
        price: f64,
    ) -> Option<RecomputeReason> {
        let Some(grid) = current else {
            return Some(RecomputeReason::Initial);
        };
        if !self.dynamic_adjustment {
            return None;
        }

        let distance = (price - grid.centre).abs();
        if !grid.contains(price) {
            Some(RecomputeReason::OutOfBounds)
        } else if distance / grid.centre > pair.price_deviation {
            Some(RecomputeReason::PriceDeviation)
        } else if grid.step > 0.0 && distance / grid.step >= pair.grid_levels as f64 {
            Some(RecomputeReason::StepDistance)
        } else {
            None
        }
    }

    /// Build the next generation, cancelling the previous grid's pending levels
    pub fn recompute(
        &self,
        pair: &PairConfig,
        previous: Option<&GridSnapshot>,
        price: f64,
        signal: Option<&Signal>,
        reason: RecomputeReason,
        now: DateTime<Utc>,
    ) -> TradingResult<Recompute> {
        let generation = previous.map_or(1, |g| g.generation + 1);
        let snapshot = self.plan(pair, price, generation, signal, now)?;
        let cancelled = previous.map(|g| g.pending_ids()).unwrap_or_default();
        Ok(Recompute { snapshot, cancelled, reason })
    }

    /// Pending buy levels at or above `price`, unless the signal is bearish
    pub fn triggered_buys<'a>(
        &self,
        grid: &'a GridSnapshot,
        price: f64,
        direction: Direction,
    ) -> Vec<&'a GridLevel> {
        if direction == Direction::Short {
            return Vec::new();
        }
        grid.buy_levels()
            .filter(|l| l.is_pending() && price <= l.price)
            .collect()
    }

    /// Pending sell levels at or below `price`, lowest first
    pub fn reached_sells<'a>(&self, grid: &'a GridSnapshot, price: f64) -> Vec<&'a GridLevel> {
        grid.sell_levels()
            .filter(|l| l.is_pending() && price >= l.price)
            .collect()
    }
}
