// Common types shared by the decision engine components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One OHLCV bar as delivered by a market data source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self { timestamp, open, high, low, close, volume }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,     // Bullish: favour grid entries
    Short,    // Bearish: suppress grid entries
    Neutral,  // No actionable agreement
}

impl Direction {
    /// +1 for Long, -1 for Short, 0 for Neutral
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Neutral => 0.0,
        }
    }
}

/// Why the engine wants an order placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderReason {
    GridLevel,
    StopLoss,
    TakeProfit,
    TrailingStop,
    ScaleIn,
    ScaleOut,
    ProfitProtection,
}

impl fmt::Display for OrderReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            OrderReason::GridLevel => "grid-level",
            OrderReason::StopLoss => "stop-loss",
            OrderReason::TakeProfit => "take-profit",
            OrderReason::TrailingStop => "trailing-stop",
            OrderReason::ScaleIn => "scale-in",
            OrderReason::ScaleOut => "scale-out",
            OrderReason::ProfitProtection => "profit-protection",
        };
        f.write_str(tag)
    }
}

/// Identifies one level of one grid generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LevelId {
    pub generation: u64,
    pub index: usize,
}

impl LevelId {
    pub fn new(generation: u64, index: usize) -> Self {
        Self { generation, index }
    }
}

impl fmt::Display for LevelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}:{}", self.generation, self.index)
    }
}

/// Positions are keyed by the pair and the grid level that opened them
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub pair: String,
    pub entry_level: LevelId,
}

impl PositionKey {
    pub fn new(pair: impl Into<String>, entry_level: LevelId) -> Self {
        Self { pair: pair.into(), entry_level }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pair, self.entry_level)
    }
}

/// Output of the engine. Ownership passes to the execution gateway once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub id: Uuid,
    pub pair: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub reason: OrderReason,
    pub level: Option<LevelId>,
    pub position: Option<PositionKey>,
    pub created_at: DateTime<Utc>,
}

impl OrderIntent {
    pub fn new(pair: impl Into<String>, side: Side, price: f64, quantity: f64, reason: OrderReason) -> Self {
        Self {
            id: Uuid::new_v4(),
            pair: pair.into(),
            side,
            price,
            quantity,
            leverage: 1.0,
            reason,
            level: None,
            position: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_level(mut self, level: LevelId) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_position(mut self, key: PositionKey) -> Self {
        self.position = Some(key);
        self
    }

    pub fn with_leverage(mut self, leverage: f64) -> Self {
        self.leverage = leverage;
        self
    }

    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = quantity;
        self
    }

    /// Same order re-priced against fresher data, under a new id
    pub fn repriced(&self, price: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            price,
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Quote-currency value of the order
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }

    /// Entries add exposure; everything else reduces it
    pub fn is_entry(&self) -> bool {
        match self.reason {
            OrderReason::GridLevel => self.side == Side::Buy,
            OrderReason::ScaleIn => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
    Pending,
    Cancelled,
    Rejected(String),
}

impl OrderStatus {
    /// Nothing more will execute
    pub fn is_final(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

/// What the execution gateway reports back for one submitted intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub status: OrderStatus,
    pub fill_price: Option<f64>,
    pub filled_quantity: f64,
}

impl OrderResult {
    pub fn filled(price: f64, quantity: f64) -> Self {
        Self { status: OrderStatus::Filled, fill_price: Some(price), filled_quantity: quantity }
    }

    pub fn partial(price: f64, quantity: f64) -> Self {
        Self { status: OrderStatus::PartiallyFilled, fill_price: Some(price), filled_quantity: quantity }
    }

    pub fn pending() -> Self {
        Self { status: OrderStatus::Pending, fill_price: None, filled_quantity: 0.0 }
    }

    pub fn cancelled() -> Self {
        Self { status: OrderStatus::Cancelled, fill_price: None, filled_quantity: 0.0 }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self { status: OrderStatus::Rejected(reason.into()), fill_price: None, filled_quantity: 0.0 }
    }

    /// Quantity and price actually executed, if anything was
    pub fn execution(&self) -> Option<(f64, f64)> {
        match self.status {
            OrderStatus::Filled | OrderStatus::PartiallyFilled if self.filled_quantity > 0.0 => {
                self.fill_price.map(|price| (price, self.filled_quantity))
            }
            _ => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.status, OrderStatus::Rejected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_classification() {
        let buy = OrderIntent::new("BTC/USDT", Side::Buy, 100.0, 1.0, OrderReason::GridLevel);
        let sell = OrderIntent::new("BTC/USDT", Side::Sell, 110.0, 1.0, OrderReason::GridLevel);
        let stop = OrderIntent::new("BTC/USDT", Side::Sell, 90.0, 1.0, OrderReason::StopLoss);
        let add = OrderIntent::new("BTC/USDT", Side::Buy, 95.0, 0.5, OrderReason::ScaleIn);

        assert!(buy.is_entry());
        assert!(!sell.is_entry());
        assert!(!stop.is_entry());
        assert!(add.is_entry());
    }

    #[test]
    fn test_repriced_keeps_order_shape() {
        let intent = OrderIntent::new("ETH/USDT", Side::Buy, 2000.0, 0.01, OrderReason::GridLevel)
            .with_level(LevelId::new(3, 2));
        let repriced = intent.repriced(1990.0);

        assert_ne!(repriced.id, intent.id);
        assert_eq!(repriced.price, 1990.0);
        assert_eq!(repriced.quantity, intent.quantity);
        assert_eq!(repriced.level, Some(LevelId::new(3, 2)));
    }

    #[test]
    fn test_order_result_execution() {
        assert_eq!(OrderResult::partial(10.0, 0.4).execution(), Some((10.0, 0.4)));
        assert_eq!(OrderResult::pending().execution(), None);
        assert_eq!(OrderResult::cancelled().execution(), None);
        assert!(!OrderResult::pending().status.is_final());
        assert!(OrderResult::cancelled().status.is_final());
        assert!(OrderResult::rejected("no margin").is_rejected());
        assert_eq!(OrderResult::filled(10.0, 0.0).execution(), None);
    }

    #[test]
    fn test_level_id_display() {
        assert_eq!(LevelId::new(2, 7).to_string(), "g2:7");
        assert_eq!(PositionKey::new("BTC/USDT", LevelId::new(1, 0)).to_string(), "BTC/USDT@g1:0");
    }
}
