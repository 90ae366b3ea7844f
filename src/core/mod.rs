// Decision engine: indicators, signal fusion, grid planning, risk, positions and the control loop

pub mod types;
pub mod clock;
pub mod indicators;
pub mod signal;
pub mod grid_planner;
pub mod position_manager;
pub mod risk_governor;
pub mod monitoring;
pub mod orchestrator;

// Re-export commonly used types
pub use types::{Candle, Direction, LevelId, OrderIntent, OrderReason, OrderResult, OrderStatus, PositionKey, Side};
pub use clock::{Clock, FixedClock, SystemClock};
pub use indicators::{IndicatorAggregator, IndicatorSnapshot, MarketConditions};
pub use signal::{AiAssessment, ConfidenceProvider, NoConfidence, Signal, SignalFusion, StaticConfidence};
pub use grid_planner::{GridLevel, GridPlanner, GridSnapshot, LevelSide, LevelStatus, RecomputeReason};
pub use position_manager::{Position, PositionManager, PositionSide};
pub use risk_governor::{ExitThresholds, PairRiskState, RiskDecision, RiskGovernor, RiskLevel};
pub use monitoring::{Alert, AlertDispatcher, AlertKind, AlertLevel};
pub use orchestrator::{Collaborators, CycleReport, EngineSnapshot, GridEngine, PairCycleReport};
