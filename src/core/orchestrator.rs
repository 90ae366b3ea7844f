//! Grid trading orchestrator
//!
//! Runs one evaluation per configured pair on every tick: market data,
//! indicators, signal, grid maintenance, protective and scaling checks, risk
//! gating, submission and fill bookkeeping. Pairs are evaluated concurrently
//! and a failure in one pair only skips that pair's cycle.
//!
//! Orders the venue leaves pending stay in flight: their level cannot
//! re-trigger, their notional and slot count against the risk limits, they are
//! polled once per cycle and cancelled when the grid they belong to is replaced.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clients::{ExecutionGateway, GatewayError, MarketDataError, MarketDataSource, NotificationSink};
use crate::config::{Config, ConfigHandle, PairConfig, RiskLimits};
use crate::core::clock::Clock;
use crate::core::grid_planner::{GridPlanner, GridSnapshot, LevelStatus, RecomputeReason};
use crate::core::indicators::{IndicatorAggregator, MarketConditions};
use crate::core::monitoring::{Alert, AlertContext, AlertDispatcher, AlertKind, AlertLevel, PnlAlertTracker};
use crate::core::position_manager::{FillOutcome, PositionManager, PositionSummary};
use crate::core::risk_governor::{GlobalRiskCounters, PairRiskState, RiskDecision, RiskGovernor, RiskLevel, RiskTransition};
use crate::core::signal::{ConfidenceProvider, Signal, SignalFusion};
use crate::core::types::{
    Candle, Direction, LevelId, OrderIntent, OrderReason, OrderResult, OrderStatus, PositionKey, Side,
};
use crate::error::{TradingError, TradingResult};

/// External services the engine drives
#[derive(Clone)]
pub struct Collaborators {
    pub market_data: Arc<dyn MarketDataSource>,
    pub gateway: Arc<dyn ExecutionGateway>,
    pub notifier: Arc<dyn NotificationSink>,
    pub confidence: Arc<dyn ConfidenceProvider>,
    pub clock: Arc<dyn Clock>,
}

/// Mutable per-pair state, only touched between awaits
#[derive(Debug)]
struct PairRuntime {
    positions: PositionManager,
    risk: PairRiskState,
    pnl_alerts: PnlAlertTracker,
    force_recompute: bool,
    last_price: Option<f64>,
    last_signal: Option<Signal>,
    skipped_fills: u64,
    in_flight: HashMap<Uuid, InFlightOrder>,
}

impl PairRuntime {
    /// Entry notional resting at the venue
    fn in_flight_exposure(&self) -> f64 {
        self.in_flight
            .values()
            .filter(|o| o.intent.is_entry())
            .map(|o| o.intent.notional())
            .sum()
    }

    fn in_flight_entries(&self) -> u32 {
        self.in_flight.values().filter(|o| o.intent.is_entry()).count() as u32
    }

    /// Positions with a resting order against them
    fn in_flight_positions(&self) -> Vec<PositionKey> {
        self.in_flight.values().filter_map(|o| o.intent.position.clone()).collect()
    }
}

/// An order the venue accepted without resolving it
#[derive(Debug, Clone)]
struct InFlightOrder {
    intent: OrderIntent,
    opens_position: bool,
}

/// Entries approved but not yet submitted or booked
#[derive(Debug, Clone, Copy, Default)]
struct Commitments {
    exposure: f64,
    entries: u32,
}

impl Commitments {
    fn add(&mut self, intent: &OrderIntent) {
        if intent.is_entry() {
            self.exposure += intent.notional();
            self.entries += 1;
        }
    }

    fn remove(&mut self, intent: &OrderIntent) {
        if intent.is_entry() {
            self.exposure = (self.exposure - intent.notional()).max(0.0);
            self.entries = self.entries.saturating_sub(1);
        }
    }
}

struct PairSlot {
    runtime: Mutex<PairRuntime>,
    grid: RwLock<Option<Arc<GridSnapshot>>>,
}

impl PairSlot {
    fn new(runtime: PairRuntime) -> Self {
        Self { runtime: Mutex::new(runtime), grid: RwLock::new(None) }
    }

    fn runtime(&self) -> MutexGuard<'_, PairRuntime> {
        self.runtime.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn grid(&self) -> Option<Arc<GridSnapshot>> {
        self.grid.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn swap_grid(&self, next: GridSnapshot) {
        *self.grid.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(next));
    }

    /// Replace the current grid with a modified copy
    fn update_grid(&self, change: impl FnOnce(&GridSnapshot) -> GridSnapshot) {
        let mut guard = self.grid.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(current) = guard.as_ref() {
            let next = change(current);
            *guard = Some(Arc::new(next));
        }
    }
}

/// What happened to one pair in one cycle
#[derive(Debug, Clone, Default)]
pub struct PairCycleReport {
    pub pair: String,
    pub price: f64,
    pub signal: Option<Signal>,
    pub market: Option<MarketConditions>,
    pub generation: u64,
    pub recomputed: Option<RecomputeReason>,
    pub cancelled: Vec<LevelId>,
    pub intents: usize,
    pub rejected: Vec<String>,
    pub filled: usize,
    pub pending: usize,     // Left resting at the venue this cycle
    pub withdrawn: usize,   // Resting orders that ended without a fill
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct PairFailure {
    pub pair: String,
    pub category: &'static str,
    pub retryable: bool,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub pairs: Vec<PairCycleReport>,
    pub failures: Vec<PairFailure>,
}

impl CycleReport {
    pub fn pair(&self, symbol: &str) -> Option<&PairCycleReport> {
        self.pairs.iter().find(|r| r.pair == symbol)
    }

    pub fn failed(&self, symbol: &str) -> bool {
        self.failures.iter().any(|f| f.pair == symbol)
    }
}

/// Read-only view of one pair
#[derive(Debug, Clone)]
pub struct PairSnapshot {
    pub pair: String,
    pub grid: Option<Arc<GridSnapshot>>,
    pub positions: PositionSummary,
    pub risk: PairRiskState,
    pub last_price: Option<f64>,
    pub last_signal: Option<Signal>,
    pub skipped_fills: u64,
    pub in_flight_orders: usize,
}

#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub pairs: Vec<PairSnapshot>,
    pub global: GlobalRiskCounters,
}

impl EngineSnapshot {
    pub fn pair(&self, symbol: &str) -> Option<&PairSnapshot> {
        self.pairs.iter().find(|p| p.pair == symbol)
    }
}

pub struct GridEngine {
    config: ConfigHandle,
    collaborators: Collaborators,
    governor: RiskGovernor,
    alerts: AlertDispatcher,
    pairs: RwLock<HashMap<String, Arc<PairSlot>>>,
}

impl GridEngine {
    /// Validate the configuration and set up per-pair state
    pub fn new(config: Config, collaborators: Collaborators) -> TradingResult<Self> {
        let config = config.prepare()?;
        let base_capital: f64 = config.pairs().map(|p| p.investment_amount).sum();
        let governor = RiskGovernor::new(base_capital, Arc::clone(&collaborators.clock));
        let alerts = AlertDispatcher::new(Arc::clone(&collaborators.notifier));

        let engine = Self {
            config: ConfigHandle::new(config),
            collaborators,
            governor,
            alerts,
            pairs: RwLock::new(HashMap::new()),
        };
        let current = engine.config.current();
        engine.sync_pairs(&current);

        info!(
            "🎯 Grid engine ready: {} pairs, {:.2} base capital",
            current.grid_settings.len(),
            base_capital
        );
        Ok(engine)
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.current()
    }

    pub fn governor(&self) -> &RiskGovernor {
        &self.governor
    }

    /// Alerts dispatched so far, oldest first
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.history()
    }

    fn slot(&self, pair: &str) -> TradingResult<Arc<PairSlot>> {
        self.pairs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(pair)
            .cloned()
            .ok_or_else(|| TradingError::UnknownPair(pair.to_string()))
    }

    /// Create state for new pairs and push reloaded settings into existing ones.
    /// Pairs dropped from the configuration keep their state but are no longer evaluated.
    fn sync_pairs(&self, config: &Config) {
        let mut pairs = self.pairs.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        for pair in config.pairs() {
            match pairs.get(&pair.symbol) {
                Some(slot) => {
                    let mut runtime = slot.runtime();
                    runtime.positions.set_config(config.position_management.clone());
                    runtime.risk.base_capital = pair.investment_amount;
                }
                None => {
                    let runtime = PairRuntime {
                        positions: PositionManager::new(&pair.symbol, config.position_management.clone()),
                        risk: self.governor.new_pair_state(&pair.symbol, pair.investment_amount),
                        pnl_alerts: PnlAlertTracker::new(),
                        force_recompute: false,
                        last_price: None,
                        last_signal: None,
                        skipped_fills: 0,
                        in_flight: HashMap::new(),
                    };
                    pairs.insert(pair.symbol.clone(), Arc::new(PairSlot::new(runtime)));
                }
            }
        }
        self.governor
            .set_base_capital(config.pairs().map(|p| p.investment_amount).sum());
    }

    /// Run the loop until `shutdown` flips to true or `max_cycles` cycles ran.
    /// Returns the number of completed cycles.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, max_cycles: Option<u64>) -> u64 {
        let mut period = Duration::from_secs(self.config.current().engine.check_interval.max(1));
        let mut ticker = interval_at(Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = 0u64;

        info!("🚀 Grid engine started, evaluating every {}s", period.as_secs());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    cycles += 1;
                    debug!(
                        "Cycle {} done: {} pairs evaluated, {} skipped",
                        cycles,
                        report.pairs.len(),
                        report.failures.len()
                    );
                    if max_cycles.is_some_and(|max| cycles >= max) {
                        break;
                    }

                    let configured = Duration::from_secs(self.config.current().engine.check_interval.max(1));
                    if configured != period {
                        info!("⏱️ Check interval changed to {}s", configured.as_secs());
                        period = configured;
                        ticker = interval_at(Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("🛑 Shutdown requested, stopping after {} cycles", cycles);
                        break;
                    }
                }
            }
        }
        cycles
    }

    /// Evaluate every configured pair once, concurrently
    pub async fn run_cycle(&self) -> CycleReport {
        let config = self.config.current();
        let pairs: Vec<PairConfig> = config.pairs().cloned().collect();

        let results = join_all(pairs.into_iter().map(|pair| {
            let config = Arc::clone(&config);
            async move {
                let symbol = pair.symbol.clone();
                (symbol, self.evaluate_pair(config, pair).await)
            }
        }))
        .await;

        let mut report = CycleReport::default();
        for (pair, result) in results {
            match result {
                Ok(pair_report) => report.pairs.push(pair_report),
                Err(e) => {
                    let retryable = e.is_retryable();
                    if retryable {
                        warn!("⏭️ Skipping {} this cycle [{}]: {}", pair, e.category(), e);
                    } else {
                        error!("❌ {} cycle failed [{}]: {}", pair, e.category(), e);
                    }
                    report.failures.push(PairFailure { pair, category: e.category(), retryable, error: e.to_string() });
                }
            }
        }
        report
    }

    async fn evaluate_pair(&self, config: Arc<Config>, pair: PairConfig) -> TradingResult<PairCycleReport> {
        let slot = self.slot(&pair.symbol)?;
        let limits = config.risk_limits_for(&pair);
        let logging = &config.logging;
        let mut report = PairCycleReport { pair: pair.symbol.clone(), ..PairCycleReport::default() };

        {
            let mut runtime = slot.runtime();
            if self.governor.roll_over(&mut runtime.risk) && logging.enable_state_change_logging {
                info!("📅 {} daily risk counters reset", pair.symbol);
            }
        }
        self.reconcile_in_flight(&slot, &mut report).await;

        let budget = Duration::from_millis(config.engine.fetch_timeout_ms);
        let (candles, price) = self.fetch_market(&pair.symbol, config.engine.history_window, budget).await?;
        report.price = price;

        let aggregator = IndicatorAggregator::new(config.technical_indicators.clone());
        let indicators = aggregator.compute(&candles)?;

        let assessment = if config.ai_settings.enabled {
            self.collaborators.confidence.assess(&pair.symbol, &indicators).await
        } else {
            None
        };
        let fusion = SignalFusion::new(
            config.technical_indicators.clone(),
            config.market_analysis.clone(),
            config.ai_settings.clone(),
        );
        let signal = fusion.fuse(&indicators, assessment.as_ref());
        let market = MarketConditions::from_snapshot(&indicators, config.exit_targets.volatility_reference_pct);
        report.market = Some(market);

        if logging.enable_price_logging {
            info!(
                "💹 {} price {:.4} | RSI {:.1} | MACD hist {:.4} | BB [{:.4}, {:.4}] | ATR {:.2}% trend {:.2}",
                pair.symbol,
                price,
                indicators.rsi,
                indicators.macd.histogram,
                indicators.bollinger.lower,
                indicators.bollinger.upper,
                market.atr_pct,
                market.trend_strength
            );
        }
        if logging.enable_signal_logging {
            info!(
                "📡 {} signal {:?} ({:.2}) votes {}/{} score {:+.3}{}",
                pair.symbol,
                signal.direction,
                signal.confidence,
                signal.breakdown.votes.long(),
                signal.breakdown.votes.short(),
                signal.breakdown.weighted_score,
                if signal.breakdown.ai_gated { " [AI gated]" } else { "" }
            );
        }

        let planner = GridPlanner::new(
            config.advanced_trading.dynamic_grid_adjustment,
            config.advanced_trading.dynamic_position_sizing,
        );
        let forced = std::mem::take(&mut slot.runtime().force_recompute);
        let current = slot.grid();
        let reason = if forced {
            Some(RecomputeReason::Forced)
        } else {
            planner.recompute_reason(&pair, current.as_deref(), price)
        };
        if let Some(reason) = reason {
            let now = self.collaborators.clock.now();
            let recompute = planner.recompute(&pair, current.as_deref(), price, Some(&signal), reason, now)?;
            let snapshot = &recompute.snapshot;
            let message = format!(
                "🔲 {} grid g{} ({}): {} levels over [{:.4}, {:.4}], step {:.4}, {} pending cancelled",
                pair.symbol,
                snapshot.generation,
                reason,
                snapshot.levels.len(),
                snapshot.lower,
                snapshot.upper,
                snapshot.step,
                recompute.cancelled.len()
            );
            if logging.enable_state_change_logging {
                info!("{}", message);
            } else {
                debug!("{}", message);
            }
            report.recomputed = Some(reason);
            report.cancelled = recompute.cancelled;
            let generation = recompute.snapshot.generation;
            slot.swap_grid(recompute.snapshot);
            self.cancel_superseded(&slot, generation, &mut report).await;
        }
        let grid = slot
            .grid()
            .ok_or_else(|| TradingError::Internal(format!("no grid for {}", pair.symbol)))?;
        report.generation = grid.generation;

        let approved = {
            let mut guard = slot.runtime();
            let runtime = &mut *guard;
            runtime.last_price = Some(price);
            runtime.last_signal = Some(signal.clone());
            self.refresh_pair_state(&config, &pair, &limits, runtime, price);

            let intents = self.plan_intents(&pair, &limits, runtime, &grid, &planner, &signal, &market, price);
            report.intents = intents.len();
            self.gate_intents(intents, &limits, runtime, &mut report)
        };
        report.signal = Some(signal);

        let mut queued = Commitments::default();
        for (intent, _) in &approved {
            queued.add(intent);
        }
        for (intent, opens_position) in approved {
            queued.remove(&intent);
            self.execute(&config, &pair, &limits, &slot, intent, opens_position, queued, &mut report)
                .await;
        }

        {
            // Fills move realized P&L, re-check limits before the next cycle
            let mut guard = slot.runtime();
            let runtime = &mut *guard;
            let pnl = runtime.positions.realized_pnl() + runtime.positions.unrealized_pnl();
            if let Some(transition) = self.governor.update_equity(&mut runtime.risk, pnl, &limits) {
                self.report_transition(&config, runtime, transition);
            }
        }

        Ok(report)
    }

    async fn fetch_market(&self, pair: &str, window: usize, budget: Duration) -> TradingResult<(Vec<Candle>, f64)> {
        let source = &self.collaborators.market_data;
        let fetch = async {
            let candles = source.get_candles(pair, window).await?;
            let price = source.get_current_price(pair).await?;
            Ok::<_, MarketDataError>((candles, price))
        };

        let (candles, price) = match timeout(budget, fetch).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TradingError::MarketDataTimeout(format!(
                    "{} fetch exceeded {}ms",
                    pair,
                    budget.as_millis()
                )))
            }
        };
        if !price.is_finite() || price <= 0.0 {
            return Err(TradingError::MarketDataUnavailable(format!("invalid price {} for {}", price, pair)));
        }
        Ok((candles, price))
    }

    /// Mark positions, raise P&L alerts and move the risk state machine
    fn refresh_pair_state(
        &self,
        config: &Config,
        pair: &PairConfig,
        limits: &RiskLimits,
        runtime: &mut PairRuntime,
        price: f64,
    ) {
        let now = self.collaborators.clock.now();
        let trailing = limits.trailing_stop.then_some(limits.trailing_stop_percentage);
        runtime.positions.update_price(price, trailing, now);

        let notification = &config.notification;
        let tracker = &mut runtime.pnl_alerts;
        let pnl_alerts: Vec<Alert> = runtime
            .positions
            .positions()
            .filter_map(|position| {
                tracker.evaluate(
                    position,
                    price,
                    notification.profit_alert_threshold,
                    notification.loss_alert_threshold,
                    now,
                )
            })
            .collect();
        for alert in pnl_alerts {
            self.alerts.dispatch(alert.with_context(Self::alert_context(runtime)));
        }

        let pnl = runtime.positions.realized_pnl() + runtime.positions.unrealized_pnl();
        if let Some(transition) = self.governor.update_equity(&mut runtime.risk, pnl, limits) {
            self.report_transition(config, runtime, transition);
        }
        debug!(
            "{} equity {:.4} drawdown {:.2}% utilization {:.2} ({})",
            pair.symbol, runtime.risk.equity, runtime.risk.drawdown_pct, runtime.risk.utilization, runtime.risk.level
        );
    }

    fn alert_context(runtime: &PairRuntime) -> AlertContext {
        AlertContext {
            daily_pnl: runtime.risk.daily_realized_pnl,
            drawdown_pct: runtime.risk.drawdown_pct,
            open_positions: runtime.positions.open_count(),
            risk_level: runtime.risk.level.to_string(),
        }
    }

    fn report_transition(&self, config: &Config, runtime: &PairRuntime, transition: RiskTransition) {
        let pair = runtime.risk.pair.as_str();
        let utilization = runtime.risk.utilization * 100.0;
        let (level, kind, message) = match transition.to {
            RiskLevel::Halted => {
                let breach = TradingError::RiskLimitBreach(format!(
                    "{} halted with {:.0}% of a risk limit used (drawdown {:.2}%, daily P&L {:+.4})",
                    pair, utilization, runtime.risk.drawdown_pct, runtime.risk.daily_realized_pnl
                ));
                error!("🚨 {} risk {} -> {} [{}]", pair, transition.from, transition.to, breach.category());
                (AlertLevel::Critical, AlertKind::RiskBreach, breach.user_message())
            }
            RiskLevel::Warning => (
                AlertLevel::Warning,
                AlertKind::RiskWarning,
                format!("{} at {:.0}% of a risk limit, entry sizes reduced", pair, utilization),
            ),
            RiskLevel::Normal => (
                AlertLevel::Info,
                AlertKind::RiskWarning,
                format!("{} back to normal risk ({:.0}%)", pair, utilization),
            ),
        };

        if transition.to != RiskLevel::Halted && config.logging.enable_state_change_logging {
            info!("🛡️ {} risk {} -> {}", pair, transition.from, transition.to);
        }
        let now = self.collaborators.clock.now();
        self.alerts
            .dispatch(Alert::new(now, level, kind, Some(pair), message).with_context(Self::alert_context(runtime)));
    }

    /// Protective exits first, then scaling, grid sells and grid buys.
    /// A position receives at most one reducing intent per cycle, and none while
    /// an order against it is in flight.
    #[allow(clippy::too_many_arguments)]
    fn plan_intents(
        &self,
        pair: &PairConfig,
        limits: &RiskLimits,
        runtime: &PairRuntime,
        grid: &GridSnapshot,
        planner: &GridPlanner,
        signal: &Signal,
        market: &MarketConditions,
        price: f64,
    ) -> Vec<OrderIntent> {
        let positions = &runtime.positions;
        let mut intents = Vec::new();
        let mut handled: Vec<PositionKey> = runtime.in_flight_positions();

        for position in positions.positions() {
            let key = &position.key;
            if handled.contains(key) {
                continue;
            }
            if let Some(reason) = self.governor.protective_exit(position, price, limits, Some(market)) {
                if let Some(exit) = positions.exit_intent(key, price, reason) {
                    info!(
                        "🛑 {} {} at {:.4} (entry {:.4}, gain {:+.2}%)",
                        key,
                        reason,
                        price,
                        position.entry_price,
                        position.gain_pct_at(price)
                    );
                    intents.push(exit);
                    handled.push(key.clone());
                }
                continue;
            }
            if let Some(reduce) = positions.scale_out(key, price) {
                intents.push(reduce);
                handled.push(key.clone());
                continue;
            }
            if signal.direction != Direction::Short {
                if let Some(add) = positions.scale_in(key, price) {
                    intents.push(add);
                    handled.push(key.clone());
                }
            }
        }

        for level in planner.reached_sells(grid, price) {
            let Some(position) = positions.closable_below(level.price, pair.min_profit_percentage, &handled) else {
                continue;
            };
            let key = position.key.clone();
            if let Some(exit) = positions.exit_intent(&key, price, OrderReason::GridLevel) {
                intents.push(exit.with_level(level.id));
                handled.push(key);
            }
        }

        for level in planner.triggered_buys(grid, price, signal.direction) {
            let quantity = level.allocation / price;
            if quantity > 0.0 {
                intents.push(
                    OrderIntent::new(&pair.symbol, Side::Buy, price, quantity, OrderReason::GridLevel)
                        .with_level(level.id)
                        .with_leverage(pair.leverage),
                );
            }
        }
        intents
    }

    /// Pass intents through the risk governor. Resting entries and entries approved
    /// earlier in the cycle count toward exposure and the daily trade limit.
    fn gate_intents(
        &self,
        intents: Vec<OrderIntent>,
        limits: &RiskLimits,
        runtime: &PairRuntime,
        report: &mut PairCycleReport,
    ) -> Vec<(OrderIntent, bool)> {
        let mut committed = Commitments {
            exposure: runtime.positions.exposure() + runtime.in_flight_exposure(),
            entries: runtime.in_flight_entries(),
        };
        let mut approved = Vec::with_capacity(intents.len());

        for intent in intents {
            let opens_position = intent.reason == OrderReason::GridLevel && intent.side == Side::Buy;
            let decision = self.governor.evaluate_queued(
                &intent,
                &runtime.risk,
                limits,
                committed.exposure,
                committed.entries,
                opens_position,
            );
            let intent = match decision {
                RiskDecision::Accept => intent,
                RiskDecision::Scale(quantity) => {
                    debug!(
                        "{} {} scaled from {:.6} to {:.6}",
                        intent.pair, intent.reason, intent.quantity, quantity
                    );
                    intent.with_quantity(quantity)
                }
                RiskDecision::Reject(reason) => {
                    warn!("❌ {} {} {} rejected: {}", intent.pair, intent.reason, intent.side, reason);
                    report.rejected.push(format!("{} {}: {}", intent.reason, intent.side, reason));
                    continue;
                }
            };
            committed.add(&intent);
            approved.push((intent, opens_position));
        }
        approved
    }

    /// Submit an intent, re-pricing once per allowed attempt after a rejection or transport error.
    /// `queued` holds this cycle's approved entries still waiting behind this one.
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        config: &Config,
        pair: &PairConfig,
        limits: &RiskLimits,
        slot: &PairSlot,
        intent: OrderIntent,
        opens_position: bool,
        queued: Commitments,
        report: &mut PairCycleReport,
    ) {
        let budget = Duration::from_millis(config.engine.fetch_timeout_ms);
        let mut current = intent;
        let mut attempts = 0;

        let failure = loop {
            let failure = match self.collaborators.gateway.submit_order(&current).await {
                Ok(result) => {
                    if let Some((fill_price, filled)) = result.execution() {
                        self.book_execution(slot, &current, opens_position, fill_price, filled, report);
                        return;
                    }
                    match result.status {
                        OrderStatus::Rejected(reason) => reason,
                        OrderStatus::Cancelled => "cancelled by the venue".to_string(),
                        _ => {
                            self.track_in_flight(slot, current, opens_position);
                            report.pending += 1;
                            return;
                        }
                    }
                }
                Err(e) => e.to_string(),
            };

            if attempts >= config.engine.max_reprice_attempts {
                break failure;
            }
            attempts += 1;
            warn!("⚠️ {} {} failed ({}), re-pricing", current.pair, current.reason, failure);

            let latest = match timeout(budget, self.collaborators.market_data.get_current_price(&pair.symbol)).await {
                Ok(Ok(price)) if price.is_finite() && price > 0.0 => price,
                Ok(Ok(price)) => break format!("{}; re-price returned {}", failure, price),
                Ok(Err(e)) => break format!("{}; re-price failed: {}", failure, e),
                Err(_) => break format!("{}; re-price timed out", failure),
            };

            let repriced = current.repriced(latest);
            let decision = {
                let runtime = slot.runtime();
                let exposure = runtime.positions.exposure() + runtime.in_flight_exposure() + queued.exposure;
                let entries = runtime.in_flight_entries() + queued.entries;
                self.governor
                    .evaluate_queued(&repriced, &runtime.risk, limits, exposure, entries, false)
            };
            current = match decision {
                RiskDecision::Accept => repriced,
                RiskDecision::Scale(quantity) => repriced.with_quantity(quantity),
                RiskDecision::Reject(reason) => break format!("{}; re-evaluation rejected: {}", failure, reason),
            };
        };

        if opens_position {
            self.governor.release_slot();
        }
        slot.runtime().skipped_fills += 1;
        report.skipped += 1;

        warn!("⏭️ {} {} {} skipped: {}", current.pair, current.reason, current.side, failure);
        self.alerts.dispatch(Alert::new(
            self.collaborators.clock.now(),
            AlertLevel::Warning,
            AlertKind::ExecutionFailure,
            Some(&current.pair),
            format!(
                "{} {} {:.6} @ {:.4} skipped: {}",
                current.reason, current.side, current.quantity, current.price, failure
            ),
        ));
    }

    /// Keep the reserved slot and block the level until the venue resolves the order
    fn track_in_flight(&self, slot: &PairSlot, intent: OrderIntent, opens_position: bool) {
        info!(
            "⏳ {} {} {} {:.6} @ {:.4} resting at the venue ({})",
            intent.pair, intent.reason, intent.side, intent.quantity, intent.price, intent.id
        );
        if let Some(level) = intent.level {
            slot.update_grid(|grid| grid.with_status(&[level], LevelStatus::Submitted));
        }
        slot.runtime()
            .in_flight
            .insert(intent.id, InFlightOrder { intent, opens_position });
    }

    /// Poll resting orders and settle the ones the venue has resolved
    async fn reconcile_in_flight(&self, slot: &PairSlot, report: &mut PairCycleReport) {
        let orders: Vec<InFlightOrder> = slot.runtime().in_flight.values().cloned().collect();
        for order in orders {
            let result = match self.collaborators.gateway.order_status(&order.intent).await {
                Ok(result) if !result.status.is_final() => continue,
                Ok(result) => result,
                Err(GatewayError::UnknownOrder(_)) => OrderResult::cancelled(),
                Err(e) => {
                    warn!("⚠️ {} status of {} unavailable, still in flight: {}", order.intent.pair, order.intent.id, e);
                    continue;
                }
            };
            self.settle(slot, &order, result, report);
        }
    }

    /// Withdraw resting grid orders placed against a replaced grid
    async fn cancel_superseded(&self, slot: &PairSlot, generation: u64, report: &mut PairCycleReport) {
        let stale: Vec<InFlightOrder> = slot
            .runtime()
            .in_flight
            .values()
            .filter(|o| o.intent.level.is_some_and(|level| level.generation < generation))
            .cloned()
            .collect();
        for order in stale {
            let result = match self.collaborators.gateway.cancel_order(&order.intent).await {
                Ok(result) if !result.status.is_final() => continue,
                Ok(result) => result,
                Err(GatewayError::UnknownOrder(_)) => OrderResult::cancelled(),
                Err(e) => {
                    warn!("⚠️ {} cancel of {} failed, still in flight: {}", order.intent.pair, order.intent.id, e);
                    continue;
                }
            };
            self.settle(slot, &order, result, report);
        }
    }

    /// Book whatever a resting order executed, or release what it held
    fn settle(&self, slot: &PairSlot, order: &InFlightOrder, result: OrderResult, report: &mut PairCycleReport) {
        let intent = &order.intent;
        if slot.runtime().in_flight.remove(&intent.id).is_none() {
            return;
        }
        if let Some((fill_price, filled)) = result.execution() {
            self.book_execution(slot, intent, order.opens_position, fill_price, filled, report);
            return;
        }

        if order.opens_position {
            self.governor.release_slot();
        }
        if let Some(level) = intent.level {
            slot.update_grid(|grid| match grid.level(level) {
                Some(current) if current.status == LevelStatus::Submitted => {
                    grid.with_status(&[level], LevelStatus::Pending)
                }
                _ => grid.clone(),
            });
        }
        match result.status {
            OrderStatus::Rejected(reason) => {
                slot.runtime().skipped_fills += 1;
                report.skipped += 1;
                warn!("⏭️ {} {} {} rejected at the venue: {}", intent.pair, intent.reason, intent.id, reason);
            }
            _ => {
                report.withdrawn += 1;
                info!("🗑️ {} {} {} withdrawn without a fill", intent.pair, intent.reason, intent.id);
            }
        }
    }

    fn book_execution(
        &self,
        slot: &PairSlot,
        intent: &OrderIntent,
        opens_position: bool,
        fill_price: f64,
        filled: f64,
        report: &mut PairCycleReport,
    ) {
        match self.apply_execution(slot, intent, opens_position, fill_price, filled) {
            Ok(outcome) => {
                report.filled += 1;
                self.announce_fill(intent, &outcome, fill_price, filled);
            }
            Err(e) => {
                error!("❌ {} fill could not be applied: {}", intent.pair, e);
                report.skipped += 1;
            }
        }
    }

    /// Book an execution: position, risk counters, slot accounting and grid status
    fn apply_execution(
        &self,
        slot: &PairSlot,
        intent: &OrderIntent,
        opens_position: bool,
        fill_price: f64,
        filled: f64,
    ) -> TradingResult<FillOutcome> {
        let now = self.collaborators.clock.now();
        let outcome = {
            let mut guard = slot.runtime();
            let runtime = &mut *guard;
            let outcome = match runtime.positions.apply_fill(intent, fill_price, filled, now) {
                Ok(outcome) => outcome,
                Err(e) => {
                    if opens_position {
                        self.governor.release_slot();
                    }
                    return Err(e);
                }
            };

            self.governor.record_fill(&mut runtime.risk, outcome.realized_pnl);
            if opens_position {
                self.governor.commit_slot();
            }
            if outcome.closed {
                self.governor.position_closed();
                runtime.pnl_alerts.forget(&outcome.key);
            }
            outcome
        };

        let grid_sell = intent.reason == OrderReason::GridLevel && intent.side == Side::Sell;
        slot.update_grid(|grid| {
            let mut next = match intent.level {
                Some(level) if opens_position => grid.with_status(&[level], LevelStatus::Filled).with_sells_rearmed(),
                Some(level) if grid_sell => grid.with_status(&[level], LevelStatus::Filled),
                _ => grid.clone(),
            };
            if outcome.closed {
                next = next.with_status(&[outcome.key.entry_level], LevelStatus::Pending);
            }
            next
        });
        Ok(outcome)
    }

    fn announce_fill(&self, intent: &OrderIntent, outcome: &FillOutcome, fill_price: f64, filled: f64) {
        let mut message = format!(
            "{} {} {:.6} @ {:.4} ({})",
            intent.reason, intent.side, filled, fill_price, outcome.key
        );
        if outcome.closed {
            message.push_str(&format!(", closed with {:+.4} realized", outcome.realized_pnl));
        } else if outcome.realized_pnl != 0.0 {
            message.push_str(&format!(", {:+.4} realized, {:.6} left", outcome.realized_pnl, outcome.remaining_size));
        }
        if filled + f64::EPSILON < intent.quantity {
            message.push_str(&format!(", partial {:.6} of {:.6}", filled, intent.quantity));
        }

        info!("✅ {} {}", intent.pair, message);
        self.alerts.dispatch(Alert::new(
            self.collaborators.clock.now(),
            AlertLevel::Info,
            AlertKind::TradeExecuted,
            Some(&intent.pair),
            message,
        ));
    }

    /// Grids, positions and risk state for every pair plus the global counters
    pub fn snapshot(&self) -> EngineSnapshot {
        let slots: Vec<(String, Arc<PairSlot>)> = self
            .pairs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(pair, slot)| (pair.clone(), Arc::clone(slot)))
            .collect();

        let mut pairs: Vec<PairSnapshot> = slots
            .into_iter()
            .map(|(pair, slot)| {
                let grid = slot.grid();
                let runtime = slot.runtime();
                PairSnapshot {
                    pair,
                    grid,
                    positions: runtime.positions.summary(),
                    risk: runtime.risk.clone(),
                    last_price: runtime.last_price,
                    last_signal: runtime.last_signal.clone(),
                    skipped_fills: runtime.skipped_fills,
                    in_flight_orders: runtime.in_flight.len(),
                }
            })
            .collect();
        pairs.sort_by(|a, b| a.pair.cmp(&b.pair));

        EngineSnapshot { pairs, global: self.governor.global_snapshot() }
    }

    /// Rebuild the pair's grid on its next cycle
    pub fn force_recompute(&self, pair: &str) -> TradingResult<()> {
        self.slot(pair)?.runtime().force_recompute = true;
        info!("🔁 {} grid recompute requested", pair);
        Ok(())
    }

    /// Block new entries for a pair; exits keep running
    pub fn halt_pair(&self, pair: &str) -> TradingResult<()> {
        self.slot(pair)?.runtime().risk.manual_halt = true;
        warn!("⏸️ {} halted by command", pair);
        Ok(())
    }

    pub fn resume_pair(&self, pair: &str) -> TradingResult<()> {
        self.slot(pair)?.runtime().risk.manual_halt = false;
        info!("▶️ {} resumed", pair);
        Ok(())
    }

    /// Validate and swap in a new configuration. Cycles already running keep the old one.
    pub fn reload_config(&self, config: Config) -> TradingResult<()> {
        let next = self.config.replace(config)?;
        self.sync_pairs(&next);
        info!("🔄 Configuration reloaded: {} pairs", next.grid_settings.len());
        Ok(())
    }
}
