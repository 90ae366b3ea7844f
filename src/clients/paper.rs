// Paper execution gateway: simulated fills with slippage, partial fills, resting orders and rejections

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::clients::{ExecutionGateway, GatewayError};
use crate::core::types::{OrderIntent, OrderResult, Side};

#[derive(Debug, Clone)]
pub struct PaperSettings {
    pub max_slippage_bps: f64,          // Adverse slippage drawn from [0, max]
    pub partial_fill_probability: f64,
    pub min_partial_ratio: f64,         // Smallest fraction filled on a partial
    pub rejection_probability: f64,
    pub pending_probability: f64,       // Order rests and resolves on the next status poll
    pub seed: Option<u64>,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self {
            max_slippage_bps: 5.0,
            partial_fill_probability: 0.1,
            min_partial_ratio: 0.3,
            rejection_probability: 0.02,
            pending_probability: 0.05,
            seed: None,
        }
    }
}

impl PaperSettings {
    /// Every order fills completely at the intent price
    pub fn perfect() -> Self {
        Self {
            max_slippage_bps: 0.0,
            partial_fill_probability: 0.0,
            min_partial_ratio: 1.0,
            rejection_probability: 0.0,
            pending_probability: 0.0,
            seed: Some(0),
        }
    }
}

pub struct PaperGateway {
    settings: PaperSettings,
    rng: Mutex<StdRng>,
    resting: Mutex<HashMap<Uuid, OrderIntent>>,
}

impl PaperGateway {
    pub fn new(settings: PaperSettings) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { settings, rng: Mutex::new(rng), resting: Mutex::new(HashMap::new()) }
    }

    pub fn resting_orders(&self) -> usize {
        self.resting.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    fn rests(&self) -> bool {
        let p = self.settings.pending_probability;
        p > 0.0 && {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rng.gen_bool(p.clamp(0.0, 1.0))
        }
    }

    fn take_resting(&self, intent: &OrderIntent) -> Result<OrderIntent, GatewayError> {
        self.resting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&intent.id)
            .ok_or_else(|| GatewayError::UnknownOrder(intent.id.to_string()))
    }

    fn simulate(&self, intent: &OrderIntent) -> OrderResult {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let s = &self.settings;

        if s.rejection_probability > 0.0 && rng.gen_bool(s.rejection_probability.clamp(0.0, 1.0)) {
            return OrderResult::rejected("simulated venue rejection");
        }

        let slippage = if s.max_slippage_bps > 0.0 {
            rng.gen_range(0.0..s.max_slippage_bps) / 10_000.0
        } else {
            0.0
        };
        let fill_price = match intent.side {
            Side::Buy => intent.price * (1.0 + slippage),
            Side::Sell => intent.price * (1.0 - slippage),
        };

        let partial = s.partial_fill_probability > 0.0
            && s.min_partial_ratio < 1.0
            && rng.gen_bool(s.partial_fill_probability.clamp(0.0, 1.0));
        if partial {
            let ratio = rng.gen_range(s.min_partial_ratio.max(0.0)..1.0);
            OrderResult::partial(fill_price, intent.quantity * ratio)
        } else {
            OrderResult::filled(fill_price, intent.quantity)
        }
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn submit_order(&self, intent: &OrderIntent) -> Result<OrderResult, GatewayError> {
        if !(intent.quantity > 0.0 && intent.price > 0.0) {
            return Err(GatewayError::Rejected(format!(
                "invalid order {} {} @ {}",
                intent.side, intent.quantity, intent.price
            )));
        }
        if self.rests() {
            self.resting
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(intent.id, intent.clone());
            debug!("📝 Paper {} {} {:.6} @ {:.4} resting", intent.pair, intent.side, intent.quantity, intent.price);
            return Ok(OrderResult::pending());
        }
        let result = self.simulate(intent);
        debug!("📝 Paper {} {} {:.6} @ {:.4} -> {:?}", intent.pair, intent.side, intent.quantity, intent.price, result.status);
        Ok(result)
    }

    /// A resting order resolves the first time it is polled
    async fn order_status(&self, intent: &OrderIntent) -> Result<OrderResult, GatewayError> {
        let resting = self.take_resting(intent)?;
        let result = self.simulate(&resting);
        debug!("📝 Paper {} {} resolved -> {:?}", resting.pair, resting.id, result.status);
        Ok(result)
    }

    async fn cancel_order(&self, intent: &OrderIntent) -> Result<OrderResult, GatewayError> {
        self.take_resting(intent)?;
        debug!("📝 Paper {} {} cancelled", intent.pair, intent.id);
        Ok(OrderResult::cancelled())
    }
}
