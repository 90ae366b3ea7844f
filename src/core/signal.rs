// Signal fusion: indicator votes, trend and volume analysis, AI confidence gate

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;

use crate::config::{AiSettings, IndicatorConfig, MarketAnalysisConfig};
use crate::core::indicators::IndicatorSnapshot;
use crate::core::types::Direction;

/// EMA divergence that maps to a full trend score
const TREND_SATURATION: f64 = 0.02;
const VOTE_COUNT: f64 = 4.0;

/// Opaque assessment from the external AI model, sub-scores in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AiAssessment {
    pub technical: f64,
    pub fundamental: f64,
    pub sentiment: f64,
}

impl AiAssessment {
    pub fn new(technical: f64, fundamental: f64, sentiment: f64) -> Self {
        Self {
            technical: technical.clamp(0.0, 1.0),
            fundamental: fundamental.clamp(0.0, 1.0),
            sentiment: sentiment.clamp(0.0, 1.0),
        }
    }

    /// Same score for every component
    pub fn uniform(confidence: f64) -> Self {
        Self::new(confidence, confidence, confidence)
    }

    /// Combine sub-scores with the (normalized) ai_settings weights
    pub fn combined(&self, settings: &AiSettings) -> f64 {
        (self.technical * settings.technical_weight
            + self.fundamental * settings.fundamental_weight
            + self.sentiment * settings.sentiment_weight)
            .clamp(0.0, 1.0)
    }
}

/// Source of the AI confidence score. The model behind it is out of scope.
#[async_trait]
pub trait ConfidenceProvider: Send + Sync {
    async fn assess(&self, pair: &str, indicators: &IndicatorSnapshot) -> Option<AiAssessment>;
}

/// Never has an assessment; with AI enabled every directional signal is gated
#[derive(Debug, Default, Clone, Copy)]
pub struct NoConfidence;

#[async_trait]
impl ConfidenceProvider for NoConfidence {
    async fn assess(&self, _pair: &str, _indicators: &IndicatorSnapshot) -> Option<AiAssessment> {
        None
    }
}

/// Fixed assessment, optionally overridden per pair
#[derive(Debug, Clone)]
pub struct StaticConfidence {
    default: Option<AiAssessment>,
    per_pair: HashMap<String, AiAssessment>,
}

impl StaticConfidence {
    pub fn new(confidence: f64) -> Self {
        Self { default: Some(AiAssessment::uniform(confidence)), per_pair: HashMap::new() }
    }

    pub fn with_pair(mut self, pair: &str, assessment: AiAssessment) -> Self {
        self.per_pair.insert(pair.to_string(), assessment);
        self
    }
}

#[async_trait]
impl ConfidenceProvider for StaticConfidence {
    async fn assess(&self, pair: &str, _indicators: &IndicatorSnapshot) -> Option<AiAssessment> {
        self.per_pair.get(pair).copied().or(self.default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Vote {
    Long,
    Short,
    Abstain,
}

impl Vote {
    fn value(self) -> f64 {
        match self {
            Vote::Long => 1.0,
            Vote::Short => -1.0,
            Vote::Abstain => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Votes {
    pub rsi: Vote,
    pub macd: Vote,
    pub bollinger: Vote,
    pub kdj: Vote,
}

impl Votes {
    fn all(&self) -> [Vote; 4] {
        [self.rsi, self.macd, self.bollinger, self.kdj]
    }

    pub fn long(&self) -> usize {
        self.all().iter().filter(|v| **v == Vote::Long).count()
    }

    pub fn short(&self) -> usize {
        self.all().iter().filter(|v| **v == Vote::Short).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalBreakdown {
    pub votes: Votes,
    pub technical: f64,
    pub trend: f64,
    pub sentiment: f64,
    pub weighted_score: f64,
    pub ai_confidence: Option<f64>,
    pub ai_gated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub direction: Direction,
    pub confidence: f64,
    pub breakdown: SignalBreakdown,
}

impl Signal {
    pub fn neutral() -> Self {
        Self {
            direction: Direction::Neutral,
            confidence: 0.0,
            breakdown: SignalBreakdown {
                votes: Votes {
                    rsi: Vote::Abstain,
                    macd: Vote::Abstain,
                    bollinger: Vote::Abstain,
                    kdj: Vote::Abstain,
                },
                technical: 0.0,
                trend: 0.0,
                sentiment: 0.0,
                weighted_score: 0.0,
                ai_confidence: None,
                ai_gated: false,
            },
        }
    }

    /// Long-strength in [0, 1] used for dynamic position sizing
    pub fn long_strength(&self) -> f64 {
        match self.direction {
            Direction::Long => self.confidence,
            Direction::Neutral => 0.5,
            Direction::Short => 0.5 * (1.0 - self.confidence),
        }
    }
}

/// Deterministic combination of indicator votes, trend, volume and AI confidence
#[derive(Debug, Clone)]
pub struct SignalFusion {
    indicators: IndicatorConfig,
    analysis: MarketAnalysisConfig,
    ai: AiSettings,
}

impl SignalFusion {
    pub fn new(indicators: IndicatorConfig, analysis: MarketAnalysisConfig, ai: AiSettings) -> Self {
        Self { indicators, analysis, ai }
    }

    pub fn votes(&self, snapshot: &IndicatorSnapshot) -> Votes {
        let rsi_cfg = &self.indicators.rsi;
        let rsi = if snapshot.rsi < rsi_cfg.oversold {
            Vote::Long
        } else if snapshot.rsi > rsi_cfg.overbought {
            Vote::Short
        } else {
            Vote::Abstain
        };

        let macd = if snapshot.macd.histogram > 0.0 {
            Vote::Long
        } else if snapshot.macd.histogram < 0.0 {
            Vote::Short
        } else {
            Vote::Abstain
        };

        // A collapsed band carries no information
        let bands = &snapshot.bollinger;
        let bollinger = if bands.upper <= bands.lower {
            Vote::Abstain
        } else if snapshot.close <= bands.lower {
            Vote::Long
        } else if snapshot.close >= bands.upper {
            Vote::Short
        } else {
            Vote::Abstain
        };

        let kdj_cfg = &self.indicators.kdj;
        let kdj = if snapshot.kdj.k < kdj_cfg.oversold && snapshot.kdj.d < kdj_cfg.oversold {
            Vote::Long
        } else if snapshot.kdj.k > kdj_cfg.overbought && snapshot.kdj.d > kdj_cfg.overbought {
            Vote::Short
        } else {
            Vote::Abstain
        };

        Votes { rsi, macd, bollinger, kdj }
    }

    pub fn fuse(&self, snapshot: &IndicatorSnapshot, assessment: Option<&AiAssessment>) -> Signal {
        let votes = self.votes(snapshot);
        let technical = votes.all().iter().map(|v| v.value()).sum::<f64>() / VOTE_COUNT;
        let trend = (snapshot.trend.divergence() / TREND_SATURATION).clamp(-1.0, 1.0);
        let momentum_sign = if snapshot.trend.momentum > 0.0 {
            1.0
        } else if snapshot.trend.momentum < 0.0 {
            -1.0
        } else {
            0.0
        };
        let sentiment = snapshot.volume_trend.clamp(-1.0, 1.0) * momentum_sign;

        let weighted_score = self.analysis.sentiment_weight * sentiment
            + self.analysis.technical_weight * technical
            + self.analysis.trend_weight * trend;

        let min_votes = self.analysis.minimum_confirmation_signals;
        let (long, short) = (votes.long(), votes.short());
        let direction = if long >= min_votes && long > short {
            Direction::Long
        } else if short >= min_votes && short > long {
            Direction::Short
        } else {
            Direction::Neutral
        };

        let confidence = match direction {
            Direction::Neutral => 0.0,
            _ => {
                let agreeing = if direction == Direction::Long { long } else { short };
                let aligned = (weighted_score * direction.sign()).max(0.0);
                (0.5 * agreeing as f64 / VOTE_COUNT + 0.5 * aligned).clamp(0.0, 1.0)
            }
        };

        let ai_confidence = assessment.map(|a| a.combined(&self.ai));
        let ai_gated = direction != Direction::Neutral
            && self.ai.enabled
            && ai_confidence.map_or(true, |c| c < self.ai.confidence_threshold);

        let breakdown = SignalBreakdown {
            votes,
            technical,
            trend,
            sentiment,
            weighted_score,
            ai_confidence,
            ai_gated,
        };

        if ai_gated {
            Signal { direction: Direction::Neutral, confidence: 0.0, breakdown }
        } else {
            Signal { direction, confidence, breakdown }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::indicators::{BollingerBands, KdjValue, MacdValue, TrendMetrics};

    fn snapshot(rsi: f64, histogram: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            close: 100.0,
            rsi,
            macd: MacdValue { macd: histogram, signal: 0.0, histogram, prev_histogram: 0.0 },
            bollinger: BollingerBands { upper: 110.0, middle: 100.0, lower: 90.0 },
            kdj: KdjValue { k: 50.0, d: 50.0, j: 50.0 },
            trend: TrendMetrics { ema_short: 100.0, ema_long: 100.0, momentum: 0.0 },
            volume_trend: 0.0,
            price_position: 50.0,
            atr: 0.0,
        }
    }

    fn fusion(ai_enabled: bool) -> SignalFusion {
        let ai = AiSettings { enabled: ai_enabled, ..AiSettings::default() };
        SignalFusion::new(IndicatorConfig::default(), MarketAnalysisConfig::default(), ai)
    }

    #[test]
    fn test_two_confirmations_give_long() {
        let signal = fusion(false).fuse(&snapshot(25.0, 0.5), None);
        assert_eq!(signal.direction, Direction::Long);
        assert!(signal.confidence > 0.0);
        assert_eq!(signal.breakdown.votes.long(), 2);
    }

    #[test]
    fn test_single_vote_is_neutral() {
        let signal = fusion(false).fuse(&snapshot(50.0, 0.5), None);
        assert_eq!(signal.direction, Direction::Neutral);
        assert_eq!(signal.confidence, 0.0);
    }

    #[test]
    fn test_conflicting_votes_are_neutral() {
        let mut snap = snapshot(75.0, 0.5);
        snap.close = 89.0;
        // RSI short, MACD long, Bollinger long
        let signal = fusion(false).fuse(&snap, None);
        assert_eq!(signal.direction, Direction::Long);

        snap.close = 100.0;
        let signal = fusion(false).fuse(&snap, None);
        assert_eq!(signal.direction, Direction::Neutral);
    }

    #[test]
    fn test_ai_gate_downgrades_low_confidence() {
        let signal = fusion(true).fuse(&snapshot(25.0, 0.5), Some(&AiAssessment::uniform(0.4)));
        assert_eq!(signal.direction, Direction::Neutral);
        assert!(signal.breakdown.ai_gated);
        let combined = signal.breakdown.ai_confidence.unwrap();
        assert!((combined - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_ai_gate_never_amplifies() {
        let without = fusion(false).fuse(&snapshot(25.0, 0.5), None);
        let with = fusion(true).fuse(&snapshot(25.0, 0.5), Some(&AiAssessment::uniform(0.95)));
        assert_eq!(with.direction, Direction::Long);
        assert_eq!(with.confidence, without.confidence);
    }

    #[test]
    fn test_missing_assessment_gates_when_enabled() {
        let signal = fusion(true).fuse(&snapshot(25.0, 0.5), None);
        assert_eq!(signal.direction, Direction::Neutral);
    }

    #[test]
    fn test_long_strength_mapping() {
        let mut signal = Signal::neutral();
        assert_eq!(signal.long_strength(), 0.5);
        signal.direction = Direction::Short;
        signal.confidence = 0.6;
        assert!((signal.long_strength() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_static_confidence_per_pair() {
        let provider = StaticConfidence::new(0.8).with_pair("ETH/USDT", AiAssessment::uniform(0.3));
        let snap = snapshot(50.0, 0.0);
        assert_eq!(tokio_test::block_on(provider.assess("BTC/USDT", &snap)), Some(AiAssessment::uniform(0.8)));
        assert_eq!(tokio_test::block_on(provider.assess("ETH/USDT", &snap)), Some(AiAssessment::uniform(0.3)));
        assert_eq!(tokio_test::block_on(NoConfidence.assess("BTC/USDT", &snap)), None);
    }
}
