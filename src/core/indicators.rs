// Technical indicator aggregation over a candle window

use crate::config::IndicatorConfig;
use crate::core::types::Candle;
use crate::error::{TradingError, TradingResult};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
    pub prev_histogram: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KdjValue {
    pub k: f64,
    pub d: f64,
    pub j: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrendMetrics {
    pub ema_short: f64,
    pub ema_long: f64,
    pub momentum: f64,  // Fractional change over momentum_period candles
}

impl TrendMetrics {
    /// Relative divergence of the short EMA from the long EMA
    pub fn divergence(&self) -> f64 {
        if self.ema_long == 0.0 {
            0.0
        } else {
            (self.ema_short - self.ema_long) / self.ema_long
        }
    }
}

/// Everything the fusion unit reads for one pair and one cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub close: f64,
    pub rsi: f64,
    pub macd: MacdValue,
    pub bollinger: BollingerBands,
    pub kdj: KdjValue,
    pub trend: TrendMetrics,
    pub volume_trend: f64,
    pub price_position: f64,  // 0-100 within the window range
    pub atr: f64,             // Wilder average true range, quote units
}

impl IndicatorSnapshot {
    pub fn atr_pct(&self) -> f64 {
        if self.close > 0.0 {
            self.atr / self.close * 100.0
        } else {
            0.0
        }
    }
}

/// Volatility and trend quality read by the exit rules
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarketConditions {
    pub atr_pct: f64,
    pub volatility_level: f64,  // ATR percent against the reference, capped at 1
    pub trend_strength: f64,    // Share of confirmations agreeing with the EMA trend, 0-1
}

impl MarketConditions {
    pub fn calm() -> Self {
        Self { atr_pct: 0.0, volatility_level: 0.0, trend_strength: 0.0 }
    }

    /// The EMA trend is confirmed by momentum, a widening MACD histogram on the
    /// same side, and the close sitting in the matching half of the window range.
    pub fn from_snapshot(snapshot: &IndicatorSnapshot, volatility_reference_pct: f64) -> Self {
        let atr_pct = snapshot.atr_pct();
        let volatility_level = if volatility_reference_pct > 0.0 {
            (atr_pct / volatility_reference_pct).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let direction = snapshot.trend.divergence();
        let trend_strength = if direction == 0.0 {
            0.0
        } else {
            let up = direction > 0.0;
            let macd = &snapshot.macd;
            let confirmations = [
                if up { snapshot.trend.momentum > 0.0 } else { snapshot.trend.momentum < 0.0 },
                (macd.histogram > 0.0) == up && macd.histogram != 0.0 && macd.histogram.abs() > macd.prev_histogram.abs(),
                if up { snapshot.price_position > 50.0 } else { snapshot.price_position < 50.0 },
            ];
            confirmations.iter().filter(|c| **c).count() as f64 / confirmations.len() as f64
        };

        Self { atr_pct, volatility_level, trend_strength }
    }
}

/// Stateless: every call is a pure function of the window it is given
#[derive(Debug, Clone)]
pub struct IndicatorAggregator {
    config: IndicatorConfig,
}

impl IndicatorAggregator {
    pub fn new(config: IndicatorConfig) -> Self {
        Self { config }
    }

    pub fn required_history(&self) -> usize {
        self.config.required_history()
    }

    pub fn compute(&self, candles: &[Candle]) -> TradingResult<IndicatorSnapshot> {
        let required = self.required_history();
        if candles.len() < required {
            return Err(TradingError::InsufficientHistory { required, available: candles.len() });
        }
        if let Some(bad) = candles.iter().find(|c| !c.close.is_finite() || c.close <= 0.0) {
            return Err(TradingError::MarketDataUnavailable(format!(
                "invalid close {} at {}",
                bad.close, bad.timestamp
            )));
        }

        let cfg = &self.config;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let close = closes[closes.len() - 1];

        let trend = TrendMetrics {
            ema_short: last_ema(&closes, cfg.trend.short_period),
            ema_long: last_ema(&closes, cfg.trend.long_period),
            momentum: momentum(&closes, cfg.trend.momentum_period),
        };

        Ok(IndicatorSnapshot {
            close,
            rsi: rsi(&closes, cfg.rsi.period),
            macd: macd(&closes, cfg.macd.fast_period, cfg.macd.slow_period, cfg.macd.signal_period),
            bollinger: bollinger(&closes, cfg.bollinger.period, cfg.bollinger.std_dev),
            kdj: kdj(candles, cfg.kdj.k_period, cfg.kdj.d_period),
            trend,
            volume_trend: volume_trend(candles, cfg.trend.volume_window),
            price_position: price_position(candles),
            atr: atr(candles, cfg.trend.atr_period),
        })
    }
}

fn sma(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// EMA series seeded with the SMA of the first `period` values.
/// Element `i` corresponds to input index `i + period - 1`.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut series = Vec::with_capacity(values.len() - period + 1);
    let mut ema = sma(&values[..period]);
    series.push(ema);
    for &value in &values[period..] {
        ema = alpha * value + (1.0 - alpha) * ema;
        series.push(ema);
    }
    series
}

fn last_ema(values: &[f64], period: usize) -> f64 {
    ema_series(values, period).last().copied().unwrap_or(0.0)
}

/// RSI with Wilder smoothing. Flat input gives 50.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 50.0;
    }

    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let mut avg_gain = changes[..period].iter().filter(|c| **c > 0.0).sum::<f64>() / period as f64;
    let mut avg_loss = changes[..period].iter().filter(|c| **c < 0.0).map(|c| -c).sum::<f64>() / period as f64;

    let p = period as f64;
    for &change in &changes[period..] {
        avg_gain = (avg_gain * (p - 1.0) + change.max(0.0)) / p;
        avg_loss = (avg_loss * (p - 1.0) + (-change).max(0.0)) / p;
    }

    if avg_loss == 0.0 {
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> MacdValue {
    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);
    if slow_series.is_empty() || fast_series.len() < slow_series.len() {
        return MacdValue { macd: 0.0, signal: 0.0, histogram: 0.0, prev_histogram: 0.0 };
    }

    let offset = fast_series.len() - slow_series.len();
    let line: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, slow_ema)| fast_series[i + offset] - slow_ema)
        .collect();

    let signal_series = ema_series(&line, signal);
    let macd_now = line[line.len() - 1];
    match signal_series.len() {
        0 => MacdValue { macd: macd_now, signal: macd_now, histogram: 0.0, prev_histogram: 0.0 },
        n => {
            let signal_now = signal_series[n - 1];
            let histogram = macd_now - signal_now;
            let prev_histogram = if n >= 2 {
                line[line.len() - 2] - signal_series[n - 2]
            } else {
                histogram
            };
            MacdValue { macd: macd_now, signal: signal_now, histogram, prev_histogram }
        }
    }
}

/// SMA ± k·σ with population standard deviation
pub fn bollinger(closes: &[f64], period: usize, std_dev: f64) -> BollingerBands {
    let start = closes.len().saturating_sub(period);
    let window = &closes[start..];
    let middle = sma(window);
    let variance = if window.is_empty() {
        0.0
    } else {
        window.iter().map(|p| (p - middle).powi(2)).sum::<f64>() / window.len() as f64
    };
    let band = std_dev * variance.sqrt();
    BollingerBands { upper: middle + band, middle, lower: middle - band }
}

/// KDJ from RSV over `k_period`, K and D smoothed with alpha 1/d_period from 50
pub fn kdj(candles: &[Candle], k_period: usize, d_period: usize) -> KdjValue {
    let mut k = 50.0;
    let mut d = 50.0;
    if k_period == 0 || d_period == 0 || candles.len() < k_period {
        return KdjValue { k, d, j: 3.0 * k - 2.0 * d };
    }

    let alpha = 1.0 / d_period as f64;
    for end in k_period..=candles.len() {
        let window = &candles[end - k_period..end];
        let highest = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let lowest = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let close = window[window.len() - 1].close;
        let rsv = if highest > lowest {
            (close - lowest) / (highest - lowest) * 100.0
        } else {
            50.0
        };
        k = (1.0 - alpha) * k + alpha * rsv;
        d = (1.0 - alpha) * d + alpha * k;
    }
    KdjValue { k, d, j: 3.0 * k - 2.0 * d }
}

pub fn momentum(closes: &[f64], period: usize) -> f64 {
    if closes.len() <= period {
        return 0.0;
    }
    let current = closes[closes.len() - 1];
    let past = closes[closes.len() - period - 1];
    if past == 0.0 {
        0.0
    } else {
        current / past - 1.0
    }
}

/// Mean volume of the last `window` candles relative to the `window` before, minus one
pub fn volume_trend(candles: &[Candle], window: usize) -> f64 {
    if window == 0 || candles.len() < window * 2 {
        return 0.0;
    }
    let n = candles.len();
    let recent: Vec<f64> = candles[n - window..].iter().map(|c| c.volume).collect();
    let prior: Vec<f64> = candles[n - 2 * window..n - window].iter().map(|c| c.volume).collect();
    let prior_mean = sma(&prior);
    if prior_mean <= 0.0 {
        return 0.0;
    }
    sma(&recent) / prior_mean - 1.0
}

/// Where the last close sits within the window's high/low range, 0-100
pub fn price_position(candles: &[Candle]) -> f64 {
    let Some(last) = candles.last() else {
        return 50.0;
    };
    let highest = candles.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let lowest = candles.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    if highest > lowest {
        ((last.close - lowest) / (highest - lowest) * 100.0).clamp(0.0, 100.0)
    } else {
        50.0
    }
}

/// Average true range with Wilder smoothing, seeded with the mean of the first `period` ranges
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    if period == 0 || candles.len() < period + 1 {
        return 0.0;
    }
    let ranges: Vec<f64> = candles
        .windows(2)
        .map(|w| {
            let (prev, bar) = (&w[0], &w[1]);
            (bar.high - bar.low)
                .max((bar.high - prev.close).abs())
                .max((bar.low - prev.close).abs())
        })
        .collect();

    let p = period as f64;
    let mut value = sma(&ranges[..period]);
    for &range in &ranges[period..] {
        value = (value * (p - 1.0) + range) / p;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone, Utc};

    fn candles_from(closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle::new(start + Duration::hours(i as i64), c, c, c, c, 10.0))
            .collect()
    }

    #[test]
    fn test_required_history_defaults() {
        let aggregator = IndicatorAggregator::new(IndicatorConfig::default());
        // 2 x volume_window dominates the defaults
        assert_eq!(aggregator.required_history(), 40);
    }

    #[test]
    fn test_insufficient_history() {
        let aggregator = IndicatorAggregator::new(IndicatorConfig::default());
        let candles = candles_from(&[100.0; 12]);
        match aggregator.compute(&candles) {
            Err(TradingError::InsufficientHistory { required, available }) => {
                assert_eq!(required, 40);
                assert_eq!(available, 12);
            }
            other => panic!("expected insufficient history, got {:?}", other),
        }
    }

    #[test]
    fn test_flat_window_is_neutral() {
        let aggregator = IndicatorAggregator::new(IndicatorConfig::default());
        let snapshot = aggregator.compute(&candles_from(&[100.0; 50])).unwrap();

        assert_eq!(snapshot.rsi, 50.0);
        assert_relative_eq!(snapshot.macd.histogram, 0.0, epsilon = 1e-9);
        assert_relative_eq!(snapshot.bollinger.upper, 100.0, epsilon = 1e-9);
        assert_relative_eq!(snapshot.bollinger.lower, 100.0, epsilon = 1e-9);
        assert_relative_eq!(snapshot.kdj.k, 50.0, epsilon = 1e-9);
        assert_eq!(snapshot.price_position, 50.0);
        assert_eq!(snapshot.volume_trend, 0.0);
        assert_eq!(snapshot.atr, 0.0);

        let conditions = MarketConditions::from_snapshot(&snapshot, 5.0);
        assert_eq!(conditions, MarketConditions::calm());
    }

    #[test]
    fn test_atr_uses_gaps_from_previous_close() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        // Each bar spans 2 and its low sits 2 above the previous close
        let candles: Vec<Candle> = (0..6)
            .map(|i| {
                let low = 100.0 + 3.0 * i as f64;
                Candle::new(start + Duration::hours(i as i64), low, low + 2.0, low, low + 1.0, 10.0)
            })
            .collect();
        // True range is high - prev close = (low + 2) - (low - 2) = 4
        assert_relative_eq!(atr(&candles, 3), 4.0, epsilon = 1e-12);
        assert_eq!(atr(&candles[..3], 3), 0.0);
    }

    #[test]
    fn test_trend_strength_counts_confirmations() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i * i) as f64 * 0.05).collect();
        let aggregator = IndicatorAggregator::new(IndicatorConfig::default());
        let snapshot = aggregator.compute(&candles_from(&closes)).unwrap();

        // Accelerating rally: momentum, widening histogram and a close at the top of the range
        let conditions = MarketConditions::from_snapshot(&snapshot, 5.0);
        assert_relative_eq!(conditions.trend_strength, 1.0);

        let mut fading = snapshot;
        fading.macd.prev_histogram = fading.macd.histogram * 2.0;
        fading.price_position = 40.0;
        let conditions = MarketConditions::from_snapshot(&fading, 5.0);
        assert_relative_eq!(conditions.trend_strength, 1.0 / 3.0);
    }

    #[test]
    fn test_rsi_extremes() {
        let rising: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert_eq!(rsi(&rising, 14), 100.0);
        assert_relative_eq!(rsi(&falling, 14), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_rsi_wilder_smoothing() {
        // Equal gains and losses in the seed window, then one gain of 1
        let mut closes = vec![100.0];
        for i in 0..14 {
            let last = closes[closes.len() - 1];
            closes.push(if i % 2 == 0 { last + 1.0 } else { last - 1.0 });
        }
        let last = closes[closes.len() - 1];
        closes.push(last + 1.0);

        // seed avg gain = avg loss = 0.5; gain -> (0.5*13 + 1)/14, loss -> 0.5*13/14
        let expected_rs = (0.5 * 13.0 + 1.0) / (0.5 * 13.0);
        assert_relative_eq!(rsi(&closes, 14), 100.0 - 100.0 / (1.0 + expected_rs), epsilon = 1e-9);
    }

    #[test]
    fn test_ema_series_seeded_with_sma() {
        let series = ema_series(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(series.len(), 2);
        assert_relative_eq!(series[0], 2.0);
        assert_relative_eq!(series[1], 0.5 * 4.0 + 0.5 * 2.0);
    }

    #[test]
    fn test_macd_positive_on_acceleration() {
        let mut closes = vec![100.0; 40];
        closes.extend((1..=10).map(|i| 100.0 + (i * i) as f64));
        let value = macd(&closes, 12, 26, 9);
        assert!(value.macd > 0.0);
        assert!(value.histogram > 0.0);
    }

    #[test]
    fn test_bollinger_population_sigma() {
        let bands = bollinger(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0], 8, 2.0);
        assert_relative_eq!(bands.middle, 5.0);
        assert_relative_eq!(bands.upper, 9.0);
        assert_relative_eq!(bands.lower, 1.0);
    }

    #[test]
    fn test_kdj_converges_toward_rsv() {
        // Each close sits at the high of a rising window: RSV = 100 every step
        let candles = candles_from(&(0..12).map(|i| 100.0 + i as f64).collect::<Vec<_>>());
        let value = kdj(&candles, 9, 3);
        let steps = (12 - 9 + 1) as i32;
        assert_relative_eq!(value.k, 100.0 - 50.0 * (2.0f64 / 3.0).powi(steps), epsilon = 1e-9);
        assert!(value.d < value.k);
        assert_relative_eq!(value.j, 3.0 * value.k - 2.0 * value.d);
    }

    #[test]
    fn test_volume_trend_and_position() {
        let mut candles = candles_from(&[100.0, 101.0, 102.0, 103.0]);
        candles[2].volume = 20.0;
        candles[3].volume = 20.0;
        assert_relative_eq!(volume_trend(&candles, 2), 1.0);
        assert_relative_eq!(price_position(&candles), 100.0);
    }

    #[test]
    fn test_rejects_non_positive_close() {
        let aggregator = IndicatorAggregator::new(IndicatorConfig::default());
        let mut candles = candles_from(&[100.0; 45]);
        candles[10].close = 0.0;
        assert!(matches!(aggregator.compute(&candles), Err(TradingError::MarketDataUnavailable(_))));
    }
}
