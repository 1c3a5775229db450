//! Indicator engine.
//!
//! Computes a point-in-time `IndicatorSnapshot` from a candle series:
//! long-EMA confirmation, ATR, trend force, Wilder RSI, consolidation,
//! higher-timeframe EMA bias, sideways detection, MACD line and simple
//! support/resistance. Too little data yields `None`, never an error.

use serde::Serialize;

use crate::types::{Candle, CandleSeries, Direction};

/// Indicator lookbacks and thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorParams {
    /// Series shorter than this produce no snapshot.
    pub min_len: usize,
    pub ema_long: usize,
    pub confirm_bars: usize,
    pub atr_span: usize,
    pub trend_bars: usize,
    pub rsi_period: usize,
    pub consolidation_bars: usize,
    pub consolidation_atr_mult: f64,
    pub htf_mult: u32,
    pub htf_fast: usize,
    pub htf_slow: usize,
    pub sideways_bars: usize,
    pub sideways_atr_mult: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub level_bars: usize,
    pub level_tolerance: f64,
    pub rsi_buy_bias: f64,
    pub rsi_sell_bias: f64,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            min_len: 50,
            ema_long: 50,
            confirm_bars: 10,
            atr_span: 7,
            trend_bars: 14,
            rsi_period: 14,
            consolidation_bars: 10,
            consolidation_atr_mult: 0.5,
            htf_mult: 2,
            htf_fast: 40,
            htf_slow: 100,
            sideways_bars: 20,
            sideways_atr_mult: 1.0,
            macd_fast: 8,
            macd_slow: 21,
            level_bars: 10,
            level_tolerance: 0.001,
            rsi_buy_bias: 55.0,
            rsi_sell_bias: 45.0,
        }
    }
}

/// Indicator values at the last bar of a series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub last_close: f64,
    pub ema_long: f64,
    /// +1 / -1 when every bar of the confirmation window closed above /
    /// below the long EMA.
    pub ma_confirmation: i8,
    pub atr: f64,
    /// +1 / -1 when the move over the trend window exceeds one ATR.
    pub trend_force: i8,
    pub rsi: f64,
    pub consolidating: bool,
    pub htf_bias: i8,
    pub sideways: bool,
    pub support: f64,
    pub resistance: f64,
    pub near_support: bool,
    pub near_resistance: bool,
    /// MACD line, aligned with the series' candles.
    #[serde(skip)]
    pub macd: Vec<f64>,
    #[serde(skip)]
    rsi_buy_bias: f64,
    #[serde(skip)]
    rsi_sell_bias: f64,
}

impl IndicatorSnapshot {
    /// Direction the oscillator leans, or `None` when neutral.
    pub fn oscillator_bias(&self) -> Option<Direction> {
        if self.rsi >= self.rsi_buy_bias {
            Some(Direction::Buy)
        } else if self.rsi <= self.rsi_sell_bias {
            Some(Direction::Sell)
        } else {
            None
        }
    }
}

/// Compute the snapshot for the last bar, or `None` on insufficient data.
pub fn compute(series: &CandleSeries, params: &IndicatorParams) -> Option<IndicatorSnapshot> {
    let candles = series.candles();
    let min_len = params
        .min_len
        .max(params.confirm_bars)
        .max(params.trend_bars + 1)
        .max(params.consolidation_bars)
        .max(params.level_bars);
    if candles.len() < min_len {
        return None;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let n = closes.len();
    let last_close = closes[n - 1];

    let ema_long = ema_series(&closes, params.ema_long);
    let ma_confirmation = ma_confirmation(&closes, &ema_long, params.confirm_bars);

    let atr_values = atr_series(candles, params.atr_span);
    let atr = atr_values[n - 1];

    let trend_force = if atr > 0.0 {
        let moved = (last_close - closes[n - 1 - params.trend_bars]) / atr;
        sign_beyond(moved, 1.0)
    } else {
        0
    };

    let window = &candles[n - params.consolidation_bars..];
    let consolidating =
        atr > 0.0 && range_of(window) < atr * params.consolidation_atr_mult;

    let levels = &candles[n - params.level_bars..];
    let support = levels.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let resistance = levels
        .iter()
        .map(|c| c.high)
        .fold(f64::NEG_INFINITY, f64::max);

    let macd = macd_line(&closes, params.macd_fast, params.macd_slow);

    Some(IndicatorSnapshot {
        last_close,
        ema_long: ema_long[n - 1],
        ma_confirmation,
        atr,
        trend_force,
        rsi: wilder_rsi(&closes, params.rsi_period),
        consolidating,
        htf_bias: htf_bias(series, params),
        sideways: is_sideways(candles, &atr_values, params),
        support,
        resistance,
        near_support: (last_close - support).abs() <= support * params.level_tolerance,
        near_resistance: (last_close - resistance).abs() <= resistance * params.level_tolerance,
        macd,
        rsi_buy_bias: params.rsi_buy_bias,
        rsi_sell_bias: params.rsi_sell_bias,
    })
}

// ---------------------------------------------------------------------------
// Building blocks
// ---------------------------------------------------------------------------

/// Exponential moving average seeded with the first value
/// (alpha = 2 / (span + 1)).
pub fn ema_series(values: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span.max(1) as f64 + 1.0);
    smooth(values, alpha)
}

fn smooth(values: &[f64], alpha: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    for &v in values {
        let next = match prev {
            Some(p) => alpha * v + (1.0 - alpha) * p,
            None => v,
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

/// ATR as an EMA of the true range; the first bar uses high - low.
pub fn atr_series(candles: &[Candle], span: usize) -> Vec<f64> {
    let tr: Vec<f64> = candles
        .iter()
        .enumerate()
        .map(|(i, c)| c.true_range(i.checked_sub(1).map(|p| candles[p].close)))
        .collect();
    ema_series(&tr, span)
}

/// RSI with Wilder smoothing (alpha = 1 / period) over all close changes.
/// Only gains gives 100, only losses 0, no movement 50.
pub fn wilder_rsi(closes: &[f64], period: usize) -> f64 {
    if closes.len() < 2 {
        return 50.0;
    }
    let alpha = 1.0 / period.max(1) as f64;
    let (mut avg_gain, mut avg_loss) = (0.0, 0.0);
    for (i, w) in closes.windows(2).enumerate() {
        let change = w[1] - w[0];
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        if i == 0 {
            avg_gain = gain;
            avg_loss = loss;
        } else {
            avg_gain = alpha * gain + (1.0 - alpha) * avg_gain;
            avg_loss = alpha * loss + (1.0 - alpha) * avg_loss;
        }
    }

    match (avg_gain > 0.0, avg_loss > 0.0) {
        (false, false) => 50.0,
        (true, false) => 100.0,
        (false, true) => 0.0,
        (true, true) => 100.0 - 100.0 / (1.0 + avg_gain / avg_loss),
    }
}

/// MACD line: fast EMA minus slow EMA.
pub fn macd_line(closes: &[f64], fast: usize, slow: usize) -> Vec<f64> {
    let f = ema_series(closes, fast);
    let s = ema_series(closes, slow);
    f.iter().zip(s.iter()).map(|(a, b)| a - b).collect()
}

fn ma_confirmation(closes: &[f64], ema: &[f64], bars: usize) -> i8 {
    let n = closes.len();
    if bars == 0 || n < bars {
        return 0;
    }
    let recent = (n - bars)..n;
    if recent.clone().all(|i| closes[i] > ema[i]) {
        1
    } else if recent.clone().all(|i| closes[i] < ema[i]) {
        -1
    } else {
        0
    }
}

fn sign_beyond(value: f64, threshold: f64) -> i8 {
    if value > threshold {
        1
    } else if value < -threshold {
        -1
    } else {
        0
    }
}

/// Highest high minus lowest low.
pub fn range_of(candles: &[Candle]) -> f64 {
    let high = candles.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let low = candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    if candles.is_empty() {
        0.0
    } else {
        high - low
    }
}

/// Price range over the window against the mean ATR over the same window.
/// An unavailable or zero ATR counts as sideways.
fn is_sideways(candles: &[Candle], atr: &[f64], params: &IndicatorParams) -> bool {
    let n = candles.len();
    let bars = params.sideways_bars;
    if bars == 0 || n < bars {
        return false;
    }
    let atr_mean = atr[n - bars..].iter().sum::<f64>() / bars as f64;
    if !atr_mean.is_finite() || atr_mean == 0.0 {
        return true;
    }
    range_of(&candles[n - bars..]) < atr_mean * params.sideways_atr_mult
}

/// Resample closes into buckets of `interval * htf_mult` seconds (last
/// close per bucket, gaps forward-filled) and compare a fast and slow EMA.
fn htf_bias(series: &CandleSeries, params: &IndicatorParams) -> i8 {
    let resampled = resample_closes(series, params);
    let (Some(fast), Some(slow)) = (
        ema_series(&resampled, params.htf_fast).last().copied(),
        ema_series(&resampled, params.htf_slow).last().copied(),
    ) else {
        return 0;
    };
    if fast > slow {
        1
    } else if fast < slow {
        -1
    } else {
        0
    }
}

/// Last close per higher-timeframe bucket. A gap forward-fills at most
/// `htf_slow` buckets, which is all the slow EMA can see.
fn resample_closes(series: &CandleSeries, params: &IndicatorParams) -> Vec<f64> {
    let bucket_secs = i64::from(series.interval_secs) * i64::from(params.htf_mult.max(1));
    if bucket_secs <= 0 {
        return Vec::new();
    }

    let mut resampled: Vec<f64> = Vec::new();
    let mut current_bucket: Option<i64> = None;
    for candle in series.candles() {
        let bucket = candle.time.div_euclid(bucket_secs);
        match current_bucket {
            Some(b) if b == bucket => {
                if let Some(last) = resampled.last_mut() {
                    *last = candle.close;
                }
            }
            Some(b) => {
                if let Some(&prev) = resampled.last() {
                    // Empty buckets carry the previous close forward.
                    let gap = (bucket - b - 1).clamp(0, params.htf_slow as i64);
                    resampled.extend(std::iter::repeat(prev).take(gap as usize));
                }
                resampled.push(candle.close);
                current_bucket = Some(bucket);
            }
            None => {
                resampled.push(candle.close);
                current_bucket = Some(bucket);
            }
        }
    }
    resampled
}
