//! Chart pattern detectors.
//!
//! Every detector has the same shape and is evaluated in the fixed order
//! of `DETECTORS`. A detector that cannot see enough history returns
//! `None`, as does one whose pattern is absent.

use crate::config::ScoreWeights;
use crate::strategy::indicators::{range_of, IndicatorSnapshot};
use crate::types::{CandleSeries, Direction, PatternTag};

/// Peaks closer than this (relative) count as a double top.
const PEAK_TOLERANCE: f64 = 0.0015;
/// Minimum relative depth of the valley between the two peaks.
const VALLEY_DEPTH: f64 = 0.001;
/// Minimum bar distance between the two peaks.
const PEAK_SEPARATION: usize = 5;
/// Pole strength in multiples of the mean absolute close change.
const POLE_STRENGTH: f64 = 4.0;
/// Close must sit within this share of the range from a triangle edge.
const APEX_SHARE: f64 = 0.15;
/// Proximity to a channel edge that still counts as a test of it.
const CHANNEL_TOLERANCE: f64 = 0.0015;
/// Bars examined by the windowed detectors.
const WINDOW: usize = 20;

/// One detector hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub tag: PatternTag,
    pub direction: Direction,
    pub score: i32,
    /// Level a breakout must clear (breakout-style patterns only).
    pub level: Option<f64>,
}

pub type Detector = fn(&CandleSeries, &IndicatorSnapshot, &ScoreWeights) -> Option<Detection>;

/// Detector table in evaluation order.
pub const DETECTORS: [(PatternTag, Detector); 6] = [
    (PatternTag::DoubleTop, double_top),
    (PatternTag::Compression, compression),
    (PatternTag::Flag, flag),
    (PatternTag::Triangle, triangle),
    (PatternTag::ChannelBreakout, channel_breakout),
    (PatternTag::Divergence, divergence),
];

/// Run every detector in table order.
pub fn detect_all(
    series: &CandleSeries,
    snapshot: &IndicatorSnapshot,
    weights: &ScoreWeights,
) -> Vec<Detection> {
    DETECTORS
        .iter()
        .filter_map(|(_, detect)| detect(series, snapshot, weights))
        .collect()
}

/// Two comparable peaks in the recent closes with the last close back
/// below the valley between them.
pub fn double_top(
    series: &CandleSeries,
    _snapshot: &IndicatorSnapshot,
    weights: &ScoreWeights,
) -> Option<Detection> {
    if series.len() < WINDOW {
        return None;
    }
    let closes: Vec<f64> = series.tail(WINDOW).iter().map(|c| c.close).collect();
    let last = *closes.last()?;

    let peaks: Vec<usize> = (1..closes.len() - 1)
        .filter(|&i| closes[i] > closes[i - 1] && closes[i] >= closes[i + 1])
        .collect();

    // Latest qualifying pair wins.
    for (j, &second) in peaks.iter().enumerate().rev() {
        for &first in peaks[..j].iter().rev() {
            if second - first < PEAK_SEPARATION {
                continue;
            }
            let (p1, p2) = (closes[first], closes[second]);
            if (p1 - p2).abs() > p1 * PEAK_TOLERANCE {
                continue;
            }
            let valley = closes[first + 1..second]
                .iter()
                .copied()
                .fold(f64::INFINITY, f64::min);
            if valley > p1.min(p2) * (1.0 - VALLEY_DEPTH) {
                continue;
            }
            if last < valley {
                return Some(Detection {
                    tag: PatternTag::DoubleTop,
                    direction: Direction::Sell,
                    score: weights.double_top,
                    level: Some(valley),
                });
            }
        }
    }
    None
}

/// The bars before the current one contract; the current close leaves
/// the contracted range.
pub fn compression(
    series: &CandleSeries,
    _snapshot: &IndicatorSnapshot,
    weights: &ScoreWeights,
) -> Option<Detection> {
    const BARS: usize = 10;
    if series.len() < BARS + 2 {
        return None;
    }
    let recent = series.tail(BARS + 1);
    let (prior, current) = recent.split_at(BARS);
    let current = current.first()?;
    let (first, last) = (prior.first()?, prior.last()?);
    if !(last.high < first.high && last.low > first.low) {
        return None;
    }

    let high = prior.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let low = prior.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    breakout_of(PatternTag::Compression, current.close, high, low, weights.compression)
}

/// A strong pole followed by a short retracement; the current close
/// leaves the retracement range in the pole's direction.
pub fn flag(
    series: &CandleSeries,
    _snapshot: &IndicatorSnapshot,
    weights: &ScoreWeights,
) -> Option<Detection> {
    if series.len() < WINDOW {
        return None;
    }
    let candles = series.candles();
    let n = candles.len();
    let pole = candles[n - 10].close - candles[n - 15].close;
    let mean_change = candles
        .windows(2)
        .map(|w| (w[1].close - w[0].close).abs())
        .sum::<f64>()
        / (n - 1) as f64;
    if mean_change <= 0.0 || pole.abs() < mean_change * POLE_STRENGTH {
        return None;
    }

    let retracement = &candles[n - 10..n - 1];
    let close = candles[n - 1].close;
    let high = retracement.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let low = retracement.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);

    let direction = Direction::from_sign(if pole > 0.0 { 1 } else { -1 })?;
    let level = match direction {
        Direction::Buy if close > high => high,
        Direction::Sell if close < low => low,
        _ => return None,
    };
    Some(Detection {
        tag: PatternTag::Flag,
        direction,
        score: weights.flag,
        level: Some(level),
    })
}

/// Highs falling and lows rising over the window; the close presses
/// against one edge.
pub fn triangle(
    series: &CandleSeries,
    _snapshot: &IndicatorSnapshot,
    weights: &ScoreWeights,
) -> Option<Detection> {
    if series.len() < WINDOW {
        return None;
    }
    let window = series.tail(WINDOW);
    let (first, last) = (window.first()?, window.last()?);
    if !(last.high < first.high && last.low > first.low) {
        return None;
    }

    let high = window.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let low = window.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let range = range_of(window);
    if range <= 0.0 {
        return None;
    }

    let close = last.close;
    let direction = if (close - high).abs() < range * APEX_SHARE {
        Direction::Buy
    } else if (close - low).abs() < range * APEX_SHARE {
        Direction::Sell
    } else {
        return None;
    };
    Some(Detection {
        tag: PatternTag::Triangle,
        direction,
        score: weights.triangle,
        level: None,
    })
}

/// The close tests or clears the prior window's high (Buy) or low (Sell).
pub fn channel_breakout(
    series: &CandleSeries,
    _snapshot: &IndicatorSnapshot,
    weights: &ScoreWeights,
) -> Option<Detection> {
    if series.len() < WINDOW + 1 {
        return None;
    }
    let recent = series.tail(WINDOW + 1);
    let (prior, current) = recent.split_at(WINDOW);
    let close = current.first()?.close;

    let high = prior.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let low = prior.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);

    let (direction, level) = if close >= high * (1.0 - CHANNEL_TOLERANCE) {
        (Direction::Buy, high)
    } else if close <= low * (1.0 + CHANNEL_TOLERANCE) {
        (Direction::Sell, low)
    } else {
        return None;
    };
    Some(Detection {
        tag: PatternTag::ChannelBreakout,
        direction,
        score: weights.channel_breakout,
        level: Some(level),
    })
}

/// Price and MACD disagree between the two halves of the window.
pub fn divergence(
    series: &CandleSeries,
    snapshot: &IndicatorSnapshot,
    weights: &ScoreWeights,
) -> Option<Detection> {
    let n = series.len();
    if n < WINDOW + 5 || snapshot.macd.len() != n {
        return None;
    }
    let closes: Vec<f64> = series.tail(WINDOW).iter().map(|c| c.close).collect();
    let macd = &snapshot.macd[n - WINDOW..];
    let half = WINDOW / 2;

    let min1 = arg_extreme(&closes[..half], |a, b| a < b);
    let min2 = half + arg_extreme(&closes[half..], |a, b| a < b);
    let max1 = arg_extreme(&closes[..half], |a, b| a > b);
    let max2 = half + arg_extreme(&closes[half..], |a, b| a > b);

    let direction = if closes[min2] < closes[min1] && macd[min2] > macd[min1] {
        Direction::Buy
    } else if closes[max2] > closes[max1] && macd[max2] < macd[max1] {
        Direction::Sell
    } else {
        return None;
    };
    Some(Detection {
        tag: PatternTag::Divergence,
        direction,
        score: weights.divergence,
        level: None,
    })
}

/// Index of the first element that is most extreme under `better`.
fn arg_extreme(values: &[f64], better: impl Fn(f64, f64) -> bool) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if better(v, values[best]) {
            best = i;
        }
    }
    best
}

fn breakout_of(tag: PatternTag, close: f64, high: f64, low: f64, score: i32) -> Option<Detection> {
    let (direction, level) = if close > high {
        (Direction::Buy, high)
    } else if close < low {
        (Direction::Sell, low)
    } else {
        return None;
    };
    Some(Detection {
        tag,
        direction,
        score,
        level: Some(level),
    })
}
