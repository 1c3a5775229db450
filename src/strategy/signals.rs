//! Signal candidate generation.
//!
//! Turns one series plus its indicator snapshot into zero or more
//! directional candidates: pattern hits that survive breakout
//! confirmation and the oscillator filter, the indicator trend signal, and
//! a combined candidate when the two agree.

use chrono::{TimeZone, Utc};
use std::fmt;
use tracing::debug;

use crate::config::ScoreWeights;
use crate::strategy::indicators::IndicatorSnapshot;
use crate::strategy::patterns::{detect_all, Detection};
use crate::types::{CandleSeries, Direction, PatternTag, SignalCandidate, SignalSource};

/// Close must clear the level by this fraction for a percentage confirm.
pub const BREAKOUT_PCT: f64 = 0.0015;
/// Close must clear the level by this many ATRs for an ATR confirm.
pub const BREAKOUT_ATR_MULT: f64 = 0.25;

/// Which confirmation rule accepted a breakout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakoutRule {
    Percent,
    Atr,
    Close,
}

impl fmt::Display for BreakoutRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakoutRule::Percent => write!(f, "pct"),
            BreakoutRule::Atr => write!(f, "atr"),
            BreakoutRule::Close => write!(f, "close"),
        }
    }
}

/// Confirm a breakout of `level` in `direction`. Rules are tried in order
/// (percentage, ATR multiple, plain close beyond the level); the first
/// that passes is returned.
pub fn confirm_breakout(
    close: f64,
    level: f64,
    direction: Direction,
    atr: f64,
) -> Option<BreakoutRule> {
    // Distance past the level in the breakout direction.
    let beyond = match direction {
        Direction::Buy => close - level,
        Direction::Sell => level - close,
    };
    if beyond >= level.abs() * BREAKOUT_PCT {
        Some(BreakoutRule::Percent)
    } else if atr > 0.0 && beyond >= atr * BREAKOUT_ATR_MULT {
        Some(BreakoutRule::Atr)
    } else if beyond > 0.0 {
        Some(BreakoutRule::Close)
    } else {
        None
    }
}

/// Produce every candidate for one (instrument, timeframe).
pub fn generate(
    series: &CandleSeries,
    snapshot: &IndicatorSnapshot,
    weights: &ScoreWeights,
) -> Vec<SignalCandidate> {
    let Some(last) = series.last() else {
        return Vec::new();
    };
    let timestamp = Utc
        .timestamp_opt(last.time, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let bias = snapshot.oscillator_bias();
    let make = |direction, score, source, pattern| SignalCandidate {
        direction,
        score,
        source,
        pattern,
        reference_price: last.close,
        timestamp,
    };

    let mut candidates: Vec<SignalCandidate> = Vec::new();

    // Patterns, in table order.
    for detection in detect_all(series, snapshot, weights) {
        if !passes_confirmation(&detection, last.close, snapshot.atr, &series.instrument) {
            continue;
        }
        if conflicts_with_oscillator(detection.direction, bias)
            && detection.tag != PatternTag::ChannelBreakout
        {
            debug!(
                instrument = %series.instrument,
                pattern = %detection.tag,
                direction = %detection.direction,
                rsi = format!("{:.1}", snapshot.rsi),
                "Pattern discarded by oscillator filter"
            );
            continue;
        }
        candidates.push(make(
            detection.direction,
            detection.score,
            SignalSource::Pattern,
            Some(detection.tag),
        ));
    }

    // Indicator trend signal.
    let indicator = indicator_direction(snapshot)
        .filter(|d| !conflicts_with_oscillator(*d, bias))
        .map(|direction| {
            let mut score = weights.indicator_base;
            if snapshot.htf_bias == direction.sign() {
                score += weights.htf_bonus;
            }
            make(direction, score, SignalSource::Indicator, None)
        });

    if let Some(ind) = indicator {
        // Best pattern by score, earlier detector on ties.
        let best_pattern = candidates
            .iter()
            .min_by_key(|c| (std::cmp::Reverse(c.score), c.pattern))
            .cloned();
        if let Some(pat) = best_pattern.filter(|p| p.direction == ind.direction) {
            candidates.push(make(
                ind.direction,
                ind.score.max(pat.score) + weights.confluence_bonus,
                SignalSource::Combined,
                pat.pattern,
            ));
        }
        candidates.push(ind);
    }

    candidates
}

/// MA confirmation agreeing with trend force, outside a sideways market.
fn indicator_direction(snapshot: &IndicatorSnapshot) -> Option<Direction> {
    if snapshot.sideways
        || snapshot.ma_confirmation == 0
        || snapshot.ma_confirmation != snapshot.trend_force
    {
        return None;
    }
    Direction::from_sign(snapshot.ma_confirmation)
}

fn conflicts_with_oscillator(direction: Direction, bias: Option<Direction>) -> bool {
    matches!(bias, Some(b) if b != direction)
}

fn passes_confirmation(detection: &Detection, close: f64, atr: f64, instrument: &str) -> bool {
    if !detection.tag.is_breakout() {
        return true;
    }
    let Some(level) = detection.level else {
        return false;
    };
    match confirm_breakout(close, level, detection.direction, atr) {
        Some(rule) => {
            debug!(
                instrument,
                pattern = %detection.tag,
                direction = %detection.direction,
                level,
                rule = %rule,
                "Breakout confirmed"
            );
            true
        }
        None => {
            debug!(
                instrument,
                pattern = %detection.tag,
                level,
                "Breakout not confirmed"
            );
            false
        }
    }
}
