//! Shared types for the TRADEGATE agent.
//!
//! These types form the data model used across all modules. The broker
//! port speaks in `RawCandle` / `RawOutcome`; everything past the port
//! boundary only ever sees the validated `CandleSeries` and the
//! normalised `TradeOutcome`.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Trade direction. `Buy` is a CALL (price ends higher), `Sell` a PUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// The opposite direction.
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }

    /// Map a signed flag (+1 / -1 / 0) onto a direction.
    pub fn from_sign(sign: i8) -> Option<Self> {
        match sign {
            s if s > 0 => Some(Direction::Buy),
            s if s < 0 => Some(Direction::Sell),
            _ => None,
        }
    }

    /// +1 for Buy, -1 for Sell.
    pub fn sign(&self) -> i8 {
        match self {
            Direction::Buy => 1,
            Direction::Sell => -1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// Candle interval the agent scans on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
}

impl Timeframe {
    /// Interval length in seconds.
    pub fn seconds(&self) -> u32 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1800,
            Timeframe::H1 => 3600,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::M1 => write!(f, "M1"),
            Timeframe::M5 => write!(f, "M5"),
            Timeframe::M15 => write!(f, "M15"),
            Timeframe::M30 => write!(f, "M30"),
            Timeframe::H1 => write!(f, "H1"),
        }
    }
}

/// Parse a timeframe label (case-insensitive).
impl std::str::FromStr for Timeframe {
    type Err = TradeGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "M1" | "1M" => Ok(Timeframe::M1),
            "M5" | "5M" => Ok(Timeframe::M5),
            "M15" | "15M" => Ok(Timeframe::M15),
            "M30" | "30M" => Ok(Timeframe::M30),
            "H1" | "1H" | "60M" => Ok(Timeframe::H1),
            _ => Err(TradeGateError::Config(format!("Unknown timeframe: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Candles
// ---------------------------------------------------------------------------

/// A candle exactly as the broker returned it. Any field may be missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawCandle {
    #[serde(default, alias = "timestamp")]
    pub time: Option<i64>,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
}

impl RawCandle {
    /// Convert into a usable candle. Returns `None` for points with missing
    /// or non-finite fields, or a zero open/close.
    pub fn to_candle(&self) -> Option<Candle> {
        let time = self.time?;
        let (open, high, low, close) = (self.open?, self.high?, self.low?, self.close?);
        let all_finite = [open, high, low, close].iter().all(|v| v.is_finite());
        if !all_finite || open == 0.0 || close == 0.0 {
            return None;
        }
        Some(Candle {
            time,
            open,
            // Some feeds report high/low that do not bracket the body.
            high: high.max(open).max(close),
            low: low.min(open).min(close),
            close,
        })
    }
}

/// One validated OHLC observation. `time` is the bar open in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    /// True range against the previous close.
    pub fn true_range(&self, prev_close: Option<f64>) -> f64 {
        let hl = self.high - self.low;
        match prev_close {
            Some(pc) => hl.max((self.high - pc).abs()).max((self.low - pc).abs()),
            None => hl,
        }
    }
}

/// Ordered candles for one (instrument, interval).
///
/// Invariant: timestamps strictly increasing. Only `CandleSeries::from_raw`
/// and `CandleSeries::empty` construct one outside of tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleSeries {
    pub instrument: String,
    pub interval_secs: u32,
    candles: Vec<Candle>,
}

impl CandleSeries {
    /// An empty series ("no data this cycle").
    pub fn empty(instrument: &str, interval_secs: u32) -> Self {
        Self {
            instrument: instrument.to_string(),
            interval_secs,
            candles: Vec::new(),
        }
    }

    /// Build a series from raw broker points: drop unusable points, sort
    /// ascending and keep the last point seen for each timestamp.
    pub fn from_raw(instrument: &str, interval_secs: u32, raw: &[RawCandle]) -> Self {
        let mut candles: Vec<Candle> = raw.iter().filter_map(RawCandle::to_candle).collect();
        // Stable sort keeps arrival order among duplicates; dedup keeps the latest.
        candles.sort_by_key(|c| c.time);
        let mut deduped: Vec<Candle> = Vec::with_capacity(candles.len());
        for candle in candles {
            match deduped.last_mut() {
                Some(last) if last.time == candle.time => *last = candle,
                _ => deduped.push(candle),
            }
        }
        Self {
            instrument: instrument.to_string(),
            interval_secs,
            candles: deduped,
        }
    }

    /// Build directly from candles that are already ordered. Used by tests
    /// and the paper broker; out-of-order input is re-normalised.
    pub fn from_candles(instrument: &str, interval_secs: u32, candles: Vec<Candle>) -> Self {
        let raw: Vec<RawCandle> = candles
            .iter()
            .map(|c| RawCandle {
                time: Some(c.time),
                open: Some(c.open),
                high: Some(c.high),
                low: Some(c.low),
                close: Some(c.close),
            })
            .collect();
        Self::from_raw(instrument, interval_secs, &raw)
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    /// Keep only the most recent `n` candles.
    pub fn tail(&self, n: usize) -> &[Candle] {
        let start = self.candles.len().saturating_sub(n);
        &self.candles[start..]
    }
}

// ---------------------------------------------------------------------------
// Signal candidates
// ---------------------------------------------------------------------------

/// Chart pattern detectors, in their fixed evaluation order.
///
/// The derived `Ord` is the tie-break order used by the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PatternTag {
    DoubleTop,
    Compression,
    Flag,
    Triangle,
    ChannelBreakout,
    Divergence,
}

impl PatternTag {
    /// Breakout-style patterns must be confirmed against their level.
    pub fn is_breakout(&self) -> bool {
        matches!(
            self,
            PatternTag::Compression | PatternTag::Flag | PatternTag::ChannelBreakout
        )
    }
}

impl fmt::Display for PatternTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PatternTag::DoubleTop => "double_top",
            PatternTag::Compression => "compression",
            PatternTag::Flag => "flag",
            PatternTag::Triangle => "triangle",
            PatternTag::ChannelBreakout => "channel_breakout",
            PatternTag::Divergence => "divergence",
        };
        write!(f, "{name}")
    }
}

/// Where a candidate came from. Variant order is the tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SignalSource {
    Combined,
    Indicator,
    Pattern,
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalSource::Combined => write!(f, "combined"),
            SignalSource::Indicator => write!(f, "indicator"),
            SignalSource::Pattern => write!(f, "pattern"),
        }
    }
}

/// A directional trade idea for one (instrument, timeframe). Cycle-scoped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalCandidate {
    pub direction: Direction,
    pub score: i32,
    pub source: SignalSource,
    pub pattern: Option<PatternTag>,
    pub reference_price: f64,
    pub timestamp: DateTime<Utc>,
}

impl SignalCandidate {
    /// Fixed ordering key used to break score ties: source first, then
    /// detector order for pattern-bearing candidates.
    pub fn order_key(&self) -> (SignalSource, Option<PatternTag>) {
        (self.source, self.pattern)
    }

    /// Label for logs and notifications (`flag`, `indicator`, `combined+flag`).
    pub fn label(&self) -> String {
        match (self.source, self.pattern) {
            (SignalSource::Combined, Some(tag)) => format!("combined+{tag}"),
            (_, Some(tag)) => tag.to_string(),
            (source, None) => source.to_string(),
        }
    }
}

impl fmt::Display for SignalCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] score={} @ {:.5}",
            self.direction,
            self.label(),
            self.score,
            self.reference_price,
        )
    }
}

// ---------------------------------------------------------------------------
// Trade outcomes
// ---------------------------------------------------------------------------

/// Settlement result as the broker reports it. The broker has answered
/// with a bare flag, a signed profit, a result word, or an object over
/// time; all of them deserialize into this one variant type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawOutcome {
    Flag(bool),
    Profit(f64),
    Word(String),
    Structured {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        profit: Option<f64>,
        #[serde(default)]
        win: Option<serde_json::Value>,
    },
}

impl RawOutcome {
    /// Normalise into `{won, profit}`. A draw or an unrecognised shape is
    /// treated as not won.
    pub fn normalize(&self) -> TradeOutcome {
        match self {
            RawOutcome::Flag(won) => TradeOutcome { won: *won, profit: 0.0 },
            RawOutcome::Profit(p) => TradeOutcome { won: *p > 0.0, profit: *p },
            RawOutcome::Word(word) => TradeOutcome {
                won: is_win_word(word),
                profit: 0.0,
            },
            RawOutcome::Structured { result, profit, win } => {
                let profit = profit.unwrap_or(0.0);
                let won = match result.as_deref() {
                    Some(word) => is_win_word(word),
                    None => match win {
                        Some(serde_json::Value::Bool(b)) => *b,
                        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0) > 0.0,
                        _ => profit > 0.0,
                    },
                };
                TradeOutcome { won, profit }
            }
        }
    }
}

fn is_win_word(word: &str) -> bool {
    matches!(word.trim().to_lowercase().as_str(), "win" | "won" | "true")
}

/// Normalised settlement result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub won: bool,
    pub profit: f64,
}

impl TradeOutcome {
    /// Outcome booked when the broker never reports a settlement: the
    /// whole stake is counted as lost.
    pub fn assumed_loss(stake: Decimal) -> Self {
        Self {
            won: false,
            profit: -stake.to_f64().unwrap_or(0.0),
        }
    }
}

impl fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = if self.won { "WIN" } else { "LOSS" };
        write!(f, "{word} ({:+.2})", self.profit)
    }
}

/// One settled trade in the rolling history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub won: bool,
    pub timestamp: DateTime<Utc>,
}

impl TradeRecord {
    pub fn new(won: bool) -> Self {
        Self {
            won,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for TRADEGATE.
#[derive(Debug, thiserror::Error)]
pub enum TradeGateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid risk parameter {name}={value}: expected {expected}")]
    InvalidRiskParameter {
        name: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Broker session invalid (balance sentinel {0})")]
    SessionInvalid(f64),

    #[error("Predictor error: {0}")]
    Predictor(String),

    #[error("Notifier error: {0}")]
    Notifier(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
