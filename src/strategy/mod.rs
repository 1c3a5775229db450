//! Strategy engine: indicators, pattern detection, candidate scoring and
//! risk management.

pub mod indicators;
pub mod patterns;
pub mod risk;
pub mod scorer;
pub mod signals;

use tracing::{debug, info};

use crate::config::{ScoreWeights, ScoringConfig};
use crate::types::{CandleSeries, Direction, SignalCandidate, TradeRecord};
use indicators::{IndicatorParams, IndicatorSnapshot};
use scorer::{Acceptance, AdaptiveScorer, Selection};

// ---------------------------------------------------------------------------
// Decision log
// ---------------------------------------------------------------------------

/// What the pipeline concluded for one (instrument, timeframe).
/// Kept for logging, including the pairs that were passed on.
#[derive(Debug, Clone, PartialEq)]
pub enum PairDecision {
    /// Too little data for the indicators.
    NoData,
    /// Indicators computed but no candidate survived.
    NoCandidates,
    /// Best candidate did not reach the adaptive minimum.
    Rejected {
        top: SignalCandidate,
        minimum: i32,
    },
    Accepted {
        candidate: SignalCandidate,
        minimum: i32,
        via: Acceptance,
    },
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Indicators → candidates → adaptive selection for a single pair.
///
/// Holds no per-cycle state; one instance is shared by all scan tasks.
pub struct SignalPipeline {
    params: IndicatorParams,
    weights: ScoreWeights,
    scorer: AdaptiveScorer,
}

impl SignalPipeline {
    pub fn new(params: IndicatorParams, scoring: ScoringConfig) -> Self {
        Self {
            params,
            weights: scoring.weights.clone(),
            scorer: AdaptiveScorer::new(scoring),
        }
    }

    pub fn scorer(&self) -> &AdaptiveScorer {
        &self.scorer
    }

    /// Indicator snapshot plus every candidate, before selection.
    pub fn candidates(
        &self,
        series: &CandleSeries,
    ) -> Option<(IndicatorSnapshot, Vec<SignalCandidate>)> {
        let snapshot = indicators::compute(series, &self.params)?;
        let candidates = signals::generate(series, &snapshot, &self.weights);
        Some((snapshot, candidates))
    }

    /// Run the whole pipeline against an explicit trade-history window.
    pub fn evaluate(&self, series: &CandleSeries, history: &[TradeRecord]) -> PairDecision {
        let Some((snapshot, candidates)) = self.candidates(series) else {
            debug!(
                instrument = %series.instrument,
                interval_secs = series.interval_secs,
                candles = series.len(),
                "Not enough data for indicators"
            );
            return PairDecision::NoData;
        };

        let bias: Option<Direction> = snapshot.oscillator_bias();
        match self.scorer.select(&candidates, bias, history) {
            Selection::Empty => PairDecision::NoCandidates,
            Selection::Rejected { top, minimum } => {
                debug!(
                    instrument = %series.instrument,
                    candidate = %top,
                    minimum,
                    "Candidate below adaptive minimum"
                );
                PairDecision::Rejected { top, minimum }
            }
            Selection::Accepted {
                candidate,
                minimum,
                via,
            } => {
                info!(
                    instrument = %series.instrument,
                    interval_secs = series.interval_secs,
                    candidate = %candidate,
                    minimum,
                    via = ?via,
                    rsi = format!("{:.1}", snapshot.rsi),
                    "Candidate accepted"
                );
                PairDecision::Accepted {
                    candidate,
                    minimum,
                    via,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
