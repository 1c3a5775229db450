//! Market scanner.
//!
//! Fans out over every configured (instrument, timeframe) pair, pulls each
//! series through the shared cache and runs the signal pipeline on it.
//! Fetch concurrency is bounded by the cache's request limiter; pairs may
//! finish in any order, and results are re-ordered by configured position
//! before global selection.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info};

use crate::data::MarketDataCache;
use crate::strategy::scorer::RankedPick;
use crate::strategy::{PairDecision, SignalPipeline};
use crate::types::{Timeframe, TradeRecord};

/// Decision for one scanned pair, with its configured position.
#[derive(Debug, Clone)]
pub struct PairResult {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub instrument_rank: usize,
    pub timeframe_rank: usize,
    pub decision: PairDecision,
}

/// Everything one scan produced.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub pairs: Vec<PairResult>,
}

impl ScanResult {
    pub fn pairs_scanned(&self) -> usize {
        self.pairs.len()
    }

    pub fn no_data(&self) -> usize {
        self.pairs
            .iter()
            .filter(|p| p.decision == PairDecision::NoData)
            .count()
    }

    pub fn rejected(&self) -> usize {
        self.pairs
            .iter()
            .filter(|p| matches!(p.decision, PairDecision::Rejected { .. }))
            .count()
    }

    /// Accepted candidates, in configured scan order.
    pub fn picks(&self) -> Vec<RankedPick> {
        self.pairs
            .iter()
            .filter_map(|p| match &p.decision {
                PairDecision::Accepted {
                    candidate, minimum, ..
                } => Some(RankedPick {
                    instrument: p.instrument.clone(),
                    timeframe: p.timeframe,
                    instrument_rank: p.instrument_rank,
                    timeframe_rank: p.timeframe_rank,
                    candidate: candidate.clone(),
                    minimum: *minimum,
                }),
                _ => None,
            })
            .collect()
    }
}

pub struct Scanner {
    cache: Arc<MarketDataCache>,
    pipeline: SignalPipeline,
    instruments: Vec<String>,
    timeframes: Vec<Timeframe>,
    lookback: usize,
}

impl Scanner {
    pub fn new(
        cache: Arc<MarketDataCache>,
        pipeline: SignalPipeline,
        instruments: Vec<String>,
        timeframes: Vec<Timeframe>,
        lookback: usize,
    ) -> Self {
        Self {
            cache,
            pipeline,
            instruments,
            timeframes,
            lookback,
        }
    }

    /// Scan every pair against the given trade-history window.
    pub async fn scan(&self, history: &[TradeRecord]) -> ScanResult {
        let tasks = self
            .instruments
            .iter()
            .enumerate()
            .flat_map(|(instrument_rank, instrument)| {
                self.timeframes
                    .iter()
                    .enumerate()
                    .map(move |(timeframe_rank, timeframe)| {
                        self.scan_pair(
                            instrument,
                            *timeframe,
                            instrument_rank,
                            timeframe_rank,
                            history,
                        )
                    })
            });

        let mut pairs = join_all(tasks).await;
        pairs.sort_by_key(|p| (p.instrument_rank, p.timeframe_rank));

        let result = ScanResult { pairs };
        info!(
            pairs = result.pairs_scanned(),
            accepted = result.picks().len(),
            rejected = result.rejected(),
            no_data = result.no_data(),
            "Scan complete"
        );
        result
    }

    async fn scan_pair(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        instrument_rank: usize,
        timeframe_rank: usize,
        history: &[TradeRecord],
    ) -> PairResult {
        let series = self
            .cache
            .get(instrument, timeframe.seconds(), self.lookback)
            .await;
        let decision = self.pipeline.evaluate(&series, history);
        debug!(
            instrument,
            timeframe = %timeframe,
            candles = series.len(),
            decision = decision_kind(&decision),
            "Pair scanned"
        );
        PairResult {
            instrument: instrument.to_string(),
            timeframe,
            instrument_rank,
            timeframe_rank,
            decision,
        }
    }
}

fn decision_kind(decision: &PairDecision) -> &'static str {
    match decision {
        PairDecision::NoData => "no_data",
        PairDecision::NoCandidates => "no_candidates",
        PairDecision::Rejected { .. } => "rejected",
        PairDecision::Accepted { .. } => "accepted",
    }
}
