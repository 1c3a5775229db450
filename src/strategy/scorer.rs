//! Adaptive scorer and selector.
//!
//! The minimum acceptance score moves with the recent winrate: it rises
//! while the agent underperforms its target and relaxes one step while it
//! meets it. The selector ranks one pair's candidates against that
//! minimum; `pick_global` then keeps the best pick of the whole cycle.

use std::cmp::{Ordering, Reverse};
use tracing::debug;

use crate::config::ScoringConfig;
use crate::types::{Direction, SignalCandidate, SignalSource, Timeframe, TradeRecord};

/// Why the top candidate was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Score at or above the adaptive minimum.
    Score,
    /// Below the minimum, rescued by an agreeing independent pattern and
    /// oscillator.
    Confirmed,
}

/// Outcome of selection for one (instrument, timeframe).
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Nothing scored at or above the floor.
    Empty,
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

pub struct AdaptiveScorer {
    config: ScoringConfig,
}

impl AdaptiveScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Winrate over the most recent window, or `None` until enough trades
    /// have settled.
    pub fn rolling_winrate(&self, history: &[TradeRecord]) -> Option<f64> {
        let start = history.len().saturating_sub(self.config.history_window);
        let window = &history[start..];
        if window.is_empty() || window.len() < self.config.min_history {
            return None;
        }
        let wins = window.iter().filter(|t| t.won).count();
        Some(wins as f64 / window.len() as f64)
    }

    /// Adaptive minimum score for the given history.
    pub fn minimum_score(&self, history: &[TradeRecord]) -> i32 {
        let c = &self.config;
        match self.rolling_winrate(history) {
            None => c.base_min_score,
            Some(wr) if wr < c.target_winrate => {
                let steps = ((c.target_winrate - wr) * 10.0).ceil() as i32;
                (c.base_min_score + steps * c.score_increment).min(c.max_min_score)
            }
            Some(_) => (c.base_min_score - c.score_increment).max(c.floor_min_score),
        }
    }

    /// Pick at most one candidate for a pair.
    pub fn select(
        &self,
        candidates: &[SignalCandidate],
        bias: Option<Direction>,
        history: &[TradeRecord],
    ) -> Selection {
        let minimum = self.minimum_score(history);

        let mut ranked: Vec<&SignalCandidate> = candidates
            .iter()
            .filter(|c| c.score >= self.config.floor_min_score)
            .collect();
        ranked.sort_by(|a, b| rank(a, b));

        let Some(top) = ranked.first().copied() else {
            return Selection::Empty;
        };

        if top.score >= minimum {
            return Selection::Accepted {
                candidate: top.clone(),
                minimum,
                via: Acceptance::Score,
            };
        }

        let independent_agrees = candidates.iter().any(|c| {
            c.source == SignalSource::Pattern
                && c.pattern != top.pattern
                && c.direction == top.direction
        });
        if independent_agrees && bias == Some(top.direction) {
            debug!(
                candidate = %top,
                minimum,
                "Weak candidate confirmed by independent pattern and oscillator"
            );
            return Selection::Accepted {
                candidate: top.clone(),
                minimum,
                via: Acceptance::Confirmed,
            };
        }

        Selection::Rejected {
            top: top.clone(),
            minimum,
        }
    }
}

/// Descending score, then source order, then detector order.
fn rank(a: &SignalCandidate, b: &SignalCandidate) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| a.order_key().cmp(&b.order_key()))
}

// ---------------------------------------------------------------------------
// Global selection
// ---------------------------------------------------------------------------

/// An accepted candidate with its position in the configured scan order.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedPick {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub instrument_rank: usize,
    pub timeframe_rank: usize,
    pub candidate: SignalCandidate,
    pub minimum: i32,
}

/// Highest score wins; ties go to the earlier instrument, then timeframe.
pub fn pick_global(picks: Vec<RankedPick>) -> Option<RankedPick> {
    picks.into_iter().min_by_key(|p| {
        (
            Reverse(p.candidate.score),
            p.instrument_rank,
            p.timeframe_rank,
        )
    })
}
