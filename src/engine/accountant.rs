//! Accountant: settlement bookkeeping and per-cycle reports.
//!
//! Applies a settled trade to the shared bot state, appends it to the
//! journal when one is configured, and restores recent history from the
//! journal on startup.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::engine::executor::PlacedTrade;
use crate::engine::state::{BotState, CumulativeStats};
use crate::storage::{JournalEntry, TradeJournal};
use crate::types::TradeOutcome;

// ---------------------------------------------------------------------------
// Cycle report
// ---------------------------------------------------------------------------

/// Summary of a cycle that reached the broker.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_number: u64,
    pub pairs_scanned: usize,
    pub accepted: usize,
    pub selected: String,
    pub amount: Decimal,
    pub trade_id: String,
    /// `None` for dry runs, which never settle.
    pub outcome: Option<TradeOutcome>,
    pub balance_before: Decimal,
    pub stats: CumulativeStats,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

pub struct Accountant {
    journal: Option<TradeJournal>,
}

impl Accountant {
    pub fn new(journal: Option<TradeJournal>) -> Self {
        Self { journal }
    }

    /// Record a settlement in the bot state and the journal. A journal
    /// write failure is logged; the in-memory state is authoritative.
    pub async fn record_settlement(
        &self,
        state: &BotState,
        trade: &PlacedTrade,
        outcome: &TradeOutcome,
    ) -> CumulativeStats {
        state.record_settlement(outcome).await;
        let stats = state.cumulative().await;

        let losing_streak = state.losing_streak().await;

        if let Some(journal) = &self.journal {
            let entry = JournalEntry {
                trade_id: trade.trade_id.clone(),
                instrument: trade.instrument.clone(),
                timeframe: trade.timeframe.to_string(),
                direction: trade.direction,
                score: trade.score,
                label: trade.label.clone(),
                amount: trade.amount,
                won: outcome.won,
                profit: outcome.profit,
                placed_at: trade.placed_at,
                settled_at: Utc::now(),
            };
            if let Err(e) = journal.append(&entry) {
                warn!(error = %e, trade_id = %trade.trade_id, "Failed to append trade journal");
            }
        }

        info!(
            trade_id = %trade.trade_id,
            instrument = %trade.instrument,
            outcome = %outcome,
            wins = stats.wins,
            losses = stats.losses,
            winrate = format!("{:.1}%", stats.winrate().unwrap_or(0.0) * 100.0),
            losing_streak,
            "Trade settled"
        );
        stats
    }

    /// Seed the trade history from the tail of the journal. Returns how
    /// many records were restored.
    pub async fn warm_start(&self, state: &BotState, count: usize) -> Result<usize> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        if count == 0 {
            return Ok(0);
        }
        let entries = journal.load_recent(count)?;
        for entry in &entries {
            state.push_history(entry.to_record()).await;
        }
        info!(restored = entries.len(), "Trade history warm-started from journal");
        Ok(entries.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
