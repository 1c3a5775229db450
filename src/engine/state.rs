//! Shared bot state.
//!
//! Each resource sits behind its own lock and no method holds two locks at
//! once. Daily stats roll over lazily: every access compares the stored
//! UTC day with today and resets first when they differ.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::OnceLock;
use tokio::sync::Mutex;
use tracing::info;

use crate::strategy::risk::{drawdown, RiskSnapshot};
use crate::types::{TradeOutcome, TradeRecord};

/// Settled trades kept in memory.
pub const HISTORY_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CumulativeStats {
    pub wins: u64,
    pub losses: u64,
    pub total: u64,
}

impl CumulativeStats {
    pub fn winrate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.wins as f64 / self.total as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyStats {
    pub trades: u32,
    pub losses: u32,
    pub day: NaiveDate,
}

impl DailyStats {
    fn fresh(day: NaiveDate) -> Self {
        Self {
            trades: 0,
            losses: 0,
            day,
        }
    }

    fn roll_to(&mut self, today: NaiveDate) {
        if self.day != today {
            info!(
                previous_day = %self.day,
                trades = self.trades,
                losses = self.losses,
                "Daily stats rolled over"
            );
            *self = Self::fresh(today);
        }
    }
}

/// All mutable agent state shared between the loop and the status API.
pub struct BotState {
    cumulative: Mutex<CumulativeStats>,
    daily: Mutex<DailyStats>,
    history: Mutex<VecDeque<TradeRecord>>,
    streak: Mutex<u32>,
    initial_balance: OnceLock<Decimal>,
}

impl Default for BotState {
    fn default() -> Self {
        Self::new()
    }
}

impl BotState {
    pub fn new() -> Self {
        Self::new_on(today())
    }

    /// State whose daily stats start on `day`.
    pub fn new_on(day: NaiveDate) -> Self {
        Self {
            cumulative: Mutex::new(CumulativeStats::default()),
            daily: Mutex::new(DailyStats::fresh(day)),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            streak: Mutex::new(0),
            initial_balance: OnceLock::new(),
        }
    }

    // ---- cumulative --------------------------------------------------------

    pub async fn cumulative(&self) -> CumulativeStats {
        *self.cumulative.lock().await
    }

    async fn record_cumulative(&self, won: bool) {
        let mut stats = self.cumulative.lock().await;
        stats.total += 1;
        if won {
            stats.wins += 1;
        } else {
            stats.losses += 1;
        }
    }

    // ---- daily -------------------------------------------------------------

    pub async fn daily(&self) -> DailyStats {
        self.daily_on(today()).await
    }

    pub async fn daily_on(&self, today: NaiveDate) -> DailyStats {
        let mut daily = self.daily.lock().await;
        daily.roll_to(today);
        *daily
    }

    /// Count a placed trade against today's limit.
    pub async fn record_trade_placed(&self) {
        self.record_trade_placed_on(today()).await
    }

    pub async fn record_trade_placed_on(&self, today: NaiveDate) {
        let mut daily = self.daily.lock().await;
        daily.roll_to(today);
        daily.trades += 1;
    }

    async fn record_daily_loss_on(&self, today: NaiveDate) {
        let mut daily = self.daily.lock().await;
        daily.roll_to(today);
        daily.losses += 1;
    }

    // ---- history -----------------------------------------------------------

    /// Append a settled trade, evicting the oldest past capacity.
    pub async fn push_history(&self, record: TradeRecord) {
        let mut history = self.history.lock().await;
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// The most recent `n` records, oldest first.
    pub async fn recent_history(&self, n: usize) -> Vec<TradeRecord> {
        let history = self.history.lock().await;
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).copied().collect()
    }

    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    // ---- streak ------------------------------------------------------------

    pub async fn losing_streak(&self) -> u32 {
        *self.streak.lock().await
    }

    async fn record_streak(&self, won: bool) {
        let mut streak = self.streak.lock().await;
        *streak = if won { 0 } else { *streak + 1 };
    }

    // ---- initial balance ---------------------------------------------------

    /// Set the drawdown reference once. Returns whether this call won.
    pub fn set_initial_balance(&self, balance: Decimal) -> bool {
        let won = self.initial_balance.set(balance).is_ok();
        if won {
            info!(balance = %balance, "Initial balance recorded");
        }
        won
    }

    pub fn initial_balance(&self) -> Option<Decimal> {
        self.initial_balance.get().copied()
    }

    /// Fractional loss from the initial balance; 0 when unknown or zero.
    pub fn calculate_drawdown(&self, current: Decimal) -> Decimal {
        drawdown(self.initial_balance(), current)
    }

    // ---- aggregates --------------------------------------------------------

    /// View of the state the risk gate decides on.
    pub async fn risk_snapshot(&self) -> RiskSnapshot {
        self.risk_snapshot_on(today()).await
    }

    pub async fn risk_snapshot_on(&self, today: NaiveDate) -> RiskSnapshot {
        let daily = self.daily_on(today).await;
        let losing_streak = self.losing_streak().await;
        RiskSnapshot {
            daily_trades: daily.trades,
            daily_losses: daily.losses,
            losing_streak,
            initial_balance: self.initial_balance(),
        }
    }

    /// Apply a settlement to every resource, one lock at a time.
    pub async fn record_settlement(&self, outcome: &TradeOutcome) {
        self.record_settlement_on(outcome, today()).await
    }

    pub async fn record_settlement_on(&self, outcome: &TradeOutcome, today: NaiveDate) {
        self.record_cumulative(outcome.won).await;
        if !outcome.won {
            self.record_daily_loss_on(today).await;
        }
        self.record_streak(outcome.won).await;
        self.push_history(TradeRecord::new(outcome.won)).await;
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}
