//! Trade executor.
//!
//! Places the cycle's selected trade through the broker port and queries
//! its settlement, retrying a bounded number of times. In dry-run mode
//! nothing reaches the broker.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broker::{place_order, BrokerPort};
use crate::engine::runner::{sleep_with_stop, wait_for_stop};
use crate::strategy::scorer::RankedPick;
use crate::types::{Direction, Timeframe, TradeOutcome};

/// A trade the executor has opened (or, in dry-run mode, would have).
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedTrade {
    pub trade_id: String,
    pub instrument: String,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub amount: Decimal,
    pub score: i32,
    pub label: String,
    pub placed_at: DateTime<Utc>,
    pub dry_run: bool,
}

pub struct Executor {
    broker: Arc<dyn BrokerPort>,
    duration_secs: u64,
    dry_run: bool,
    settle_attempts: usize,
    settle_backoff: Duration,
    sleep_slice: Duration,
}

impl Executor {
    pub fn new(broker: Arc<dyn BrokerPort>, duration_secs: u64, dry_run: bool) -> Self {
        Self {
            broker,
            duration_secs,
            dry_run,
            settle_attempts: 3,
            settle_backoff: Duration::from_secs(5),
            sleep_slice: Duration::from_secs(1),
        }
    }

    /// Settlement lookups to try, the pause between them, and the slice
    /// the pause checks the stop signal at.
    pub fn with_settlement_retry(
        mut self,
        attempts: usize,
        backoff: Duration,
        sleep_slice: Duration,
    ) -> Self {
        self.settle_attempts = attempts.max(1);
        self.settle_backoff = backoff;
        self.sleep_slice = sleep_slice;
        self
    }

    /// Open the trade for a selected pick at the approved stake.
    pub async fn place(&self, pick: &RankedPick, amount: Decimal) -> Result<PlacedTrade> {
        let candidate = &pick.candidate;

        if self.dry_run {
            let trade_id = format!("dry-{}", &Uuid::new_v4().to_string()[..8]);
            info!(
                instrument = %pick.instrument,
                timeframe = %pick.timeframe,
                direction = %candidate.direction,
                amount = format!("${:.2}", amount),
                score = candidate.score,
                signal = %candidate.label(),
                "[DRY RUN] Would place trade"
            );
            return Ok(self.record(pick, amount, trade_id, true));
        }

        let trade_id = place_order(
            self.broker.as_ref(),
            candidate.direction,
            &pick.instrument,
            amount,
            self.duration_secs,
        )
        .await
        .with_context(|| {
            format!(
                "Failed to place {} on {} via {}",
                candidate.direction,
                pick.instrument,
                self.broker.name()
            )
        })?;

        info!(
            trade_id = %trade_id,
            broker = self.broker.name(),
            instrument = %pick.instrument,
            timeframe = %pick.timeframe,
            direction = %candidate.direction,
            amount = format!("${:.2}", amount),
            duration_secs = self.duration_secs,
            score = candidate.score,
            signal = %candidate.label(),
            "Trade placed"
        );
        Ok(self.record(pick, amount, trade_id, false))
    }

    /// Query and normalise the settlement of a placed trade. Failed
    /// lookups are retried; a stop request ends the retries early.
    pub async fn settle(
        &self,
        trade: &PlacedTrade,
        stop: &watch::Receiver<bool>,
    ) -> Result<TradeOutcome> {
        let mut last_error = None;
        for attempt in 1..=self.settle_attempts {
            let lookup = tokio::select! {
                result = self.broker.check_win(&trade.trade_id) => Some(result),
                () = wait_for_stop(stop) => None,
            };
            let Some(result) = lookup else {
                break;
            };
            match result {
                Ok(raw) => return Ok(raw.normalize()),
                Err(e) => {
                    warn!(
                        trade_id = %trade.trade_id,
                        attempt,
                        max_attempts = self.settle_attempts,
                        error = %e,
                        "Settlement lookup failed"
                    );
                    last_error = Some(e);
                }
            }
            if attempt < self.settle_attempts
                && sleep_with_stop(self.settle_backoff, self.sleep_slice, stop).await
            {
                break;
            }
        }

        let error = last_error.unwrap_or_else(|| anyhow!("stop requested before lookup"));
        Err(error).with_context(|| format!("Failed to fetch settlement for {}", trade.trade_id))
    }

    fn record(
        &self,
        pick: &RankedPick,
        amount: Decimal,
        trade_id: String,
        dry_run: bool,
    ) -> PlacedTrade {
        PlacedTrade {
            trade_id,
            instrument: pick.instrument.clone(),
            timeframe: pick.timeframe,
            direction: pick.candidate.direction,
            amount,
            score: pick.candidate.score,
            label: pick.candidate.label(),
            placed_at: Utc::now(),
            dry_run,
        }
    }
}
