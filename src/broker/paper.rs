//! In-process paper broker.
//!
//! Simulates a binary-options venue: seeded random-walk candles, uuid
//! trade ids, a fixed 92% payout on wins and balance bookkeeping. Trades
//! settle against the next simulated price step.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::BrokerPort;
use crate::types::{Direction, RawCandle, RawOutcome};

/// Payout on a winning trade, as a fraction of the stake.
const PAYOUT: f64 = 0.92;

/// Relative standard step of the random walk per bar.
const STEP: f64 = 0.0008;

struct OpenTrade {
    instrument: String,
    direction: Direction,
    stake: f64,
    entry: f64,
}

struct PaperState {
    balance: f64,
    rng: StdRng,
    prices: HashMap<String, f64>,
    open: HashMap<String, OpenTrade>,
}

/// A simulated broker. All state is in-memory.
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(initial_balance: f64, seed: u64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                balance: initial_balance,
                rng: StdRng::seed_from_u64(seed),
                prices: HashMap::new(),
                open: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PaperState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("paper broker state poisoned"))
    }

    fn open_trade(
        &self,
        instrument: &str,
        direction: Direction,
        amount: Decimal,
    ) -> Result<String> {
        let stake = amount
            .to_f64()
            .ok_or_else(|| anyhow!("stake {amount} not representable"))?;
        let mut state = self.lock()?;
        if stake <= 0.0 || stake > state.balance {
            bail!("insufficient paper balance for stake {stake:.2}");
        }
        let entry = current_price(&mut state, instrument);
        state.balance -= stake;

        let id = Uuid::new_v4().simple().to_string()[..8].to_string();
        state.open.insert(
            id.clone(),
            OpenTrade {
                instrument: instrument.to_string(),
                direction,
                stake,
                entry,
            },
        );
        info!(
            trade_id = %id,
            instrument,
            direction = %direction,
            stake = format!("${stake:.2}"),
            entry,
            "Paper trade opened"
        );
        Ok(id)
    }
}

/// Last simulated price for an instrument, seeding it on first use.
fn current_price(state: &mut PaperState, instrument: &str) -> f64 {
    if let Some(price) = state.prices.get(instrument) {
        return *price;
    }
    let seed_price = 1.0 + state.rng.gen_range(0.0..0.5);
    state.prices.insert(instrument.to_string(), seed_price);
    seed_price
}

fn step(rng: &mut StdRng, price: f64) -> f64 {
    let change: f64 = rng.gen_range(-STEP..STEP);
    (price * (1.0 + change)).max(1e-6)
}

#[async_trait]
impl BrokerPort for PaperBroker {
    async fn balance(&self) -> Result<f64> {
        Ok(self.lock()?.balance)
    }

    async fn get_candles(
        &self,
        instrument: &str,
        interval_secs: u32,
        count: usize,
    ) -> Result<Vec<RawCandle>> {
        let mut state = self.lock()?;
        let mut price = current_price(&mut state, instrument);
        let interval = i64::from(interval_secs.max(1));
        let now = Utc::now().timestamp();
        let last_open = now - now.rem_euclid(interval);
        let first_open = last_open - interval * (count as i64 - 1).max(0);

        let mut candles = Vec::with_capacity(count);
        for i in 0..count {
            let open = price;
            let close = step(&mut state.rng, open);
            let wick: f64 = state.rng.gen_range(0.0..STEP / 2.0);
            candles.push(RawCandle {
                time: Some(first_open + interval * i as i64),
                open: Some(open),
                high: Some(open.max(close) * (1.0 + wick)),
                low: Some(open.min(close) * (1.0 - wick)),
                close: Some(close),
            });
            price = close;
        }
        state.prices.insert(instrument.to_string(), price);
        debug!(instrument, interval_secs, count, "Paper candles generated");
        Ok(candles)
    }

    async fn buy(&self, instrument: &str, amount: Decimal, _duration_secs: u64) -> Result<String> {
        self.open_trade(instrument, Direction::Buy, amount)
    }

    async fn sell(&self, instrument: &str, amount: Decimal, _duration_secs: u64) -> Result<String> {
        self.open_trade(instrument, Direction::Sell, amount)
    }

    async fn check_win(&self, trade_id: &str) -> Result<RawOutcome> {
        let mut state = self.lock()?;
        let trade = state
            .open
            .remove(trade_id)
            .ok_or_else(|| anyhow!("unknown paper trade {trade_id}"))?;

        let exit = step(&mut state.rng, trade.entry);
        state.prices.insert(trade.instrument.clone(), exit);
        let won = match trade.direction {
            Direction::Buy => exit > trade.entry,
            Direction::Sell => exit < trade.entry,
        };

        let profit = if won {
            let gain = trade.stake * PAYOUT;
            state.balance += trade.stake + gain;
            gain
        } else {
            -trade.stake
        };

        info!(
            trade_id,
            won,
            profit = format!("${profit:.2}"),
            balance = format!("${:.2}", state.balance),
            "Paper trade settled"
        );

        Ok(RawOutcome::Structured {
            result: Some(if won { "win" } else { "loss" }.to_string()),
            profit: Some(profit),
            win: Some(serde_json::json!(if won { profit } else { 0.0 })),
        })
    }

    fn name(&self) -> &str {
        "paper"
    }
}
