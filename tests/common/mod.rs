//! Mock broker for integration testing.
//!
//! Provides a deterministic `BrokerPort` implementation: geometric
//! trending candles per instrument, scripted settlements and a
//! controllable balance. All state is in-memory.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tradegate::broker::{BrokerPort, SESSION_INVALID};
use tradegate::config::AppConfig;
use tradegate::predictor::{Predictor, SignalFeatures};
use tradegate::types::{Direction, RawCandle, RawOutcome};

/// One order the mock received.
#[derive(Debug, Clone, PartialEq)]
pub struct MockOrder {
    pub instrument: String,
    pub direction: Direction,
    pub amount: Decimal,
}

/// A mock binary-options broker for deterministic testing.
pub struct MockBroker {
    balance: Mutex<f64>,
    /// Per-bar close multiplier per instrument; unknown instruments are flat.
    trends: HashMap<String, f64>,
    outcomes: Mutex<VecDeque<RawOutcome>>,
    orders: Mutex<Vec<MockOrder>>,
    candle_calls: AtomicUsize,
    settlement_calls: AtomicUsize,
    /// If set, `balance` returns this error.
    force_error: Mutex<Option<String>>,
    /// `get_candles` never answers.
    hang_candles: AtomicBool,
    /// `check_win` always errors.
    fail_settlement: AtomicBool,
}

impl MockBroker {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            balance: Mutex::new(initial_balance),
            trends: HashMap::new(),
            outcomes: Mutex::new(VecDeque::new()),
            orders: Mutex::new(Vec::new()),
            candle_calls: AtomicUsize::new(0),
            settlement_calls: AtomicUsize::new(0),
            force_error: Mutex::new(None),
            hang_candles: AtomicBool::new(false),
            fail_settlement: AtomicBool::new(false),
        }
    }

    /// Give an instrument a steady trend (1.001 rises 0.1 % per bar).
    pub fn with_trend(mut self, instrument: &str, factor: f64) -> Self {
        self.trends.insert(instrument.to_string(), factor);
        self
    }

    /// Queue settlement results; once exhausted every trade wins.
    pub fn script_outcomes(&self, outcomes: Vec<RawOutcome>) {
        self.outcomes.lock().unwrap().extend(outcomes);
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn hang_candles(&self) {
        self.hang_candles.store(true, Ordering::SeqCst);
    }

    pub fn fail_settlement(&self) {
        self.fail_settlement.store(true, Ordering::SeqCst);
    }

    pub fn settlement_calls(&self) -> usize {
        self.settlement_calls.load(Ordering::SeqCst)
    }

    pub fn invalidate_session(&self) {
        *self.balance.lock().unwrap() = SESSION_INVALID;
    }

    pub fn orders(&self) -> Vec<MockOrder> {
        self.orders.lock().unwrap().clone()
    }

    pub fn candle_calls(&self) -> usize {
        self.candle_calls.load(Ordering::SeqCst)
    }

    fn record_order(&self, instrument: &str, direction: Direction, amount: Decimal) -> Result<String> {
        let stake = amount.to_f64().ok_or_else(|| anyhow!("bad amount"))?;
        let mut balance = self.balance.lock().unwrap();
        if stake > *balance {
            return Err(anyhow!("insufficient balance"));
        }
        *balance -= stake;
        let mut orders = self.orders.lock().unwrap();
        orders.push(MockOrder {
            instrument: instrument.to_string(),
            direction,
            amount,
        });
        Ok(format!("mock-{}", orders.len()))
    }
}

#[async_trait]
impl BrokerPort for MockBroker {
    async fn balance(&self) -> Result<f64> {
        if let Some(msg) = self.force_error.lock().unwrap().clone() {
            return Err(anyhow!(msg));
        }
        Ok(*self.balance.lock().unwrap())
    }

    async fn get_candles(
        &self,
        instrument: &str,
        interval_secs: u32,
        count: usize,
    ) -> Result<Vec<RawCandle>> {
        self.candle_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_candles.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let factor = self.trends.get(instrument).copied().unwrap_or(1.0);
        let mut price = 1.1;
        Ok((0..count)
            .map(|i| {
                let open = price;
                let close = open * factor;
                price = close;
                RawCandle {
                    time: Some(1_700_000_000 + i as i64 * i64::from(interval_secs)),
                    open: Some(open),
                    high: Some(open.max(close)),
                    low: Some(open.min(close)),
                    close: Some(close),
                }
            })
            .collect())
    }

    async fn buy(&self, instrument: &str, amount: Decimal, _duration_secs: u64) -> Result<String> {
        self.record_order(instrument, Direction::Buy, amount)
    }

    async fn sell(&self, instrument: &str, amount: Decimal, _duration_secs: u64) -> Result<String> {
        self.record_order(instrument, Direction::Sell, amount)
    }

    async fn check_win(&self, _trade_id: &str) -> Result<RawOutcome> {
        self.settlement_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_settlement.load(Ordering::SeqCst) {
            return Err(anyhow!("trade not found"));
        }
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RawOutcome::Word("win".into()));
        let profit = outcome.normalize().profit;
        if profit > 0.0 {
            *self.balance.lock().unwrap() += profit;
        }
        Ok(outcome)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Predictor returning a fixed probability.
pub struct FixedPredictor(pub f64);

#[async_trait]
impl Predictor for FixedPredictor {
    async fn predict_proba(&self, _features: &SignalFeatures) -> Result<f64> {
        Ok(self.0)
    }
}

/// Config scanning the given instruments on M1 with 120-candle lookback.
pub fn make_config(instruments: &[&str]) -> AppConfig {
    let list = instruments
        .iter()
        .map(|i| format!("\"{i}\""))
        .collect::<Vec<_>>()
        .join(", ");
    AppConfig::from_toml(&format!(
        r#"
        [agent]
        name = "TG-IT"
        trade_duration_secs = 60
        settlement_margin_secs = 5
        session_cooldown_secs = 60

        [trading]
        instruments = [{list}]
        timeframes = ["M1"]
        lookback = 120

        [risk]
        risk_per_trade = 0.02
        max_risk_per_trade = 0.05
        max_drawdown = 0.2
        max_daily_losses = 3
        max_daily_trades = 20
        max_consecutive_losses = 4
        "#
    ))
    .unwrap()
}
