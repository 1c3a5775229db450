//! Orchestration loop.
//!
//! One cycle: read the balance, scan every pair, pick the single best
//! accepted candidate, run it past the predictor and the risk gate, place
//! the trade, wait out its duration and record the settlement. The loop
//! around it applies idle/error backoff and honours the stop signal at
//! every sleep slice.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use crate::broker::{is_session_invalid, BrokerPort};
use crate::config::{AgentConfig, AppConfig, LoopConfig};
use crate::data::MarketDataCache;
use crate::engine::accountant::{Accountant, CycleReport};
use crate::engine::executor::Executor;
use crate::engine::scanner::Scanner;
use crate::engine::state::{BotState, CumulativeStats};
use crate::engine::Handles;
use crate::notify::{dispatch, Notifier, NotifyEvent};
use crate::predictor::{self, Predictor, SignalFeatures};
use crate::storage::TradeJournal;
use crate::strategy::indicators::IndicatorParams;
use crate::strategy::risk::{DenyReason, RiskDecision, RiskManager};
use crate::strategy::scorer::pick_global;
use crate::strategy::SignalPipeline;
use crate::types::{TradeGateError, TradeOutcome};

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Adaptive loop sleep. Idle cycles stretch the sleep by the idle factor,
/// failed cycles by the error factor; an active cycle resets both.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: f64,
    idle: f64,
    error: f64,
    idle_factor: f64,
    idle_cap: f64,
    error_factor: f64,
    error_cap: f64,
}

impl Backoff {
    pub fn from_config(config: &LoopConfig) -> Self {
        Self {
            base: config.base_sleep_secs,
            idle: config.base_sleep_secs,
            error: config.base_sleep_secs,
            idle_factor: config.idle_factor,
            idle_cap: config.idle_cap_secs,
            error_factor: config.error_factor,
            error_cap: config.error_cap_secs,
        }
    }

    /// A cycle that found nothing to do.
    pub fn on_idle(&mut self) -> Duration {
        self.error = self.base;
        self.idle = (self.idle * self.idle_factor).min(self.idle_cap);
        Duration::from_secs_f64(self.idle)
    }

    /// A cycle that failed unexpectedly.
    pub fn on_error(&mut self) -> Duration {
        self.error = (self.error * self.error_factor).min(self.error_cap);
        Duration::from_secs_f64(self.error)
    }

    /// A cycle that traded.
    pub fn on_active(&mut self) -> Duration {
        self.idle = self.base;
        self.error = self.base;
        Duration::from_secs_f64(self.base)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&LoopConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Stop-aware sleep
// ---------------------------------------------------------------------------

pub fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Resolves once a stop is requested. Pending forever if the sender is
/// dropped without raising it.
pub async fn wait_for_stop(stop: &watch::Receiver<bool>) {
    let mut stop = stop.clone();
    let raised = stop.wait_for(|requested| *requested).await.is_ok();
    if !raised {
        std::future::pending::<()>().await;
    }
}

/// Sleep for `total` in slices of at most `slice`, checking the stop
/// signal before each. Returns `true` if a stop was requested.
pub async fn sleep_with_stop(
    total: Duration,
    slice: Duration,
    stop: &watch::Receiver<bool>,
) -> bool {
    let slice = slice.max(Duration::from_millis(1));
    let deadline = tokio::time::Instant::now() + total;
    loop {
        if stop_requested(stop) {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep((deadline - now).min(slice)).await;
    }
}

// ---------------------------------------------------------------------------
// Cycle outcomes
// ---------------------------------------------------------------------------

/// Why a cycle ended without a trade.
#[derive(Debug, Clone, PartialEq)]
pub enum IdleReason {
    NoSignal,
    PredictorRejected,
    RiskDenied(DenyReason),
}

impl fmt::Display for IdleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdleReason::NoSignal => write!(f, "no accepted signal"),
            IdleReason::PredictorRejected => write!(f, "predictor rejected signal"),
            IdleReason::RiskDenied(reason) => write!(f, "risk denied: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Traded(Box<CycleReport>),
    Idle(IdleReason),
    /// Broker reported the session-invalid balance sentinel.
    SessionInvalid,
    /// Circuit breaker latched; the scan was skipped.
    Halted,
    /// Stop requested mid-cycle.
    Stopped,
}

/// Totals for one run of the loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub cycles: u64,
    pub trades: u64,
    pub errors: u64,
    pub stats: CumulativeStats,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct Agent {
    agent: AgentConfig,
    loop_config: LoopConfig,
    history_window: usize,
    warm_start: usize,
    predictor_threshold: f64,
    broker: Arc<dyn BrokerPort>,
    state: Arc<BotState>,
    risk: Arc<RiskManager>,
    cache: Arc<MarketDataCache>,
    scanner: Scanner,
    executor: Executor,
    accountant: Accountant,
    predictor: Option<Arc<dyn Predictor>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Agent {
    /// Assemble every component from configuration around a connected
    /// broker.
    pub fn build(
        config: &AppConfig,
        broker: Arc<dyn BrokerPort>,
        predictor: Option<Arc<dyn Predictor>>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Result<Self> {
        let risk = RiskManager::new(config.risk.clone()).context("Invalid risk configuration")?;
        let limiter = Arc::new(Semaphore::new(config.system.max_concurrent_requests));
        let cache = Arc::new(MarketDataCache::new(broker.clone(), limiter, &config.cache));
        let scanner = Scanner::new(
            cache.clone(),
            SignalPipeline::new(IndicatorParams::default(), config.scoring.clone()),
            config.trading.instruments.clone(),
            config.timeframes()?,
            config.trading.lookback,
        );
        let executor = Executor::new(
            broker.clone(),
            config.agent.trade_duration_secs,
            config.agent.dry_run,
        )
        .with_settlement_retry(
            config.agent.settlement_attempts,
            config.agent.settlement_retry(),
            Duration::from_millis(config.cycle.sleep_slice_ms),
        );
        let accountant = Accountant::new(config.journal.path.as_deref().map(TradeJournal::new));

        Ok(Self {
            agent: config.agent.clone(),
            loop_config: config.cycle.clone(),
            history_window: config.scoring.history_window,
            warm_start: config.journal.warm_start,
            predictor_threshold: config.predictor.threshold,
            broker,
            state: Arc::new(BotState::new()),
            risk: Arc::new(risk),
            cache,
            scanner,
            executor,
            accountant,
            predictor,
            notifier,
        })
    }

    /// Shared views for the status API.
    pub fn handles(&self) -> Handles {
        Handles {
            agent_name: self.agent.name.clone(),
            dry_run: self.agent.dry_run,
            started_at: Utc::now(),
            state: self.state.clone(),
            risk: self.risk.clone(),
            cache: self.cache.clone(),
        }
    }

    pub fn state(&self) -> &Arc<BotState> {
        &self.state
    }

    pub fn risk(&self) -> &Arc<RiskManager> {
        &self.risk
    }

    /// Run cycles until the stop signal is raised.
    pub async fn run(&self, stop: watch::Receiver<bool>) -> RunSummary {
        if let Err(e) = self.accountant.warm_start(&self.state, self.warm_start).await {
            warn!(error = %e, "Trade journal warm start failed, starting with empty history");
        }
        self.announce().await;

        let slice = Duration::from_millis(self.loop_config.sleep_slice_ms);
        let mut backoff = Backoff::from_config(&self.loop_config);
        let mut summary = RunSummary::default();
        let mut cycle: u64 = 0;

        info!(agent = %self.agent.name, "Entering main loop");

        while !stop_requested(&stop) {
            cycle += 1;
            summary.cycles = cycle;

            let pause = match self.run_cycle(cycle, &stop).await {
                Ok(CycleOutcome::Traded(report)) => {
                    self.risk.reset_errors();
                    summary.trades += 1;
                    log_cycle_report(&report);
                    backoff.on_active()
                }
                Ok(CycleOutcome::Idle(reason)) => {
                    self.risk.reset_errors();
                    let pause = backoff.on_idle();
                    info!(
                        cycle,
                        reason = %reason,
                        sleep_secs = pause.as_secs_f64(),
                        "Cycle idle"
                    );
                    pause
                }
                Ok(CycleOutcome::SessionInvalid) => {
                    Duration::from_secs(self.agent.session_cooldown_secs)
                }
                Ok(CycleOutcome::Halted) => backoff.on_idle(),
                Ok(CycleOutcome::Stopped) => break,
                Err(e) => {
                    summary.errors += 1;
                    let was_tripped = self.risk.is_tripped();
                    self.risk.record_error();
                    self.notify_if_tripped(was_tripped).await;
                    let pause = backoff.on_error();
                    error!(
                        cycle,
                        error = format!("{e:#}"),
                        sleep_secs = pause.as_secs_f64(),
                        "Cycle failed, continuing to next"
                    );
                    pause
                }
            };

            if sleep_with_stop(pause, slice, &stop).await {
                break;
            }
        }

        summary.stats = self.state.cumulative().await;
        info!(
            cycles = summary.cycles,
            trades = summary.trades,
            errors = summary.errors,
            wins = summary.stats.wins,
            losses = summary.stats.losses,
            "Agent stopped"
        );
        summary
    }

    /// Execute one decision cycle.
    pub async fn run_cycle(
        &self,
        cycle: u64,
        stop: &watch::Receiver<bool>,
    ) -> Result<CycleOutcome> {
        info!(cycle, "Starting cycle");

        // 1. Balance and session validity
        let raw_balance = self
            .broker
            .balance()
            .await
            .context("Failed to read balance")?;
        if is_session_invalid(raw_balance) {
            warn!(
                cycle,
                cooldown_secs = self.agent.session_cooldown_secs,
                "{}",
                TradeGateError::SessionInvalid(raw_balance)
            );
            return Ok(CycleOutcome::SessionInvalid);
        }
        let balance = to_decimal(raw_balance)?;
        self.state.set_initial_balance(balance);

        if self.risk.is_tripped() {
            warn!(cycle, "Circuit breaker active, skipping scan");
            return Ok(CycleOutcome::Halted);
        }

        // 2. Scan and select
        let history = self.state.recent_history(self.history_window).await;
        let scan = tokio::select! {
            scan = self.scanner.scan(&history) => scan,
            () = wait_for_stop(stop) => {
                warn!(cycle, "Stop requested during scan");
                return Ok(CycleOutcome::Stopped);
            }
        };
        let picks = scan.picks();
        let accepted = picks.len();
        let Some(pick) = pick_global(picks) else {
            return Ok(CycleOutcome::Idle(IdleReason::NoSignal));
        };
        info!(
            cycle,
            pairs = scan.pairs_scanned(),
            accepted,
            instrument = %pick.instrument,
            timeframe = %pick.timeframe,
            candidate = %pick.candidate,
            minimum = pick.minimum,
            "Signal selected"
        );

        if stop_requested(stop) {
            return Ok(CycleOutcome::Stopped);
        }

        // 3. Predictor gate
        let features = SignalFeatures::from_pick(&pick);
        let verdict = tokio::select! {
            verdict = predictor::evaluate(
                self.predictor.as_deref(),
                &features,
                self.predictor_threshold,
            ) => verdict,
            () = wait_for_stop(stop) => return Ok(CycleOutcome::Stopped),
        };
        if !verdict.passes() {
            return Ok(CycleOutcome::Idle(IdleReason::PredictorRejected));
        }

        // 4. Risk gate
        let snapshot = self.state.risk_snapshot().await;
        let was_tripped = self.risk.is_tripped();
        let decision = self.risk.can_trade(balance, &snapshot);
        info!(
            cycle,
            balance = format!("${:.2}", balance),
            daily_trades = snapshot.daily_trades,
            daily_losses = snapshot.daily_losses,
            losing_streak = snapshot.losing_streak,
            decision = %decision,
            "Risk decision"
        );
        let amount = match decision {
            RiskDecision::Approved { amount } => amount,
            RiskDecision::Denied { reason } => {
                self.notify_if_tripped(was_tripped).await;
                return Ok(CycleOutcome::Idle(IdleReason::RiskDenied(reason)));
            }
        };

        // 5. Execute
        self.notify(&NotifyEvent::Signal {
            instrument: pick.instrument.clone(),
            timeframe: pick.timeframe,
            candidate: pick.candidate.clone(),
            amount,
        })
        .await;
        let trade = self.executor.place(&pick, amount).await?;

        let mut report = CycleReport {
            cycle_number: cycle,
            pairs_scanned: scan.pairs_scanned(),
            accepted,
            selected: format!("{} {} {}", pick.instrument, pick.timeframe, pick.candidate),
            amount,
            trade_id: trade.trade_id.clone(),
            outcome: None,
            balance_before: balance,
            stats: self.state.cumulative().await,
            timestamp: Utc::now(),
        };
        if trade.dry_run {
            return Ok(CycleOutcome::Traded(Box::new(report)));
        }
        self.state.record_trade_placed().await;

        // 6. Settlement
        let wait = self.agent.settlement_wait();
        info!(
            cycle,
            trade_id = %trade.trade_id,
            wait_secs = wait.as_secs(),
            "Awaiting settlement"
        );
        if sleep_with_stop(wait, Duration::from_millis(self.loop_config.sleep_slice_ms), stop).await {
            warn!(trade_id = %trade.trade_id, "Stop requested before settlement");
            return Ok(CycleOutcome::Stopped);
        }

        let outcome = match self.executor.settle(&trade, stop).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Unknown settlements count as losses against the limits.
                let outcome = TradeOutcome::assumed_loss(trade.amount);
                error!(
                    trade_id = %trade.trade_id,
                    error = format!("{e:#}"),
                    "Settlement unresolved, booking the stake as a loss"
                );
                self.accountant
                    .record_settlement(&self.state, &trade, &outcome)
                    .await;
                if stop_requested(stop) {
                    return Ok(CycleOutcome::Stopped);
                }
                return Err(e.context("Settlement unresolved, booked as a loss"));
            }
        };
        let stats = self
            .accountant
            .record_settlement(&self.state, &trade, &outcome)
            .await;
        self.notify(&NotifyEvent::Result {
            instrument: trade.instrument.clone(),
            direction: trade.direction,
            amount: trade.amount,
            outcome,
            stats,
        })
        .await;

        report.outcome = Some(outcome);
        report.stats = stats;
        report.timestamp = Utc::now();
        Ok(CycleOutcome::Traded(Box::new(report)))
    }

    async fn announce(&self) {
        match self.broker.balance().await {
            Ok(balance) => {
                info!(
                    agent = %self.agent.name,
                    broker = self.broker.name(),
                    balance = format!("${:.2}", balance),
                    dry_run = self.agent.dry_run,
                    "Session started"
                );
                self.notify(&NotifyEvent::SessionStarted {
                    agent: self.agent.name.clone(),
                    balance,
                    dry_run: self.agent.dry_run,
                })
                .await;
            }
            Err(e) => warn!(error = %e, "Could not read starting balance"),
        }
    }

    async fn notify(&self, event: &NotifyEvent) {
        dispatch(self.notifier.as_deref(), event).await;
    }

    async fn notify_if_tripped(&self, was_tripped: bool) {
        if was_tripped || !self.risk.is_tripped() {
            return;
        }
        let reason = self
            .risk
            .status()
            .trip_reason
            .unwrap_or_else(|| "unknown".to_string());
        self.notify(&NotifyEvent::CircuitBreaker { reason }).await;
    }
}

fn to_decimal(balance: f64) -> Result<Decimal> {
    Decimal::from_f64(balance)
        .map(|d| d.round_dp(2))
        .ok_or_else(|| TradeGateError::Broker(format!("balance {balance} is not a number")).into())
}

/// Log a one-line cycle summary.
fn log_cycle_report(report: &CycleReport) {
    let outcome = report
        .outcome
        .map(|o| o.to_string())
        .unwrap_or_else(|| "dry-run".to_string());
    info!(
        cycle = report.cycle_number,
        scanned = report.pairs_scanned,
        accepted = report.accepted,
        selected = %report.selected,
        amount = format!("${:.2}", report.amount),
        trade_id = %report.trade_id,
        outcome = %outcome,
        balance_before = format!("${:.2}", report.balance_before),
        wins = report.stats.wins,
        losses = report.stats.losses,
        "Cycle complete"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    fn secs(d: Duration) -> f64 {
        d.as_secs_f64()
    }

    #[test]
    fn test_idle_backoff_sequence() {
        let mut b = Backoff::default();
        let seq: Vec<f64> = (0..6).map(|_| secs(b.on_idle())).collect();
        assert_eq!(seq, vec![7.5, 11.25, 16.875, 25.3125, 30.0, 30.0]);
        assert_eq!(secs(b.on_active()), 5.0);
        assert_eq!(secs(b.on_idle()), 7.5);
    }

    #[test]
    fn test_error_backoff_sequence() {
        let mut b = Backoff::default();
        let seq: Vec<f64> = (0..8).map(|_| secs(b.on_error())).collect();
        assert_eq!(seq, vec![10.0, 20.0, 40.0, 80.0, 160.0, 300.0, 300.0, 300.0]);
        assert_eq!(secs(b.on_active()), 5.0);
        assert_eq!(secs(b.on_error()), 10.0);
    }

    #[test]
    fn test_idle_cycle_resets_error_backoff() {
        let mut b = Backoff::default();
        b.on_error();
        b.on_error();
        b.on_idle();
        assert_eq!(secs(b.on_error()), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_runs_to_completion_without_stop() {
        let (_tx, rx) = watch::channel(false);
        let start = tokio::time::Instant::now();
        let stopped = sleep_with_stop(Duration::from_secs(65), Duration::from_secs(1), &rx).await;
        assert!(!stopped);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(65));
        assert!(elapsed < Duration::from_secs(66));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_ends_within_one_slice_of_stop() {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            let _ = tx.send(true);
        });
        let start = tokio::time::Instant::now();
        let stopped = sleep_with_stop(Duration::from_secs(65), Duration::from_secs(1), &rx).await;
        assert!(stopped);
        assert!(start.elapsed() <= Duration::from_millis(3500));
    }

    #[test]
    fn test_wait_for_stop_wakes_on_request() {
        let (tx, rx) = watch::channel(false);
        let mut waiting = task::spawn(wait_for_stop(&rx));
        assert_pending!(waiting.poll());

        tx.send(true).unwrap();
        assert!(waiting.is_woken());
        assert_ready!(waiting.poll());
    }

    #[test]
    fn test_wait_for_stop_already_raised() {
        let (_tx, rx) = watch::channel(true);
        let mut waiting = task::spawn(wait_for_stop(&rx));
        assert_ready!(waiting.poll());
    }

    #[test]
    fn test_wait_for_stop_pends_after_sender_drop() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let mut waiting = task::spawn(wait_for_stop(&rx));
        assert_pending!(waiting.poll());
    }

    #[test]
    fn test_balance_conversion() {
        assert_eq!(to_decimal(1000.004).unwrap(), Decimal::new(100000, 2));
        assert!(to_decimal(f64::NAN).is_err());
    }
}
