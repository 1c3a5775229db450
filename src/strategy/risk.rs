//! Risk manager.
//!
//! A pure gate over (balance, bot-state snapshot, limits) that approves a
//! stake or denies with a reason, plus a circuit-breaker latch. Once the
//! latch trips (drawdown breach or too many consecutive cycle failures)
//! every trade is denied until `reset_circuit_breaker` is called.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::RiskConfig;
use crate::types::TradeGateError;

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// Point-in-time view of the bot state the gate decides on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RiskSnapshot {
    pub daily_trades: u32,
    pub daily_losses: u32,
    pub losing_streak: u32,
    pub initial_balance: Option<Decimal>,
}

/// Why a trade was denied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DenyReason {
    CircuitBreaker,
    BalanceBelowMinimum { balance: Decimal, minimum: Decimal },
    DailyLossLimit { losses: u32, max: u32 },
    DailyTradeLimit { trades: u32, max: u32 },
    LosingStreak { streak: u32, max: u32 },
    MaxDrawdown { drawdown: Decimal, max: Decimal },
    InsufficientBalance { amount: Decimal, balance: Decimal },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::CircuitBreaker => write!(f, "Circuit breaker active"),
            DenyReason::BalanceBelowMinimum { balance, minimum } => {
                write!(f, "Balance ${balance:.2} below minimum ${minimum:.2}")
            }
            DenyReason::DailyLossLimit { losses, max } => {
                write!(f, "Daily loss limit reached ({losses}/{max})")
            }
            DenyReason::DailyTradeLimit { trades, max } => {
                write!(f, "Daily trade limit reached ({trades}/{max})")
            }
            DenyReason::LosingStreak { streak, max } => {
                write!(f, "Losing streak limit reached ({streak}/{max})")
            }
            DenyReason::MaxDrawdown { drawdown, max } => write!(
                f,
                "Max drawdown reached ({:.1}% >= {:.1}%)",
                drawdown * dec!(100),
                max * dec!(100)
            ),
            DenyReason::InsufficientBalance { amount, balance } => {
                write!(f, "Stake ${amount:.2} exceeds balance ${balance:.2}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Approved { amount: Decimal },
    Denied { reason: DenyReason },
}

impl RiskDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskDecision::Approved { .. })
    }
}

impl fmt::Display for RiskDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskDecision::Approved { amount } => write!(f, "approved ${amount:.2}"),
            RiskDecision::Denied { reason } => write!(f, "denied: {reason}"),
        }
    }
}

/// Snapshot of the gate for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub circuit_breaker: bool,
    pub trip_reason: Option<String>,
    pub consecutive_errors: u32,
    pub error_threshold: u32,
    pub risk_per_trade: Decimal,
    pub max_risk_per_trade: Decimal,
    pub max_drawdown: Decimal,
    pub max_daily_losses: u32,
    pub max_daily_trades: u32,
    pub max_consecutive_losses: u32,
}

// ---------------------------------------------------------------------------
// Risk manager
// ---------------------------------------------------------------------------

pub struct RiskManager {
    config: RiskConfig,
    breaker: AtomicBool,
    consecutive_errors: AtomicU32,
    trip_reason: Mutex<Option<String>>,
}

impl RiskManager {
    /// Validate the limits and build the gate.
    pub fn new(config: RiskConfig) -> Result<Self, TradeGateError> {
        validate(&config)?;
        Ok(Self {
            config,
            breaker: AtomicBool::new(false),
            consecutive_errors: AtomicU32::new(0),
            trip_reason: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Decide whether a trade may be placed and at what stake. Checks run
    /// in a fixed order and the first failure wins. Only a drawdown breach
    /// has a side effect: it latches the breaker.
    pub fn can_trade(&self, balance: Decimal, snapshot: &RiskSnapshot) -> RiskDecision {
        let c = &self.config;
        let deny = |reason| RiskDecision::Denied { reason };

        if self.is_tripped() {
            return deny(DenyReason::CircuitBreaker);
        }
        if balance < c.min_amount {
            return deny(DenyReason::BalanceBelowMinimum {
                balance,
                minimum: c.min_amount,
            });
        }
        if snapshot.daily_losses >= c.max_daily_losses {
            return deny(DenyReason::DailyLossLimit {
                losses: snapshot.daily_losses,
                max: c.max_daily_losses,
            });
        }
        if snapshot.daily_trades >= c.max_daily_trades {
            return deny(DenyReason::DailyTradeLimit {
                trades: snapshot.daily_trades,
                max: c.max_daily_trades,
            });
        }
        if snapshot.losing_streak >= c.max_consecutive_losses {
            return deny(DenyReason::LosingStreak {
                streak: snapshot.losing_streak,
                max: c.max_consecutive_losses,
            });
        }
        if snapshot.initial_balance.is_some() {
            let drawdown = drawdown(snapshot.initial_balance, balance);
            if drawdown >= c.max_drawdown {
                let reason = DenyReason::MaxDrawdown {
                    drawdown,
                    max: c.max_drawdown,
                };
                self.trip(&reason.to_string());
                return deny(reason);
            }
        }

        let amount = (balance * c.risk_per_trade)
            .min(balance * c.max_risk_per_trade)
            .max(c.min_amount)
            .round_dp(2);
        if amount > balance {
            return deny(DenyReason::InsufficientBalance { amount, balance });
        }
        RiskDecision::Approved { amount }
    }

    /// Count an unexpected cycle failure; latches the breaker at the
    /// threshold. Returns the new count.
    pub fn record_error(&self) -> u32 {
        let count = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            consecutive_errors = count,
            threshold = self.config.error_threshold,
            "Cycle error recorded"
        );
        if count >= self.config.error_threshold {
            self.trip(&format!("{count} consecutive cycle errors"));
        }
        count
    }

    /// Clear the consecutive-error count after a successful cycle.
    pub fn reset_errors(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    /// Manual clear of the latch.
    pub fn reset_circuit_breaker(&self) {
        let was = self.breaker.swap(false, Ordering::SeqCst);
        self.consecutive_errors.store(0, Ordering::SeqCst);
        if let Ok(mut reason) = self.trip_reason.lock() {
            *reason = None;
        }
        info!(was_tripped = was, "Circuit breaker reset");
    }

    pub fn is_tripped(&self) -> bool {
        self.breaker.load(Ordering::SeqCst)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> RiskStatus {
        let c = &self.config;
        RiskStatus {
            circuit_breaker: self.is_tripped(),
            trip_reason: self.trip_reason.lock().ok().and_then(|r| r.clone()),
            consecutive_errors: self.consecutive_errors(),
            error_threshold: c.error_threshold,
            risk_per_trade: c.risk_per_trade,
            max_risk_per_trade: c.max_risk_per_trade,
            max_drawdown: c.max_drawdown,
            max_daily_losses: c.max_daily_losses,
            max_daily_trades: c.max_daily_trades,
            max_consecutive_losses: c.max_consecutive_losses,
        }
    }

    fn trip(&self, reason: &str) {
        if !self.breaker.swap(true, Ordering::SeqCst) {
            error!(reason, "CIRCUIT BREAKER TRIPPED: trading halted until manual reset");
            if let Ok(mut slot) = self.trip_reason.lock() {
                *slot = Some(reason.to_string());
            }
        }
    }
}

/// Fractional loss of `current` against `initial`; 0 when the initial
/// balance is unknown or zero.
pub fn drawdown(initial: Option<Decimal>, current: Decimal) -> Decimal {
    match initial {
        Some(initial) if initial > Decimal::ZERO => (initial - current) / initial,
        _ => Decimal::ZERO,
    }
}

fn validate(c: &RiskConfig) -> Result<(), TradeGateError> {
    fn invalid(
        name: &'static str,
        value: impl fmt::Display,
        expected: &'static str,
    ) -> TradeGateError {
        TradeGateError::InvalidRiskParameter {
            name,
            value: value.to_string(),
            expected,
        }
    }

    if c.risk_per_trade < dec!(0.01) || c.risk_per_trade > dec!(0.05) {
        return Err(invalid("risk_per_trade", c.risk_per_trade, "[0.01, 0.05]"));
    }
    if c.max_drawdown < dec!(0.05) || c.max_drawdown > Decimal::ONE {
        return Err(invalid("max_drawdown", c.max_drawdown, "[0.05, 1.0]"));
    }
    if c.max_daily_losses < 1 {
        return Err(invalid("max_daily_losses", c.max_daily_losses, ">= 1"));
    }
    if c.max_risk_per_trade <= Decimal::ZERO || c.max_risk_per_trade > Decimal::ONE {
        return Err(invalid("max_risk_per_trade", c.max_risk_per_trade, "(0, 1]"));
    }
    if c.max_risk_per_trade < c.risk_per_trade {
        return Err(invalid(
            "max_risk_per_trade",
            c.max_risk_per_trade,
            ">= risk_per_trade",
        ));
    }
    if c.max_daily_trades < 1 {
        return Err(invalid("max_daily_trades", c.max_daily_trades, ">= 1"));
    }
    if c.max_consecutive_losses < 1 {
        return Err(invalid("max_consecutive_losses", c.max_consecutive_losses, ">= 1"));
    }
    if c.min_amount <= Decimal::ZERO {
        return Err(invalid("min_amount", c.min_amount, "> 0"));
    }
    if c.error_threshold < 1 {
        return Err(invalid("error_threshold", c.error_threshold, ">= 1"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_manager() -> RiskManager {
        RiskManager::new(RiskConfig::default()).unwrap()
    }

    fn make_snapshot() -> RiskSnapshot {
        RiskSnapshot {
            daily_trades: 0,
            daily_losses: 0,
            losing_streak: 0,
            initial_balance: Some(dec!(1000)),
        }
    }

    fn denied_reason(decision: RiskDecision) -> DenyReason {
        match decision {
            RiskDecision::Denied { reason } => reason,
            other => panic!("expected denial, got {other:?}"),
        }
    }

    // ---- sizing ------------------------------------------------------------

    #[test]
    fn test_standard_stake() {
        let decision = make_manager().can_trade(dec!(1000), &make_snapshot());
        assert_eq!(decision, RiskDecision::Approved { amount: dec!(20.00) });
    }

    #[test]
    fn test_stake_floored_at_minimum() {
        let rm = make_manager();
        let snap = RiskSnapshot {
            initial_balance: None,
            ..make_snapshot()
        };
        assert_eq!(
            rm.can_trade(dec!(10), &snap),
            RiskDecision::Approved { amount: dec!(1) }
        );
    }

    #[test]
    fn test_stake_capped_by_max_risk() {
        let config = RiskConfig {
            risk_per_trade: dec!(0.05),
            max_risk_per_trade: dec!(0.05),
            ..RiskConfig::default()
        };
        let rm = RiskManager::new(config).unwrap();
        assert_eq!(
            rm.can_trade(dec!(1000), &make_snapshot()),
            RiskDecision::Approved { amount: dec!(50) }
        );
    }

    #[test]
    fn test_can_trade_is_repeatable() {
        let rm = make_manager();
        let snap = make_snapshot();
        let first = rm.can_trade(dec!(950), &snap);
        for _ in 0..5 {
            assert_eq!(rm.can_trade(dec!(950), &snap), first);
        }
    }

    // ---- ordered checks ----------------------------------------------------

    #[test]
    fn test_balance_floor() {
        let reason = denied_reason(make_manager().can_trade(dec!(0.5), &make_snapshot()));
        assert!(matches!(reason, DenyReason::BalanceBelowMinimum { .. }));
    }

    #[test]
    fn test_daily_loss_limit() {
        let snap = RiskSnapshot {
            daily_losses: 3,
            ..make_snapshot()
        };
        let reason = denied_reason(make_manager().can_trade(dec!(1000), &snap));
        assert!(matches!(reason, DenyReason::DailyLossLimit { losses: 3, max: 3 }));
        assert!(reason.to_string().contains("Daily loss limit"));
    }

    #[test]
    fn test_daily_losses_checked_before_trades() {
        let snap = RiskSnapshot {
            daily_losses: 3,
            daily_trades: 20,
            losing_streak: 4,
            ..make_snapshot()
        };
        let reason = denied_reason(make_manager().can_trade(dec!(1000), &snap));
        assert!(matches!(reason, DenyReason::DailyLossLimit { .. }));
    }

    #[test]
    fn test_daily_trade_limit_and_streak() {
        let rm = make_manager();
        let trades = RiskSnapshot {
            daily_trades: 20,
            ..make_snapshot()
        };
        assert!(matches!(
            denied_reason(rm.can_trade(dec!(1000), &trades)),
            DenyReason::DailyTradeLimit { .. }
        ));
        let streak = RiskSnapshot {
            losing_streak: 4,
            ..make_snapshot()
        };
        assert!(matches!(
            denied_reason(rm.can_trade(dec!(1000), &streak)),
            DenyReason::LosingStreak { .. }
        ));
    }

    // ---- circuit breaker ---------------------------------------------------

    #[test]
    fn test_drawdown_latches_breaker() {
        let rm = make_manager();
        let snap = make_snapshot();
        let reason = denied_reason(rm.can_trade(dec!(800), &snap));
        assert!(matches!(reason, DenyReason::MaxDrawdown { .. }));
        assert!(rm.is_tripped());

        // Latched for any balance, even a full recovery.
        for balance in [dec!(1000), dec!(5000), dec!(900)] {
            assert_eq!(
                denied_reason(rm.can_trade(balance, &snap)),
                DenyReason::CircuitBreaker
            );
        }

        rm.reset_circuit_breaker();
        assert!(!rm.is_tripped());
        assert!(rm.can_trade(dec!(1000), &snap).is_approved());
    }

    #[test]
    fn test_drawdown_below_limit_allows() {
        let rm = make_manager();
        assert!(rm.can_trade(dec!(801), &make_snapshot()).is_approved());
        assert!(!rm.is_tripped());
    }

    #[test]
    fn test_error_threshold_latches() {
        let rm = make_manager();
        for _ in 0..4 {
            rm.record_error();
        }
        assert!(!rm.is_tripped());
        rm.reset_errors();
        for _ in 0..4 {
            rm.record_error();
        }
        assert!(!rm.is_tripped());
        assert_eq!(rm.record_error(), 5);
        assert!(rm.is_tripped());
        let status = rm.status();
        assert!(status.circuit_breaker);
        assert!(status.trip_reason.unwrap().contains("consecutive"));
    }

    // ---- validation --------------------------------------------------------

    #[test]
    fn test_out_of_range_parameters_rejected() {
        let cases = [
            RiskConfig {
                risk_per_trade: dec!(0.2),
                ..RiskConfig::default()
            },
            RiskConfig {
                max_drawdown: dec!(0.01),
                ..RiskConfig::default()
            },
            RiskConfig {
                max_daily_losses: 0,
                ..RiskConfig::default()
            },
            RiskConfig {
                max_risk_per_trade: dec!(0.01),
                ..RiskConfig::default()
            },
            RiskConfig {
                max_risk_per_trade: dec!(1.5),
                ..RiskConfig::default()
            },
        ];
        for config in cases {
            assert!(matches!(
                RiskManager::new(config),
                Err(TradeGateError::InvalidRiskParameter { .. })
            ));
        }
    }

    #[test]
    fn test_drawdown_helper() {
        assert_eq!(drawdown(Some(dec!(1000)), dec!(800)), dec!(0.2));
        assert_eq!(drawdown(Some(dec!(1000)), dec!(1100)), dec!(-0.1));
        assert_eq!(drawdown(Some(Decimal::ZERO), dec!(50)), Decimal::ZERO);
        assert_eq!(drawdown(None, dec!(50)), Decimal::ZERO);
    }

    #[test]
    fn test_zero_initial_balance_never_trips() {
        let manager = make_manager();
        let snapshot = RiskSnapshot {
            initial_balance: Some(Decimal::ZERO),
            ..make_snapshot()
        };
        assert!(manager.can_trade(dec!(100), &snapshot).is_approved());
        assert!(!manager.is_tripped());
    }
}
