//! Outbound notifications.
//!
//! Delivery is best effort: a failing notifier is logged and the cycle
//! carries on.

pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::warn;

use crate::engine::state::CumulativeStats;
use crate::types::{Direction, SignalCandidate, Timeframe, TradeOutcome};

/// Something worth telling the operator about.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyEvent {
    SessionStarted {
        agent: String,
        balance: f64,
        dry_run: bool,
    },
    Signal {
        instrument: String,
        timeframe: Timeframe,
        candidate: SignalCandidate,
        amount: Decimal,
    },
    Result {
        instrument: String,
        direction: Direction,
        amount: Decimal,
        outcome: TradeOutcome,
        stats: CumulativeStats,
    },
    CircuitBreaker {
        reason: String,
    },
}

impl NotifyEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NotifyEvent::SessionStarted { .. } => "session_started",
            NotifyEvent::Signal { .. } => "signal",
            NotifyEvent::Result { .. } => "result",
            NotifyEvent::CircuitBreaker { .. } => "circuit_breaker",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotifyEvent) -> Result<()>;

    fn name(&self) -> &str;
}

/// Send to the notifier if one is configured. Failures are logged only.
pub async fn dispatch(notifier: Option<&dyn Notifier>, event: &NotifyEvent) {
    let Some(notifier) = notifier else {
        return;
    };
    if let Err(e) = notifier.notify(event).await {
        warn!(
            notifier = notifier.name(),
            event = event.kind(),
            error = %e,
            "Notification failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingNotifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _event: &NotifyEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("telegram unreachable")
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_failure_is_swallowed() {
        let notifier = FailingNotifier {
            calls: AtomicUsize::new(0),
        };
        let event = NotifyEvent::CircuitBreaker {
            reason: "drawdown".into(),
        };
        dispatch(Some(&notifier), &event).await;
        dispatch(None, &event).await;
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }
}
