//! End-to-end decision cycles against the mock broker.
//!
//! Time is paused so settlement waits and backoff sleeps complete
//! instantly while keeping their virtual durations observable.

mod common;

use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use common::{make_config, FixedPredictor, MockBroker};
use tradegate::engine::runner::{Agent, CycleOutcome, IdleReason};
use tradegate::predictor::Predictor;
use tradegate::strategy::risk::DenyReason;
use tradegate::types::{Direction, RawOutcome};

fn build(broker: &Arc<MockBroker>, instruments: &[&str]) -> Agent {
    Agent::build(&make_config(instruments), broker.clone(), None, None).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_rising_market_places_and_settles_buy() {
    let broker = Arc::new(MockBroker::new(1000.0).with_trend("UP", 1.001));
    let agent = build(&broker, &["UP"]);
    let (_tx, rx) = watch::channel(false);

    let start = tokio::time::Instant::now();
    let outcome = agent.run_cycle(1, &rx).await.unwrap();

    let CycleOutcome::Traded(report) = outcome else {
        panic!("expected a trade, got {outcome:?}");
    };
    assert_eq!(report.amount, dec!(20.00));
    assert_eq!(report.pairs_scanned, 1);
    assert!(report.outcome.unwrap().won);
    // Settlement waited for duration plus margin.
    assert!(start.elapsed() >= Duration::from_secs(65));

    let orders = broker.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].direction, Direction::Buy);
    assert_eq!(orders[0].instrument, "UP");

    let state = agent.state();
    assert_eq!(state.daily().await.trades, 1);
    assert_eq!(state.cumulative().await.wins, 1);
    assert_eq!(state.history_len().await, 1);
    assert_eq!(state.initial_balance(), Some(dec!(1000)));
}

#[tokio::test(start_paused = true)]
async fn test_falling_market_sells() {
    let broker = Arc::new(MockBroker::new(1000.0).with_trend("DOWN", 0.999));
    let agent = build(&broker, &["DOWN"]);
    let (_tx, rx) = watch::channel(false);

    let outcome = agent.run_cycle(1, &rx).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Traded(_)));
    assert_eq!(broker.orders()[0].direction, Direction::Sell);
}

#[tokio::test(start_paused = true)]
async fn test_best_pair_is_the_only_trade() {
    let broker = Arc::new(
        MockBroker::new(1000.0)
            .with_trend("UP", 1.001)
            .with_trend("ALSO_UP", 1.001),
    );
    let agent = build(&broker, &["FLAT", "ALSO_UP", "UP"]);
    let (_tx, rx) = watch::channel(false);

    agent.run_cycle(1, &rx).await.unwrap();
    let orders = broker.orders();
    assert_eq!(orders.len(), 1);
    // Equal scores: the earlier configured instrument wins.
    assert_eq!(orders[0].instrument, "ALSO_UP");
    assert_eq!(broker.candle_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_flat_market_is_idle() {
    let broker = Arc::new(MockBroker::new(1000.0));
    let agent = build(&broker, &["FLAT"]);
    let (_tx, rx) = watch::channel(false);

    let outcome = agent.run_cycle(1, &rx).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Idle(IdleReason::NoSignal)));
    assert!(broker.orders().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_session_skips_scan() {
    let broker = Arc::new(MockBroker::new(1000.0).with_trend("UP", 1.001));
    broker.invalidate_session();
    let agent = build(&broker, &["UP"]);
    let (_tx, rx) = watch::channel(false);

    let outcome = agent.run_cycle(1, &rx).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::SessionInvalid));
    assert_eq!(broker.candle_calls(), 0);
    assert_eq!(agent.state().initial_balance(), None);
}

#[tokio::test(start_paused = true)]
async fn test_daily_loss_limit_stops_trading() {
    let broker = Arc::new(MockBroker::new(1000.0).with_trend("UP", 1.001));
    broker.script_outcomes(vec![
        RawOutcome::Profit(-20.0),
        RawOutcome::Profit(-19.6),
        RawOutcome::Word("loss".into()),
    ]);
    let agent = build(&broker, &["UP"]);
    let (_tx, rx) = watch::channel(false);

    for cycle in 1..=3 {
        let outcome = agent.run_cycle(cycle, &rx).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Traded(_)), "cycle {cycle}");
    }
    assert_eq!(agent.state().losing_streak().await, 3);

    match agent.run_cycle(4, &rx).await.unwrap() {
        CycleOutcome::Idle(IdleReason::RiskDenied(reason)) => {
            assert_eq!(reason, DenyReason::DailyLossLimit { losses: 3, max: 3 });
            assert!(reason.to_string().contains("Daily loss limit"));
        }
        other => panic!("expected a risk denial, got {other:?}"),
    }
    assert_eq!(broker.orders().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_predictor_gate() {
    let (_tx, rx) = watch::channel(false);

    let broker = Arc::new(MockBroker::new(1000.0).with_trend("UP", 1.001));
    let low: Arc<dyn Predictor> = Arc::new(FixedPredictor(0.40));
    let agent = Agent::build(&make_config(&["UP"]), broker.clone(), Some(low), None).unwrap();
    let outcome = agent.run_cycle(1, &rx).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Idle(IdleReason::PredictorRejected)));
    assert!(broker.orders().is_empty());

    let high: Arc<dyn Predictor> = Arc::new(FixedPredictor(0.90));
    let agent = Agent::build(&make_config(&["UP"]), broker.clone(), Some(high), None).unwrap();
    let outcome = agent.run_cycle(1, &rx).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Traded(_)));
    assert_eq!(broker.orders().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_settlement_ends_loop() {
    let broker = Arc::new(MockBroker::new(1000.0).with_trend("UP", 1.001));
    let agent = Arc::new(build(&broker, &["UP"]));
    let (tx, rx) = watch::channel(false);

    let start = tokio::time::Instant::now();
    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run(rx).await })
    };

    // The trade is open and the loop is inside its 65 s settlement wait.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(broker.orders().len(), 1);
    tx.send(true).unwrap();

    let summary = runner.await.unwrap();
    assert!(start.elapsed() <= Duration::from_secs(11));
    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.trades, 0);
    assert_eq!(agent.state().cumulative().await.total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_errors_trip_breaker() {
    let broker = Arc::new(MockBroker::new(1000.0).with_trend("UP", 1.001));
    broker.set_error("socket closed");
    let agent = Arc::new(build(&broker, &["UP"]));
    let (tx, rx) = watch::channel(false);

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run(rx).await })
    };

    // Errors at t = 0, 10, 30, 70 and 150 s under doubling backoff.
    tokio::time::sleep(Duration::from_secs(200)).await;
    tx.send(true).unwrap();
    let summary = runner.await.unwrap();

    assert_eq!(summary.errors, 5);
    assert!(agent.risk().is_tripped());

    // The latch outlives the fault: the scan is skipped until a reset.
    broker.clear_error();
    let (_tx, rx) = watch::channel(false);
    let outcome = agent.run_cycle(6, &rx).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Halted));
    assert_eq!(broker.candle_calls(), 0);

    agent.risk().reset_circuit_breaker();
    let outcome = agent.run_cycle(7, &rx).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Traded(_)));
}

#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_hanging_scan() {
    let broker = Arc::new(MockBroker::new(1000.0).with_trend("UP", 1.001));
    broker.hang_candles();
    let agent = Arc::new(build(&broker, &["UP"]));
    let (tx, rx) = watch::channel(false);

    let start = tokio::time::Instant::now();
    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run(rx).await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.candle_calls(), 1);
    tx.send(true).unwrap();

    let summary = runner.await.unwrap();
    assert!(start.elapsed() <= Duration::from_secs(2), "took {:?}", start.elapsed());
    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.errors, 0);
    assert!(broker.orders().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unresolved_settlement_books_a_loss() {
    let broker = Arc::new(MockBroker::new(1000.0).with_trend("UP", 1.001));
    broker.fail_settlement();
    let agent = build(&broker, &["UP"]);
    let (_tx, rx) = watch::channel(false);

    let err = agent.run_cycle(1, &rx).await.err().unwrap();
    assert!(format!("{err:#}").contains("trade not found"));
    assert_eq!(broker.settlement_calls(), 3);

    let state = agent.state();
    let daily = state.daily().await;
    assert_eq!(daily.trades, 1);
    assert_eq!(daily.losses, 1);
    assert_eq!(state.cumulative().await.losses, 1);
    assert_eq!(state.losing_streak().await, 1);
    assert_eq!(state.history_len().await, 1);
}
