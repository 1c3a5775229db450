//! TRADEGATE: Adaptive binary-options trading agent
//!
//! Entry point. Loads configuration, initialises structured logging,
//! resolves broker credentials and runs the decision loop until Ctrl+C.

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use tradegate::broker::BrokerCredentials;
use tradegate::config::AppConfig;
use tradegate::engine;

const BANNER: &str = r#"
 _____ ____      _    ____  _____ ____    _  _____ _____
|_   _|  _ \    / \  |  _ \| ____/ ___|  / \|_   _| ____|
  | | | |_) |  / _ \ | | | |  _|| |  _  / _ \ | | |  _|
  | | |  _ <  / ___ \| |_| | |__| |_| |/ ___ \| | | |___
  |_| |_| \_\/_/   \_\____/|_____\____/_/   \_\_| |_____|

  Adaptive signal scoring, risk-gated execution
  v0.1.0
"#;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("TRADEGATE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg = AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        config = %config_path,
        broker = %cfg.broker.mode,
        instruments = cfg.trading.instruments.len(),
        timeframes = cfg.trading.timeframes.len(),
        dry_run = cfg.agent.dry_run,
        "TRADEGATE starting up"
    );

    let credentials = if cfg.broker.mode == "paper" {
        BrokerCredentials::paper()
    } else {
        BrokerCredentials::from_env(&cfg.broker.ssid_env)?
    };

    // Ctrl+C flips the stop signal; the loop checks it at every sleep slice.
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received."),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
        let _ = stop_tx.send(true);
    });

    let summary = engine::run(cfg, credentials, stop_rx).await?;

    info!(
        cycles = summary.cycles,
        trades = summary.trades,
        errors = summary.errors,
        wins = summary.stats.wins,
        losses = summary.stats.losses,
        "TRADEGATE shut down cleanly."
    );
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tradegate=info"));

    let json_logging = std::env::var("TRADEGATE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
