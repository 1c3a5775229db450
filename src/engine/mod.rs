//! Core engine: the scan → select → gate → trade → settle loop.

pub mod accountant;
pub mod executor;
pub mod runner;
pub mod scanner;
pub mod state;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broker::paper::PaperBroker;
use crate::broker::{BrokerCredentials, BrokerPort};
use crate::config::AppConfig;
use crate::data::MarketDataCache;
use crate::notify::telegram::TelegramNotifier;
use crate::notify::Notifier;
use crate::predictor::http::HttpPredictor;
use crate::predictor::Predictor;
use crate::status;
use crate::strategy::risk::RiskManager;
use runner::{Agent, RunSummary};
use state::BotState;

/// Shared, read-mostly views of a running agent.
#[derive(Clone)]
pub struct Handles {
    pub agent_name: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub state: Arc<BotState>,
    pub risk: Arc<RiskManager>,
    pub cache: Arc<MarketDataCache>,
}

/// Long-running entry point. Connects the configured broker with the given
/// credentials, wires the optional predictor, notifier and status API,
/// and runs until `stop` is raised.
pub async fn run(
    config: AppConfig,
    credentials: BrokerCredentials,
    stop: watch::Receiver<bool>,
) -> Result<RunSummary> {
    let broker = connect_broker(&config, &credentials)?;

    let predictor: Option<Arc<dyn Predictor>> = match config.predictor.endpoint.as_deref() {
        Some(endpoint) => {
            info!(endpoint, threshold = config.predictor.threshold, "Predictor enabled");
            Some(Arc::new(HttpPredictor::new(
                endpoint,
                config.predictor.timeout_secs,
            )?))
        }
        None => {
            info!("No predictor configured, every selected signal passes the gate");
            None
        }
    };

    let notifier: Option<Arc<dyn Notifier>> = match TelegramNotifier::from_config(&config.alerts) {
        Ok(Some(telegram)) => Some(Arc::new(telegram)),
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "Telegram alerts disabled");
            None
        }
    };

    run_with(config, broker, predictor, notifier, stop).await
}

/// Run against an already-connected broker.
pub async fn run_with(
    config: AppConfig,
    broker: Arc<dyn BrokerPort>,
    predictor: Option<Arc<dyn Predictor>>,
    notifier: Option<Arc<dyn Notifier>>,
    stop: watch::Receiver<bool>,
) -> Result<RunSummary> {
    let agent = Agent::build(&config, broker, predictor, notifier)?;

    if config.status.enabled {
        let state = status::routes::AppState {
            handles: agent.handles(),
            reset_token: resolve_reset_token(&config),
        };
        status::spawn_status_server(state, &config.status)
            .await
            .context("Failed to start status API")?;
    }

    Ok(agent.run(stop).await)
}

/// Token for the status API's breaker reset, or `None` to leave the route
/// unmounted.
fn resolve_reset_token(config: &AppConfig) -> Option<SecretString> {
    let env_name = config.status.reset_token_env.as_deref()?;
    match AppConfig::resolve_env(env_name) {
        Ok(token) if !token.trim().is_empty() => Some(SecretString::new(token.trim().to_string())),
        Ok(_) | Err(_) => {
            warn!(env = env_name, "No status reset token set, breaker reset route disabled");
            None
        }
    }
}

fn connect_broker(
    config: &AppConfig,
    credentials: &BrokerCredentials,
) -> Result<Arc<dyn BrokerPort>> {
    match config.broker.mode.as_str() {
        "paper" => {
            info!(
                balance = format!("${:.2}", config.broker.paper_balance),
                seed = config.broker.paper_seed,
                "Using paper broker"
            );
            Ok(Arc::new(PaperBroker::new(
                config.broker.paper_balance,
                config.broker.paper_seed,
            )))
        }
        other => {
            if credentials.is_empty() {
                bail!("broker mode '{other}' requires a session id in {}", config.broker.ssid_env);
            }
            bail!("unsupported broker mode '{other}'; only 'paper' ships with this build")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [agent]
        name = "TG-ENGINE"

        [trading]
        instruments = ["EURUSD_otc"]
        timeframes = ["M1"]

        [risk]
        risk_per_trade = 0.02
        max_risk_per_trade = 0.05
        max_drawdown = 0.2
        max_daily_losses = 3
        max_daily_trades = 20
        max_consecutive_losses = 4
    "#;

    #[test]
    fn test_reset_token_needs_env() {
        let mut config = AppConfig::from_toml(CONFIG).unwrap();
        assert!(resolve_reset_token(&config).is_none());

        config.status.reset_token_env = Some("TRADEGATE_TEST_UNSET_RESET_TOKEN".into());
        assert!(resolve_reset_token(&config).is_none());

        std::env::set_var("TRADEGATE_TEST_RESET_TOKEN", " tok-123 ");
        config.status.reset_token_env = Some("TRADEGATE_TEST_RESET_TOKEN".into());
        let token = resolve_reset_token(&config).unwrap();
        assert_eq!(secrecy::ExposeSecret::expose_secret(&token), "tok-123");
    }

    #[test]
    fn test_paper_mode_connects() {
        let config = AppConfig::from_toml(CONFIG).unwrap();
        assert!(connect_broker(&config, &BrokerCredentials::paper()).is_ok());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let mut config = AppConfig::from_toml(CONFIG).unwrap();
        config.broker.mode = "pocket".into();
        let err = connect_broker(&config, &BrokerCredentials::new("")).err().unwrap();
        assert!(err.to_string().contains("session id"));

        let err = connect_broker(&config, &BrokerCredentials::new("abc")).err().unwrap();
        assert!(err.to_string().contains("unsupported"));
    }
}
