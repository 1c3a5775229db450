//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (session id, bot tokens) are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::time::Duration;

use crate::types::Timeframe;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default, rename = "loop")]
    pub cycle: LoopConfig,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub predictor: PredictorConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub journal: JournalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    /// Log trade decisions without placing orders.
    #[serde(default)]
    pub dry_run: bool,
    /// Expiry of each binary option.
    #[serde(default = "default_trade_duration")]
    pub trade_duration_secs: u64,
    /// Extra wait after expiry before asking for the settlement.
    #[serde(default = "default_settlement_margin")]
    pub settlement_margin_secs: u64,
    /// Sleep after the broker reports an invalid session.
    #[serde(default = "default_session_cooldown")]
    pub session_cooldown_secs: u64,
    /// Settlement lookups before the trade is booked as a loss.
    #[serde(default = "default_settlement_attempts")]
    pub settlement_attempts: usize,
    #[serde(default = "default_settlement_retry")]
    pub settlement_retry_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TradingConfig {
    /// Instruments in priority order (ties in global selection go to the
    /// earlier entry).
    pub instruments: Vec<String>,
    /// Timeframe labels, also in priority order.
    pub timeframes: Vec<String>,
    /// Candles requested per fetch.
    #[serde(default = "default_lookback")]
    pub lookback: usize,
}

/// Risk limits. Validated by `RiskManager::new`, immutable afterwards.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RiskConfig {
    pub risk_per_trade: Decimal,
    pub max_risk_per_trade: Decimal,
    pub max_drawdown: Decimal,
    pub max_daily_losses: u32,
    pub max_daily_trades: u32,
    pub max_consecutive_losses: u32,
    /// Absolute floor for both the balance and the stake.
    #[serde(default = "default_min_amount")]
    pub min_amount: Decimal,
    /// Consecutive unexpected cycle failures that latch the breaker.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: dec!(0.02),
            max_risk_per_trade: dec!(0.05),
            max_drawdown: dec!(0.20),
            max_daily_losses: 3,
            max_daily_trades: 20,
            max_consecutive_losses: 4,
            min_amount: default_min_amount(),
            error_threshold: default_error_threshold(),
        }
    }
}

/// Adaptive minimum-score parameters.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub base_min_score: i32,
    pub floor_min_score: i32,
    pub max_min_score: i32,
    pub score_increment: i32,
    pub target_winrate: f64,
    /// Trade-history window fed to the selector.
    pub history_window: usize,
    /// Below this many trades the winrate is treated as unknown.
    pub min_history: usize,
    pub weights: ScoreWeights,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_min_score: 3,
            floor_min_score: 2,
            max_min_score: 6,
            score_increment: 1,
            target_winrate: 0.55,
            history_window: 20,
            min_history: 10,
            weights: ScoreWeights::default(),
        }
    }
}

/// Per-source score constants.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ScoreWeights {
    pub double_top: i32,
    pub compression: i32,
    pub flag: i32,
    pub triangle: i32,
    pub channel_breakout: i32,
    pub divergence: i32,
    pub indicator_base: i32,
    pub htf_bonus: i32,
    pub confluence_bonus: i32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            double_top: 4,
            compression: 3,
            flag: 3,
            triangle: 2,
            channel_breakout: 3,
            divergence: 4,
            indicator_base: 2,
            htf_bonus: 1,
            confluence_bonus: 1,
        }
    }
}

/// Market data cache and fetch retry settings.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Per-attempt timeouts; the attempt count is the length of this list.
    pub attempt_timeouts_secs: Vec<u64>,
    /// Sleeps between attempts; the last value repeats if too short.
    pub backoffs_secs: Vec<u64>,
    pub ttl_ceiling_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            attempt_timeouts_secs: vec![30, 45, 60],
            backoffs_secs: vec![3, 6],
            ttl_ceiling_secs: 3600,
            sweep_interval_secs: 300,
        }
    }
}

/// Orchestration loop sleeps.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub base_sleep_secs: f64,
    pub idle_factor: f64,
    pub idle_cap_secs: f64,
    pub error_factor: f64,
    pub error_cap_secs: f64,
    /// Longest uninterrupted sleep; the stop signal is checked between slices.
    pub sleep_slice_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            base_sleep_secs: 5.0,
            idle_factor: 1.5,
            idle_cap_secs: 30.0,
            error_factor: 2.0,
            error_cap_secs: 300.0,
            sleep_slice_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SystemConfig {
    pub max_concurrent_requests: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Only `paper` ships with this crate.
    pub mode: String,
    pub ssid_env: String,
    pub paper_balance: f64,
    pub paper_seed: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: "paper".to_string(),
            ssid_env: "TRADEGATE_SSID".to_string(),
            paper_balance: 1000.0,
            paper_seed: 42,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PredictorConfig {
    pub endpoint: Option<String>,
    pub threshold: f64,
    pub timeout_secs: u64,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            threshold: 0.65,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct AlertsConfig {
    pub telegram_bot_token_env: Option<String>,
    pub telegram_chat_id_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    /// Env var holding the bearer token for the breaker reset. Without it
    /// the reset route is not mounted.
    pub reset_token_env: Option<String>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            port: 8080,
            reset_token_env: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct JournalConfig {
    pub path: Option<String>,
    pub warm_start: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: None,
            warm_start: 20,
        }
    }
}

fn default_trade_duration() -> u64 {
    60
}

fn default_settlement_margin() -> u64 {
    5
}

fn default_session_cooldown() -> u64 {
    60
}

fn default_settlement_attempts() -> usize {
    3
}

fn default_settlement_retry() -> u64 {
    5
}

fn default_lookback() -> usize {
    150
}

fn default_min_amount() -> Decimal {
    dec!(1)
}

fn default_error_threshold() -> u32 {
    5
}

impl LoopConfig {
    /// Sleeps must be positive and finite, factors must not shrink them
    /// and caps must not undercut the base.
    pub fn validate(&self) -> Result<()> {
        let base = self.base_sleep_secs;
        if !base.is_finite() || base <= 0.0 {
            bail!("loop.base_sleep_secs must be positive, got {base}");
        }
        for (name, factor) in [
            ("idle_factor", self.idle_factor),
            ("error_factor", self.error_factor),
        ] {
            if !factor.is_finite() || factor < 1.0 {
                bail!("loop.{name} must be at least 1, got {factor}");
            }
        }
        for (name, cap) in [
            ("idle_cap_secs", self.idle_cap_secs),
            ("error_cap_secs", self.error_cap_secs),
        ] {
            if !cap.is_finite() || cap < base {
                bail!("loop.{name} must be finite and at least base_sleep_secs, got {cap}");
            }
        }
        if self.sleep_slice_ms == 0 {
            bail!("loop.sleep_slice_ms must be positive");
        }
        Ok(())
    }
}

impl AgentConfig {
    /// Time from order placement until the settlement can be queried.
    pub fn settlement_wait(&self) -> Duration {
        Duration::from_secs(self.trade_duration_secs + self.settlement_margin_secs)
    }

    pub fn settlement_retry(&self) -> Duration {
        Duration::from_secs(self.settlement_retry_secs)
    }
}

impl AppConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(contents).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.trading.instruments.is_empty() {
            bail!("trading.instruments must not be empty");
        }
        if self.trading.timeframes.is_empty() {
            bail!("trading.timeframes must not be empty");
        }
        self.timeframes()?;
        if self.system.max_concurrent_requests == 0 {
            bail!("system.max_concurrent_requests must be at least 1");
        }
        if self.cache.attempt_timeouts_secs.is_empty() {
            bail!("cache.attempt_timeouts_secs must list at least one attempt");
        }
        if !(0.0..=1.0).contains(&self.predictor.threshold) {
            bail!(
                "predictor.threshold must be within [0, 1], got {}",
                self.predictor.threshold
            );
        }
        if self.scoring.floor_min_score > self.scoring.max_min_score {
            bail!("scoring.floor_min_score exceeds scoring.max_min_score");
        }
        if self.agent.settlement_attempts == 0 {
            bail!("agent.settlement_attempts must be at least 1");
        }
        if self.status.bind.parse::<IpAddr>().is_err() {
            bail!("status.bind must be an IP address, got '{}'", self.status.bind);
        }
        self.cycle.validate()
    }

    /// Parsed timeframes in configured order.
    pub fn timeframes(&self) -> Result<Vec<Timeframe>> {
        self.trading
            .timeframes
            .iter()
            .map(|label| label.parse::<Timeframe>().map_err(anyhow::Error::from))
            .collect()
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
