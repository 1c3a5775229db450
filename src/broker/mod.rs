//! Broker integration.
//!
//! Defines the `BrokerPort` trait the decision core trades through, the
//! session credentials it is constructed from, and the in-process
//! `PaperBroker` used for dry runs and tests.

pub mod paper;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use crate::types::{Direction, RawCandle, RawOutcome};

/// Balance value brokers report when the session has expired.
pub const SESSION_INVALID: f64 = -1.0;

/// Abstraction over a binary-options broker.
///
/// Implementors provide market data, order placement and settlement
/// lookup. Shapes are the broker's own; normalisation happens in the
/// caller (`CandleSeries::from_raw`, `RawOutcome::normalize`).
#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Account balance. A negative value means the session is invalid.
    async fn balance(&self) -> Result<f64>;

    /// Most recent `count` candles for an instrument. Order not guaranteed.
    async fn get_candles(
        &self,
        instrument: &str,
        interval_secs: u32,
        count: usize,
    ) -> Result<Vec<RawCandle>>;

    /// Open a CALL. Returns the broker's trade id.
    async fn buy(&self, instrument: &str, amount: Decimal, duration_secs: u64) -> Result<String>;

    /// Open a PUT. Returns the broker's trade id.
    async fn sell(&self, instrument: &str, amount: Decimal, duration_secs: u64) -> Result<String>;

    /// Settlement of a previously opened trade.
    async fn check_win(&self, trade_id: &str) -> Result<RawOutcome>;

    /// Broker name for logging.
    fn name(&self) -> &str;
}

/// Dispatch a trade in the given direction.
pub async fn place_order(
    broker: &dyn BrokerPort,
    direction: Direction,
    instrument: &str,
    amount: Decimal,
    duration_secs: u64,
) -> Result<String> {
    match direction {
        Direction::Buy => broker.buy(instrument, amount, duration_secs).await,
        Direction::Sell => broker.sell(instrument, amount, duration_secs).await,
    }
}

/// True when a reported balance is the broker's "session invalid" sentinel.
pub fn is_session_invalid(balance: f64) -> bool {
    balance < 0.0
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Broker session credentials. The session id never appears in logs.
#[derive(Clone)]
pub struct BrokerCredentials {
    ssid: SecretString,
}

impl BrokerCredentials {
    /// Build credentials from a raw session value (see `clean_ssid`).
    pub fn new(raw: &str) -> Self {
        Self {
            ssid: SecretString::new(clean_ssid(raw)),
        }
    }

    /// Load from the environment variable named in the config.
    pub fn from_env(env_name: &str) -> Result<Self> {
        let raw = crate::config::AppConfig::resolve_env(env_name)?;
        Ok(Self::new(&raw))
    }

    /// Credentials for the paper broker, which needs none.
    pub fn paper() -> Self {
        Self::new("paper")
    }

    pub fn ssid(&self) -> &str {
        self.ssid.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.ssid.expose_secret().is_empty()
    }
}

impl fmt::Debug for BrokerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerCredentials")
            .field("ssid", &"[REDACTED]")
            .finish()
    }
}

/// Normalise a session value pasted from a browser.
///
/// Strips surrounding whitespace and quotes. A raw websocket auth frame
/// such as `42["auth",{"session":"..."}]` is reduced to its JSON object.
pub fn clean_ssid(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
    if trimmed.starts_with("42[") {
        if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
            if start < end {
                return trimmed[start..=end].to_string();
            }
        }
    }
    trimmed.to_string()
}
