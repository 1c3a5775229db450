//! Telegram Bot API notifier (`sendMessage`, HTML parse mode).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::{Notifier, NotifyEvent};
use crate::config::{AlertsConfig, AppConfig};
use crate::types::{Direction, TradeGateError};

const TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

pub struct TelegramNotifier {
    http: Client,
    token: SecretString,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: &str, chat_id: &str) -> Result<Self> {
        if token.trim().is_empty() {
            bail!(TradeGateError::Notifier("bot token is empty".into()));
        }
        if chat_id.trim().is_empty() {
            bail!(TradeGateError::Notifier("chat id is empty".into()));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build Telegram HTTP client")?;

        Ok(Self {
            http,
            token: SecretString::new(token.trim().to_string()),
            chat_id: chat_id.trim().to_string(),
        })
    }

    /// Build from `[alerts]`. `Ok(None)` when alerts are not configured.
    pub fn from_config(alerts: &AlertsConfig) -> Result<Option<Self>> {
        let (Some(token_env), Some(chat_env)) = (
            alerts.telegram_bot_token_env.as_deref(),
            alerts.telegram_chat_id_env.as_deref(),
        ) else {
            return Ok(None);
        };
        let token = AppConfig::resolve_env(token_env)?;
        let chat_id = AppConfig::resolve_env(chat_env)?;
        Self::new(&token, &chat_id).map(Some)
    }

    pub async fn send_message(&self, text: &str) -> Result<()> {
        let url = format!(
            "{}/bot{}/sendMessage",
            TELEGRAM_API_URL,
            self.token.expose_secret()
        );
        let body = SendMessageRequest {
            chat_id: &self.chat_id,
            text,
            parse_mode: "HTML",
        };
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TradeGateError::Notifier(format!("request failed: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            bail!(TradeGateError::Notifier(format!("HTTP {status}: {error_text}")));
        }
        debug!(length = text.len(), "Sent Telegram notification");
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, event: &NotifyEvent) -> Result<()> {
        self.send_message(&format_event(event)).await
    }

    fn name(&self) -> &str {
        "telegram"
    }
}

/// Render an event as a Telegram HTML message.
pub fn format_event(event: &NotifyEvent) -> String {
    let clock = Utc::now().format("%H:%M:%S UTC");
    match event {
        NotifyEvent::SessionStarted {
            agent,
            balance,
            dry_run,
        } => format!(
            "<b>🚀 SESSION STARTED</b>\n\n<b>Agent:</b> {}\n<b>Balance:</b> ${:.2}\n<b>Mode:</b> {}\n\n<i>{clock}</i>",
            escape_html(agent),
            balance,
            if *dry_run { "dry run" } else { "live" },
        ),
        NotifyEvent::Signal {
            instrument,
            timeframe,
            candidate,
            amount,
        } => format!(
            "<b>🎯 NEW SIGNAL</b>\n\n<b>Pair:</b> {}\n<b>Direction:</b> {} {}\n<b>Timeframe:</b> {}\n<b>Score:</b> {} [{}]\n<b>Price:</b> {:.5}\n<b>Amount:</b> ${:.2}\n\n<i>{clock}</i>",
            escape_html(instrument),
            direction_arrow(candidate.direction),
            candidate.direction,
            timeframe,
            candidate.score,
            candidate.label(),
            candidate.reference_price,
            amount,
        ),
        NotifyEvent::Result {
            instrument,
            direction,
            amount,
            outcome,
            stats,
        } => {
            let verdict = if outcome.won { "✅ WIN" } else { "❌ LOSS" };
            let winrate = stats.winrate().map(|w| w * 100.0).unwrap_or(0.0);
            format!(
                "<b>🏁 TRADE SETTLED</b>\n\n<b>Result:</b> {verdict}\n<b>Pair:</b> {}\n<b>Direction:</b> {} {}\n<b>Amount:</b> ${:.2}\n<b>P/L:</b> ${:+.2}\n<b>Session:</b> {}W / {}L ({:.1}%)\n\n<i>{clock}</i>",
                escape_html(instrument),
                direction_arrow(*direction),
                direction,
                amount,
                outcome.profit,
                stats.wins,
                stats.losses,
                winrate,
            )
        }
        NotifyEvent::CircuitBreaker { reason } => format!(
            "<b>🛑 CIRCUIT BREAKER TRIPPED</b>\n\n<code>{}</code>\n\nTrading halted until manual reset.\n\n<i>{clock}</i>",
            escape_html(reason),
        ),
    }
}

fn direction_arrow(direction: Direction) -> &'static str {
    match direction {
        Direction::Buy => "📈",
        Direction::Sell => "📉",
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
