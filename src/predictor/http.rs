//! HTTP predictor client.
//!
//! POSTs `SignalFeatures` as JSON to a model endpoint and reads back
//! `{"probability": p}`. Out-of-range values are clamped into [0, 1].

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{Predictor, SignalFeatures};
use crate::types::TradeGateError;

/// Retries on transport errors and 5xx responses.
const MAX_RETRIES: u32 = 2;

/// Base delay for exponential backoff (ms).
const BASE_BACKOFF_MS: u64 = 500;

#[derive(Debug, Deserialize)]
struct PredictionResponse {
    probability: f64,
}

pub struct HttpPredictor {
    http: Client,
    endpoint: String,
}

impl HttpPredictor {
    pub fn new(endpoint: &str, timeout_secs: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build predictor HTTP client")?;

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict_proba(&self, features: &SignalFeatures) -> Result<f64> {
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                debug!(attempt, delay_ms = delay, "Retrying predictor call");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let resp = self.http.post(&self.endpoint).json(features).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: PredictionResponse = response
                            .json()
                            .await
                            .context("Failed to parse predictor response")?;
                        return clamp_probability(body.probability);
                    }
                    if status.is_server_error() {
                        last_error = Some(format!("HTTP {status}"));
                        continue;
                    }
                    let error_text = response.text().await.unwrap_or_default();
                    return Err(TradeGateError::Predictor(format!(
                        "HTTP {status}: {error_text}"
                    ))
                    .into());
                }
                Err(e) => {
                    last_error = Some(format!("Request error: {e}"));
                    continue;
                }
            }
        }

        Err(TradeGateError::Predictor(format!(
            "failed after {} retries: {}",
            MAX_RETRIES,
            last_error.unwrap_or_default()
        ))
        .into())
    }
}

/// Clamp into [0, 1]; NaN is an error.
fn clamp_probability(p: f64) -> Result<f64> {
    if p.is_nan() {
        return Err(TradeGateError::Predictor("probability is NaN".into()).into());
    }
    Ok(p.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_probability() {
        assert_eq!(clamp_probability(0.7).unwrap(), 0.7);
        assert_eq!(clamp_probability(1.3).unwrap(), 1.0);
        assert_eq!(clamp_probability(-0.2).unwrap(), 0.0);
        assert!(clamp_probability(f64::NAN).is_err());
    }

    #[test]
    fn test_response_shape() {
        let body: PredictionResponse =
            serde_json::from_str(r#"{"probability": 0.71, "model": "gbm"}"#).unwrap();
        assert_eq!(body.probability, 0.71);
    }

    #[test]
    fn test_client_builds() {
        let p = HttpPredictor::new("http://localhost:9000/predict", 10).unwrap();
        assert_eq!(p.endpoint(), "http://localhost:9000/predict");
    }
}
