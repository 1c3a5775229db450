//! Win-probability predictor gate.
//!
//! An optional external model scores the selected signal before any risk
//! is taken. With no predictor configured every signal passes; with one,
//! the signal passes when the probability reaches the threshold and fails
//! on any predictor error.

pub mod http;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::strategy::scorer::RankedPick;

/// Features sent to the predictor for one selected signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalFeatures {
    pub instrument: String,
    pub timeframe: String,
    pub direction: String,
    pub score: i32,
    pub minimum_score: i32,
    pub source: String,
    pub pattern: Option<String>,
    pub reference_price: f64,
    pub timestamp: i64,
}

impl SignalFeatures {
    pub fn from_pick(pick: &RankedPick) -> Self {
        let c = &pick.candidate;
        Self {
            instrument: pick.instrument.clone(),
            timeframe: pick.timeframe.to_string(),
            direction: c.direction.to_string(),
            score: c.score,
            minimum_score: pick.minimum,
            source: c.source.to_string(),
            pattern: c.pattern.map(|p| p.to_string()),
            reference_price: c.reference_price,
            timestamp: c.timestamp.timestamp(),
        }
    }
}

/// External probability model.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Probability in [0, 1] that the signal wins.
    async fn predict_proba(&self, features: &SignalFeatures) -> Result<f64>;
}

/// Result of running a signal through the predictor gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// No predictor configured.
    Unchecked,
    Accepted { probability: f64 },
    Rejected { probability: f64 },
    Failed,
}

impl Verdict {
    pub fn passes(&self) -> bool {
        matches!(self, Verdict::Unchecked | Verdict::Accepted { .. })
    }
}

/// Apply the predictor gate to one signal.
pub async fn evaluate(
    predictor: Option<&dyn Predictor>,
    features: &SignalFeatures,
    threshold: f64,
) -> Verdict {
    let Some(predictor) = predictor else {
        return Verdict::Unchecked;
    };
    match predictor.predict_proba(features).await {
        Ok(probability) if probability >= threshold => {
            info!(
                instrument = %features.instrument,
                probability = format!("{:.3}", probability),
                threshold,
                "Predictor accepted signal"
            );
            Verdict::Accepted { probability }
        }
        Ok(probability) => {
            info!(
                instrument = %features.instrument,
                probability = format!("{:.3}", probability),
                threshold,
                "Predictor rejected signal"
            );
            Verdict::Rejected { probability }
        }
        Err(e) => {
            warn!(
                instrument = %features.instrument,
                error = %e,
                "Predictor failed, rejecting signal"
            );
            Verdict::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, PatternTag, SignalCandidate, SignalSource, Timeframe};
    use chrono::Utc;

    fn make_features() -> SignalFeatures {
        SignalFeatures::from_pick(&RankedPick {
            instrument: "EURUSD_otc".into(),
            timeframe: Timeframe::M5,
            instrument_rank: 0,
            timeframe_rank: 1,
            candidate: SignalCandidate {
                direction: Direction::Sell,
                score: 5,
                source: SignalSource::Combined,
                pattern: Some(PatternTag::DoubleTop),
                reference_price: 1.0842,
                timestamp: Utc::now(),
            },
            minimum: 3,
        })
    }

    #[test]
    fn test_features_from_pick() {
        let f = make_features();
        assert_eq!(f.instrument, "EURUSD_otc");
        assert_eq!(f.timeframe, "M5");
        assert_eq!(f.direction, "SELL");
        assert_eq!(f.source, "combined");
        assert_eq!(f.pattern.as_deref(), Some("double_top"));
        assert_eq!(f.minimum_score, 3);
    }

    #[tokio::test]
    async fn test_absent_predictor_accepts_everything() {
        let verdict = evaluate(None, &make_features(), 0.65).await;
        assert_eq!(verdict, Verdict::Unchecked);
        assert!(verdict.passes());
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let mut mock = MockPredictor::new();
        mock.expect_predict_proba().times(1).returning(|_| Ok(0.65));
        let verdict = evaluate(Some(&mock), &make_features(), 0.65).await;
        assert_eq!(verdict, Verdict::Accepted { probability: 0.65 });
    }

    #[tokio::test]
    async fn test_low_probability_rejected() {
        let mut mock = MockPredictor::new();
        mock.expect_predict_proba()
            .withf(|f| f.score == 5)
            .returning(|_| Ok(0.40));
        let verdict = evaluate(Some(&mock), &make_features(), 0.65).await;
        assert!(!verdict.passes());
    }

    #[tokio::test]
    async fn test_predictor_error_rejects() {
        let mut mock = MockPredictor::new();
        mock.expect_predict_proba()
            .returning(|_| Err(anyhow::anyhow!("model offline")));
        let verdict = evaluate(Some(&mock), &make_features(), 0.65).await;
        assert_eq!(verdict, Verdict::Failed);
        assert!(!verdict.passes());
    }
}
