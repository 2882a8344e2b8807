use crate::providers::{CollaboratorError, SentimentClassifier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Two buckets only: anything not clearly positive is treated as negative
/// so that it gets the apologetic reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sentiment {
    Positive,
    Negative,
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sentiment::Positive => f.write_str("Positive"),
            Sentiment::Negative => f.write_str("Negative"),
        }
    }
}

pub const POSITIVE_THRESHOLD: f64 = 0.25;

impl Sentiment {
    pub fn from_compound(compound: f64) -> Self {
        if compound > POSITIVE_THRESHOLD {
            Sentiment::Positive
        } else {
            Sentiment::Negative
        }
    }
}

/// VADER classifier: the full valence lexicon with its negation,
/// intensifier, capitalisation and punctuation rules. The compound score is
/// bucketed at `POSITIVE_THRESHOLD`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexiconClassifier;

impl LexiconClassifier {
    /// Normalised VADER compound score in [-1, 1].
    pub fn compound(&self, text: &str) -> f64 {
        vader_sentiment::SentimentIntensityAnalyzer::new()
            .polarity_scores(text)
            .get("compound")
            .copied()
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl SentimentClassifier for LexiconClassifier {
    async fn classify(&self, text: &str) -> Result<Sentiment, CollaboratorError> {
        Ok(Sentiment::from_compound(self.compound(text)))
    }
}
