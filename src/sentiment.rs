//! Sentiment classification for survey comments.
//!
//! The classifier adapter owns text cleaning, the translation from the
//! model's label vocabulary to [`Sentiment`], and the fail-open policy: when
//! the model cannot be loaded or inference fails, callers receive a
//! [`Classification::Degraded`] result instead of an error.

use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::Sentiment;

static DISALLOWED_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-záéíóúñü0-9\s]").expect("valid character class"));
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid pattern"));

/// Confidence reported when the classifier is unavailable.
pub const DEGRADED_CONFIDENCE: f64 = 0.5;

/// Label order assumed when a model artifact does not name its labels.
pub const DEFAULT_LABELS: [&str; 3] = ["BUENO", "MALO", "REGULAR"];

/// Lowercase, drop everything but Spanish letters, digits and whitespace,
/// then collapse whitespace.
pub fn clean_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped = DISALLOWED_CHARS.replace_all(&lowered, "");
    WHITESPACE_RUN.replace_all(&stripped, " ").trim().to_string()
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("sentiment model unavailable: {0}")]
    Unavailable(String),

    #[error("model labels {found:?} do not match BUENO/MALO/REGULAR")]
    LabelMismatch { found: Vec<String> },

    #[error("label mappings {mapping:?} disagree with model labels {model:?}")]
    MappingConflict {
        model: Vec<String>,
        mapping: Vec<String>,
    },

    #[error("inference failed: {0}")]
    Inference(String),
}

/// Labels emitted by the underlying model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelLabel {
    Bueno,
    Malo,
    Regular,
}

const LABEL_TABLE: [(&str, ModelLabel, Sentiment); 3] = [
    ("BUENO", ModelLabel::Bueno, Sentiment::Positive),
    ("MALO", ModelLabel::Malo, Sentiment::Negative),
    ("REGULAR", ModelLabel::Regular, Sentiment::Neutral),
];

impl ModelLabel {
    pub fn parse(raw: &str) -> Option<Self> {
        LABEL_TABLE
            .iter()
            .find(|(name, _, _)| *name == raw)
            .map(|(_, label, _)| *label)
    }

    pub fn as_str(self) -> &'static str {
        LABEL_TABLE
            .iter()
            .find(|(_, label, _)| *label == self)
            .map(|(name, _, _)| *name)
            .unwrap_or("REGULAR")
    }

    pub fn sentiment(self) -> Sentiment {
        LABEL_TABLE
            .iter()
            .find(|(_, label, _)| *label == self)
            .map(|(_, _, sentiment)| *sentiment)
            .unwrap_or(Sentiment::Neutral)
    }
}

/// Resolve a model's raw label list, requiring exactly the three known
/// labels with no repeats.
pub fn resolve_labels(raw: &[String]) -> Result<Vec<ModelLabel>, ModelError> {
    let mismatch = || ModelError::LabelMismatch {
        found: raw.to_vec(),
    };

    let labels = raw
        .iter()
        .map(|name| ModelLabel::parse(name))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(mismatch)?;

    let complete = labels.len() == LABEL_TABLE.len()
        && LABEL_TABLE
            .iter()
            .all(|(_, expected, _)| labels.contains(expected));
    if !complete {
        return Err(mismatch());
    }

    Ok(labels)
}

/// An opaque text classifier over the model label vocabulary.
pub trait SentimentModel: Send + Sync {
    /// Raw label names, in output order.
    fn labels(&self) -> &[String];

    /// Class probabilities for cleaned text, aligned with [`labels`](Self::labels).
    fn predict(&self, cleaned: &str) -> Result<Vec<f64>, ModelError>;
}

/// Acquires the model on first use.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<Box<dyn SentimentModel>, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SentimentScores {
    pub positive: f64,
    pub neutral: f64,
    pub negative: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Model {
        sentiment: Sentiment,
        confidence: f64,
        scores: SentimentScores,
    },
    /// The model could not be used; the comment is treated as neutral.
    Degraded { reason: String },
}

impl Classification {
    pub fn sentiment(&self) -> Sentiment {
        match self {
            Classification::Model { sentiment, .. } => *sentiment,
            Classification::Degraded { .. } => Sentiment::Neutral,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            Classification::Model { confidence, .. } => *confidence,
            Classification::Degraded { .. } => DEGRADED_CONFIDENCE,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Classification::Degraded { .. })
    }
}

struct LoadedModel {
    inner: Box<dyn SentimentModel>,
    labels: Vec<ModelLabel>,
}

pub struct SentimentClassifier {
    loader: Box<dyn ModelLoader>,
    model: OnceCell<LoadedModel>,
}

impl SentimentClassifier {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            model: OnceCell::new(),
        }
    }

    /// Load the model now instead of on the first comment.
    pub fn warm_up(&self) -> Result<(), ModelError> {
        self.loaded().map(|_| ())
    }

    #[cfg(test)]
    pub fn is_loaded(&self) -> bool {
        self.model.get().is_some()
    }

    /// Classify a comment. Never fails: loader and inference errors produce
    /// [`Classification::Degraded`].
    pub fn classify(&self, text: &str) -> Classification {
        match self.try_classify(text) {
            Ok(classification) => classification,
            Err(err) => {
                warn!(error = %err, "using neutral sentiment, classifier unavailable");
                Classification::Degraded {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn loaded(&self) -> Result<&LoadedModel, ModelError> {
        // A failed load leaves the cell empty so the next call retries.
        self.model.get_or_try_init(|| {
            let inner = self.loader.load()?;
            let labels = resolve_labels(inner.labels())?;
            info!(labels = ?inner.labels(), "sentiment model loaded");
            Ok(LoadedModel { inner, labels })
        })
    }

    fn try_classify(&self, text: &str) -> Result<Classification, ModelError> {
        let model = self.loaded()?;
        let cleaned = clean_text(text);
        let probabilities = model.inner.predict(&cleaned)?;

        if probabilities.len() != model.labels.len() {
            return Err(ModelError::Inference(format!(
                "expected {} probabilities, got {}",
                model.labels.len(),
                probabilities.len()
            )));
        }
        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(ModelError::Inference("non-finite probability".to_string()));
        }

        let mut best = 0;
        for (index, probability) in probabilities.iter().enumerate() {
            if *probability > probabilities[best] {
                best = index;
            }
        }

        let mut scores = SentimentScores {
            positive: 0.0,
            neutral: 0.0,
            negative: 0.0,
        };
        for (label, probability) in model.labels.iter().zip(&probabilities) {
            match label.sentiment() {
                Sentiment::Positive => scores.positive = *probability,
                Sentiment::Neutral => scores.neutral = *probability,
                Sentiment::Negative => scores.negative = *probability,
            }
        }

        let label = model.labels[best];
        let confidence = probabilities[best].clamp(0.0, 1.0);
        debug!(label = label.as_str(), confidence, "comment classified");

        Ok(Classification::Model {
            sentiment: label.sentiment(),
            confidence,
            scores,
        })
    }
}
