//! Multinomial naive Bayes comment model and its on-disk artifact.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::sentiment::{
    clean_text, ModelError, ModelLabel, ModelLoader, SentimentModel, DEFAULT_LABELS,
};

pub const MODEL_FILE: &str = "model.json";
pub const LABEL_MAPPINGS_FILE: &str = "label_mappings.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NaiveBayesModel {
    pub model_id: Uuid,
    #[serde(default)]
    pub labels: Vec<String>,
    pub class_log_prior: Vec<f64>,
    pub feature_log_prob: HashMap<String, Vec<f64>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LabelMappings {
    label_encoder_classes: Vec<String>,
}

impl NaiveBayesModel {
    /// Fit with add-one smoothing over `(comment, label)` pairs. Every label
    /// must have at least one example.
    pub fn fit(examples: &[(String, String)]) -> anyhow::Result<Self> {
        let labels: Vec<String> = DEFAULT_LABELS.iter().map(|l| l.to_string()).collect();
        let mut doc_counts = vec![0usize; labels.len()];
        let mut token_totals = vec![0usize; labels.len()];
        let mut token_counts: BTreeMap<String, Vec<usize>> = BTreeMap::new();

        for (comment, label) in examples {
            let class = labels
                .iter()
                .position(|known| known == label)
                .with_context(|| format!("unknown label '{label}'"))?;
            doc_counts[class] += 1;

            for token in clean_text(comment).split_whitespace() {
                let counts = token_counts
                    .entry(token.to_string())
                    .or_insert_with(|| vec![0; labels.len()]);
                counts[class] += 1;
                token_totals[class] += 1;
            }
        }

        if let Some(missing) = doc_counts.iter().position(|count| *count == 0) {
            anyhow::bail!("no training examples for label {}", labels[missing]);
        }

        let documents = examples.len() as f64;
        let vocabulary = token_counts.len() as f64;
        let class_log_prior = doc_counts
            .iter()
            .map(|count| (*count as f64 / documents).ln())
            .collect();
        let feature_log_prob = token_counts
            .into_iter()
            .map(|(token, counts)| {
                let row = counts
                    .iter()
                    .zip(&token_totals)
                    .map(|(count, total)| {
                        ((*count as f64 + 1.0) / (*total as f64 + vocabulary)).ln()
                    })
                    .collect();
                (token, row)
            })
            .collect();

        Ok(Self {
            model_id: Uuid::new_v4(),
            labels,
            class_log_prior,
            feature_log_prob,
        })
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        fs::write(dir.join(MODEL_FILE), serde_json::to_string_pretty(self)?)?;
        let mappings = LabelMappings {
            label_encoder_classes: self.labels.clone(),
        };
        fs::write(
            dir.join(LABEL_MAPPINGS_FILE),
            serde_json::to_string_pretty(&mappings)?,
        )?;
        Ok(())
    }

    fn check_shape(&self) -> Result<(), ModelError> {
        let width = self.labels.len();
        let malformed = self.class_log_prior.len() != width
            || self.feature_log_prob.values().any(|row| row.len() != width);
        if malformed {
            return Err(ModelError::Unavailable(format!(
                "model {} has rows that do not match {} labels",
                self.model_id, width
            )));
        }
        Ok(())
    }
}

impl SentimentModel for NaiveBayesModel {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn predict(&self, cleaned: &str) -> Result<Vec<f64>, ModelError> {
        let mut joint = self.class_log_prior.clone();
        // Tokens outside the training vocabulary carry no evidence.
        for token in cleaned.split_whitespace() {
            if let Some(row) = self.feature_log_prob.get(token) {
                for (score, log_prob) in joint.iter_mut().zip(row) {
                    *score += log_prob;
                }
            }
        }
        Ok(softmax(&joint))
    }
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|score| (score - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|value| value / sum).collect()
}

/// Loads a [`NaiveBayesModel`] from a directory holding `model.json` and an
/// optional `label_mappings.json`.
#[derive(Debug, Clone)]
pub struct ModelDirectory {
    path: PathBuf,
}

impl ModelDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ModelLoader for ModelDirectory {
    fn load(&self) -> Result<Box<dyn SentimentModel>, ModelError> {
        let model_path = self.path.join(MODEL_FILE);
        let raw = fs::read_to_string(&model_path)
            .map_err(|err| ModelError::Unavailable(format!("{}: {err}", model_path.display())))?;
        let mut model: NaiveBayesModel = serde_json::from_str(&raw)
            .map_err(|err| ModelError::Unavailable(format!("{}: {err}", model_path.display())))?;

        let mappings_path = self.path.join(LABEL_MAPPINGS_FILE);
        if mappings_path.exists() {
            let raw = fs::read_to_string(&mappings_path).map_err(|err| {
                ModelError::Unavailable(format!("{}: {err}", mappings_path.display()))
            })?;
            let mappings: LabelMappings = serde_json::from_str(&raw).map_err(|err| {
                ModelError::Unavailable(format!("{}: {err}", mappings_path.display()))
            })?;
            if model.labels.is_empty() {
                model.labels = mappings.label_encoder_classes;
            } else if model.labels != mappings.label_encoder_classes {
                return Err(ModelError::MappingConflict {
                    model: model.labels,
                    mapping: mappings.label_encoder_classes,
                });
            }
        } else if model.labels.is_empty() {
            model.labels = DEFAULT_LABELS.iter().map(|l| l.to_string()).collect();
        }

        model.check_shape()?;
        info!(model_id = %model.model_id, path = %self.path.display(), "read model artifact");
        Ok(Box::new(model))
    }
}

/// Train from a CSV with `comment,label` columns.
pub fn train_from_csv(csv_path: &Path) -> anyhow::Result<NaiveBayesModel> {
    #[derive(Deserialize)]
    struct CsvRow {
        comment: String,
        label: String,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut examples = Vec::new();

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let label = row.label.trim().to_uppercase();
        if ModelLabel::parse(&label).is_none() {
            anyhow::bail!("unknown label '{}' in {}", row.label, csv_path.display());
        }
        examples.push((row.comment, label));
    }

    NaiveBayesModel::fit(&examples)
}
