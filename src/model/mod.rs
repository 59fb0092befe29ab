pub mod centroid;
pub mod knn;
pub mod logistic;
pub mod metrics;
pub mod search;

use crate::data::Matrix;
use crate::error::{Result, ToxError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

pub use search::{GridSearch, ModelSearch, SearchSpace};

/// A trained predictor over one column space
pub trait FittedModel: fmt::Debug {
    /// Hard 0/1 predictions, one per row
    fn predict(&self, x: &Matrix) -> Result<Vec<u8>>;

    /// Whether [`FittedModel::predict_proba`] is implemented
    fn supports_proba(&self) -> bool {
        false
    }

    /// Positive-class probability, one per row
    fn predict_proba(&self, _x: &Matrix) -> Result<Vec<f64>> {
        Err(ToxError::ProbabilityUnavailable(format!("{:?}", self)))
    }
}

/// A frozen model architecture with its hyperparameters
///
/// Searching produces one of these; it is then re-fitted once per seed.
pub trait Classifier: fmt::Debug + Send + Sync {
    /// Fit a fresh model on `x` and binary `y`
    fn fit(&self, x: &Matrix, y: &[u8]) -> Result<Box<dyn FittedModel>>;

    /// Human-readable description of the architecture
    fn export(&self) -> String;
}

/// Built-in architectures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum Architecture {
    LogisticRegression(logistic::LogisticParams),
    KNearestNeighbors(knn::KnnParams),
    NearestCentroid,
}

impl Classifier for Architecture {
    fn fit(&self, x: &Matrix, y: &[u8]) -> Result<Box<dyn FittedModel>> {
        check_training_data(x, y)?;
        Ok(match self {
            Architecture::LogisticRegression(params) => {
                Box::new(logistic::LogisticModel::fit(params, x, y))
            }
            Architecture::KNearestNeighbors(params) => Box::new(knn::KnnModel::fit(params, x, y)),
            Architecture::NearestCentroid => Box::new(centroid::CentroidModel::fit(x, y)),
        })
    }

    fn export(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

/// Reject empty or misaligned training data
pub fn check_training_data(x: &Matrix, y: &[u8]) -> Result<()> {
    if x.nrows() == 0 {
        return Err(ToxError::integrity("cannot fit a model on zero rows"));
    }
    if x.nrows() != y.len() {
        return Err(ToxError::integrity(format!(
            "training matrix has {} rows but {} labels",
            x.nrows(),
            y.len()
        )));
    }
    Ok(())
}

/// How a meta-feature column was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    Probability,
    HardLabel,
}

/// Score rows with probabilities when the model has them, else hard labels
pub fn score(model: &dyn FittedModel, x: &Matrix) -> Result<(Vec<f64>, ScoreKind)> {
    if model.supports_proba() {
        Ok((model.predict_proba(x)?, ScoreKind::Probability))
    } else {
        let labels = model.predict(x)?;
        Ok((labels.into_iter().map(f64::from).collect(), ScoreKind::HardLabel))
    }
}

/// Score several matrices with one model; `warn_fallback` logs a hard-label
/// fallback for `unit`
pub fn score_all(
    model: &dyn FittedModel,
    unit: &str,
    matrices: &[&Matrix],
    warn_fallback: bool,
) -> Result<(Vec<Vec<f64>>, ScoreKind)> {
    let kind = if model.supports_proba() {
        ScoreKind::Probability
    } else {
        if warn_fallback {
            warn!("{}: model has no probability output, recording hard labels", unit);
        }
        ScoreKind::HardLabel
    };

    let mut out = Vec::with_capacity(matrices.len());
    for x in matrices {
        out.push(score(model, x)?.0);
    }
    Ok((out, kind))
}

/// One named model-search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierEntry {
    /// Label written to the summaries, e.g. `gridsk`
    pub label: String,
    pub space: SearchSpace,
}

/// The explicit `{label → search configuration}` list handed to trainers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierRegistry {
    pub entries: Vec<ClassifierEntry>,
}

impl Default for ClassifierRegistry {
    fn default() -> Self {
        Self {
            entries: vec![
                ClassifierEntry {
                    label: "gridsk".to_string(),
                    space: SearchSpace::default(),
                },
                ClassifierEntry {
                    label: "centroid".to_string(),
                    space: SearchSpace::centroid_only(),
                },
            ],
        }
    }
}

impl ClassifierRegistry {
    /// Registry with a single entry
    pub fn single(label: impl Into<String>, space: SearchSpace) -> Self {
        Self {
            entries: vec![ClassifierEntry {
                label: label.into(),
                space,
            }],
        }
    }

    /// Find an entry by label
    pub fn get(&self, label: &str) -> Result<&ClassifierEntry> {
        self.entries
            .iter()
            .find(|e| e.label == label)
            .ok_or_else(|| ToxError::config(format!("no classifier registered as '{}'", label)))
    }

    /// Build the search collaborator for an entry
    pub fn search_for(&self, entry: &ClassifierEntry, folds: usize, seed: u64) -> GridSearch {
        GridSearch::new(entry.space.clone())
            .with_folds(folds)
            .with_seed(seed)
    }

    /// Labels in registration order
    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.label.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_score_prefers_probabilities() {
        let x = array![[0.0], [0.1], [0.9], [1.0]];
        let y = [0, 0, 1, 1];
        let model = Architecture::LogisticRegression(logistic::LogisticParams::default())
            .fit(&x, &y)
            .unwrap();
        let (scores, kind) = score(model.as_ref(), &x).unwrap();
        assert_eq!(kind, ScoreKind::Probability);
        assert!(scores.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn test_probability_fallback_records_hard_labels() {
        let x = array![[0.0], [0.1], [0.9], [1.0]];
        let y = [0, 0, 1, 1];
        let model = Architecture::NearestCentroid.fit(&x, &y).unwrap();
        assert!(!model.supports_proba());
        assert!(matches!(
            model.predict_proba(&x),
            Err(ToxError::ProbabilityUnavailable(_))
        ));

        let (scores, kind) = score_all(model.as_ref(), "sages-centroid", &[&x], true).unwrap();
        assert_eq!(kind, ScoreKind::HardLabel);
        assert_eq!(scores[0], vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_fit_rejects_misaligned_labels() {
        let x = array![[0.0], [1.0]];
        assert!(matches!(
            Architecture::NearestCentroid.fit(&x, &[1]),
            Err(ToxError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_export_is_json() {
        let arch = Architecture::KNearestNeighbors(knn::KnnParams { k: 5 });
        let exported = arch.export();
        let parsed: Architecture = serde_json::from_str(&exported).unwrap();
        assert_eq!(parsed, arch);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ClassifierRegistry::default();
        assert_eq!(registry.labels(), vec!["gridsk", "centroid"]);
        assert!(registry.get("gridsk").is_ok());
        assert!(registry.get("tpot").is_err());
    }
}
