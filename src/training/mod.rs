pub mod artifacts;
pub mod level1;
pub mod level2;

use crate::aggregate::ThresholdPolarity;
use crate::data::{DataPaths, FeatureSetKind, Matrix};
use crate::error::{Result, ToxError};
use crate::model::metrics::Metrics;
use crate::model::{Classifier, ClassifierRegistry, ScoreKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Run configuration for the whole stacking pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackingConfig {
    /// Label column used as the endpoint (column 0 is the drug name)
    pub endpoint: usize,
    /// Seed of the split the model search runs on
    pub seed: u64,
    /// Fraction of the smaller class pool used for training
    pub train_fraction: f64,
    /// Resampling seeds run are `0..n_seeds`
    pub n_seeds: u64,
    /// Cross-validation folds used by the built-in search
    pub cv_folds: usize,
    /// Write artifacts to `output_dir`
    pub write: bool,
    pub output_dir: PathBuf,
    pub data: DataPaths,
    /// Model-search configurations shared by both levels
    pub classifiers: ClassifierRegistry,
    /// Level-1 outputs stacked at level 2, as `feature_set-classifier`;
    /// empty selects the best classifier per feature set
    pub selection: Vec<String>,
    /// Registry label of the meta-classifier used for trial drugs
    pub meta_classifier: String,
    /// Threshold of the average-of-level-1 baseline
    pub average_threshold: f64,
    pub average_polarity: ThresholdPolarity,
    /// Show progress bars over the seed loop
    pub progress: bool,
}

impl Default for StackingConfig {
    fn default() -> Self {
        Self {
            endpoint: 1,
            seed: 0,
            train_fraction: 0.8,
            n_seeds: 10,
            cv_folds: 5,
            write: false,
            output_dir: PathBuf::from("./output"),
            data: DataPaths::default(),
            classifiers: ClassifierRegistry::default(),
            selection: Vec::new(),
            meta_classifier: "gridsk".to_string(),
            average_threshold: 0.5,
            average_polarity: ThresholdPolarity::default(),
            progress: true,
        }
    }
}

impl StackingConfig {
    /// Small configuration for tests and smoke runs
    pub fn quick_test() -> Self {
        Self {
            n_seeds: 3,
            cv_folds: 3,
            progress: false,
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ToxError::io(path, e))?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.endpoint == 0 {
            return Err(ToxError::config("endpoint column 0 is the drug identifier"));
        }
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            return Err(ToxError::config(format!(
                "train fraction must be in (0, 1), got {}",
                self.train_fraction
            )));
        }
        if self.n_seeds == 0 {
            return Err(ToxError::config("at least one resampling seed is required"));
        }
        if self.cv_folds < 2 {
            return Err(ToxError::config("cross-validation needs at least 2 folds"));
        }
        if self.classifiers.entries.is_empty() {
            return Err(ToxError::config("classifier registry is empty"));
        }
        if !self.average_threshold.is_finite() {
            return Err(ToxError::config("average threshold must be finite"));
        }
        self.selection_keys()?;
        Ok(())
    }

    /// Resampling seeds
    pub fn seeds(&self) -> Range<u64> {
        0..self.n_seeds
    }

    /// Parsed level-2 selection
    pub fn selection_keys(&self) -> Result<Vec<OutputKey>> {
        self.selection.iter().map(|s| s.parse()).collect()
    }
}

/// Identifies one level-1 output: a feature set and a classifier label
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputKey {
    pub feature_set: FeatureSetKind,
    pub classifier: String,
}

impl OutputKey {
    pub fn new(feature_set: FeatureSetKind, classifier: impl Into<String>) -> Self {
        Self {
            feature_set,
            classifier: classifier.into(),
        }
    }
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.feature_set, self.classifier)
    }
}

impl FromStr for OutputKey {
    type Err = ToxError;

    fn from_str(s: &str) -> Result<Self> {
        let (set, classifier) = s
            .split_once('-')
            .ok_or_else(|| {
                ToxError::config(format!("expected feature_set-classifier, got '{}'", s))
            })?;
        if classifier.is_empty() {
            return Err(ToxError::config(format!("missing classifier label in '{}'", s)));
        }
        Ok(Self::new(set.parse()?, classifier))
    }
}

/// Label sequences of the level-2 rows for one seed
#[derive(Debug, Clone, PartialEq)]
pub struct SeedLabels {
    pub seed: u64,
    /// train followed by test1
    pub train: Vec<u8>,
    /// test2
    pub test: Vec<u8>,
}

/// One level-1 fit: a feature set, a classifier and a seed
#[derive(Debug, Clone)]
pub struct Level1Record {
    pub seed: u64,
    pub key: OutputKey,
    /// Metrics of the test1 hard predictions
    pub metrics: Metrics,
    pub score_kind: ScoreKind,
    /// Scores for train followed by test1, in cohort order
    pub train_meta: Vec<f64>,
    /// Scores for test2, in cohort order
    pub test_meta: Vec<f64>,
}

/// A unit of work that was aborted
#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub unit: String,
    pub error: String,
}

/// Architecture frozen by the model search for one output
#[derive(Debug)]
pub struct FrozenArchitecture {
    pub key: OutputKey,
    pub architecture: Box<dyn Classifier>,
}

/// Everything level 1 hands to level 2 and to the trial predictor
#[derive(Debug, Default)]
pub struct Level1Output {
    pub labels: Vec<SeedLabels>,
    pub records: Vec<Level1Record>,
    pub architectures: Vec<FrozenArchitecture>,
    pub failures: Vec<UnitFailure>,
}

impl Level1Output {
    /// Record of one output at one seed
    pub fn record(&self, key: &OutputKey, seed: u64) -> Option<&Level1Record> {
        self.records.iter().find(|r| &r.key == key && r.seed == seed)
    }

    /// Frozen architecture of one output
    pub fn architecture(&self, key: &OutputKey) -> Option<&dyn Classifier> {
        self.architectures
            .iter()
            .find(|a| &a.key == key)
            .map(|a| a.architecture.as_ref())
    }

    /// Mean test1 accuracy over seeds for one output
    pub fn mean_accuracy(&self, key: &OutputKey) -> Option<f64> {
        let values: Vec<f64> = self
            .records
            .iter()
            .filter(|r| &r.key == key)
            .map(|r| r.metrics.accuracy)
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }

    /// Outputs that produced records, in first-seen order
    pub fn keys(&self) -> Vec<OutputKey> {
        let mut keys: Vec<OutputKey> = Vec::new();
        for r in &self.records {
            if !keys.contains(&r.key) {
                keys.push(r.key.clone());
            }
        }
        keys
    }

    /// Best classifier per feature set by mean test1 accuracy
    pub fn best_per_feature_set(&self) -> Vec<OutputKey> {
        let mut best: Vec<(OutputKey, f64)> = Vec::new();
        for key in self.keys() {
            let Some(acc) = self.mean_accuracy(&key) else {
                continue;
            };
            match best.iter_mut().find(|(k, _)| k.feature_set == key.feature_set) {
                Some(entry) if acc > entry.1 => *entry = (key, acc),
                Some(_) => {}
                None => best.push((key, acc)),
            }
        }
        best.sort_by(|a, b| a.0.cmp(&b.0));
        best.into_iter().map(|(k, _)| k).collect()
    }

    /// Selection from config, or the best output per feature set
    pub fn resolve_selection(&self, configured: &[OutputKey]) -> Vec<OutputKey> {
        if configured.is_empty() {
            self.best_per_feature_set()
        } else {
            configured.to_vec()
        }
    }
}

/// Stack per-output score vectors as columns of a drug-by-output matrix
pub fn stack_columns(columns: &[Vec<f64>]) -> Result<Matrix> {
    let rows = columns.first().map(|c| c.len()).unwrap_or(0);
    if let Some(bad) = columns.iter().find(|c| c.len() != rows) {
        return Err(ToxError::integrity(format!(
            "meta-feature columns differ in length ({} vs {})",
            rows,
            bad.len()
        )));
    }
    let flat: Vec<f64> = columns.iter().flatten().copied().collect();
    let by_column = Matrix::from_shape_vec((columns.len(), rows), flat)
        .map_err(|e| ToxError::integrity(e.to_string()))?;
    Ok(by_column.reversed_axes().as_standard_layout().into_owned())
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::data::loader::{FeatureTable, LabelTable};
    use crate::data::{FeatureSetKind, FeatureStore};
    use std::io::Cursor;

    /// 30 positive and 30 negative drugs; the first column of every set
    /// tracks the label, the second is noise
    pub(crate) fn fixture() -> (LabelTable, FeatureStore) {
        let mut labels = String::from("drug,tox\n");
        let mut sages = String::new();
        let mut fp = String::new();
        for i in 0..60 {
            let positive = i % 2 == 0;
            labels.push_str(&format!("D{},{}\n", i, u8::from(positive)));
            let base = if positive { 0.75 } else { 0.25 };
            let jitter = ((i * 37) % 11) as f64 / 50.0;
            sages.push_str(&format!("D{},{},{}\n", i, base + jitter, (i % 7) as f64));
            fp.push_str(&format!("D{},{},{}\n", i, u8::from(positive), (i % 3) as f64));
        }
        let labels = LabelTable::parse(Cursor::new(labels), b',').unwrap();
        let mut store = FeatureStore::new();
        store.insert(
            FeatureSetKind::Sages,
            FeatureTable::parse(Cursor::new(sages), b',', "sages").unwrap(),
        );
        store.insert(
            FeatureSetKind::Fingerprint,
            FeatureTable::parse(Cursor::new(fp), b',', "fp").unwrap(),
        );
        (labels, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(set: FeatureSetKind, cl: &str, seed: u64, accuracy: f64) -> Level1Record {
        Level1Record {
            seed,
            key: OutputKey::new(set, cl),
            metrics: Metrics {
                accuracy,
                ..Metrics::default()
            },
            score_kind: ScoreKind::Probability,
            train_meta: Vec::new(),
            test_meta: Vec::new(),
        }
    }

    #[test]
    fn test_output_key_round_trip() {
        let key: OutputKey = "drug_features-gridsk".parse().unwrap();
        assert_eq!(key.feature_set, FeatureSetKind::DrugFeatures);
        assert_eq!(key.classifier, "gridsk");
        assert_eq!(key.to_string(), "drug_features-gridsk");
        assert!("sages".parse::<OutputKey>().is_err());
        assert!("sages-".parse::<OutputKey>().is_err());
    }

    #[test]
    fn test_best_per_feature_set() {
        let output = Level1Output {
            records: vec![
                record(FeatureSetKind::Sages, "a", 0, 0.6),
                record(FeatureSetKind::Sages, "a", 1, 0.8),
                record(FeatureSetKind::Sages, "b", 0, 0.65),
                record(FeatureSetKind::Sages, "b", 1, 0.65),
                record(FeatureSetKind::Fingerprint, "b", 0, 0.9),
            ],
            ..Default::default()
        };

        assert_eq!(
            output.best_per_feature_set(),
            vec![
                OutputKey::new(FeatureSetKind::Sages, "a"),
                OutputKey::new(FeatureSetKind::Fingerprint, "b"),
            ]
        );
        assert_eq!(output.mean_accuracy(&OutputKey::new(FeatureSetKind::Sages, "a")), Some(0.7));
    }

    #[test]
    fn test_stack_columns_transposes() {
        let m = stack_columns(&[vec![0.1, 0.2, 0.3], vec![0.9, 0.8, 0.7]]).unwrap();
        assert_eq!(m.shape(), &[3, 2]);
        assert_eq!(m.row(1).to_vec(), vec![0.2, 0.8]);
        assert!(stack_columns(&[vec![0.1], vec![0.2, 0.3]]).is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(StackingConfig::default().validate().is_ok());

        let config = StackingConfig {
            train_fraction: 1.2,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = StackingConfig {
            selection: vec!["nonsense".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let json = r#"{"endpoint": 2, "n_seeds": 4, "selection": ["sages-gridsk"]}"#;
        std::fs::write(&path, json).unwrap();

        let config = StackingConfig::from_file(&path).unwrap();
        assert_eq!(config.endpoint, 2);
        assert_eq!(config.n_seeds, 4);
        assert_eq!(config.train_fraction, 0.8);
        assert_eq!(config.selection_keys().unwrap().len(), 1);
    }
}
