pub mod feature_selection;
pub mod loader;
pub mod preprocessing;

use crate::error::{Result, ToxError};
use loader::FeatureTable;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Row-major drug matrix: rows are drugs, columns are features
pub type Matrix = Array2<f64>;

/// The four fixed feature-set sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSetKind {
    /// Computed molecular descriptors
    Sages,
    /// Structural fingerprint bits
    #[serde(rename = "fp")]
    Fingerprint,
    /// Auxiliary drug features
    DrugFeatures,
    /// Target-binding profile
    #[serde(rename = "targetsall")]
    TargetsAll,
}

impl FeatureSetKind {
    /// All feature sets in canonical order
    pub const ALL: [FeatureSetKind; 4] = [
        FeatureSetKind::Sages,
        FeatureSetKind::Fingerprint,
        FeatureSetKind::DrugFeatures,
        FeatureSetKind::TargetsAll,
    ];

    /// Name used in artifact file names
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureSetKind::Sages => "sages",
            FeatureSetKind::Fingerprint => "fp",
            FeatureSetKind::DrugFeatures => "drug_features",
            FeatureSetKind::TargetsAll => "targetsall",
        }
    }
}

impl fmt::Display for FeatureSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureSetKind {
    type Err = ToxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sages" => Ok(FeatureSetKind::Sages),
            "fp" | "fingerprint" => Ok(FeatureSetKind::Fingerprint),
            "drug_features" => Ok(FeatureSetKind::DrugFeatures),
            "targetsall" | "targets" => Ok(FeatureSetKind::TargetsAll),
            other => Err(ToxError::config(format!("unknown feature set: {other}"))),
        }
    }
}

/// Input file locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPaths {
    /// Label table (header row, identifier in column 0)
    pub labels: PathBuf,
    /// Feature table per feature set
    pub features: BTreeMap<FeatureSetKind, PathBuf>,
    /// Clinical-trial feature table per feature set
    pub trials: BTreeMap<FeatureSetKind, PathBuf>,
}

impl Default for DataPaths {
    fn default() -> Self {
        Self::in_dir(".")
    }
}

impl DataPaths {
    /// Default file names rooted at `dir`
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        let features = FeatureSetKind::ALL
            .iter()
            .map(|&kind| (kind, dir.join(format!("{}.csv", kind))))
            .collect();
        let trials = FeatureSetKind::ALL
            .iter()
            .map(|&kind| (kind, dir.join(format!("trials_{}.csv", kind))))
            .collect();
        Self {
            labels: dir.join("tox_labels.csv"),
            features,
            trials,
        }
    }
}

/// Partition of drug identifiers for one seed
#[derive(Debug, Clone, PartialEq)]
pub struct CohortSplit {
    /// Seed the partition was drawn with
    pub seed: u64,
    pub train: Vec<String>,
    pub test1: Vec<String>,
    pub test2: Vec<String>,
    pub train_labels: Vec<u8>,
    pub test1_labels: Vec<u8>,
    pub test2_labels: Vec<u8>,
}

impl CohortSplit {
    /// Labels of the level-2 training rows (train followed by test1)
    pub fn meta_train_labels(&self) -> Vec<u8> {
        self.train_labels
            .iter()
            .chain(&self.test1_labels)
            .copied()
            .collect()
    }

    /// Labels of the level-2 test rows (test2)
    pub fn meta_test_labels(&self) -> Vec<u8> {
        self.test2_labels.clone()
    }

    /// Every drug in the cohort, train then test1 then test2
    pub fn all_drugs(&self) -> Vec<String> {
        self.train
            .iter()
            .chain(&self.test1)
            .chain(&self.test2)
            .cloned()
            .collect()
    }

    /// Labels parallel to [`CohortSplit::all_drugs`]
    pub fn all_labels(&self) -> Vec<u8> {
        self.train_labels
            .iter()
            .chain(&self.test1_labels)
            .chain(&self.test2_labels)
            .copied()
            .collect()
    }

    /// Total number of drugs kept in the cohort
    pub fn total(&self) -> usize {
        self.train.len() + self.test1.len() + self.test2.len()
    }
}

/// Normalized matrices of one feature set for one cohort split
#[derive(Debug, Clone)]
pub struct FeatureDataset {
    pub kind: FeatureSetKind,
    pub train: Matrix,
    pub test1: Matrix,
    pub test2: Matrix,
}

/// All loaded feature tables, keyed by feature set
#[derive(Debug, Clone, Default)]
pub struct FeatureStore {
    tables: BTreeMap<FeatureSetKind, FeatureTable>,
}

impl FeatureStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every feature table named in `paths`
    pub fn load(paths: &DataPaths) -> Result<Self> {
        let mut store = Self::new();
        for (&kind, path) in &paths.features {
            store.insert(kind, FeatureTable::load(path)?);
        }
        Ok(store)
    }

    /// Add or replace a table
    pub fn insert(&mut self, kind: FeatureSetKind, table: FeatureTable) {
        self.tables.insert(kind, table);
    }

    /// Loaded feature sets in canonical order
    pub fn kinds(&self) -> Vec<FeatureSetKind> {
        self.tables.keys().copied().collect()
    }

    /// Matrix of one feature set with rows in exactly the order of `drugs`
    pub fn matrix(&self, kind: FeatureSetKind, drugs: &[String]) -> Result<Matrix> {
        self.tables
            .get(&kind)
            .ok_or_else(|| ToxError::integrity(format!("feature set {} not loaded", kind)))?
            .matrix(drugs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_set_names() {
        for kind in FeatureSetKind::ALL {
            assert_eq!(kind.as_str().parse::<FeatureSetKind>().unwrap(), kind);
        }
        assert!("morgan".parse::<FeatureSetKind>().is_err());
    }

    #[test]
    fn test_default_paths() {
        let paths = DataPaths::in_dir("data");
        assert_eq!(paths.labels, PathBuf::from("data/tox_labels.csv"));
        assert_eq!(
            paths.features[&FeatureSetKind::Fingerprint],
            PathBuf::from("data/fp.csv")
        );
        assert_eq!(
            paths.trials[&FeatureSetKind::TargetsAll],
            PathBuf::from("data/trials_targetsall.csv")
        );
    }

    #[test]
    fn test_cohort_label_sequences() {
        let split = CohortSplit {
            seed: 3,
            train: vec!["a".into(), "b".into()],
            test1: vec!["c".into(), "d".into()],
            test2: vec!["e".into(), "f".into()],
            train_labels: vec![1, 0],
            test1_labels: vec![1, 0],
            test2_labels: vec![1, 0],
        };
        assert_eq!(split.meta_train_labels(), vec![1, 0, 1, 0]);
        assert_eq!(split.meta_test_labels(), vec![1, 0]);
        assert_eq!(split.all_drugs().len(), split.total());
        assert_eq!(split.all_labels(), vec![1, 0, 1, 0, 1, 0]);
    }
}
