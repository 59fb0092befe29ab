//! # drugtox: stacked drug-toxicity classification
//!
//! drugtox predicts whether a drug fails for toxicity by stacking
//! classifiers trained on several heterogeneous feature sets of the same
//! drug cohort.
//!
//! ## Features
//!
//! - Balanced resampled train/test1/test2 splits per seed
//! - Level-1 classifiers per (feature set, classifier) with a model search
//!   frozen on one split and re-fit on every seed
//! - Level-2 meta-classifiers over the stacked level-1 probabilities
//! - Unweighted averaging baseline and seed-averaged summaries
//! - Majority-vote predictions for held-out clinical-trial drugs
//! - Input tables as CSV, TSV or gzipped
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use drugtox::data::loader::LabelTable;
//! use drugtox::data::FeatureStore;
//! use drugtox::training::level1::Level1Trainer;
//! use drugtox::training::level2::{Level2Trainer, MetaDataset};
//! use drugtox::training::StackingConfig;
//!
//! let config = StackingConfig::default();
//! let labels = LabelTable::load(&config.data.labels).unwrap();
//! let store = FeatureStore::load(&config.data).unwrap();
//!
//! // Level 1
//! let level1 = Level1Trainer::new(&config, &labels, &store).run().unwrap();
//!
//! // Stack the best classifier per feature set
//! let selection = level1.resolve_selection(&[]);
//! let meta = MetaDataset::all_from_level1(&level1, &selection).unwrap();
//!
//! // Level 2
//! let level2 = Level2Trainer::new(&config).run(&meta).unwrap();
//! println!("{:?}", level2.mean_accuracy(&config.meta_classifier));
//! ```

pub mod aggregate;
pub mod cli;
pub mod data;
pub mod error;
pub mod model;
pub mod predict;
pub mod training;
pub mod utils;

/// Re-export commonly used types
pub use aggregate::{AveragePredictor, ThresholdPolarity};
pub use data::loader::{FeatureTable, LabelTable, TrialCohort};
pub use data::{DataPaths, FeatureSetKind, FeatureStore, Matrix};
pub use error::{Result, ToxError};
pub use model::metrics::Metrics;
pub use model::{Classifier, ClassifierRegistry, FittedModel, ModelSearch};
pub use predict::{TrialPredictionTable, TrialPredictor};
pub use training::level1::Level1Trainer;
pub use training::level2::{Level2Trainer, MetaDataset};
pub use training::{Level1Output, OutputKey, StackingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!(
        "{} v{} - two-level stacked drug toxicity classification",
        NAME, VERSION
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_info() {
        let info_str = info();
        assert!(info_str.contains("drugtox"));
        assert!(info_str.contains(VERSION));
    }
}
