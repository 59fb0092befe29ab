//! Toxicity calls for drugs in active clinical trials.
//!
//! Level-1 stage: for every selected output the frozen architecture is
//! re-fitted per seed on that seed's whole balanced cohort and scores the
//! trial drugs, which are normalized with the cohort's statistics.
//! Level-2 stage: the frozen meta-architecture is re-fitted per seed on that
//! seed's level-2 training rows and scores the stacked trial scores.

use crate::data::loader::{LabelTable, TrialCohort};
use crate::data::preprocessing::{normalize_feature_set, split_cohort, NormStats};
use crate::data::{FeatureStore, Matrix};
use crate::error::{Result, ToxError};
use crate::model::{score_all, Classifier, ModelSearch, ScoreKind};
use crate::training::artifacts::{self, join, ArtifactWriter};
use crate::training::level2::MetaDataset;
use crate::training::{stack_columns, Level1Output, OutputKey, StackingConfig};
use crate::utils::progress_bar;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Stacked level-1 trial scores of one seed
#[derive(Debug, Clone)]
pub struct TrialMeta {
    pub seed: u64,
    pub columns: Vec<OutputKey>,
    /// Rows: trial drugs; columns: selected outputs
    pub matrix: Matrix,
}

/// Level-1 stage output
#[derive(Debug, Clone)]
pub struct TrialLevel1 {
    pub drugs: Vec<String>,
    pub seeds: Vec<TrialMeta>,
}

/// Final level-2 scores: one row per seed, one column per trial drug
#[derive(Debug, Clone)]
pub struct TrialPredictionTable {
    pub drugs: Vec<String>,
    pub rows: Vec<(u64, Vec<f64>)>,
    pub score_kind: ScoreKind,
}

/// Per-drug summary over seeds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrugVote {
    pub drug: String,
    pub mean_score: f64,
    /// Seeds whose score is above 0.5
    pub positive_votes: usize,
    pub seeds: usize,
    /// 1 when a strict majority of seeds vote positive
    pub call: u8,
}

impl TrialPredictionTable {
    /// Header of drug names, then one line of scores per seed
    pub fn to_csv(&self) -> String {
        let mut csv = join(&self.drugs);
        csv.push('\n');
        for (_, scores) in &self.rows {
            csv.push_str(&join(scores));
            csv.push('\n');
        }
        csv
    }

    pub fn votes(&self) -> Vec<DrugVote> {
        self.drugs
            .iter()
            .enumerate()
            .map(|(i, drug)| {
                let scores: Vec<f64> = self
                    .rows
                    .iter()
                    .filter_map(|(_, r)| r.get(i).copied())
                    .collect();
                let positive_votes = scores.iter().filter(|&&s| s > 0.5).count();
                let mean_score = if scores.is_empty() {
                    0.0
                } else {
                    scores.iter().sum::<f64>() / scores.len() as f64
                };
                DrugVote {
                    drug: drug.clone(),
                    mean_score,
                    positive_votes,
                    seeds: scores.len(),
                    call: u8::from(2 * positive_votes > scores.len()),
                }
            })
            .collect()
    }

    pub fn votes_to_csv(&self) -> String {
        let mut csv = String::from("drug,mean_score,positive_votes,seeds,call\n");
        for v in self.votes() {
            csv.push_str(&format!(
                "{},{:.6},{},{},{}\n",
                v.drug, v.mean_score, v.positive_votes, v.seeds, v.call
            ));
        }
        csv
    }
}

fn pick_architecture<'b>(
    key: &OutputKey,
    frozen: Option<&'b Level1Output>,
    searched: &'b [(OutputKey, Box<dyn Classifier>)],
) -> Result<&'b dyn Classifier> {
    frozen
        .and_then(|f| f.architecture(key))
        .or_else(|| searched.iter().find(|(k, _)| k == key).map(|(_, a)| a.as_ref()))
        .ok_or_else(|| ToxError::integrity(format!("no architecture for {}", key)))
}

pub struct TrialPredictor<'a> {
    config: &'a StackingConfig,
    labels: &'a LabelTable,
    store: &'a FeatureStore,
    trials: &'a TrialCohort,
    writer: Option<&'a ArtifactWriter>,
}

impl<'a> TrialPredictor<'a> {
    pub fn new(
        config: &'a StackingConfig,
        labels: &'a LabelTable,
        store: &'a FeatureStore,
        trials: &'a TrialCohort,
    ) -> Self {
        Self {
            config,
            labels,
            store,
            trials,
            writer: None,
        }
    }

    pub fn with_writer(mut self, writer: &'a ArtifactWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Search an architecture for `key` on the primary split
    fn search_level1(&self, key: &OutputKey) -> Result<Box<dyn Classifier>> {
        let config = self.config;
        let split = split_cohort(self.labels, config.endpoint, config.seed, config.train_fraction)?;
        let data = normalize_feature_set(self.store, key.feature_set, &split)?;
        let entry = config.classifiers.get(&key.classifier)?;
        config
            .classifiers
            .search_for(entry, config.cv_folds, config.seed)
            .search(&data.train, &split.train_labels)
    }

    /// Score trial drugs with every selected level-1 output at every seed
    ///
    /// Architectures are taken from `frozen` when given, else searched anew.
    pub fn level1(
        &self,
        selection: &[OutputKey],
        frozen: Option<&Level1Output>,
    ) -> Result<TrialLevel1> {
        if selection.is_empty() {
            return Err(ToxError::config("no level-1 outputs selected for trial prediction"));
        }
        let config = self.config;

        let mut searched = Vec::new();
        for key in selection {
            if frozen.and_then(|f| f.architecture(key)).is_none() {
                searched.push((key.clone(), self.search_level1(key)?));
            }
        }

        let pb = progress_bar(config.n_seeds, "trials-level1", config.progress);
        let mut seeds = Vec::with_capacity(config.n_seeds as usize);
        for seed in config.seeds() {
            let split = split_cohort(self.labels, config.endpoint, seed, config.train_fraction)?;
            let drugs = split.all_drugs();
            let labels = split.all_labels();

            let mut columns = Vec::with_capacity(selection.len());
            for key in selection {
                let cohort = self.store.matrix(key.feature_set, &drugs)?;
                let stats = NormStats::fit(&cohort);
                let trial = self.trials.sets.get(&key.feature_set).ok_or_else(|| {
                    ToxError::integrity(format!("no trial table for {}", key.feature_set))
                })?;

                let model = pick_architecture(key, frozen, &searched)?
                    .fit(&stats.transform(&cohort)?, &labels)?;
                let (mut scores, _) = score_all(
                    model.as_ref(),
                    &format!("trials-{}", key),
                    &[&stats.transform(trial)?],
                    seed == 0,
                )?;
                columns.push(scores.pop().unwrap_or_default());
            }

            if let Some(writer) = self.writer {
                let lines: Vec<String> = selection
                    .iter()
                    .zip(&columns)
                    .map(|(key, c)| format!("{},{}", key, join(c)))
                    .collect();
                writer.write_lines(&artifacts::trial_level1_name(seed), &lines)?;
            }

            seeds.push(TrialMeta {
                seed,
                columns: selection.to_vec(),
                matrix: stack_columns(&columns)?,
            });
            pb.inc(1);
        }
        pb.finish_and_clear();

        Ok(TrialLevel1 {
            drugs: self.trials.drugs.clone(),
            seeds,
        })
    }

    /// Re-fit the meta-architecture per seed and score the trial drugs
    pub fn level2(
        &self,
        level1: &TrialLevel1,
        meta: &[MetaDataset],
        architecture: &dyn Classifier,
    ) -> Result<TrialPredictionTable> {
        let mut rows = Vec::with_capacity(level1.seeds.len());
        let mut kind = ScoreKind::Probability;
        for trial in &level1.seeds {
            let data = meta.iter().find(|m| m.seed == trial.seed).ok_or_else(|| {
                ToxError::integrity(format!("no level-2 training data for seed {}", trial.seed))
            })?;
            if data.columns != trial.columns {
                return Err(ToxError::integrity(format!(
                    "seed {}: trial scores stack {} outputs, level-2 data stacks {}",
                    trial.seed,
                    trial.columns.len(),
                    data.columns.len()
                )));
            }

            let model = architecture.fit(&data.train, &data.train_labels)?;
            let (mut scores, score_kind) = score_all(
                model.as_ref(),
                "trials-level2",
                &[&trial.matrix],
                rows.is_empty(),
            )?;
            kind = score_kind;
            rows.push((trial.seed, scores.pop().unwrap_or_default()));
        }

        let table = TrialPredictionTable {
            drugs: level1.drugs.clone(),
            rows,
            score_kind: kind,
        };
        if let Some(writer) = self.writer {
            writer.write(artifacts::TRIAL_PREDICTIONS, &table.to_csv())?;
            writer.write(artifacts::TRIAL_VOTES, &table.votes_to_csv())?;
        }
        let positives = table.votes().iter().filter(|v| v.call == 1).count();
        info!(
            "Trial prediction: {} of {} drugs called toxic by majority vote",
            positives,
            table.drugs.len()
        );
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FeatureSetKind;
    use crate::model::{Architecture, ClassifierRegistry, SearchSpace};
    use crate::training::level1::Level1Trainer;
    use crate::training::test_support::fixture;
    use ndarray::array;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn trials() -> TrialCohort {
        let mut sets = BTreeMap::new();
        // Raw scale of the fixture: sages column 0 spans 0.25..0.95
        sets.insert(FeatureSetKind::Sages, array![[0.9, 3.0], [0.3, 3.0], [0.85, 1.0]]);
        sets.insert(FeatureSetKind::Fingerprint, array![[1.0, 0.0], [0.0, 1.0], [1.0, 2.0]]);
        TrialCohort {
            drugs: vec!["T1".into(), "T2".into(), "T3".into()],
            sets,
        }
    }

    #[test]
    fn test_table_csv_and_votes() {
        let table = TrialPredictionTable {
            drugs: vec!["a".into(), "b".into()],
            rows: vec![(0, vec![0.9, 0.2]), (1, vec![0.7, 0.6]), (2, vec![0.4, 0.1])],
            score_kind: ScoreKind::Probability,
        };
        let csv = table.to_csv();
        assert_eq!(csv.lines().next().unwrap(), "a,b");
        assert_eq!(csv.lines().count(), 4);

        let votes = table.votes();
        assert_eq!(votes[0].positive_votes, 2);
        assert_eq!(votes[0].call, 1);
        assert_eq!(votes[1].call, 0);
        assert!((votes[0].mean_score - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_trial_prediction_end_to_end() {
        let (labels, store) = fixture();
        let config = StackingConfig {
            classifiers: ClassifierRegistry::single("centroid", SearchSpace::centroid_only()),
            ..StackingConfig::quick_test()
        };
        let level1 = Level1Trainer::new(&config, &labels, &store).run().unwrap();
        let selection = level1.best_per_feature_set();
        let meta = MetaDataset::all_from_level1(&level1, &selection).unwrap();

        let dir = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        let trials = trials();
        let predictor = TrialPredictor::new(&config, &labels, &store, &trials).with_writer(&writer);

        let trial_l1 = predictor.level1(&selection, Some(&level1)).unwrap();
        assert_eq!(trial_l1.seeds.len(), 3);
        assert_eq!(trial_l1.seeds[0].matrix.shape(), &[3, 2]);

        let table = predictor
            .level2(&trial_l1, &meta, &Architecture::NearestCentroid)
            .unwrap();
        assert_eq!(table.rows.len(), 3);
        let calls: Vec<u8> = table.votes().iter().map(|v| v.call).collect();
        assert_eq!(calls, vec![1, 0, 1]);

        assert!(dir.path().join("0predtrialdrugs-level2.csv").exists());
        let csv = std::fs::read_to_string(dir.path().join(artifacts::TRIAL_PREDICTIONS)).unwrap();
        assert_eq!(csv.lines().next().unwrap(), "T1,T2,T3");
    }

    #[test]
    fn test_mismatched_columns_rejected() {
        let (labels, store) = fixture();
        let config = StackingConfig {
            classifiers: ClassifierRegistry::single("centroid", SearchSpace::centroid_only()),
            ..StackingConfig::quick_test()
        };
        let level1 = Level1Trainer::new(&config, &labels, &store).run().unwrap();
        let meta = MetaDataset::all_from_level1(
            &level1,
            &[OutputKey::new(FeatureSetKind::Sages, "centroid")],
        )
        .unwrap();

        let trials = trials();
        let predictor = TrialPredictor::new(&config, &labels, &store, &trials);
        let trial_l1 = predictor.level1(&level1.best_per_feature_set(), None).unwrap();
        assert!(matches!(
            predictor.level2(&trial_l1, &meta, &Architecture::NearestCentroid),
            Err(ToxError::DataIntegrity(_))
        ));
    }
}
