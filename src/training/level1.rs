//! Level 1: one classifier per feature set, re-fitted across resampling
//! seeds.
//!
//! For every (feature set, classifier) pair the model search runs once on
//! the primary split. The frozen architecture is then fitted on each seed's
//! training rows and scored on test1 (reported) and on all rows (the
//! meta-features handed to level 2).

use crate::data::loader::LabelTable;
use crate::data::preprocessing::{normalize_feature_set, split_cohort};
use crate::data::{CohortSplit, FeatureDataset, FeatureSetKind, FeatureStore};
use crate::error::{Result, ToxError};
use crate::model::metrics::{curves, evaluate};
use crate::model::{score_all, ModelSearch, ScoreKind};
use crate::training::artifacts::{
    self, join, ArtifactWriter, Part, SummaryLog, LEVEL1_HEADER, LEVEL1_SUMMARY,
};
use crate::training::{
    FrozenArchitecture, Level1Output, Level1Record, OutputKey, SeedLabels, StackingConfig,
    UnitFailure,
};
use crate::utils::progress_bar;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{error, info, warn};

/// Runs level 1 over every loaded feature set and registered classifier
pub struct Level1Trainer<'a> {
    config: &'a StackingConfig,
    labels: &'a LabelTable,
    store: &'a FeatureStore,
    writer: Option<&'a ArtifactWriter>,
    overrides: HashMap<String, Box<dyn ModelSearch + 'a>>,
}

impl<'a> Level1Trainer<'a> {
    pub fn new(
        config: &'a StackingConfig,
        labels: &'a LabelTable,
        store: &'a FeatureStore,
    ) -> Self {
        Self {
            config,
            labels,
            store,
            writer: None,
            overrides: HashMap::new(),
        }
    }

    /// Write artifacts through `writer`
    pub fn with_writer(mut self, writer: &'a ArtifactWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Replace the built-in search of one registry label
    pub fn with_search(
        mut self,
        label: impl Into<String>,
        search: Box<dyn ModelSearch + 'a>,
    ) -> Self {
        self.overrides.insert(label.into(), search);
        self
    }

    /// Run every unit and collect the level-1 output
    pub fn run(&self) -> Result<Level1Output> {
        let start = Instant::now();
        let config = self.config;
        info!(
            "Level 1: endpoint {}, {} seeds, {} feature sets, classifiers {:?}",
            config.endpoint,
            config.n_seeds,
            self.store.kinds().len(),
            config.classifiers.labels()
        );

        let primary =
            split_cohort(self.labels, config.endpoint, config.seed, config.train_fraction)?;
        let splits = config
            .seeds()
            .map(|seed| split_cohort(self.labels, config.endpoint, seed, config.train_fraction))
            .collect::<Result<Vec<CohortSplit>>>()?;

        let mut output = Level1Output {
            labels: splits
                .iter()
                .map(|s| SeedLabels {
                    seed: s.seed,
                    train: s.meta_train_labels(),
                    test: s.meta_test_labels(),
                })
                .collect(),
            ..Default::default()
        };
        self.write_labels(&output.labels)?;

        let mut summary = SummaryLog::new(LEVEL1_SUMMARY, LEVEL1_HEADER);
        for kind in self.store.kinds() {
            let datasets = match self.load_feature_set(kind, &primary, &splits) {
                Ok(d) => d,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    for label in config.classifiers.labels() {
                        output.fail(OutputKey::new(kind, label).to_string(), &e);
                    }
                    continue;
                }
            };

            for entry in &config.classifiers.entries {
                let key = OutputKey::new(kind, entry.label.clone());
                let unit = self.run_unit(&key, &datasets, &primary, &splits);
                match unit {
                    Ok((architecture, records)) => {
                        if let Some(writer) = self.writer {
                            self.write_unit(writer, &architecture, &records, &splits)?;
                        }
                        for record in &records {
                            summary.push(format!(
                                "{},{},{},{}",
                                record.seed,
                                kind,
                                record.metrics.to_csv_fields(),
                                entry.label
                            ));
                        }
                        summary.flush(self.writer)?;
                        output.records.extend(records);
                        output.architectures.push(architecture);
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => output.fail(key.to_string(), &e),
                }
            }
        }

        if output.records.is_empty() {
            return Err(ToxError::integrity(format!(
                "every level-1 unit failed ({} failures)",
                output.failures.len()
            )));
        }
        info!(
            "Level 1 finished in {}: {} records, {} failed units",
            crate::utils::format_duration(start.elapsed().as_secs_f64()),
            output.records.len(),
            output.failures.len()
        );
        Ok(output)
    }

    /// Normalized matrices for the primary split and every seed
    fn load_feature_set(
        &self,
        kind: FeatureSetKind,
        primary: &CohortSplit,
        splits: &[CohortSplit],
    ) -> Result<(FeatureDataset, Vec<FeatureDataset>)> {
        let primary_data = normalize_feature_set(self.store, kind, primary)?;
        let per_seed = splits
            .iter()
            .map(|split| normalize_feature_set(self.store, kind, split))
            .collect::<Result<Vec<_>>>()?;
        Ok((primary_data, per_seed))
    }

    fn search_architecture(
        &self,
        key: &OutputKey,
        data: &FeatureDataset,
        split: &CohortSplit,
    ) -> Result<FrozenArchitecture> {
        let architecture = match self.overrides.get(&key.classifier) {
            Some(search) => search.search(&data.train, &split.train_labels)?,
            None => {
                let entry = self.config.classifiers.get(&key.classifier)?;
                self.config
                    .classifiers
                    .search_for(entry, self.config.cv_folds, self.config.seed)
                    .search(&data.train, &split.train_labels)?
            }
        };
        info!("{}: frozen architecture {}", key, architecture.export().replace('\n', " "));
        Ok(FrozenArchitecture {
            key: key.clone(),
            architecture,
        })
    }

    /// Search once, then fit and score at every seed
    ///
    /// Nothing is written here; a unit that fails at any seed leaves no
    /// artifacts behind.
    fn run_unit(
        &self,
        key: &OutputKey,
        datasets: &(FeatureDataset, Vec<FeatureDataset>),
        primary: &CohortSplit,
        splits: &[CohortSplit],
    ) -> Result<(FrozenArchitecture, Vec<Level1Record>)> {
        let (primary_data, per_seed) = datasets;
        let frozen = self.search_architecture(key, primary_data, primary)?;

        let pb = progress_bar(splits.len() as u64, &key.to_string(), self.config.progress);
        let mut records = Vec::with_capacity(splits.len());
        let mut fallback_logged = false;
        for (split, data) in splits.iter().zip(per_seed) {
            let model = frozen.architecture.fit(&data.train, &split.train_labels)?;
            let predicted = model.predict(&data.test1)?;
            let metrics = evaluate(&split.test1_labels, &predicted)?;

            let (mut scores, score_kind) = score_all(
                model.as_ref(),
                &key.to_string(),
                &[&data.train, &data.test1, &data.test2],
                !fallback_logged,
            )?;
            fallback_logged |= score_kind == ScoreKind::HardLabel;
            let test_meta = scores.pop().unwrap_or_default();
            let test1_scores = scores.pop().unwrap_or_default();
            let mut train_meta = scores.pop().unwrap_or_default();
            train_meta.extend(test1_scores);

            records.push(Level1Record {
                seed: split.seed,
                key: key.clone(),
                metrics,
                score_kind,
                train_meta,
                test_meta,
            });
            pb.inc(1);
        }
        pb.finish_and_clear();

        let total: f64 = records.iter().map(|r| r.metrics.accuracy).sum();
        let mean = total / records.len().max(1) as f64;
        info!("{}: mean test1 accuracy {:.4} over {} seeds", key, mean, records.len());
        Ok((frozen, records))
    }

    /// Architecture, meta-feature files and curves of a completed unit
    fn write_unit(
        &self,
        writer: &ArtifactWriter,
        frozen: &FrozenArchitecture,
        records: &[Level1Record],
        splits: &[CohortSplit],
    ) -> Result<()> {
        let key = &frozen.key;
        writer.write(
            &artifacts::level1_architecture_name(&key.classifier, key.feature_set),
            &frozen.architecture.export(),
        )?;

        let (set, cl) = (key.feature_set, key.classifier.as_str());
        for (record, split) in records.iter().zip(splits) {
            let name = |part| artifacts::level1_meta_name(set, cl, split.seed, part);
            writer.write_lines(&name(Part::Train), &[join(&record.train_meta)])?;
            writer.write_lines(&name(Part::Test), &[join(&record.test_meta)])?;

            if record.score_kind == ScoreKind::Probability {
                match curves(&split.test2_labels, &record.test_meta) {
                    Ok(c) => {
                        let name = artifacts::curves_name(split.seed, set.as_str(), cl);
                        writer.write_curves(&name, &c)?;
                    }
                    Err(e) => warn!("{}: no curves for seed {}: {}", key, split.seed, e),
                }
            }
        }
        Ok(())
    }

    fn write_labels(&self, labels: &[SeedLabels]) -> Result<()> {
        let Some(writer) = self.writer else {
            return Ok(());
        };
        let train: Vec<String> = labels.iter().map(|l| join(&l.train)).collect();
        let test: Vec<String> = labels.iter().map(|l| join(&l.test)).collect();
        writer.write_lines(artifacts::TRAIN_LABELS, &train)?;
        writer.write_lines(artifacts::TEST_LABELS, &test)?;
        Ok(())
    }
}

impl Level1Output {
    pub(crate) fn fail(&mut self, unit: String, e: &ToxError) {
        error!("{}: unit aborted: {}", unit, e);
        self.failures.push(UnitFailure {
            unit,
            error: e.to_string(),
        });
    }
}
