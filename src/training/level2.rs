//! Level 2: a meta-classifier over the stacked level-1 scores.
//!
//! The meta-training rows are a seed's train and test1 drugs, the
//! meta-test rows its test2 drugs. Each column is one selected level-1
//! output.

use crate::data::Matrix;
use crate::error::{Result, ToxError};
use crate::model::metrics::{curves, evaluate, Metrics};
use crate::model::{score_all, Classifier, ModelSearch, ScoreKind};
use crate::training::artifacts::{
    self, join, ArtifactWriter, Part, SummaryLog, LEVEL2_HEADER, LEVEL2_SUMMARY,
};
use crate::training::{stack_columns, Level1Output, OutputKey, StackingConfig, UnitFailure};
use crate::utils::progress_bar;
use std::collections::HashMap;
use std::path::Path;
use tracing::{error, info, warn};

/// Stacked level-1 scores of one seed
#[derive(Debug, Clone)]
pub struct MetaDataset {
    pub seed: u64,
    /// One column per level-1 output, in this order
    pub columns: Vec<OutputKey>,
    /// Rows: train then test1 drugs
    pub train: Matrix,
    /// Rows: test2 drugs
    pub test: Matrix,
    pub train_labels: Vec<u8>,
    pub test_labels: Vec<u8>,
}

impl MetaDataset {
    /// Build from per-output score vectors and check its shape
    pub fn new(
        seed: u64,
        columns: Vec<OutputKey>,
        train_scores: &[Vec<f64>],
        test_scores: &[Vec<f64>],
        train_labels: Vec<u8>,
        test_labels: Vec<u8>,
    ) -> Result<Self> {
        let data = Self {
            seed,
            train: stack_columns(train_scores)?,
            test: stack_columns(test_scores)?,
            columns,
            train_labels,
            test_labels,
        };
        data.validate()?;
        Ok(data)
    }

    /// Column count equals the selection; row counts equal the label counts
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(ToxError::integrity(format!(
                "seed {}: no level-1 outputs selected",
                self.seed
            )));
        }
        for (name, m) in [("train", &self.train), ("test", &self.test)] {
            if m.ncols() != self.columns.len() {
                return Err(ToxError::integrity(format!(
                    "seed {}: {} meta matrix has {} columns, expected {}",
                    self.seed,
                    name,
                    m.ncols(),
                    self.columns.len()
                )));
            }
        }
        if self.train.nrows() != self.train_labels.len()
            || self.test.nrows() != self.test_labels.len()
        {
            return Err(ToxError::integrity(format!(
                "seed {}: meta rows ({}, {}) do not match labels ({}, {})",
                self.seed,
                self.train.nrows(),
                self.test.nrows(),
                self.train_labels.len(),
                self.test_labels.len()
            )));
        }
        Ok(())
    }

    /// Assemble one seed from in-memory level-1 records
    pub fn from_level1(output: &Level1Output, selection: &[OutputKey], seed: u64) -> Result<Self> {
        let labels = output
            .labels
            .iter()
            .find(|l| l.seed == seed)
            .ok_or_else(|| ToxError::integrity(format!("no labels recorded for seed {}", seed)))?;

        let mut train = Vec::with_capacity(selection.len());
        let mut test = Vec::with_capacity(selection.len());
        for key in selection {
            let record = output.record(key, seed).ok_or_else(|| {
                ToxError::integrity(format!("level-1 output {} missing for seed {}", key, seed))
            })?;
            train.push(record.train_meta.clone());
            test.push(record.test_meta.clone());
        }
        Self::new(
            seed,
            selection.to_vec(),
            &train,
            &test,
            labels.train.clone(),
            labels.test.clone(),
        )
    }

    /// Assemble every seed of a level-1 run
    pub fn all_from_level1(output: &Level1Output, selection: &[OutputKey]) -> Result<Vec<Self>> {
        output
            .labels
            .iter()
            .map(|l| Self::from_level1(output, selection, l.seed))
            .collect()
    }

    /// Stack the per-output level-1 files of every seed in `dir`
    ///
    /// Labels come from the level-1 label files, one line per seed.
    pub fn load_level1_files(
        dir: &Path,
        selection: &[OutputKey],
        seeds: &[u64],
    ) -> Result<Vec<Self>> {
        let train_labels = artifacts::read_label_rows(&dir.join(artifacts::TRAIN_LABELS))?;
        let test_labels = artifacts::read_label_rows(&dir.join(artifacts::TEST_LABELS))?;

        let mut out = Vec::with_capacity(seeds.len());
        for (i, &seed) in seeds.iter().enumerate() {
            let (Some(train_y), Some(test_y)) = (train_labels.get(i), test_labels.get(i)) else {
                return Err(ToxError::integrity(format!(
                    "label files hold {} seeds, seed {} requested",
                    train_labels.len(),
                    seed
                )));
            };

            let mut train = Vec::new();
            let mut test = Vec::new();
            for key in selection {
                for (part, target) in [(Part::Train, &mut train), (Part::Test, &mut test)] {
                    let name =
                        artifacts::level1_meta_name(key.feature_set, &key.classifier, seed, part);
                    let row = artifacts::read_rows(&dir.join(&name))?
                        .into_iter()
                        .next()
                        .ok_or_else(|| ToxError::integrity(format!("{} is empty", name)))?;
                    target.push(row);
                }
            }
            out.push(Self::new(
                seed,
                selection.to_vec(),
                &train,
                &test,
                train_y.clone(),
                test_y.clone(),
            )?);
        }
        Ok(out)
    }

    /// Write the stacked seed files, one line per selected output
    pub fn write(&self, writer: &ArtifactWriter) -> Result<()> {
        for (part, matrix) in [(Part::Train, &self.train), (Part::Test, &self.test)] {
            let lines: Vec<String> = matrix
                .columns()
                .into_iter()
                .map(|c| join(&c.to_vec()))
                .collect();
            writer.write_lines(&artifacts::stacked_meta_name(self.seed, part), &lines)?;
        }
        Ok(())
    }
}

/// One meta-classifier evaluated at one seed
#[derive(Debug, Clone)]
pub struct Level2Record {
    pub seed: u64,
    pub classifier: String,
    /// Metrics of the test2 hard predictions
    pub metrics: Metrics,
    pub score_kind: ScoreKind,
    /// Scores of the test2 rows
    pub test_scores: Vec<f64>,
}

#[derive(Debug, Default)]
pub struct Level2Output {
    pub records: Vec<Level2Record>,
    /// Frozen meta-architecture per classifier label
    pub architectures: Vec<(String, Box<dyn Classifier>)>,
    pub failures: Vec<UnitFailure>,
}

impl Level2Output {
    pub fn architecture(&self, label: &str) -> Option<&dyn Classifier> {
        self.architectures
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, a)| a.as_ref())
    }

    pub fn mean_accuracy(&self, label: &str) -> Option<f64> {
        let values: Vec<f64> = self
            .records
            .iter()
            .filter(|r| r.classifier == label)
            .map(|r| r.metrics.accuracy)
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }
}

/// Runs every registered meta-classifier over the stacked seeds
pub struct Level2Trainer<'a> {
    config: &'a StackingConfig,
    writer: Option<&'a ArtifactWriter>,
    overrides: HashMap<String, Box<dyn ModelSearch + 'a>>,
}

impl<'a> Level2Trainer<'a> {
    pub fn new(config: &'a StackingConfig) -> Self {
        Self {
            config,
            writer: None,
            overrides: HashMap::new(),
        }
    }

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

    /// Search a meta-architecture on `data`
    pub fn search(&self, label: &str, data: &MetaDataset) -> Result<Box<dyn Classifier>> {
        match self.overrides.get(label) {
            Some(search) => search.search(&data.train, &data.train_labels),
            None => {
                let entry = self.config.classifiers.get(label)?;
                self.config
                    .classifiers
                    .search_for(entry, self.config.cv_folds, self.config.seed)
                    .search(&data.train, &data.train_labels)
            }
        }
    }

    /// Search on the first seed, then fit on every seed's train rows and
    /// evaluate on its test2 rows
    pub fn run(&self, meta: &[MetaDataset]) -> Result<Level2Output> {
        let first = meta
            .first()
            .ok_or_else(|| ToxError::integrity("no level-2 datasets"))?;
        for data in meta {
            data.validate()?;
            if data.columns != first.columns {
                return Err(ToxError::integrity(format!(
                    "seed {} stacks different outputs than seed {}",
                    data.seed, first.seed
                )));
            }
        }
        info!(
            "Level 2: {} seeds over {} stacked outputs",
            meta.len(),
            first.columns.len()
        );

        if let Some(writer) = self.writer {
            for data in meta {
                data.write(writer)?;
            }
        }

        let mut output = Level2Output::default();
        let mut summary = SummaryLog::new(LEVEL2_SUMMARY, LEVEL2_HEADER);
        for label in self.config.classifiers.labels() {
            match self.run_classifier(label, meta) {
                Ok((architecture, records)) => {
                    if let Some(writer) = self.writer {
                        write_classifier(writer, label, architecture.as_ref(), &records, meta)?;
                    }
                    for r in &records {
                        summary.push(format!("{},{},{}", r.seed, r.metrics.to_csv_fields(), label));
                    }
                    summary.flush(self.writer)?;
                    output.records.extend(records);
                    output.architectures.push((label.to_string(), architecture));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("level2-{}: unit aborted: {}", label, e);
                    output.failures.push(UnitFailure {
                        unit: format!("level2-{}", label),
                        error: e.to_string(),
                    });
                }
            }
        }

        if output.records.is_empty() {
            return Err(ToxError::integrity("every level-2 classifier failed"));
        }
        Ok(output)
    }

    /// Search, fit and evaluate one meta-classifier; writes nothing
    fn run_classifier(
        &self,
        label: &str,
        meta: &[MetaDataset],
    ) -> Result<(Box<dyn Classifier>, Vec<Level2Record>)> {
        let architecture = self.search(label, &meta[0])?;

        let unit = format!("level2-{}", label);
        let pb = progress_bar(meta.len() as u64, &unit, self.config.progress);
        let mut records = Vec::with_capacity(meta.len());
        let mut fallback_logged = false;
        for data in meta {
            let model = architecture.fit(&data.train, &data.train_labels)?;
            let predicted = model.predict(&data.test)?;
            let metrics = evaluate(&data.test_labels, &predicted)?;
            let (mut scores, score_kind) = score_all(
                model.as_ref(),
                &format!("level2-{}", label),
                &[&data.test],
                !fallback_logged,
            )?;
            fallback_logged |= score_kind == ScoreKind::HardLabel;
            let test_scores = scores.pop().unwrap_or_default();

            records.push(Level2Record {
                seed: data.seed,
                classifier: label.to_string(),
                metrics,
                score_kind,
                test_scores,
            });
            pb.inc(1);
        }
        pb.finish_and_clear();

        let mean = records.iter().map(|r| r.metrics.accuracy).sum::<f64>() / records.len() as f64;
        info!("level2-{}: mean test2 accuracy {:.4}", label, mean);
        Ok((architecture, records))
    }
}

/// Architecture and curves of a meta-classifier that completed every seed
fn write_classifier(
    writer: &ArtifactWriter,
    label: &str,
    architecture: &dyn Classifier,
    records: &[Level2Record],
    meta: &[MetaDataset],
) -> Result<()> {
    writer.write(&artifacts::level2_architecture_name(label), &architecture.export())?;
    for (record, data) in records.iter().zip(meta) {
        if record.score_kind != ScoreKind::Probability {
            continue;
        }
        match curves(&data.test_labels, &record.test_scores) {
            Ok(c) => {
                writer.write_curves(&artifacts::curves_name(data.seed, "all", label), &c)?;
            }
            Err(e) => warn!("level2-{}: no curves for seed {}: {}", label, data.seed, e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FeatureSetKind;
    use crate::model::{ClassifierRegistry, SearchSpace};
    use crate::training::level1::Level1Trainer;
    use crate::training::test_support::fixture;
    use tempfile::TempDir;

    fn key(set: FeatureSetKind) -> OutputKey {
        OutputKey::new(set, "centroid")
    }

    fn config() -> StackingConfig {
        StackingConfig {
            classifiers: ClassifierRegistry::single("centroid", SearchSpace::centroid_only()),
            ..StackingConfig::quick_test()
        }
    }

    #[test]
    fn test_meta_dataset_shape_checks() {
        let selection = vec![key(FeatureSetKind::Sages), key(FeatureSetKind::Fingerprint)];
        let data = MetaDataset::new(
            0,
            selection.clone(),
            &[vec![0.1, 0.9, 0.2], vec![0.0, 1.0, 0.0]],
            &[vec![0.8], vec![1.0]],
            vec![0, 1, 0],
            vec![1],
        )
        .unwrap();
        assert_eq!(data.train.shape(), &[3, 2]);

        let mismatched = MetaDataset::new(
            0,
            selection,
            &[vec![0.1, 0.9, 0.2], vec![0.0, 1.0, 0.0]],
            &[vec![0.8], vec![1.0]],
            vec![0, 1],
            vec![1],
        );
        assert!(matches!(mismatched, Err(ToxError::DataIntegrity(_))));
    }

    #[test]
    fn test_missing_selection_is_integrity_error() {
        let (labels, store) = fixture();
        let config = config();
        let level1 = Level1Trainer::new(&config, &labels, &store).run().unwrap();
        let selection = vec![key(FeatureSetKind::TargetsAll)];
        assert!(matches!(
            MetaDataset::all_from_level1(&level1, &selection),
            Err(ToxError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_level2_uses_per_seed_labels() {
        let (labels, store) = fixture();
        let config = config();
        let level1 = Level1Trainer::new(&config, &labels, &store).run().unwrap();
        let selection = level1.best_per_feature_set();
        let meta = MetaDataset::all_from_level1(&level1, &selection).unwrap();

        assert_eq!(meta.len(), 3);
        for (data, seed_labels) in meta.iter().zip(&level1.labels) {
            assert_eq!(data.train_labels, seed_labels.train);
            assert_eq!(data.test_labels, seed_labels.test);
        }

        let output = Level2Trainer::new(&config).run(&meta).unwrap();
        assert_eq!(output.records.len(), 3);
        assert!(output.mean_accuracy("centroid").unwrap() > 0.9);
        assert!(output.architecture("centroid").is_some());
    }

    #[test]
    fn test_level2_from_written_files() {
        let (labels, store) = fixture();
        let dir = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        let config = config();
        let level1 = Level1Trainer::new(&config, &labels, &store)
            .with_writer(&writer)
            .run()
            .unwrap();
        let selection = vec![key(FeatureSetKind::Sages), key(FeatureSetKind::Fingerprint)];

        let in_memory = MetaDataset::all_from_level1(&level1, &selection).unwrap();
        let from_files =
            MetaDataset::load_level1_files(dir.path(), &selection, &[0, 1, 2]).unwrap();
        assert_eq!(from_files.len(), 3);
        assert_eq!(from_files[2].train, in_memory[2].train);
        assert_eq!(from_files[2].test_labels, in_memory[2].test_labels);

        Level2Trainer::new(&config)
            .with_writer(&writer)
            .run(&from_files)
            .unwrap();
        assert!(dir.path().join("1-level2_train.csv").exists());
        let summary = std::fs::read_to_string(dir.path().join(LEVEL2_SUMMARY)).unwrap();
        assert_eq!(summary.lines().count(), 4);
    }

    #[test]
    fn test_stacked_rows_align_with_seed_labels() {
        let (labels, store) = fixture();
        let config = config();
        let level1 = Level1Trainer::new(&config, &labels, &store).run().unwrap();
        let selection = vec![key(FeatureSetKind::Sages), key(FeatureSetKind::Fingerprint)];
        let meta = MetaDataset::all_from_level1(&level1, &selection).unwrap();

        // fp is the second column and its centroid calls reproduce the labels
        for data in &meta {
            let train: Vec<f64> = data.train_labels.iter().map(|&l| f64::from(l)).collect();
            let test: Vec<f64> = data.test_labels.iter().map(|&l| f64::from(l)).collect();
            assert_eq!(data.train.column(1).to_vec(), train);
            assert_eq!(data.test.column(1).to_vec(), test);
        }
    }

    #[test]
    fn test_unwritable_architecture_aborts_level2() {
        let (labels, store) = fixture();
        let config = config();
        let level1 = Level1Trainer::new(&config, &labels, &store).run().unwrap();
        let meta = MetaDataset::all_from_level1(&level1, &level1.best_per_feature_set()).unwrap();

        let dir = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        let blocked = dir.path().join(artifacts::level2_architecture_name("centroid"));
        std::fs::create_dir_all(blocked.join("occupied")).unwrap();

        let result = Level2Trainer::new(&config).with_writer(&writer).run(&meta);
        assert!(matches!(result, Err(ToxError::Io { .. })));
    }
}
