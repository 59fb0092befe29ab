//! Averages over resampling seeds and the average-of-level-1 baseline.

use crate::data::Matrix;
use crate::error::{Result, ToxError};
use crate::model::metrics::{curves, evaluate, Metrics};
use crate::model::ScoreKind;
use crate::training::artifacts::{self, ArtifactWriter, SummaryLog, LEVEL2_HEADER, LEVEL2_SUMMARY};
use crate::training::level2::{Level2Record, MetaDataset};
use csv::{ReaderBuilder, Trim};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

/// Label written for the average-of-level-1 baseline
pub const AVERAGE_LABEL: &str = "allaverage";

/// Layout of a summary log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryLevel {
    /// `seed, feature set, 6 metrics, classifier`
    Level1,
    /// `seed, 6 metrics, classifier`
    Level2,
}

impl FromStr for SummaryLevel {
    type Err = ToxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1" | "level1" => Ok(SummaryLevel::Level1),
            "2" | "level2" => Ok(SummaryLevel::Level2),
            other => Err(ToxError::config(format!("unknown summary level '{}'", other))),
        }
    }
}

/// One parsed summary row
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub seed: u64,
    /// Feature set for level-1 rows
    pub feature_set: Option<String>,
    pub classifier: String,
    pub metrics: Metrics,
}

impl SummaryRow {
    /// Averaging group: `set_classifier` at level 1, the classifier at level 2
    pub fn group(&self) -> String {
        match &self.feature_set {
            Some(set) => format!("{}_{}", set, self.classifier),
            None => self.classifier.clone(),
        }
    }
}

/// Level-1 summary line in column order
#[derive(Debug, Deserialize)]
struct Level1Line {
    seed: u64,
    feature_set: String,
    accuracy: f64,
    auroc: f64,
    f1: f64,
    precision: f64,
    recall: f64,
    mcc: f64,
    classifier: String,
}

/// Level-2 summary line in column order
#[derive(Debug, Deserialize)]
struct Level2Line {
    seed: u64,
    accuracy: f64,
    auroc: f64,
    f1: f64,
    precision: f64,
    recall: f64,
    mcc: f64,
    classifier: String,
}

impl From<Level1Line> for SummaryRow {
    fn from(l: Level1Line) -> Self {
        Self {
            seed: l.seed,
            feature_set: Some(l.feature_set),
            classifier: l.classifier,
            metrics: Metrics::from_values([
                l.accuracy,
                l.auroc,
                l.f1,
                l.precision,
                l.recall,
                l.mcc,
            ]),
        }
    }
}

impl From<Level2Line> for SummaryRow {
    fn from(l: Level2Line) -> Self {
        Self {
            seed: l.seed,
            feature_set: None,
            classifier: l.classifier,
            metrics: Metrics::from_values([
                l.accuracy,
                l.auroc,
                l.f1,
                l.precision,
                l.recall,
                l.mcc,
            ]),
        }
    }
}

/// Parse a summary log, skipping its header; columns are read by position
pub fn parse_summary(text: &str, level: SummaryLevel) -> Result<Vec<SummaryRow>> {
    let width = match level {
        SummaryLevel::Level1 => 9,
        SummaryLevel::Level2 => 8,
    };
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        if record.len() != width {
            return Err(ToxError::integrity(format!(
                "summary line {} has {} fields, expected {}",
                record.position().map_or(0, |p| p.line()),
                record.len(),
                width
            )));
        }
        rows.push(match level {
            SummaryLevel::Level1 => record.deserialize::<Level1Line>(None)?.into(),
            SummaryLevel::Level2 => record.deserialize::<Level2Line>(None)?.into(),
        });
    }
    Ok(rows)
}

/// Per-group mean of every metric
#[derive(Debug, Clone, PartialEq)]
pub struct AverageRow {
    pub group: String,
    /// Rows the mean was taken over
    pub count: usize,
    pub metrics: Metrics,
}

impl AverageRow {
    pub fn to_csv_line(&self) -> String {
        format!("{},{}", self.group, self.metrics.to_csv_fields())
    }
}

/// Mean per group, divided by the group's own row count; groups keep
/// first-seen order
pub fn average(rows: &[SummaryRow]) -> Vec<AverageRow> {
    let mut groups: Vec<(String, Vec<&Metrics>)> = Vec::new();
    for row in rows {
        let group = row.group();
        match groups.iter_mut().find(|(g, _)| *g == group) {
            Some((_, members)) => members.push(&row.metrics),
            None => groups.push((group, vec![&row.metrics])),
        }
    }

    groups
        .into_iter()
        .map(|(group, members)| {
            let mut sums = [0.0; 6];
            for m in &members {
                for (s, v) in sums.iter_mut().zip(m.values()) {
                    *s += v;
                }
            }
            let n = members.len() as f64;
            AverageRow {
                group,
                count: members.len(),
                metrics: Metrics::from_values(sums.map(|s| s / n)),
            }
        })
        .collect()
}

/// Average a summary file into `output`, one line per group, no header
pub fn average_file(input: &Path, output: &Path, level: SummaryLevel) -> Result<Vec<AverageRow>> {
    let text = fs::read_to_string(input).map_err(|e| ToxError::io(input, e))?;
    let averages = average(&parse_summary(&text, level)?);

    let mut contents = String::new();
    for row in &averages {
        contents.push_str(&row.to_csv_line());
        contents.push('\n');
    }
    fs::write(output, contents).map_err(|e| ToxError::io(output, e))?;
    info!("Wrote {} averaged groups to {:?}", averages.len(), output);
    Ok(averages)
}

/// Best classifier per feature set by mean level-1 accuracy, as
/// `feature_set-classifier`
pub fn best_per_feature_set(rows: &[SummaryRow]) -> Vec<String> {
    let mut best: Vec<(String, String, f64)> = Vec::new();
    let averages = average(rows);
    for row in rows {
        let Some(set) = &row.feature_set else {
            continue;
        };
        let group = row.group();
        let Some(average) = averages.iter().find(|a| a.group == group) else {
            continue;
        };
        let acc = average.metrics.accuracy;
        match best.iter_mut().find(|(s, _, _)| s == set) {
            Some(entry) if acc > entry.2 => *entry = (set.clone(), row.classifier.clone(), acc),
            Some(_) => {}
            None => best.push((set.clone(), row.classifier.clone(), acc)),
        }
    }
    best.into_iter().map(|(s, c, _)| format!("{}-{}", s, c)).collect()
}

/// Which side of the threshold counts as positive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdPolarity {
    /// Mean score above the threshold is positive
    #[default]
    AboveIsPositive,
    /// Mean score at or below the threshold is positive; for columns that
    /// hold the negative-class probability
    AtOrBelowIsPositive,
}

/// Baseline that thresholds the row mean of the level-1 scores
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AveragePredictor {
    pub threshold: f64,
    pub polarity: ThresholdPolarity,
}

impl Default for AveragePredictor {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            polarity: ThresholdPolarity::AboveIsPositive,
        }
    }
}

impl AveragePredictor {
    pub fn new(threshold: f64, polarity: ThresholdPolarity) -> Self {
        Self { threshold, polarity }
    }

    /// Row means of a stacked matrix
    pub fn mean_scores(&self, x: &Matrix) -> Vec<f64> {
        x.rows()
            .into_iter()
            .map(|r| if r.is_empty() { 0.0 } else { r.sum() / r.len() as f64 })
            .collect()
    }

    pub fn predict(&self, means: &[f64]) -> Vec<u8> {
        means
            .iter()
            .map(|&m| match self.polarity {
                ThresholdPolarity::AboveIsPositive => u8::from(m > self.threshold),
                ThresholdPolarity::AtOrBelowIsPositive => u8::from(m <= self.threshold),
            })
            .collect()
    }

    /// Score oriented so that higher means more likely positive
    fn oriented(&self, means: &[f64]) -> Vec<f64> {
        match self.polarity {
            ThresholdPolarity::AboveIsPositive => means.to_vec(),
            ThresholdPolarity::AtOrBelowIsPositive => means.iter().map(|m| 1.0 - m).collect(),
        }
    }

    /// Evaluate the baseline on the test2 rows of one seed
    pub fn evaluate(&self, data: &MetaDataset) -> Result<Level2Record> {
        let means = self.mean_scores(&data.test);
        let metrics = evaluate(&data.test_labels, &self.predict(&means))?;
        Ok(Level2Record {
            seed: data.seed,
            classifier: AVERAGE_LABEL.to_string(),
            metrics,
            score_kind: ScoreKind::Probability,
            test_scores: self.oriented(&means),
        })
    }

    /// Evaluate every seed, writing its summary and curves when a writer is
    /// present
    pub fn run(
        &self,
        meta: &[MetaDataset],
        writer: Option<&ArtifactWriter>,
    ) -> Result<Vec<Level2Record>> {
        let mut summary = SummaryLog::new(
            format!("{}_{}", AVERAGE_LABEL, LEVEL2_SUMMARY),
            LEVEL2_HEADER,
        );
        let mut records = Vec::with_capacity(meta.len());
        for data in meta {
            let record = self.evaluate(data)?;
            summary.push(format!(
                "{},{},{}",
                record.seed,
                record.metrics.to_csv_fields(),
                AVERAGE_LABEL
            ));
            if let Some(writer) = writer {
                match curves(&data.test_labels, &record.test_scores) {
                    Ok(c) => {
                        let name = artifacts::curves_name(data.seed, "all", "average");
                        writer.write_curves(&name, &c)?;
                    }
                    Err(e) => warn!("average baseline: no curves for seed {}: {}", data.seed, e),
                }
            }
            records.push(record);
        }
        summary.flush(writer)?;

        let total: f64 = records.iter().map(|r| r.metrics.accuracy).sum();
        let mean = total / records.len().max(1) as f64;
        info!("Average-of-level-1 baseline: mean test2 accuracy {:.4}", mean);
        Ok(records)
    }
}
