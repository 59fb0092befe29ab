//! Feature-selection reports for the level-1 feature sets.
//!
//! Nothing here feeds back into training; the masks and rankings are
//! written out for inspection.

use crate::data::loader::LabelTable;
use crate::data::preprocessing::{normalize_feature_set, split_cohort};
use crate::data::{FeatureSetKind, FeatureStore, Matrix};
use crate::error::{Result, ToxError};
use crate::model::logistic::{LogisticModel, LogisticParams};
use crate::model::{check_training_data, Architecture, GridSearch, SearchSpace};
use crate::training::artifacts::{join, ArtifactWriter};
use crate::training::StackingConfig;
use ndarray::Axis;
use tracing::{debug, info};

/// Feature sets the report is produced for
pub const REPORTED_SETS: [FeatureSetKind; 3] = [
    FeatureSetKind::Sages,
    FeatureSetKind::TargetsAll,
    FeatureSetKind::DrugFeatures,
];

/// Output of one selector
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Kept columns
    Mask(Vec<bool>),
    /// 1 for kept columns, larger for columns eliminated earlier
    Ranking(Vec<usize>),
}

impl Selection {
    pub fn to_line(&self) -> String {
        match self {
            Selection::Mask(mask) => join(mask),
            Selection::Ranking(ranks) => join(ranks),
        }
    }
}

pub trait FeatureSelector {
    /// Suffix of the report file, e.g. `variancefs`
    fn suffix(&self) -> &'static str;

    fn select(&self, x: &Matrix, y: &[u8]) -> Result<Selection>;
}

/// Keeps columns whose variance exceeds `threshold`
#[derive(Debug, Clone, Default)]
pub struct VarianceThreshold {
    pub threshold: f64,
}

impl FeatureSelector for VarianceThreshold {
    fn suffix(&self) -> &'static str {
        "variancefs"
    }

    fn select(&self, x: &Matrix, _y: &[u8]) -> Result<Selection> {
        if x.nrows() == 0 {
            return Err(ToxError::integrity("variance of an empty matrix"));
        }
        Ok(Selection::Mask(
            x.var_axis(Axis(0), 0.0)
                .iter()
                .map(|&v| v > self.threshold)
                .collect(),
        ))
    }
}

/// Chi-squared statistic of every non-negative column against binary labels
pub fn chi2_scores(x: &Matrix, y: &[u8]) -> Result<Vec<f64>> {
    check_training_data(x, y)?;
    if x.iter().any(|&v| v < 0.0) {
        return Err(ToxError::integrity("chi-squared needs non-negative features"));
    }
    let n = y.len() as f64;
    let n_pos = y.iter().filter(|&&l| l == 1).count() as f64;
    let class_share = [(n - n_pos) / n, n_pos / n];

    Ok(x.axis_iter(Axis(1))
        .map(|col| {
            let mut observed = [0.0; 2];
            for (&v, &label) in col.iter().zip(y) {
                observed[usize::from(label == 1)] += v;
            }
            let total = observed[0] + observed[1];
            observed
                .iter()
                .zip(class_share)
                .map(|(&o, share)| {
                    let expected = share * total;
                    if expected > 0.0 {
                        (o - expected).powi(2) / expected
                    } else {
                        0.0
                    }
                })
                .sum()
        })
        .collect())
}

/// Keeps the `k` columns with the highest chi-squared statistic; `k`
/// defaults to a quarter of the columns
#[derive(Debug, Clone, Default)]
pub struct Chi2KBest {
    pub k: Option<usize>,
}

impl FeatureSelector for Chi2KBest {
    fn suffix(&self) -> &'static str {
        "genericunifs"
    }

    fn select(&self, x: &Matrix, y: &[u8]) -> Result<Selection> {
        let scores = chi2_scores(x, y)?;
        let k = self.k.unwrap_or(x.ncols() / 4).min(x.ncols());

        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
        let mut mask = vec![false; scores.len()];
        for &i in order.iter().take(k) {
            mask[i] = true;
        }
        Ok(Selection::Mask(mask))
    }
}

/// Recursive elimination by logistic-regression weight magnitude; the kept
/// column count is the one with the best cross-validated accuracy
#[derive(Debug, Clone)]
pub struct RecursiveElimination {
    pub ranker: LogisticParams,
    pub folds: usize,
    pub seed: u64,
}

impl Default for RecursiveElimination {
    fn default() -> Self {
        Self {
            ranker: LogisticParams::default(),
            folds: 5,
            seed: 0,
        }
    }
}

impl RecursiveElimination {
    /// Columns in elimination order, the most important last
    fn elimination_order(&self, x: &Matrix, y: &[u8]) -> Vec<usize> {
        let mut remaining: Vec<usize> = (0..x.ncols()).collect();
        let mut eliminated = Vec::with_capacity(x.ncols());
        while remaining.len() > 1 {
            let model = LogisticModel::fit(&self.ranker, &x.select(Axis(1), &remaining), y);
            let weakest = model
                .weights()
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
                .map(|(i, _)| i)
                .unwrap_or(0);
            eliminated.push(remaining.remove(weakest));
        }
        eliminated.extend(remaining);
        eliminated
    }
}

impl FeatureSelector for RecursiveElimination {
    fn suffix(&self) -> &'static str {
        "fs"
    }

    fn select(&self, x: &Matrix, y: &[u8]) -> Result<Selection> {
        check_training_data(x, y)?;
        if x.ncols() == 0 {
            return Err(ToxError::integrity("no columns to rank"));
        }
        let order = self.elimination_order(x, y);
        let cv = GridSearch::new(SearchSpace::default())
            .with_folds(self.folds)
            .with_seed(self.seed);
        let candidate = Architecture::LogisticRegression(self.ranker.clone());

        // Smallest column count wins ties
        let mut best = (f64::NEG_INFINITY, order.len());
        for keep in 1..=order.len() {
            let columns = &order[order.len() - keep..];
            let score = cv.cross_validate(&candidate, &x.select(Axis(1), columns), y)?;
            if score > best.0 {
                best = (score, keep);
            }
        }
        debug!("Recursive elimination keeps {} of {} columns", best.1, order.len());

        let eliminated = order.len() - best.1;
        let mut ranks = vec![1; order.len()];
        for (step, &col) in order.iter().take(eliminated).enumerate() {
            ranks[col] = eliminated - step + 1;
        }
        Ok(Selection::Ranking(ranks))
    }
}

/// Run every selector over every seed and append one line per seed to
/// `<set>_<suffix>.csv`
pub fn run_feature_selection(
    config: &StackingConfig,
    labels: &LabelTable,
    store: &FeatureStore,
    writer: &ArtifactWriter,
) -> Result<usize> {
    let kinds: Vec<FeatureSetKind> = REPORTED_SETS
        .into_iter()
        .filter(|k| store.kinds().contains(k))
        .collect();
    let mut written = 0;

    for seed in config.seeds() {
        let split = split_cohort(labels, config.endpoint, seed, config.train_fraction)?;
        let selectors: [Box<dyn FeatureSelector>; 3] = [
            Box::new(VarianceThreshold::default()),
            Box::new(Chi2KBest::default()),
            Box::new(RecursiveElimination {
                folds: config.cv_folds,
                seed,
                ..Default::default()
            }),
        ];

        for &kind in &kinds {
            let data = normalize_feature_set(store, kind, &split)?;
            for selector in &selectors {
                let selection = selector.select(&data.train, &split.train_labels)?;
                let name = format!("{}_{}.csv", kind, selector.suffix());
                writer.append_line(&name, &selection.to_line())?;
                written += 1;
            }
        }
        info!("Feature selection done for seed {}", seed);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_variance_threshold() {
        let x = array![[0.0, 1.0, 0.5], [1.0, 1.0, 0.5], [0.5, 1.0, 0.6]];
        let selection = VarianceThreshold::default().select(&x, &[0, 1, 0]).unwrap();
        assert_eq!(selection, Selection::Mask(vec![true, false, true]));
        assert_eq!(selection.to_line(), "true,false,true");
    }

    #[test]
    fn test_chi2_prefers_label_tracking_column() {
        let x = array![
            [1.0, 0.5, 0.2, 0.3],
            [1.0, 0.5, 0.3, 0.3],
            [0.0, 0.5, 0.2, 0.3],
            [0.0, 0.5, 0.3, 0.3]
        ];
        let y = [1, 1, 0, 0];
        let scores = chi2_scores(&x, &y).unwrap();
        assert!((scores[0] - 2.0).abs() < 1e-12);
        assert_eq!(scores[1], 0.0);

        let selection = Chi2KBest::default().select(&x, &y).unwrap();
        assert_eq!(selection, Selection::Mask(vec![true, false, false, false]));
    }

    #[test]
    fn test_chi2_rejects_negative_values() {
        let x = array![[-1.0], [1.0]];
        assert!(chi2_scores(&x, &[0, 1]).is_err());
    }

    #[test]
    fn test_recursive_elimination_ranks_informative_column_first() {
        let n = 20;
        let x = Matrix::from_shape_fn((n, 3), |(i, j)| match j {
            0 => f64::from(u8::from(i % 2 == 0)),
            1 => ((i * 7) % 5) as f64 / 4.0,
            _ => ((i * 3) % 4) as f64 / 3.0,
        });
        let y: Vec<u8> = (0..n).map(|i| u8::from(i % 2 == 0)).collect();

        let selection = RecursiveElimination::default().select(&x, &y).unwrap();
        let Selection::Ranking(ranks) = selection else {
            panic!("expected a ranking");
        };
        assert_eq!(ranks.len(), 3);
        assert_eq!(ranks[0], 1);
        assert!(ranks.iter().all(|&r| (1..=3).contains(&r)));
    }

    #[test]
    fn test_run_appends_one_line_per_seed() {
        use crate::training::test_support::fixture;

        let (labels, mut store) = fixture();
        let mut table = crate::data::loader::FeatureTable::default();
        for i in 0..60 {
            let row = vec![(i % 4) as f64, f64::from(u8::from(i % 2 == 0))];
            table.insert(&format!("D{}", i), row);
        }
        store.insert(FeatureSetKind::DrugFeatures, table);

        let dir = tempfile::TempDir::new().unwrap();
        let writer = ArtifactWriter::new(dir.path()).unwrap();
        let config = StackingConfig::quick_test();
        let written = run_feature_selection(&config, &labels, &store, &writer).unwrap();

        // sages and drug_features; fp is not reported
        assert_eq!(written, 3 * 2 * 3);
        let text = std::fs::read_to_string(dir.path().join("sages_variancefs.csv")).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(!dir.path().join("fp_fs.csv").exists());
    }
}
