use crate::data::loader::LabelTable;
use crate::data::{CohortSplit, FeatureDataset, FeatureSetKind, FeatureStore, Matrix};
use crate::error::{Result, ToxError};
use crate::utils::random::seeded_rng;
use ndarray::Axis;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

/// Slack added before flooring so that e.g. `100 * (1 - 0.8) / 2` lands on 10
const FLOOR_TOLERANCE: f64 = 1e-9;

fn floor_count(value: f64) -> usize {
    (value + FLOOR_TOLERANCE).floor().max(0.0) as usize
}

/// Per-column min/max taken from a training matrix
#[derive(Debug, Clone, PartialEq)]
pub struct NormStats {
    pub mins: Vec<f64>,
    pub maxs: Vec<f64>,
}

impl NormStats {
    /// Compute statistics from the training matrix
    pub fn fit(train: &Matrix) -> Self {
        let mut mins = vec![f64::INFINITY; train.ncols()];
        let mut maxs = vec![f64::NEG_INFINITY; train.ncols()];

        for row in train.axis_iter(Axis(0)) {
            for (j, &value) in row.iter().enumerate() {
                if value.is_nan() {
                    continue;
                }
                mins[j] = mins[j].min(value);
                maxs[j] = maxs[j].max(value);
            }
        }

        Self { mins, maxs }
    }

    /// Number of columns the statistics cover
    pub fn width(&self) -> usize {
        self.mins.len()
    }

    /// Min-max scale `matrix`; every non-finite result becomes 0
    pub fn transform(&self, matrix: &Matrix) -> Result<Matrix> {
        if matrix.ncols() != self.width() {
            return Err(ToxError::integrity(format!(
                "cannot normalize {} columns with statistics fitted on {}",
                matrix.ncols(),
                self.width()
            )));
        }

        let mut out = matrix.clone();
        for (j, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (min, max) = (self.mins[j], self.maxs[j]);
            column.mapv_inplace(|x| {
                let scaled = (x - min) / (max - min);
                if scaled.is_finite() {
                    scaled
                } else {
                    0.0
                }
            });
        }
        Ok(out)
    }
}

/// Draw the balanced train/test1/test2 cohorts for one seed
///
/// Both pools are shuffled from a single seeded stream, positives first.
/// Train takes `floor(min(|pos|, |neg|) * p)` drugs from each pool and each
/// test cohort takes `floor(min(|pos|, |neg|) * (1 - p) / 2)`; whatever is
/// left in the larger pool is dropped.
pub fn split_cohort(
    labels: &LabelTable,
    endpoint: usize,
    seed: u64,
    train_fraction: f64,
) -> Result<CohortSplit> {
    if !(train_fraction > 0.0 && train_fraction < 1.0) {
        return Err(ToxError::config(format!(
            "train fraction must be in (0, 1), got {}",
            train_fraction
        )));
    }

    let (mut positive, mut negative) = labels.pools(endpoint)?;
    if positive.is_empty() || negative.is_empty() {
        return Err(ToxError::integrity(format!(
            "endpoint {} has an empty class pool (positive={}, negative={})",
            endpoint,
            positive.len(),
            negative.len()
        )));
    }

    let pool = positive.len().min(negative.len());
    let smaller = pool as f64;
    let train_size = floor_count(smaller * train_fraction).min(pool);
    let test_size =
        floor_count(smaller * (1.0 - train_fraction) / 2.0).min((pool - train_size) / 2);
    if train_size == 0 || test_size == 0 {
        return Err(ToxError::integrity(format!(
            "cohort too small for train fraction {}: train={} test={} per class",
            train_fraction, train_size, test_size
        )));
    }

    let mut rng = seeded_rng(seed);
    positive.shuffle(&mut rng);
    negative.shuffle(&mut rng);

    let used = train_size + 2 * test_size;
    let dropped = positive.len() + negative.len() - 2 * used;
    if dropped > 0 {
        debug!("Seed {}: {} drugs beyond the balanced cohort are unused", seed, dropped);
    }

    let take = |start: usize, len: usize| -> (Vec<String>, Vec<u8>) {
        let mut ids = positive[start..start + len].to_vec();
        ids.extend_from_slice(&negative[start..start + len]);
        let mut labels = vec![1u8; len];
        labels.extend(std::iter::repeat(0u8).take(len));
        (ids, labels)
    };

    let (train, train_labels) = take(0, train_size);
    let (test1, test1_labels) = take(train_size, test_size);
    let (test2, test2_labels) = take(train_size + test_size, test_size);

    debug!(
        "Seed {} split: train={}, test1={}, test2={}",
        seed,
        train.len(),
        test1.len(),
        test2.len()
    );

    Ok(CohortSplit {
        seed,
        train,
        test1,
        test2,
        train_labels,
        test1_labels,
        test2_labels,
    })
}

/// Load one feature set for a split, normalized by its training rows
pub fn normalize_feature_set(
    store: &FeatureStore,
    kind: FeatureSetKind,
    split: &CohortSplit,
) -> Result<FeatureDataset> {
    let train = store.matrix(kind, &split.train)?;
    let stats = NormStats::fit(&train);

    Ok(FeatureDataset {
        kind,
        train: stats.transform(&train)?,
        test1: stats.transform(&store.matrix(kind, &split.test1)?)?,
        test2: stats.transform(&store.matrix(kind, &split.test2)?)?,
    })
}

/// Log a warning when the two label pools differ a lot in size
pub fn report_imbalance(labels: &LabelTable, endpoint: usize) -> Result<()> {
    let (positive, negative) = labels.pools(endpoint)?;
    let (small, large) = if positive.len() < negative.len() {
        (positive.len(), negative.len())
    } else {
        (negative.len(), positive.len())
    };
    if small > 0 && large > 2 * small {
        warn!(
            "Endpoint {} is imbalanced (positive={}, negative={}); excess majority drugs are unused",
            endpoint,
            positive.len(),
            negative.len()
        );
    }
    Ok(())
}
