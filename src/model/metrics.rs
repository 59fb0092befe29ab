use crate::error::{Result, ToxError};
use serde::{Deserialize, Serialize};

/// The six reported classification metrics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub accuracy: f64,
    pub auroc: f64,
    pub f1: f64,
    pub precision: f64,
    pub recall: f64,
    pub mcc: f64,
}

impl Metrics {
    /// Column names in CSV order
    pub const NAMES: [&'static str; 6] = ["Accuracy", "AUROC", "F1", "Precision", "Recall", "MCC"];

    /// Values in CSV order
    pub fn values(&self) -> [f64; 6] {
        [
            self.accuracy,
            self.auroc,
            self.f1,
            self.precision,
            self.recall,
            self.mcc,
        ]
    }

    /// Build from values in CSV order
    pub fn from_values(v: [f64; 6]) -> Self {
        Self {
            accuracy: v[0],
            auroc: v[1],
            f1: v[2],
            precision: v[3],
            recall: v[4],
            mcc: v[5],
        }
    }

    /// Comma-joined values in CSV order
    pub fn to_csv_fields(&self) -> String {
        self.values()
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Binary confusion counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Confusion {
    pub tp: usize,
    pub fp: usize,
    pub tn: usize,
    pub fn_: usize,
}

impl Confusion {
    pub fn from_labels(actual: &[u8], predicted: &[u8]) -> Self {
        let mut c = Self::default();
        for (&a, &p) in actual.iter().zip(predicted) {
            match (a == 1, p == 1) {
                (true, true) => c.tp += 1,
                (false, true) => c.fp += 1,
                (false, false) => c.tn += 1,
                (true, false) => c.fn_ += 1,
            }
        }
        c
    }

    fn ratio(num: usize, denom: usize) -> f64 {
        if denom == 0 {
            0.0
        } else {
            num as f64 / denom as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        Self::ratio(self.tp + self.tn, self.tp + self.tn + self.fp + self.fn_)
    }

    pub fn precision(&self) -> f64 {
        Self::ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> f64 {
        Self::ratio(self.tp, self.tp + self.fn_)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    /// Matthews correlation; 0 when any marginal is empty
    pub fn mcc(&self) -> f64 {
        let (tp, fp, tn, fn_) = (
            self.tp as f64,
            self.fp as f64,
            self.tn as f64,
            self.fn_ as f64,
        );
        let denom = ((tp + fp) * (tp + fn_) * (tn + fp) * (tn + fn_)).sqrt();
        if denom == 0.0 {
            0.0
        } else {
            (tp * tn - fp * fn_) / denom
        }
    }
}

fn check_inputs(actual: &[u8], n_predicted: usize) -> Result<()> {
    if actual.is_empty() {
        return Err(ToxError::integrity("cannot evaluate empty label vectors"));
    }
    if actual.len() != n_predicted {
        return Err(ToxError::integrity(format!(
            "{} true labels but {} predictions",
            actual.len(),
            n_predicted
        )));
    }
    Ok(())
}

fn class_counts(actual: &[u8]) -> Result<(usize, usize)> {
    let pos = actual.iter().filter(|&&a| a == 1).count();
    let neg = actual.len() - pos;
    if pos == 0 || neg == 0 {
        return Err(ToxError::MetricUndefined(format!(
            "AUROC needs both classes in the true labels (positive={}, negative={})",
            pos, neg
        )));
    }
    Ok((pos, neg))
}

/// Area under the ROC curve of `scores`, via average ranks
pub fn roc_auc(actual: &[u8], scores: &[f64]) -> Result<f64> {
    check_inputs(actual, scores.len())?;
    let (pos, neg) = class_counts(actual)?;

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // Ranks are 1-based; tied scores share the mean rank
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if actual[idx] == 1 {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }

    let pos_f = pos as f64;
    Ok((rank_sum_pos - pos_f * (pos_f + 1.0) / 2.0) / (pos_f * neg as f64))
}

/// Evaluate hard predictions against the true labels
pub fn evaluate(actual: &[u8], predicted: &[u8]) -> Result<Metrics> {
    check_inputs(actual, predicted.len())?;
    let scores: Vec<f64> = predicted.iter().map(|&p| f64::from(p)).collect();
    let auroc = roc_auc(actual, &scores)?;
    let c = Confusion::from_labels(actual, predicted);

    Ok(Metrics {
        accuracy: c.accuracy(),
        auroc,
        f1: c.f1(),
        precision: c.precision(),
        recall: c.recall(),
        mcc: c.mcc(),
    })
}

/// ROC and precision-recall curves of one scored cohort
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Curves {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
}

impl Curves {
    /// Four lines: false-positive rate, true-positive rate, precision, recall
    pub fn to_csv(&self) -> String {
        [&self.fpr, &self.tpr, &self.precision, &self.recall]
            .iter()
            .map(|line| {
                line.iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// `(threshold, tp, fp)` at every distinct score, highest threshold first
fn cumulative_counts(actual: &[u8], scores: &[f64]) -> Vec<(f64, usize, usize)> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut out = Vec::new();
    let (mut tp, mut fp) = (0, 0);
    for (k, &idx) in order.iter().enumerate() {
        if actual[idx] == 1 {
            tp += 1;
        } else {
            fp += 1;
        }
        let last_of_tie = k + 1 == order.len() || scores[order[k + 1]] != scores[idx];
        if last_of_tie {
            out.push((scores[idx], tp, fp));
        }
    }
    out
}

/// Thresholds whose ROC point is a corner of the curve; points inside a
/// straight run are dropped, the first and last are always kept
fn roc_corners(counts: &[(f64, usize, usize)]) -> Vec<(f64, usize, usize)> {
    let bend = |a: usize, b: usize, c: usize| a as i64 - 2 * b as i64 + c as i64 != 0;
    counts
        .iter()
        .enumerate()
        .filter(|&(i, _)| {
            i == 0
                || i + 1 == counts.len()
                || bend(counts[i - 1].1, counts[i].1, counts[i + 1].1)
                || bend(counts[i - 1].2, counts[i].2, counts[i + 1].2)
        })
        .map(|(_, c)| *c)
        .collect()
}

/// ROC and precision-recall curves for positive-class scores; collinear
/// ROC points are dropped, the precision-recall curve keeps every threshold
pub fn curves(actual: &[u8], scores: &[f64]) -> Result<Curves> {
    check_inputs(actual, scores.len())?;
    let (pos, neg) = class_counts(actual)?;
    let counts = cumulative_counts(actual, scores);

    let mut fpr = vec![0.0];
    let mut tpr = vec![0.0];
    for &(_, tp, fp) in &roc_corners(&counts) {
        fpr.push(fp as f64 / neg as f64);
        tpr.push(tp as f64 / pos as f64);
    }

    // Precision-recall stops once full recall is reached and runs from the
    // lowest threshold up, ending at (recall 0, precision 1)
    let mut precision = Vec::new();
    let mut recall = Vec::new();
    for &(_, tp, fp) in &counts {
        precision.push(tp as f64 / (tp + fp) as f64);
        recall.push(tp as f64 / pos as f64);
        if tp == pos {
            break;
        }
    }
    precision.reverse();
    recall.reverse();
    precision.push(1.0);
    recall.push(0.0);

    Ok(Curves {
        fpr,
        tpr,
        precision,
        recall,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_metrics() {
        let actual = [1, 0, 0, 0, 1];
        let predicted = [1, 0, 1, 0, 1];
        let m = evaluate(&actual, &predicted).unwrap();

        assert_relative_eq!(m.accuracy, 0.8);
        assert_relative_eq!(m.precision, 2.0 / 3.0);
        assert_relative_eq!(m.recall, 1.0);
        assert_relative_eq!(m.f1, 0.8, epsilon = 1e-12);
        // tpr = 1, fpr = 1/3
        assert_relative_eq!(m.auroc, (1.0 + 2.0 / 3.0) / 2.0, epsilon = 1e-12);
        // (2*2 - 1*0) / sqrt(3*2*3*2)
        assert_relative_eq!(m.mcc, 4.0 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_evaluate_is_deterministic_and_bounded() {
        let actual = [1, 1, 0, 0, 1, 0, 1, 0];
        let predicted = [0, 1, 1, 0, 0, 0, 1, 1];
        let a = evaluate(&actual, &predicted).unwrap();
        let b = evaluate(&actual, &predicted).unwrap();
        assert_eq!(a, b);

        for v in [a.accuracy, a.precision, a.recall, a.f1, a.auroc] {
            assert!((0.0..=1.0).contains(&v));
        }
        assert!((-1.0..=1.0).contains(&a.mcc));
    }

    #[test]
    fn test_perfectly_wrong_predictor() {
        let m = evaluate(&[1, 0, 1, 0], &[0, 1, 0, 1]).unwrap();
        assert_eq!(m.accuracy, 0.0);
        assert_eq!(m.auroc, 0.0);
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.f1, 0.0);
        assert_relative_eq!(m.mcc, -1.0);
    }

    #[test]
    fn test_single_class_auroc_is_undefined() {
        assert!(matches!(
            evaluate(&[1, 1, 1], &[1, 0, 1]),
            Err(ToxError::MetricUndefined(_))
        ));
    }

    #[test]
    fn test_length_mismatch() {
        assert!(matches!(
            evaluate(&[1, 0], &[1]),
            Err(ToxError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_roc_auc_with_scores() {
        let actual = [0, 0, 1, 1];
        let scores = [0.1, 0.4, 0.35, 0.8];
        assert_relative_eq!(roc_auc(&actual, &scores).unwrap(), 0.75);
    }

    #[test]
    fn test_curves() {
        let actual = [0, 0, 1, 1];
        let scores = [0.1, 0.4, 0.35, 0.8];
        let c = curves(&actual, &scores).unwrap();

        assert_eq!(c.fpr, vec![0.0, 0.0, 0.5, 0.5, 1.0]);
        assert_eq!(c.tpr, vec![0.0, 0.5, 0.5, 1.0, 1.0]);
        assert_eq!(c.recall, vec![1.0, 0.5, 0.5, 0.0]);
        assert_eq!(c.precision, vec![2.0 / 3.0, 0.5, 1.0, 1.0]);

        let csv = c.to_csv();
        assert_eq!(csv.lines().count(), 4);
        assert!(csv.starts_with("0,0,0.5,0.5,1"));
    }

    #[test]
    fn test_curves_drop_collinear_roc_points() {
        let actual = [1, 1, 1, 0];
        let scores = [0.9, 0.8, 0.7, 0.1];
        let c = curves(&actual, &scores).unwrap();

        assert_eq!(c.fpr, vec![0.0, 0.0, 0.0, 1.0]);
        assert_eq!(c.tpr, vec![0.0, 1.0 / 3.0, 1.0, 1.0]);
        // every threshold stays on the precision-recall curve
        assert_eq!(c.recall.len(), 4);
        assert_eq!(c.precision.len(), 4);
    }
}
