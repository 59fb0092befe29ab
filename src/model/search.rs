//! Model search: pick an architecture and its hyperparameters from
//! training data.
//!
//! [`ModelSearch`] is the seam an external AutoML engine plugs into. The
//! built-in [`GridSearch`] scores every candidate in a [`SearchSpace`] by
//! stratified k-fold cross-validated accuracy.

use crate::data::Matrix;
use crate::error::{Result, ToxError};
use crate::model::knn::KnnParams;
use crate::model::logistic::LogisticParams;
use crate::model::{check_training_data, Architecture, Classifier};
use crate::utils::random::seeded_rng;
use ndarray::Axis;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Selects a classifier architecture for a training matrix
pub trait ModelSearch {
    fn search(&self, x: &Matrix, y: &[u8]) -> Result<Box<dyn Classifier>>;
}

/// Logistic-regression grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticGrid {
    pub learning_rates: Vec<f64>,
    pub l2: Vec<f64>,
    pub epochs: usize,
}

impl Default for LogisticGrid {
    fn default() -> Self {
        Self {
            learning_rates: vec![0.1, 0.5, 1.0],
            l2: vec![1e-4, 1e-2],
            epochs: 300,
        }
    }
}

/// Candidate architectures for one registry entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSpace {
    pub logistic: Option<LogisticGrid>,
    pub knn_k: Vec<usize>,
    pub nearest_centroid: bool,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            logistic: Some(LogisticGrid::default()),
            knn_k: vec![3, 5, 9],
            nearest_centroid: false,
        }
    }
}

impl SearchSpace {
    /// Space holding only the nearest-centroid classifier
    pub fn centroid_only() -> Self {
        Self {
            logistic: None,
            knn_k: Vec::new(),
            nearest_centroid: true,
        }
    }

    /// Every architecture in the space, in a fixed order
    pub fn candidates(&self) -> Vec<Architecture> {
        let mut out = Vec::new();
        if let Some(grid) = &self.logistic {
            for &learning_rate in &grid.learning_rates {
                for &l2 in &grid.l2 {
                    out.push(Architecture::LogisticRegression(LogisticParams {
                        learning_rate,
                        l2,
                        epochs: grid.epochs,
                    }));
                }
            }
        }
        for &k in &self.knn_k {
            out.push(Architecture::KNearestNeighbors(KnnParams { k }));
        }
        if self.nearest_centroid {
            out.push(Architecture::NearestCentroid);
        }
        out
    }
}

/// Exhaustive grid search scored by cross-validated accuracy
#[derive(Debug, Clone)]
pub struct GridSearch {
    space: SearchSpace,
    folds: usize,
    seed: u64,
}

impl GridSearch {
    pub fn new(space: SearchSpace) -> Self {
        Self {
            space,
            folds: 5,
            seed: 0,
        }
    }

    pub fn with_folds(mut self, folds: usize) -> Self {
        self.folds = folds;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Fold index per row; each class is dealt round-robin after a shuffle
    fn assign_folds(&self, y: &[u8], folds: usize) -> Vec<usize> {
        let mut rng = seeded_rng(self.seed);
        let mut assignment = vec![0; y.len()];
        for class in [1u8, 0u8] {
            let mut rows: Vec<usize> = (0..y.len()).filter(|&i| y[i] == class).collect();
            rows.shuffle(&mut rng);
            for (k, row) in rows.into_iter().enumerate() {
                assignment[row] = k % folds;
            }
        }
        assignment
    }

    /// Mean held-out accuracy of one candidate
    pub fn cross_validate(&self, candidate: &Architecture, x: &Matrix, y: &[u8]) -> Result<f64> {
        check_training_data(x, y)?;
        let folds = self.folds.min(x.nrows());
        if folds < 2 {
            return Err(ToxError::integrity(format!(
                "cross-validation needs at least 2 rows, got {}",
                x.nrows()
            )));
        }
        let assignment = self.assign_folds(y, folds);

        let mut total = 0.0;
        let mut used = 0;
        for fold in 0..folds {
            let (held, kept): (Vec<usize>, Vec<usize>) =
                (0..y.len()).partition(|&i| assignment[i] == fold);
            if held.is_empty() || kept.is_empty() {
                continue;
            }

            let kept_y: Vec<u8> = kept.iter().map(|&i| y[i]).collect();
            let held_y: Vec<u8> = held.iter().map(|&i| y[i]).collect();
            let model = candidate.fit(&x.select(Axis(0), &kept), &kept_y)?;
            let predicted = model.predict(&x.select(Axis(0), &held))?;

            let correct = predicted.iter().zip(&held_y).filter(|(p, a)| p == a).count();
            total += correct as f64 / held_y.len() as f64;
            used += 1;
        }

        if used == 0 {
            return Err(ToxError::integrity("no usable cross-validation folds"));
        }
        Ok(total / used as f64)
    }
}

impl ModelSearch for GridSearch {
    fn search(&self, x: &Matrix, y: &[u8]) -> Result<Box<dyn Classifier>> {
        let candidates = self.space.candidates();
        if candidates.is_empty() {
            return Err(ToxError::config("search space has no candidate models"));
        }

        let mut best: Option<(f64, Architecture)> = None;
        for candidate in candidates {
            let score = self.cross_validate(&candidate, x, y)?;
            debug!("Candidate {:?}: cv accuracy {:.4}", candidate, score);
            // First candidate wins ties
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, candidate));
            }
        }

        let (score, architecture) =
            best.ok_or_else(|| ToxError::config("search produced no model"))?;
        info!("Selected {:?} (cv accuracy {:.4})", architecture, score);
        Ok(Box::new(architecture))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn toy_data() -> (Matrix, Vec<u8>) {
        let n = 20;
        let x = Array2::from_shape_fn((n, 2), |(i, j)| {
            let base = if i < n / 2 { 0.2 } else { 0.8 };
            base + 0.01 * ((i * 7 + j * 3) % 5) as f64
        });
        let y = (0..n).map(|i| u8::from(i >= n / 2)).collect();
        (x, y)
    }

    #[test]
    fn test_candidates_enumeration() {
        let space = SearchSpace::default();
        assert_eq!(space.candidates().len(), 3 * 2 + 3);
        assert_eq!(
            SearchSpace::centroid_only().candidates(),
            vec![Architecture::NearestCentroid]
        );
    }

    #[test]
    fn test_folds_are_stratified() {
        let y: Vec<u8> = (0..10).map(|i| u8::from(i % 2 == 0)).collect();
        let search = GridSearch::new(SearchSpace::default()).with_folds(5);
        let folds = search.assign_folds(&y, 5);
        for fold in 0..5 {
            let pos = (0..10).filter(|&i| folds[i] == fold && y[i] == 1).count();
            let neg = (0..10).filter(|&i| folds[i] == fold && y[i] == 0).count();
            assert_eq!((pos, neg), (1, 1));
        }
    }

    #[test]
    fn test_search_separable_data() {
        let (x, y) = toy_data();
        let search = GridSearch::new(SearchSpace::default()).with_folds(5);
        let best = search.search(&x, &y).unwrap();
        let model = best.fit(&x, &y).unwrap();
        assert_eq!(model.predict(&x).unwrap(), y);
    }

    #[test]
    fn test_search_is_deterministic() {
        let (x, y) = toy_data();
        let search = GridSearch::new(SearchSpace::default()).with_seed(3);
        let a = search.search(&x, &y).unwrap().export();
        let b = search.search(&x, &y).unwrap().export();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_space_is_config_error() {
        let (x, y) = toy_data();
        let space = SearchSpace {
            logistic: None,
            knn_k: Vec::new(),
            nearest_centroid: false,
        };
        assert!(matches!(
            GridSearch::new(space).search(&x, &y),
            Err(ToxError::Config(_))
        ));
    }
}
