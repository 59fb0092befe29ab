//! k-nearest-neighbour classifier over Euclidean distance.

use crate::data::Matrix;
use crate::error::{Result, ToxError};
use crate::model::FittedModel;
use ndarray::{ArrayView1, Axis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnParams {
    pub k: usize,
}

impl Default for KnnParams {
    fn default() -> Self {
        Self { k: 5 }
    }
}

#[derive(Debug, Clone)]
pub struct KnnModel {
    k: usize,
    points: Matrix,
    labels: Vec<u8>,
}

impl KnnModel {
    /// Memorise the training rows; `k` is clamped to the row count
    pub fn fit(params: &KnnParams, x: &Matrix, y: &[u8]) -> Self {
        Self {
            k: params.k.clamp(1, x.nrows().max(1)),
            points: x.clone(),
            labels: y.to_vec(),
        }
    }

    /// Share of positive labels among the k nearest training rows
    fn positive_share(&self, row: ArrayView1<f64>) -> f64 {
        let mut distances: Vec<(f64, usize)> = self
            .points
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(i, p)| {
                let d: f64 = p.iter().zip(row.iter()).map(|(a, b)| (a - b).powi(2)).sum();
                (d, i)
            })
            .collect();
        // Ties resolve by training order
        distances.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let positives = distances
            .iter()
            .take(self.k)
            .filter(|(_, i)| self.labels[*i] == 1)
            .count();
        positives as f64 / self.k as f64
    }
}

impl FittedModel for KnnModel {
    fn predict(&self, x: &Matrix) -> Result<Vec<u8>> {
        Ok(self
            .predict_proba(x)?
            .into_iter()
            .map(|p| u8::from(p > 0.5))
            .collect())
    }

    fn supports_proba(&self) -> bool {
        true
    }

    fn predict_proba(&self, x: &Matrix) -> Result<Vec<f64>> {
        if x.ncols() != self.points.ncols() {
            return Err(ToxError::integrity(format!(
                "model fitted on {} columns, got {}",
                self.points.ncols(),
                x.ncols()
            )));
        }
        Ok(x.axis_iter(Axis(0)).map(|row| self.positive_share(row)).collect())
    }
}
