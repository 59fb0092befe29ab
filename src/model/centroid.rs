//! Nearest class centroid. Has no probability output.

use crate::data::Matrix;
use crate::error::{Result, ToxError};
use crate::model::FittedModel;
use ndarray::{Array1, ArrayView1, Axis};

#[derive(Debug, Clone)]
pub struct CentroidModel {
    positive: Array1<f64>,
    negative: Array1<f64>,
}

fn class_mean(x: &Matrix, y: &[u8], class: u8) -> Array1<f64> {
    let rows: Vec<usize> = (0..y.len()).filter(|&i| y[i] == class).collect();
    if rows.is_empty() {
        return Array1::from_elem(x.ncols(), f64::NAN);
    }
    x.select(Axis(0), &rows)
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(x.ncols()))
}

fn squared_distance(a: ArrayView1<f64>, b: &Array1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

impl CentroidModel {
    pub fn fit(x: &Matrix, y: &[u8]) -> Self {
        Self {
            positive: class_mean(x, y, 1),
            negative: class_mean(x, y, 0),
        }
    }
}

impl FittedModel for CentroidModel {
    fn predict(&self, x: &Matrix) -> Result<Vec<u8>> {
        if x.ncols() != self.positive.len() {
            return Err(ToxError::integrity(format!(
                "model fitted on {} columns, got {}",
                self.positive.len(),
                x.ncols()
            )));
        }
        Ok(x.axis_iter(Axis(0))
            .map(|row| {
                let to_pos = squared_distance(row, &self.positive);
                let to_neg = squared_distance(row, &self.negative);
                // A missing class centroid yields NaN and never wins
                u8::from(to_pos < to_neg || to_neg.is_nan())
            })
            .collect())
    }
}
