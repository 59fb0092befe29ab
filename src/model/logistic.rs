//! L2-regularised logistic regression fitted by full-batch gradient descent.

use crate::data::Matrix;
use crate::error::{Result, ToxError};
use crate::model::FittedModel;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Hyperparameters searched by the grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticParams {
    pub learning_rate: f64,
    pub l2: f64,
    pub epochs: usize,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.5,
            l2: 1e-3,
            epochs: 300,
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[derive(Debug, Clone)]
pub struct LogisticModel {
    weights: Array1<f64>,
    bias: f64,
}

impl LogisticModel {
    /// Fit from zero-initialised weights; the result depends only on the data
    pub fn fit(params: &LogisticParams, x: &Matrix, y: &[u8]) -> Self {
        let n = x.nrows() as f64;
        let targets: Array1<f64> = y.iter().map(|&v| f64::from(v)).collect();
        let mut weights = Array1::<f64>::zeros(x.ncols());
        let mut bias = 0.0;

        for _ in 0..params.epochs {
            let logits = x.dot(&weights) + bias;
            let residual = logits.mapv(sigmoid) - &targets;

            let grad_w = x.t().dot(&residual) / n + &weights * params.l2;
            let grad_b = residual.sum() / n;

            weights = weights - grad_w * params.learning_rate;
            bias -= grad_b * params.learning_rate;
        }

        Self { weights, bias }
    }

    /// Learned coefficients, one per column
    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    fn check_width(&self, x: &Matrix) -> Result<()> {
        if x.ncols() != self.weights.len() {
            return Err(ToxError::integrity(format!(
                "model fitted on {} columns, got {}",
                self.weights.len(),
                x.ncols()
            )));
        }
        Ok(())
    }
}

impl FittedModel for LogisticModel {
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
        self.check_width(x)?;
        Ok((x.dot(&self.weights) + self.bias).mapv(sigmoid).to_vec())
    }
}
