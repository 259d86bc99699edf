// projeto: speitrain
// file: src/neural/utils.rs
// Error type, activation functions, weight initialisation and the Adam optimizer

use ndarray::{Array, Array1, Array2, ArrayD, Dimension, IxDyn, ShapeError, Zip};
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Data processing error: {0}")]
    DataProcessing(String),

    #[error("Model configuration error: {0}")]
    ModelConfiguration(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Shape error: {0}")]
    Shape(String),
}

impl From<ShapeError> for TrainingError {
    fn from(err: ShapeError) -> Self {
        TrainingError::Shape(err.to_string())
    }
}

/// Activation functions, named the way the configuration names them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Sigmoid,
    Tanh,
    Linear,
}

impl Activation {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Relu => x.max(0.0),
            Activation::Sigmoid => sigmoid_scalar(x),
            Activation::Tanh => x.tanh(),
            Activation::Linear => x,
        }
    }

    /// Derivative evaluated at the pre-activation value `x`.
    pub fn derivative(self, x: f64) -> f64 {
        match self {
            Activation::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Sigmoid => {
                let s = sigmoid_scalar(x);
                s * (1.0 - s)
            }
            Activation::Tanh => 1.0 - x.tanh().powi(2),
            Activation::Linear => 1.0,
        }
    }

    pub fn forward(self, x: &Array1<f64>) -> Array1<f64> {
        x.mapv(|val| self.apply(val))
    }

    pub fn backward(self, pre: &Array1<f64>) -> Array1<f64> {
        pre.mapv(|val| self.derivative(val))
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::Relu => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Linear => "linear",
        };
        f.write_str(name)
    }
}

pub fn sigmoid_scalar(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn sigmoid(x: &Array1<f64>) -> Array1<f64> {
    x.mapv(sigmoid_scalar)
}

/// Glorot/Xavier uniform initialisation, `limit = sqrt(6 / (fan_in + fan_out))`.
pub fn glorot_uniform<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    fan_in: usize,
    fan_out: usize,
    rng: &mut R,
) -> Result<Array2<f64>, TrainingError> {
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
    let dist = Uniform::new(-limit, limit)
        .map_err(|e| TrainingError::ModelConfiguration(format!("Invalid init range: {}", e)))?;
    Ok(Array2::from_shape_fn((rows, cols), |_| dist.sample(rng)))
}

#[derive(Debug, Clone)]
pub struct AdamOptimizer {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub t: usize,
    m: HashMap<String, ArrayD<f64>>,
    v: HashMap<String, ArrayD<f64>>,
}

impl AdamOptimizer {
    pub fn new(learning_rate: f64, beta1: f64, beta2: f64, epsilon: f64) -> Self {
        AdamOptimizer {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }

    /// Advances the timestep. Call once per optimisation step, before the
    /// per-parameter `update` calls of that step.
    pub fn begin_step(&mut self) {
        self.t += 1;
    }

    pub fn update<D: Dimension>(
        &mut self,
        param_name: &str,
        param: &mut Array<f64, D>,
        gradient: &Array<f64, D>,
    ) -> Result<(), TrainingError> {
        if param.shape() != gradient.shape() {
            return Err(TrainingError::Shape(format!(
                "Gradient for '{}' has shape {:?}, parameter has {:?}",
                param_name,
                gradient.shape(),
                param.shape()
            )));
        }
        if self.t == 0 {
            return Err(TrainingError::Training(
                "Adam update called before begin_step".to_string(),
            ));
        }

        let (beta1, beta2) = (self.beta1, self.beta2);
        let bias1 = 1.0 - beta1.powi(self.t as i32);
        let bias2 = 1.0 - beta2.powi(self.t as i32);
        let lr = self.learning_rate;
        let eps = self.epsilon;

        let shape = IxDyn(gradient.shape());
        let m = self
            .m
            .entry(param_name.to_string())
            .or_insert_with(|| ArrayD::zeros(shape.clone()));
        let v = self
            .v
            .entry(param_name.to_string())
            .or_insert_with(|| ArrayD::zeros(shape));

        if m.shape() != gradient.shape() {
            return Err(TrainingError::Shape(format!(
                "Optimizer state for '{}' has shape {:?}, gradient has {:?}",
                param_name,
                m.shape(),
                gradient.shape()
            )));
        }

        let grad = gradient.view().into_dyn();
        m.zip_mut_with(&grad, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
        v.zip_mut_with(&grad, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

        Zip::from(param.view_mut().into_dyn())
            .and(m.view())
            .and(v.view())
            .for_each(|p, &m, &v| {
                let m_hat = m / bias1;
                let v_hat = v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });

        Ok(())
    }
}

pub fn validate_targets(targets: &[f64], name: &str) -> Result<(), TrainingError> {
    if targets.is_empty() {
        return Err(TrainingError::DataProcessing(format!("{} is empty", name)));
    }

    for (i, &value) in targets.iter().enumerate() {
        if !value.is_finite() {
            return Err(TrainingError::DataProcessing(format!(
                "{} contains non-finite value at position {}",
                name, i
            )));
        }
    }

    Ok(())
}
