// projeto: speitrain
// file: src/neural/config.rs
// Hyperparameter file loading and derived model settings

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::neural::utils::{Activation, TrainingError};

pub const DEFAULT_DATA_PATH: &str = "./Data/spei12_riopardodeminas.csv";
pub const DEFAULT_REGION: &str = "Rio Pardo de Minas";
pub const DEFAULT_LOSS_CHART: &str = "loss_chart.html";

/// Keys exactly as they appear in the hyperparameter file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConfig {
    pub total_points: usize,
    pub hidden_units: usize,
    pub dense_units: usize,
    #[serde(rename = "numberOfEpochs")]
    pub number_of_epochs: usize,
    #[serde(rename = "parcelDataTrain")]
    pub parcel_data_train: f64,

    #[serde(rename = "learningRate", default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(rename = "batchSize", default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(rename = "dataPath", default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(rename = "regionName", default = "default_region")]
    pub region_name: String,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(rename = "lossChartPath", default = "default_loss_chart")]
    pub loss_chart_path: PathBuf,
}

fn default_learning_rate() -> f64 {
    0.001
}

fn default_batch_size() -> usize {
    1
}

fn default_data_path() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_PATH)
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_loss_chart() -> PathBuf {
    PathBuf::from(DEFAULT_LOSS_CHART)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    Mse,
    Mae,
}

impl LossKind {
    pub fn value(self, prediction: &[f64], target: &[f64]) -> f64 {
        let n = prediction.len().max(1) as f64;
        match self {
            LossKind::Mse => prediction.iter().zip(target).map(|(p, t)| (p - t).powi(2)).sum::<f64>() / n,
            LossKind::Mae => prediction.iter().zip(target).map(|(p, t)| (p - t).abs()).sum::<f64>() / n,
        }
    }

    /// d(loss)/d(prediction) for a single sample.
    pub fn gradient(self, prediction: f64, target: f64, n_outputs: usize) -> f64 {
        let n = n_outputs.max(1) as f64;
        match self {
            LossKind::Mse => 2.0 * (prediction - target) / n,
            LossKind::Mae => (prediction - target).signum() / n,
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossKind::Mse => f.write_str("mse"),
            LossKind::Mae => f.write_str("mae"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Mae,
    Rmse,
    Mse,
    R2,
}

impl MetricKind {
    pub fn name(self) -> &'static str {
        match self {
            MetricKind::Mae => "mae",
            MetricKind::Rmse => "rmse",
            MetricKind::Mse => "mse",
            MetricKind::R2 => "r2",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum OptimizerKind {
    Adam { learning_rate: f64 },
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Adam { .. } => f.write_str("adam"),
        }
    }
}

/// Loaded hyperparameters plus the fields derived from them at startup.
/// Read-only once built.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub raw: RawConfig,
    pub input_shape: (usize, usize),
    pub activation: [Activation; 2],
    pub loss: LossKind,
    pub metrics: [MetricKind; 4],
    pub optimizer: OptimizerKind,
}

impl ModelConfig {
    /// Reads a JSON (or `.toml`) hyperparameter file and derives the model settings.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            TrainingError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let raw: RawConfig = if is_toml {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        info!("⚙️ Configuração carregada de: {}", path.display());
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self, TrainingError> {
        validate(&raw)?;

        let config = ModelConfig {
            input_shape: (raw.total_points - raw.hidden_units, 1),
            activation: [Activation::Relu, Activation::Sigmoid],
            loss: LossKind::Mse,
            metrics: [MetricKind::Mae, MetricKind::Rmse, MetricKind::Mse, MetricKind::R2],
            optimizer: OptimizerKind::Adam {
                learning_rate: raw.learning_rate,
            },
            raw,
        };

        debug!(
            "🔧 input_shape={:?} activation={:?} loss={} optimizer={}",
            config.input_shape, config.activation, config.loss, config.optimizer
        );
        Ok(config)
    }

    pub fn recurrent_activation(&self) -> Activation {
        self.activation[0]
    }

    pub fn dense_activation(&self) -> Activation {
        self.activation[1]
    }
}

fn validate(raw: &RawConfig) -> Result<(), TrainingError> {
    if raw.hidden_units == 0 {
        return Err(TrainingError::Config("hidden_units must be greater than zero".into()));
    }
    if raw.total_points <= raw.hidden_units {
        return Err(TrainingError::Config(format!(
            "total_points ({}) must be greater than hidden_units ({})",
            raw.total_points, raw.hidden_units
        )));
    }
    if raw.dense_units == 0 {
        return Err(TrainingError::Config("dense_units must be greater than zero".into()));
    }
    if raw.number_of_epochs == 0 {
        return Err(TrainingError::Config("numberOfEpochs must be greater than zero".into()));
    }
    if !(raw.parcel_data_train > 0.0 && raw.parcel_data_train <= 1.0) {
        return Err(TrainingError::Config(format!(
            "parcelDataTrain must be in (0, 1], got {}",
            raw.parcel_data_train
        )));
    }
    if raw.batch_size == 0 {
        return Err(TrainingError::Config("batchSize must be greater than zero".into()));
    }
    if !(raw.learning_rate > 0.0 && raw.learning_rate.is_finite()) {
        return Err(TrainingError::Config(format!(
            "learningRate must be positive, got {}",
            raw.learning_rate
        )));
    }
    Ok(())
}
