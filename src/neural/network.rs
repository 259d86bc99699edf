// projeto: speitrain
// file: src/neural/network.rs
// Top-level SPEI forecaster: configuration, model, training and evaluation

use log::info;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::neural::config::ModelConfig;
use crate::neural::data::{DataProcessor, SplitData, Windowed, window_target_months};
use crate::neural::metrics::{History, RegressionMetrics, calculate_regression_metrics};
use crate::neural::model::{CompiledModel, build_model};
use crate::neural::plot::{loss_chart, prediction_chart, save_chart};
use crate::neural::utils::{TrainingError, validate_targets};

/// Errors of the trained model on both partitions.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub train: RegressionMetrics,
    pub test: RegressionMetrics,
}

pub struct NeuralNetwork<P: DataProcessor> {
    data_processor: P,
    configs: ModelConfig,
    model: CompiledModel,
    show_charts: bool,
}

impl<P: DataProcessor> NeuralNetwork<P> {
    /// Loads the configuration and builds the compiled model. A configuration
    /// that fails to load never reaches model construction.
    pub fn new<Q: AsRef<Path>>(file_name: Q, data_processor: P) -> Result<Self, TrainingError> {
        let configs = ModelConfig::load(file_name)?;
        Self::from_config(configs, data_processor)
    }

    pub fn from_config(configs: ModelConfig, data_processor: P) -> Result<Self, TrainingError> {
        let model = build_model(&configs)?;
        println!("{}", model.summary());

        Ok(NeuralNetwork {
            data_processor,
            configs,
            model,
            show_charts: false,
        })
    }

    pub fn with_show_charts(mut self, show: bool) -> Self {
        self.show_charts = show;
        self
    }

    pub fn configs(&self) -> &ModelConfig {
        &self.configs
    }

    pub fn model(&self) -> &CompiledModel {
        &self.model
    }

    fn split(&self) -> Result<SplitData, TrainingError> {
        self.data_processor
            .split(&self.configs.raw.data_path, self.configs.raw.parcel_data_train)
    }

    /// Windows a partition so each sample matches the model input length.
    fn windows(&self, series: &[f64]) -> Result<Windowed, TrainingError> {
        let steps = self.configs.input_shape.0;
        let horizon = self.configs.raw.dense_units;
        let windowed = self.data_processor.window(series, steps, horizon)?;
        self.model.check_tensors(&windowed.inputs, &windowed.targets)?;
        Ok(windowed)
    }

    pub fn train_ml_model(&mut self) -> Result<History, TrainingError> {
        info!("🚀 Started: training of ML model");
        let start = Instant::now();

        let split = self.split()?;
        let train = self.windows(&split.train_data)?;
        if train.is_empty() {
            return Err(TrainingError::DataProcessing(format!(
                "Training partition has {} points, need at least {}",
                split.train_data.len(),
                self.configs.input_shape.0 + self.configs.raw.dense_units
            )));
        }
        validate_targets(train.targets.as_slice().unwrap_or(&[]), "training targets")?;

        let history = self.model.fit(
            &train.inputs,
            &train.targets,
            self.configs.raw.number_of_epochs,
            self.configs.raw.batch_size,
        )?;

        save_chart(&loss_chart(&history), &self.configs.raw.loss_chart_path, self.show_charts)?;

        info!(
            "✅ Ended: training of ML model ({} épocas em {:.2}s)",
            history.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(history)
    }

    /// Predicts both partitions with the trained model, prints the errors and
    /// charts true vs predicted values for the test partition.
    pub fn apply_ml_model<Q: AsRef<Path>>(&self, chart_path: Q) -> Result<Evaluation, TrainingError> {
        let split = self.split()?;
        let steps = self.configs.input_shape.0;
        let horizon = self.configs.raw.dense_units;

        let train = self.windows(&split.train_data)?;
        let test = self.windows(&split.test_data)?;

        let train_pred = self.model.predict(&train.inputs)?;
        let test_pred = self.model.predict(&test.inputs)?;

        let train_errors = errors(&train_pred, &train.targets)?;
        let test_errors = errors(&test_pred, &test.targets)?;

        let region = &self.configs.raw.region_name;
        println!("--------------Result for {}---------------", region);
        train_errors.print("Train");
        test_errors.print("Test");

        let test_months = window_target_months(&split.test_months, steps, horizon);
        let first_column = |m: &Array2<f64>| m.column(0).to_vec();
        let plot = prediction_chart(
            &format!("SPEI - {} (teste)", region),
            &test_months,
            &first_column(&test.targets),
            &first_column(&test_pred),
        );
        save_chart(&plot, chart_path, self.show_charts)?;

        Ok(Evaluation {
            train: train_errors,
            test: test_errors,
        })
    }
}

fn errors(predictions: &Array2<f64>, targets: &Array2<f64>) -> Result<RegressionMetrics, TrainingError> {
    if predictions.is_empty() {
        return Err(TrainingError::DataProcessing(
            "Partition too short for a single evaluation window".to_string(),
        ));
    }
    let p: Vec<f64> = predictions.iter().copied().collect();
    let t: Vec<f64> = targets.iter().copied().collect();
    calculate_regression_metrics(&p, &t)
}

pub fn default_prediction_chart_path(loss_chart: &Path) -> PathBuf {
    loss_chart.with_file_name("predictions_chart.html")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::data::SpeiRecord;
    use crate::neural::data::split_records;
    use chrono::NaiveDate;
    use std::cell::Cell;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    struct SyntheticProcessor {
        points: usize,
        calls: Cell<usize>,
    }

    impl DataProcessor for SyntheticProcessor {
        fn split(&self, _path: &Path, fraction: f64) -> Result<SplitData, TrainingError> {
            self.calls.set(self.calls.get() + 1);
            let records: Vec<SpeiRecord> = (0..self.points)
                .map(|i| SpeiRecord {
                    month: NaiveDate::from_ymd_opt(1990 + (i / 12) as i32, (i % 12) as u32 + 1, 1).unwrap(),
                    value: 0.5 + 0.3 * (i as f64 * 0.52).sin(),
                })
                .collect();
            split_records(&records, fraction)
        }
    }

    fn processor(points: usize) -> SyntheticProcessor {
        SyntheticProcessor {
            points,
            calls: Cell::new(0),
        }
    }

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        fs::write(&path, body).unwrap();
        path
    }

    fn full_config(dir: &TempDir) -> String {
        format!(
            r#"{{
                "total_points": 24,
                "hidden_units": 12,
                "dense_units": 1,
                "numberOfEpochs": 3,
                "parcelDataTrain": 0.8,
                "seed": 9,
                "lossChartPath": "{}"
            }}"#,
            dir.path().join("loss.html").display()
        )
    }

    #[test]
    fn test_missing_key_fails_before_model() {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, r#"{"total_points": 24, "hidden_units": 12, "dense_units": 1, "numberOfEpochs": 3}"#);

        let result = NeuralNetwork::new(&path, processor(120));
        assert!(matches!(result, Err(TrainingError::Json(_))));
    }

    #[test]
    fn test_construction_builds_expected_model() {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, &full_config(&dir));
        let network = NeuralNetwork::new(&path, processor(120)).unwrap();

        assert_eq!(network.model().input_shape(), (12, 1));
        assert_eq!(network.model().output_units(), 1);
        assert_eq!(network.data_processor.calls.get(), 0);
    }

    #[test]
    fn test_train_runs_configured_epochs() {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, &full_config(&dir));
        let mut network = NeuralNetwork::new(&path, processor(120)).unwrap();

        let history = network.train_ml_model().unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.loss().iter().all(|l| l.is_finite()));
        assert!(dir.path().join("loss.html").exists());
        assert_eq!(network.data_processor.calls.get(), 1);
    }

    #[test]
    fn test_train_rejects_short_series() {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, &full_config(&dir));
        let mut network = NeuralNetwork::new(&path, processor(10)).unwrap();

        let result = network.train_ml_model();
        assert!(matches!(result, Err(TrainingError::DataProcessing(_))));
    }

    #[test]
    fn test_apply_reports_both_partitions() {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, &full_config(&dir));
        let mut network = NeuralNetwork::new(&path, processor(120)).unwrap();
        network.train_ml_model().unwrap();

        let chart = dir.path().join("pred.html");
        let evaluation = network.apply_ml_model(&chart).unwrap();

        // 96 train points and 24 test points, windows of 12 → 1
        assert_eq!(evaluation.train.n_samples, 84);
        assert_eq!(evaluation.test.n_samples, 12);
        assert!(chart.exists());
    }

    #[test]
    fn test_prediction_chart_path_sits_next_to_loss_chart() {
        let path = default_prediction_chart_path(Path::new("out/loss_chart.html"));
        assert_eq!(path, PathBuf::from("out/predictions_chart.html"));
    }
}
