// projeto: speitrain
// file: src/neural/metrics.rs
// Training history, per-epoch metrics and regression error reports

use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::neural::config::MetricKind;
use crate::neural::utils::TrainingError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f64,
    pub metrics: Vec<(MetricKind, f64)>,
}

/// Per-epoch record returned by `fit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    pub epochs: Vec<EpochRecord>,
}

impl History {
    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn loss(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.loss).collect()
    }

    pub fn metric(&self, kind: MetricKind) -> Option<Vec<f64>> {
        self.epochs
            .iter()
            .map(|e| e.metrics.iter().find(|(k, _)| *k == kind).map(|(_, v)| *v))
            .collect()
    }

    pub fn save_to_csv<P: AsRef<Path>>(&self, file_path: P) -> Result<(), TrainingError> {
        let file_path = file_path.as_ref();
        let mut writer = csv::Writer::from_path(file_path)?;

        let kinds: Vec<MetricKind> = self
            .epochs
            .first()
            .map(|e| e.metrics.iter().map(|(k, _)| *k).collect())
            .unwrap_or_default();

        let mut header = vec!["epoch".to_string(), "loss".to_string()];
        header.extend(kinds.iter().map(|k| k.name().to_string()));
        writer.write_record(&header)?;

        for record in &self.epochs {
            let mut row = vec![record.epoch.to_string(), format!("{:.6}", record.loss)];
            row.extend(record.metrics.iter().map(|(_, v)| format!("{:.6}", v)));
            writer.write_record(&row)?;
        }
        writer.flush()?;

        info!("📊 [Metrics] Training history saved to: {}", file_path.display());
        Ok(())
    }
}

pub fn compute_metric(kind: MetricKind, predictions: &[f64], targets: &[f64]) -> f64 {
    match kind {
        MetricKind::Mae => mean_abs_error(predictions, targets),
        MetricKind::Mse => mean_sq_error(predictions, targets),
        MetricKind::Rmse => mean_sq_error(predictions, targets).sqrt(),
        MetricKind::R2 => r_squared(predictions, targets),
    }
}

fn mean_sq_error(predictions: &[f64], targets: &[f64]) -> f64 {
    if predictions.is_empty() {
        return 0.0;
    }
    predictions.iter().zip(targets).map(|(p, t)| (p - t).powi(2)).sum::<f64>() / predictions.len() as f64
}

fn mean_abs_error(predictions: &[f64], targets: &[f64]) -> f64 {
    if predictions.is_empty() {
        return 0.0;
    }
    predictions.iter().zip(targets).map(|(p, t)| (p - t).abs()).sum::<f64>() / predictions.len() as f64
}

fn r_squared(predictions: &[f64], targets: &[f64]) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let target_mean = targets.iter().sum::<f64>() / targets.len() as f64;
    let ss_res = predictions.iter().zip(targets).map(|(p, t)| (t - p).powi(2)).sum::<f64>();
    let ss_tot = targets.iter().map(|t| (t - target_mean).powi(2)).sum::<f64>();
    if ss_tot != 0.0 { 1.0 - (ss_res / ss_tot) } else { 0.0 }
}

/// Calculate comprehensive metrics for model evaluation
pub fn calculate_regression_metrics(predictions: &[f64], targets: &[f64]) -> Result<RegressionMetrics, TrainingError> {
    if predictions.len() != targets.len() {
        return Err(TrainingError::Shape(format!(
            "{} predictions for {} targets",
            predictions.len(),
            targets.len()
        )));
    }
    if predictions.is_empty() {
        return Err(TrainingError::DataProcessing("No predictions to evaluate".to_string()));
    }

    let n = predictions.len() as f64;
    let mse = mean_sq_error(predictions, targets);

    let mape = predictions
        .iter()
        .zip(targets)
        .filter(|(_, t)| **t != 0.0)
        .map(|(p, t)| ((p - t) / t).abs())
        .sum::<f64>()
        / n
        * 100.0;

    let mut correct_direction = 0;
    for i in 1..predictions.len() {
        let pred_change = predictions[i] - predictions[i - 1];
        let actual_change = targets[i] - targets[i - 1];
        if pred_change.signum() == actual_change.signum() {
            correct_direction += 1;
        }
    }
    let directional_accuracy = if predictions.len() > 1 {
        correct_direction as f64 / (predictions.len() - 1) as f64
    } else {
        0.0
    };

    let mut abs_errors: Vec<f64> = predictions.iter().zip(targets).map(|(p, t)| (p - t).abs()).collect();
    abs_errors.sort_by(|a, b| a.total_cmp(b));
    let max_error = abs_errors.last().copied().unwrap_or(0.0);
    let mid = abs_errors.len() / 2;
    let median_ae = if abs_errors.len() % 2 == 0 {
        (abs_errors[mid - 1] + abs_errors[mid]) / 2.0
    } else {
        abs_errors[mid]
    };

    Ok(RegressionMetrics {
        mse,
        rmse: mse.sqrt(),
        mae: mean_abs_error(predictions, targets),
        mape,
        directional_accuracy,
        r_squared: r_squared(predictions, targets),
        max_error,
        median_ae,
        n_samples: predictions.len(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mse: f64,
    pub rmse: f64,
    pub mae: f64,
    pub mape: f64,
    pub directional_accuracy: f64,
    pub r_squared: f64,
    pub max_error: f64,
    pub median_ae: f64,
    pub n_samples: usize,
}

impl RegressionMetrics {
    pub fn print(&self, prefix: &str) {
        println!("📊 [{}] Regression Metrics:", prefix);
        println!("   ├── Samples: {}", self.n_samples);
        println!("   ├── MSE: {:.6}", self.mse);
        println!("   ├── RMSE: {:.6}", self.rmse);
        println!("   ├── MAE: {:.6}", self.mae);
        println!("   ├── MAPE: {:.2}%", self.mape);
        println!("   ├── Max Error: {:.6}", self.max_error);
        println!("   ├── Median AE: {:.6}", self.median_ae);
        println!("   ├── Direction Acc: {:.2}%", self.directional_accuracy * 100.0);
        println!("   └── R²: {:.6}", self.r_squared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn history() -> History {
        let mut history = History::default();
        for epoch in 1..=3 {
            history.push(EpochRecord {
                epoch,
                loss: 1.0 / epoch as f64,
                metrics: vec![(MetricKind::Mae, 0.5), (MetricKind::R2, 0.1 * epoch as f64)],
            });
        }
        history
    }

    #[test]
    fn test_metric_values() {
        let predictions = [1.0, 2.0, 3.0];
        let targets = [1.0, 2.0, 4.0];

        assert!((compute_metric(MetricKind::Mae, &predictions, &targets) - 1.0 / 3.0).abs() < 1e-12);
        assert!((compute_metric(MetricKind::Mse, &predictions, &targets) - 1.0 / 3.0).abs() < 1e-12);
        assert!((compute_metric(MetricKind::Rmse, &predictions, &targets) - (1.0f64 / 3.0).sqrt()).abs() < 1e-12);
        // ss_tot = 42/9, ss_res = 1
        let r2 = compute_metric(MetricKind::R2, &predictions, &targets);
        assert!((r2 - (1.0 - 9.0 / 42.0)).abs() < 1e-12);
    }

    #[test]
    fn test_r2_constant_targets() {
        assert_eq!(compute_metric(MetricKind::R2, &[1.0, 2.0], &[3.0, 3.0]), 0.0);
    }

    #[test]
    fn test_regression_metrics() {
        let predictions = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let targets = vec![1.1, 1.9, 3.1, 3.8, 5.2];

        let metrics = calculate_regression_metrics(&predictions, &targets).unwrap();

        assert!(metrics.rmse > 0.0);
        assert!(metrics.mae > 0.0);
        assert!((metrics.max_error - 0.2).abs() < 1e-9);
        assert!((metrics.median_ae - 0.1).abs() < 1e-9);
        assert_eq!(metrics.directional_accuracy, 1.0);
        assert!(metrics.r_squared <= 1.0);
        assert_eq!(metrics.n_samples, 5);

        assert!(calculate_regression_metrics(&[1.0], &[1.0, 2.0]).is_err());
        assert!(calculate_regression_metrics(&[], &[]).is_err());
    }

    #[test]
    fn test_history_accessors() {
        let history = history();
        assert_eq!(history.len(), 3);
        assert_eq!(history.loss(), vec![1.0, 0.5, 1.0 / 3.0]);
        assert_eq!(history.metric(MetricKind::Mae), Some(vec![0.5, 0.5, 0.5]));
        assert_eq!(history.metric(MetricKind::Rmse), None);
    }

    #[test]
    fn test_history_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");
        history().save_to_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("epoch,loss,mae,r2"));
        assert_eq!(lines.next(), Some("1,1.000000,0.500000,0.100000"));
        assert_eq!(content.lines().count(), 4);
    }
}
