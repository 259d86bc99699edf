// projeto: speitrain
// file: src/neural/data.rs
// SPEI series loading, chronological train/test split and sliding windows

use chrono::NaiveDate;
use log::{debug, info, warn};
use ndarray::{Array2, Array3};
use std::path::Path;

use crate::neural::utils::TrainingError;

#[derive(Debug, Clone, PartialEq)]
pub struct SpeiRecord {
    pub month: NaiveDate,
    pub value: f64,
}

/// Result of splitting a labelled series into train and test partitions.
#[derive(Debug, Clone)]
pub struct SplitData {
    pub train_data: Vec<f64>,
    pub test_data: Vec<f64>,
    pub train_months: Vec<NaiveDate>,
    pub test_months: Vec<NaiveDate>,
    pub split: usize,
}

/// Sliding-window (input, target) pairs, shaped for the model.
#[derive(Debug, Clone)]
pub struct Windowed {
    /// `(samples, window_size, 1)`
    pub inputs: Array3<f64>,
    /// `(samples, horizon)`
    pub targets: Array2<f64>,
}

impl Windowed {
    pub fn len(&self) -> usize {
        self.inputs.dim().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collaborator that prepares the training tensors.
pub trait DataProcessor {
    fn split(&self, path: &Path, fraction: f64) -> Result<SplitData, TrainingError>;

    fn window(&self, series: &[f64], window_size: usize, horizon: usize) -> Result<Windowed, TrainingError> {
        create_windows(series, window_size, horizon)
    }
}

/// Reads the SPEI series from a CSV file: month in the first column,
/// index value in the second.
#[derive(Debug, Default, Clone)]
pub struct SpeiDataProcessor;

impl SpeiDataProcessor {
    pub fn new() -> Self {
        SpeiDataProcessor
    }

    pub fn load_records(&self, path: &Path) -> Result<Vec<SpeiRecord>, TrainingError> {
        println!("📥 [DataLoader] Loading SPEI series from: {}", path.display());

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(path)?;

        let mut records = Vec::new();
        let mut skipped = 0;

        for (line, row) in reader.records().enumerate() {
            let row = row?;
            let (Some(month_field), Some(value_field)) = (row.get(0), row.get(1)) else {
                skipped += 1;
                continue;
            };

            let value = match value_field.replace(',', ".").parse::<f64>() {
                Ok(v) if v.is_finite() => v,
                _ => {
                    skipped += 1;
                    continue;
                }
            };

            let month = parse_month(month_field).ok_or_else(|| {
                TrainingError::DataProcessing(format!(
                    "Invalid month '{}' at data row {}",
                    month_field,
                    line + 1
                ))
            })?;

            records.push(SpeiRecord { month, value });
        }

        if skipped > 0 {
            warn!("⚠️ {} rows without a valid SPEI value were skipped", skipped);
        }
        if records.is_empty() {
            return Err(TrainingError::DataProcessing(format!(
                "No SPEI values found in {}",
                path.display()
            )));
        }

        records.sort_by_key(|r| r.month);
        println!("✅ [DataLoader] Loaded {} monthly records", records.len());
        Ok(records)
    }
}

impl DataProcessor for SpeiDataProcessor {
    fn split(&self, path: &Path, fraction: f64) -> Result<SplitData, TrainingError> {
        let records = self.load_records(path)?;
        split_records(&records, fraction)
    }
}

pub fn split_records(records: &[SpeiRecord], fraction: f64) -> Result<SplitData, TrainingError> {
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(TrainingError::DataProcessing(format!(
            "Train fraction must be in (0, 1], got {}",
            fraction
        )));
    }

    let split = (records.len() as f64 * fraction).floor() as usize;
    let (train, test) = records.split_at(split.min(records.len()));

    let data = SplitData {
        train_data: train.iter().map(|r| r.value).collect(),
        test_data: test.iter().map(|r| r.value).collect(),
        train_months: train.iter().map(|r| r.month).collect(),
        test_months: test.iter().map(|r| r.month).collect(),
        split,
    };

    info!(
        "✅ Dados divididos - Treino: {} | Teste: {}",
        data.train_data.len(),
        data.test_data.len()
    );
    Ok(data)
}

/// Stride-1 windows: `window_size` consecutive inputs followed by `horizon` targets.
/// A series too short for a single window yields zero samples.
pub fn create_windows(series: &[f64], window_size: usize, horizon: usize) -> Result<Windowed, TrainingError> {
    if window_size == 0 || horizon == 0 {
        return Err(TrainingError::DataProcessing(format!(
            "Window size and horizon must be positive (got {} and {})",
            window_size, horizon
        )));
    }

    let span = window_size + horizon;
    let samples = if series.len() >= span { series.len() - span + 1 } else { 0 };

    let inputs = Array3::from_shape_fn((samples, window_size, 1), |(i, t, _)| series[i + t]);
    let targets = Array2::from_shape_fn((samples, horizon), |(i, k)| series[i + window_size + k]);

    debug!("🔧 Created {} windows of {} → {}", samples, window_size, horizon);
    Ok(Windowed { inputs, targets })
}

/// Month of the first target of each window, aligned with `create_windows`.
pub fn window_target_months(months: &[NaiveDate], window_size: usize, horizon: usize) -> Vec<NaiveDate> {
    let span = window_size + horizon;
    if months.len() < span {
        return Vec::new();
    }
    months[window_size..=months.len() - horizon].to_vec()
}

pub fn parse_month(field: &str) -> Option<NaiveDate> {
    let field = field.trim();
    // timestamps exported as "2001-01-01 00:00:00"
    let date_part = field.split_whitespace().next().unwrap_or(field);

    // month-only values are pinned to the first day
    let candidates = [
        date_part.to_string(),
        format!("{}-01", date_part),
        format!("01/{}", date_part),
    ];

    candidates.iter().find_map(|candidate| {
        ["%Y-%m-%d", "%d/%m/%Y"]
            .iter()
            .find_map(|format| NaiveDate::parse_from_str(candidate, format).ok())
    })
}
