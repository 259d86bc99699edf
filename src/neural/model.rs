// projeto: speitrain
// file: src/neural/model.rs
// Sequential model: layer stack, compile, fit loop and prediction

use log::{debug, info};
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::fmt;
use std::time::Instant;

use crate::neural::config::{LossKind, MetricKind, ModelConfig, OptimizerKind};
use crate::neural::layers::{DenseCache, DenseLayer, LayerGrads, LstmCache, LstmLayer};
use crate::neural::metrics::{EpochRecord, History, compute_metric};
use crate::neural::utils::{Activation, AdamOptimizer, TrainingError};

/// Layer specification passed to `SequentialModel::add`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LayerSpec {
    Lstm { units: usize, activation: Activation },
    Dense { units: usize, activation: Activation },
}

#[derive(Debug, Clone)]
pub enum Layer {
    Lstm(LstmLayer),
    Dense(DenseLayer),
}

impl Layer {
    pub fn units(&self) -> usize {
        match self {
            Layer::Lstm(l) => l.units,
            Layer::Dense(l) => l.units,
        }
    }

    pub fn num_parameters(&self) -> usize {
        match self {
            Layer::Lstm(l) => l.num_parameters(),
            Layer::Dense(l) => l.num_parameters(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Layer::Lstm(_) => "LSTM",
            Layer::Dense(_) => "Dense",
        }
    }
}

/// Uncompiled layer stack. The first layer consumes the `(steps, features)`
/// sequence and must be recurrent; dense layers follow.
pub struct SequentialModel {
    input_shape: (usize, usize),
    layers: Vec<Layer>,
    rng: StdRng,
}

impl SequentialModel {
    pub fn new(input_shape: (usize, usize), seed: Option<u64>) -> Result<Self, TrainingError> {
        if input_shape.0 == 0 || input_shape.1 == 0 {
            return Err(TrainingError::ModelConfiguration(format!(
                "Input shape must be positive, got {:?}",
                input_shape
            )));
        }

        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_os_rng(),
        };

        Ok(SequentialModel {
            input_shape,
            layers: Vec::new(),
            rng,
        })
    }

    pub fn add(&mut self, spec: LayerSpec) -> Result<&mut Self, TrainingError> {
        let input_size = self.layers.last().map(Layer::units).unwrap_or(self.input_shape.1);

        let layer = match spec {
            LayerSpec::Lstm { units, activation } => {
                if !self.layers.is_empty() {
                    return Err(TrainingError::ModelConfiguration(
                        "LSTM is only supported as the first layer".to_string(),
                    ));
                }
                Layer::Lstm(LstmLayer::new(input_size, units, activation, &mut self.rng)?)
            }
            LayerSpec::Dense { units, activation } => {
                if self.layers.is_empty() {
                    return Err(TrainingError::ModelConfiguration(
                        "The first layer must be an LSTM over the input sequence".to_string(),
                    ));
                }
                Layer::Dense(DenseLayer::new(input_size, units, activation, &mut self.rng)?)
            }
        };

        self.layers.push(layer);
        Ok(self)
    }

    pub fn compile(
        self,
        loss: LossKind,
        metrics: &[MetricKind],
        optimizer: OptimizerKind,
    ) -> Result<CompiledModel, TrainingError> {
        if self.layers.is_empty() {
            return Err(TrainingError::ModelConfiguration(
                "Cannot compile a model without layers".to_string(),
            ));
        }

        let optimizer = match optimizer {
            OptimizerKind::Adam { learning_rate } => AdamOptimizer::new(learning_rate, 0.9, 0.999, 1e-7),
        };

        Ok(CompiledModel {
            input_shape: self.input_shape,
            layers: self.layers,
            rng: self.rng,
            loss,
            metrics: metrics.to_vec(),
            optimizer,
        })
    }
}

/// A compiled model: the only form that can be trained.
pub struct CompiledModel {
    input_shape: (usize, usize),
    layers: Vec<Layer>,
    rng: StdRng,
    loss: LossKind,
    metrics: Vec<MetricKind>,
    optimizer: AdamOptimizer,
}

enum Cache {
    Lstm(LstmCache),
    Dense(DenseCache),
}

impl CompiledModel {
    pub fn input_shape(&self) -> (usize, usize) {
        self.input_shape
    }

    pub fn output_units(&self) -> usize {
        self.layers.last().map(Layer::units).unwrap_or(0)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn metrics(&self) -> &[MetricKind] {
        &self.metrics
    }

    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(Layer::num_parameters).sum()
    }

    pub fn summary(&self) -> ModelSummary<'_> {
        ModelSummary { model: self }
    }

    /// Single-sample forward pass over a `(steps, features)` sequence.
    pub fn forward(&self, input: ArrayView2<f64>) -> Result<Array1<f64>, TrainingError> {
        self.check_sequence(input.dim())?;

        let mut current: Option<Array1<f64>> = None;
        for layer in &self.layers {
            current = Some(match (layer, current) {
                (Layer::Lstm(lstm), None) => lstm.forward(input),
                (Layer::Dense(dense), Some(x)) => dense.forward(x.view()),
                _ => {
                    return Err(TrainingError::ModelConfiguration(
                        "Unsupported layer ordering".to_string(),
                    ));
                }
            });
        }

        current.ok_or_else(|| TrainingError::ModelConfiguration("Model has no layers".to_string()))
    }

    fn forward_train(&self, input: ArrayView2<f64>) -> Result<(Array1<f64>, Vec<Cache>), TrainingError> {
        let mut caches = Vec::with_capacity(self.layers.len());
        let mut current: Option<Array1<f64>> = None;

        for layer in &self.layers {
            let (out, cache) = match (layer, current.take()) {
                (Layer::Lstm(lstm), None) => {
                    let (out, cache) = lstm.forward_train(input);
                    (out, Cache::Lstm(cache))
                }
                (Layer::Dense(dense), Some(x)) => {
                    let (out, cache) = dense.forward_train(&x);
                    (out, Cache::Dense(cache))
                }
                _ => {
                    return Err(TrainingError::ModelConfiguration(
                        "Unsupported layer ordering".to_string(),
                    ));
                }
            };
            caches.push(cache);
            current = Some(out);
        }

        let output = current.ok_or_else(|| TrainingError::ModelConfiguration("Model has no layers".to_string()))?;
        Ok((output, caches))
    }

    fn backward(&self, caches: &[Cache], d_output: Array1<f64>) -> Result<Vec<LayerGrads>, TrainingError> {
        let mut grads = Vec::with_capacity(self.layers.len());
        let mut delta = d_output;

        for (layer, cache) in self.layers.iter().zip(caches).rev() {
            match (layer, cache) {
                (Layer::Dense(dense), Cache::Dense(c)) => {
                    let (g, d_input) = dense.backward(c, &delta);
                    grads.push(LayerGrads::Dense(g));
                    delta = d_input;
                }
                (Layer::Lstm(lstm), Cache::Lstm(c)) => {
                    grads.push(LayerGrads::Lstm(lstm.backward(c, &delta)));
                }
                _ => {
                    return Err(TrainingError::Training(
                        "Forward cache does not match layer".to_string(),
                    ));
                }
            }
        }

        grads.reverse();
        Ok(grads)
    }

    fn apply_gradients(&mut self, grads: &[LayerGrads]) -> Result<(), TrainingError> {
        self.optimizer.begin_step();
        for (idx, (layer, grad)) in self.layers.iter_mut().zip(grads).enumerate() {
            let prefix = format!("layer{}", idx);
            match (layer, grad) {
                (Layer::Lstm(l), LayerGrads::Lstm(g)) => l.apply_gradients(&prefix, g, &mut self.optimizer)?,
                (Layer::Dense(l), LayerGrads::Dense(g)) => l.apply_gradients(&prefix, g, &mut self.optimizer)?,
                _ => {
                    return Err(TrainingError::Training(
                        "Gradient does not match layer".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_sequence(&self, dim: (usize, usize)) -> Result<(), TrainingError> {
        if dim != self.input_shape {
            return Err(TrainingError::Shape(format!(
                "Expected input sequence {:?}, got {:?}",
                self.input_shape, dim
            )));
        }
        Ok(())
    }

    pub fn check_tensors(&self, inputs: &Array3<f64>, targets: &Array2<f64>) -> Result<(), TrainingError> {
        let (samples, steps, features) = inputs.dim();
        self.check_sequence((steps, features))?;

        if targets.ncols() != self.output_units() {
            return Err(TrainingError::Shape(format!(
                "Model outputs {} units but targets have {} columns",
                self.output_units(),
                targets.ncols()
            )));
        }
        if targets.nrows() != samples {
            return Err(TrainingError::Shape(format!(
                "{} input samples but {} target rows",
                samples,
                targets.nrows()
            )));
        }
        Ok(())
    }

    /// Trains in place for `epochs` passes, shuffling samples every epoch.
    /// Loss and metrics are reported over the predictions made during the epoch.
    pub fn fit(
        &mut self,
        inputs: &Array3<f64>,
        targets: &Array2<f64>,
        epochs: usize,
        batch_size: usize,
    ) -> Result<History, TrainingError> {
        self.check_tensors(inputs, targets)?;
        let samples = inputs.dim().0;
        if samples == 0 {
            return Err(TrainingError::Training("No training samples".to_string()));
        }
        if batch_size == 0 {
            return Err(TrainingError::Training("Batch size must be positive".to_string()));
        }

        info!(
            "🎓 Iniciando treinamento por {} épocas ({} amostras, batch {})",
            epochs, samples, batch_size
        );

        let n_outputs = self.output_units();
        let mut history = History::default();
        let mut order: Vec<usize> = (0..samples).collect();

        for epoch in 1..=epochs {
            let epoch_start = Instant::now();
            order.shuffle(&mut self.rng);

            let mut loss_sum = 0.0;
            let mut predictions = Vec::with_capacity(samples * n_outputs);
            let mut truth = Vec::with_capacity(samples * n_outputs);

            for batch in order.chunks(batch_size) {
                let mut batch_grads: Option<Vec<LayerGrads>> = None;

                for &idx in batch {
                    let x = inputs.index_axis(Axis(0), idx);
                    let y = targets.row(idx);
                    let (output, caches) = self.forward_train(x)?;

                    let out_slice = output.to_vec();
                    let y_slice = y.to_vec();
                    let sample_loss = self.loss.value(&out_slice, &y_slice);
                    if !sample_loss.is_finite() {
                        return Err(TrainingError::Training(format!(
                            "Loss diverged at epoch {} (sample {})",
                            epoch, idx
                        )));
                    }
                    loss_sum += sample_loss;

                    let d_output = Array1::from_shape_fn(n_outputs, |k| {
                        self.loss.gradient(out_slice[k], y_slice[k], n_outputs)
                    });
                    let grads = self.backward(&caches, d_output)?;

                    match batch_grads.as_mut() {
                        Some(total) => {
                            for (t, g) in total.iter_mut().zip(&grads) {
                                t.scaled_add(1.0, g)?;
                            }
                        }
                        None => batch_grads = Some(grads),
                    }

                    predictions.extend(out_slice);
                    truth.extend(y_slice);
                }

                if let Some(mut total) = batch_grads {
                    let scale = 1.0 / batch.len() as f64;
                    for g in total.iter_mut() {
                        g.scale(scale);
                    }
                    self.apply_gradients(&total)?;
                }
            }

            let loss = loss_sum / samples as f64;
            let metrics: Vec<(MetricKind, f64)> = self
                .metrics
                .iter()
                .map(|&kind| (kind, compute_metric(kind, &predictions, &truth)))
                .collect();

            debug!(
                "📈 Época {}/{}: loss={:.6} {} | {:.2}s",
                epoch,
                epochs,
                loss,
                metrics
                    .iter()
                    .map(|(k, v)| format!("{}={:.6}", k, v))
                    .collect::<Vec<_>>()
                    .join(" "),
                epoch_start.elapsed().as_secs_f64()
            );

            history.push(EpochRecord { epoch, loss, metrics });
        }

        Ok(history)
    }

    /// Predicts every sample of a `(samples, steps, features)` tensor.
    pub fn predict(&self, inputs: &Array3<f64>) -> Result<Array2<f64>, TrainingError> {
        let (samples, steps, features) = inputs.dim();
        self.check_sequence((steps, features))?;

        let rows: Vec<Array1<f64>> = (0..samples)
            .into_par_iter()
            .map(|i| self.forward(inputs.index_axis(Axis(0), i)))
            .collect::<Result<Vec<_>, TrainingError>>()?;

        let n_outputs = self.output_units();
        let mut out = Array2::zeros((samples, n_outputs));
        for (i, row) in rows.iter().enumerate() {
            out.row_mut(i).assign(row);
        }
        Ok(out)
    }
}

/// Keras-style architecture table.
pub struct ModelSummary<'a> {
    model: &'a CompiledModel,
}

impl fmt::Display for ModelSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "_".repeat(65);
        let double = "=".repeat(65);
        writeln!(f, "Model: \"sequential\"")?;
        writeln!(f, "{}", rule)?;
        writeln!(f, " {:<28}{:<26}{}", "Layer (type)", "Output Shape", "Param #")?;
        writeln!(f, "{}", double)?;

        let mut dense_seen = 0;
        for layer in &self.model.layers {
            let name = match layer {
                Layer::Lstm(_) => "lstm".to_string(),
                Layer::Dense(_) => {
                    let name = if dense_seen == 0 {
                        "dense".to_string()
                    } else {
                        format!("dense_{}", dense_seen)
                    };
                    dense_seen += 1;
                    name
                }
            };
            writeln!(
                f,
                " {:<28}{:<26}{}",
                format!("{} ({})", name, layer.kind()),
                format!("(None, {})", layer.units()),
                layer.num_parameters()
            )?;
        }

        let total = self.model.num_parameters();
        writeln!(f, "{}", double)?;
        writeln!(f, "Total params: {}", total)?;
        writeln!(f, "Trainable params: {}", total)?;
        writeln!(f, "Non-trainable params: 0")?;
        write!(f, "{}", rule)
    }
}

/// Builds and compiles the fixed Input → LSTM → Dense ×3 stack from the configuration.
pub fn build_model(config: &ModelConfig) -> Result<CompiledModel, TrainingError> {
    info!("🛠️ Started: creation of ML model");

    let units = config.raw.dense_units;
    let mut model = SequentialModel::new(config.input_shape, config.raw.seed)?;
    model
        .add(LayerSpec::Lstm {
            units: config.raw.hidden_units,
            activation: config.recurrent_activation(),
        })?
        .add(LayerSpec::Dense { units, activation: config.dense_activation() })?
        .add(LayerSpec::Dense { units, activation: config.dense_activation() })?
        .add(LayerSpec::Dense { units, activation: config.dense_activation() })?;

    let compiled = model.compile(config.loss, &config.metrics, config.optimizer)?;
    info!(
        "✅ Ended: creation of ML model ({} parameters)",
        compiled.num_parameters()
    );
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::config::RawConfig;
    use crate::neural::data::create_windows;
    use std::path::PathBuf;

    fn raw(total_points: usize, hidden_units: usize, dense_units: usize) -> RawConfig {
        RawConfig {
            total_points,
            hidden_units,
            dense_units,
            number_of_epochs: 5,
            parcel_data_train: 0.8,
            learning_rate: 0.01,
            batch_size: 1,
            data_path: PathBuf::from("unused.csv"),
            region_name: "test".to_string(),
            seed: Some(42),
            loss_chart_path: PathBuf::from("unused.html"),
        }
    }

    #[test]
    fn test_end_to_end_shapes() {
        let config = ModelConfig::from_raw(raw(24, 12, 1)).unwrap();
        let model = build_model(&config).unwrap();

        assert_eq!(model.input_shape(), (12, 1));
        assert_eq!(model.output_units(), 1);
        assert_eq!(model.layers().len(), 4);
        assert_eq!(model.num_parameters(), 672 + 13 + 2 + 2);
        assert_eq!(model.metrics(), &[MetricKind::Mae, MetricKind::Rmse, MetricKind::Mse, MetricKind::R2]);
    }

    #[test]
    fn test_summary_lists_layers() {
        let config = ModelConfig::from_raw(raw(24, 12, 1)).unwrap();
        let model = build_model(&config).unwrap();
        let text = model.summary().to_string();

        assert!(text.contains("lstm (LSTM)"));
        assert!(text.contains("dense_2 (Dense)"));
        assert!(text.contains("(None, 12)"));
        assert!(text.contains("Total params: 689"));
    }

    #[test]
    fn test_layer_ordering_enforced() {
        let mut model = SequentialModel::new((4, 1), Some(1)).unwrap();
        assert!(model.add(LayerSpec::Dense { units: 1, activation: Activation::Sigmoid }).is_err());

        model.add(LayerSpec::Lstm { units: 3, activation: Activation::Relu }).unwrap();
        assert!(model.add(LayerSpec::Lstm { units: 3, activation: Activation::Relu }).is_err());

        let empty = SequentialModel::new((4, 1), Some(1)).unwrap();
        let optimizer = OptimizerKind::Adam { learning_rate: 0.001 };
        assert!(empty.compile(LossKind::Mse, &[], optimizer).is_err());
    }

    #[test]
    fn test_fit_reduces_loss() {
        let config = ModelConfig::from_raw(raw(10, 4, 1)).unwrap();
        let mut model = build_model(&config).unwrap();

        // bounded periodic series the sigmoid head can reach
        let series: Vec<f64> = (0..60).map(|i| 0.7 + 0.2 * (i as f64 * 0.5).sin()).collect();
        let windows = create_windows(&series, 6, 1).unwrap();

        let history = model.fit(&windows.inputs, &windows.targets, 30, 1).unwrap();
        let losses = history.loss();

        assert_eq!(losses.len(), 30);
        assert!(losses.iter().all(|l| l.is_finite()));
        assert!(losses[29] < losses[0], "first {} last {}", losses[0], losses[29]);
        assert_eq!(history.metric(MetricKind::R2).map(|v| v.len()), Some(30));
    }

    #[test]
    fn test_fit_with_batches() {
        let config = ModelConfig::from_raw(raw(8, 4, 2)).unwrap();
        let mut model = build_model(&config).unwrap();
        let series: Vec<f64> = (0..30).map(|i| 0.4 + 0.1 * (i % 5) as f64).collect();
        let windows = create_windows(&series, 4, 2).unwrap();

        let history = model.fit(&windows.inputs, &windows.targets, 3, 4).unwrap();
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_fit_rejects_mismatched_tensors() {
        let config = ModelConfig::from_raw(raw(24, 12, 1)).unwrap();
        let mut model = build_model(&config).unwrap();
        let series: Vec<f64> = (0..40).map(|i| i as f64 / 40.0).collect();

        let wrong_steps = create_windows(&series, 23, 1).unwrap();
        let err = model.fit(&wrong_steps.inputs, &wrong_steps.targets, 1, 1);
        assert!(matches!(err, Err(TrainingError::Shape(_))));

        let wrong_horizon = create_windows(&series, 12, 2).unwrap();
        let err = model.fit(&wrong_horizon.inputs, &wrong_horizon.targets, 1, 1);
        assert!(matches!(err, Err(TrainingError::Shape(_))));

        let empty = create_windows(&series[..5], 12, 1).unwrap();
        let err = model.fit(&empty.inputs, &empty.targets, 1, 1);
        assert!(matches!(err, Err(TrainingError::Training(_))));
    }

    #[test]
    fn test_predict_matches_forward() {
        let config = ModelConfig::from_raw(raw(10, 4, 1)).unwrap();
        let model = build_model(&config).unwrap();
        let series: Vec<f64> = (0..20).map(|i| i as f64 / 20.0).collect();
        let windows = create_windows(&series, 6, 1).unwrap();

        let predictions = model.predict(&windows.inputs).unwrap();
        assert_eq!(predictions.dim(), (windows.len(), 1));

        let single = model.forward(windows.inputs.index_axis(Axis(0), 3)).unwrap();
        assert!((predictions[[3, 0]] - single[0]).abs() < 1e-12);
        assert!(predictions.iter().all(|&p| p > 0.0 && p < 1.0));
    }

    #[test]
    fn test_same_seed_same_weights() {
        let config = ModelConfig::from_raw(raw(10, 4, 1)).unwrap();
        let a = build_model(&config).unwrap();
        let b = build_model(&config).unwrap();
        let input = Array2::from_elem((6, 1), 0.3);
        assert_eq!(a.forward(input.view()).unwrap(), b.forward(input.view()).unwrap());
    }
}
