// projeto: speitrain
// file: src/neural/layers.rs
// LSTM and Dense layers with forward caches and backpropagation

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::neural::utils::{Activation, AdamOptimizer, TrainingError, glorot_uniform, sigmoid};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmLayerWeights {
    pub w_ii: Array2<f64>, // Input gate input weights
    pub w_if: Array2<f64>, // Forget gate input weights
    pub w_ig: Array2<f64>, // Cell gate input weights
    pub w_io: Array2<f64>, // Output gate input weights
    pub w_hi: Array2<f64>, // Input gate hidden weights
    pub w_hf: Array2<f64>, // Forget gate hidden weights
    pub w_hg: Array2<f64>, // Cell gate hidden weights
    pub w_ho: Array2<f64>, // Output gate hidden weights
    pub b_i: Array1<f64>,  // Input gate bias
    pub b_f: Array1<f64>,  // Forget gate bias
    pub b_g: Array1<f64>,  // Cell gate bias
    pub b_o: Array1<f64>,  // Output gate bias
}

impl LstmLayerWeights {
    fn zeros_like(other: &LstmLayerWeights) -> Self {
        LstmLayerWeights {
            w_ii: Array2::zeros(other.w_ii.raw_dim()),
            w_if: Array2::zeros(other.w_if.raw_dim()),
            w_ig: Array2::zeros(other.w_ig.raw_dim()),
            w_io: Array2::zeros(other.w_io.raw_dim()),
            w_hi: Array2::zeros(other.w_hi.raw_dim()),
            w_hf: Array2::zeros(other.w_hf.raw_dim()),
            w_hg: Array2::zeros(other.w_hg.raw_dim()),
            w_ho: Array2::zeros(other.w_ho.raw_dim()),
            b_i: Array1::zeros(other.b_i.raw_dim()),
            b_f: Array1::zeros(other.b_f.raw_dim()),
            b_g: Array1::zeros(other.b_g.raw_dim()),
            b_o: Array1::zeros(other.b_o.raw_dim()),
        }
    }

    fn scaled_add(&mut self, alpha: f64, other: &LstmLayerWeights) {
        self.w_ii.scaled_add(alpha, &other.w_ii);
        self.w_if.scaled_add(alpha, &other.w_if);
        self.w_ig.scaled_add(alpha, &other.w_ig);
        self.w_io.scaled_add(alpha, &other.w_io);
        self.w_hi.scaled_add(alpha, &other.w_hi);
        self.w_hf.scaled_add(alpha, &other.w_hf);
        self.w_hg.scaled_add(alpha, &other.w_hg);
        self.w_ho.scaled_add(alpha, &other.w_ho);
        self.b_i.scaled_add(alpha, &other.b_i);
        self.b_f.scaled_add(alpha, &other.b_f);
        self.b_g.scaled_add(alpha, &other.b_g);
        self.b_o.scaled_add(alpha, &other.b_o);
    }
}

/// Recurrent layer returning only the last hidden state.
/// Gates use sigmoid; `activation` drives the cell candidate and the cell output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmLayer {
    pub units: usize,
    pub input_size: usize,
    pub activation: Activation,
    pub weights: LstmLayerWeights,
}

struct LstmStep {
    x: Array1<f64>,
    h_prev: Array1<f64>,
    c_prev: Array1<f64>,
    i: Array1<f64>,
    f: Array1<f64>,
    o: Array1<f64>,
    g: Array1<f64>,
    g_pre: Array1<f64>,
    c: Array1<f64>,
}

pub struct LstmCache {
    steps: Vec<LstmStep>,
}

impl LstmLayer {
    pub fn new<R: Rng + ?Sized>(
        input_size: usize,
        units: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self, TrainingError> {
        if units == 0 || input_size == 0 {
            return Err(TrainingError::ModelConfiguration(format!(
                "LSTM needs positive sizes (input {}, units {})",
                input_size, units
            )));
        }

        let gates = 4 * units;
        let weights = LstmLayerWeights {
            w_ii: glorot_uniform(units, input_size, input_size, gates, rng)?,
            w_if: glorot_uniform(units, input_size, input_size, gates, rng)?,
            w_ig: glorot_uniform(units, input_size, input_size, gates, rng)?,
            w_io: glorot_uniform(units, input_size, input_size, gates, rng)?,
            w_hi: glorot_uniform(units, units, units, gates, rng)?,
            w_hf: glorot_uniform(units, units, units, gates, rng)?,
            w_hg: glorot_uniform(units, units, units, gates, rng)?,
            w_ho: glorot_uniform(units, units, units, gates, rng)?,
            b_i: Array1::zeros(units),
            // unit forget bias
            b_f: Array1::ones(units),
            b_g: Array1::zeros(units),
            b_o: Array1::zeros(units),
        };

        Ok(LstmLayer {
            units,
            input_size,
            activation,
            weights,
        })
    }

    pub fn num_parameters(&self) -> usize {
        4 * (self.units * (self.input_size + self.units) + self.units)
    }

    pub fn forward(&self, input: ArrayView2<f64>) -> Array1<f64> {
        let (hidden, _) = self.run(input, false);
        hidden
    }

    pub fn forward_train(&self, input: ArrayView2<f64>) -> (Array1<f64>, LstmCache) {
        self.run(input, true)
    }

    fn run(&self, input: ArrayView2<f64>, keep: bool) -> (Array1<f64>, LstmCache) {
        let w = &self.weights;
        let mut hidden = Array1::zeros(self.units);
        let mut cell = Array1::zeros(self.units);
        let mut steps = Vec::new();

        for x_t in input.axis_iter(Axis(0)) {
            let i_t = sigmoid(&(w.w_ii.dot(&x_t) + w.w_hi.dot(&hidden) + &w.b_i));
            let f_t = sigmoid(&(w.w_if.dot(&x_t) + w.w_hf.dot(&hidden) + &w.b_f));
            let o_t = sigmoid(&(w.w_io.dot(&x_t) + w.w_ho.dot(&hidden) + &w.b_o));
            let g_pre = w.w_ig.dot(&x_t) + w.w_hg.dot(&hidden) + &w.b_g;
            let g_t = self.activation.forward(&g_pre);

            let c_t = &f_t * &cell + &i_t * &g_t;
            let h_t = &o_t * &self.activation.forward(&c_t);

            if keep {
                steps.push(LstmStep {
                    x: x_t.to_owned(),
                    h_prev: hidden.clone(),
                    c_prev: cell.clone(),
                    i: i_t,
                    f: f_t,
                    o: o_t,
                    g: g_t,
                    g_pre,
                    c: c_t.clone(),
                });
            }

            hidden = h_t;
            cell = c_t;
        }

        (hidden, LstmCache { steps })
    }

    /// Backpropagation through time from the gradient on the last hidden state.
    pub fn backward(&self, cache: &LstmCache, d_hidden: &Array1<f64>) -> LstmLayerWeights {
        let w = &self.weights;
        let mut grads = LstmLayerWeights::zeros_like(w);
        let mut dh = d_hidden.clone();
        let mut dc: Array1<f64> = Array1::zeros(self.units);

        for step in cache.steps.iter().rev() {
            let act_c = self.activation.forward(&step.c);
            let d_o = &dh * &act_c;
            dc = dc + &dh * &step.o * &self.activation.backward(&step.c);

            let d_i = &dc * &step.g;
            let d_g = &dc * &step.i;
            let d_f = &dc * &step.c_prev;

            let di_raw = &d_i * &step.i.mapv(|v| v * (1.0 - v));
            let df_raw = &d_f * &step.f.mapv(|v| v * (1.0 - v));
            let do_raw = &d_o * &step.o.mapv(|v| v * (1.0 - v));
            let dg_raw = &d_g * &self.activation.backward(&step.g_pre);

            accumulate_outer(&mut grads.w_ii, &di_raw, &step.x);
            accumulate_outer(&mut grads.w_if, &df_raw, &step.x);
            accumulate_outer(&mut grads.w_ig, &dg_raw, &step.x);
            accumulate_outer(&mut grads.w_io, &do_raw, &step.x);
            accumulate_outer(&mut grads.w_hi, &di_raw, &step.h_prev);
            accumulate_outer(&mut grads.w_hf, &df_raw, &step.h_prev);
            accumulate_outer(&mut grads.w_hg, &dg_raw, &step.h_prev);
            accumulate_outer(&mut grads.w_ho, &do_raw, &step.h_prev);
            grads.b_i += &di_raw;
            grads.b_f += &df_raw;
            grads.b_g += &dg_raw;
            grads.b_o += &do_raw;

            dh = w.w_hi.t().dot(&di_raw)
                + w.w_hf.t().dot(&df_raw)
                + w.w_hg.t().dot(&dg_raw)
                + w.w_ho.t().dot(&do_raw);
            dc = &dc * &step.f;
        }

        grads
    }

    pub fn apply_gradients(
        &mut self,
        prefix: &str,
        grads: &LstmLayerWeights,
        optimizer: &mut AdamOptimizer,
    ) -> Result<(), TrainingError> {
        let w = &mut self.weights;
        optimizer.update(&format!("{}/w_ii", prefix), &mut w.w_ii, &grads.w_ii)?;
        optimizer.update(&format!("{}/w_if", prefix), &mut w.w_if, &grads.w_if)?;
        optimizer.update(&format!("{}/w_ig", prefix), &mut w.w_ig, &grads.w_ig)?;
        optimizer.update(&format!("{}/w_io", prefix), &mut w.w_io, &grads.w_io)?;
        optimizer.update(&format!("{}/w_hi", prefix), &mut w.w_hi, &grads.w_hi)?;
        optimizer.update(&format!("{}/w_hf", prefix), &mut w.w_hf, &grads.w_hf)?;
        optimizer.update(&format!("{}/w_hg", prefix), &mut w.w_hg, &grads.w_hg)?;
        optimizer.update(&format!("{}/w_ho", prefix), &mut w.w_ho, &grads.w_ho)?;
        optimizer.update(&format!("{}/b_i", prefix), &mut w.b_i, &grads.b_i)?;
        optimizer.update(&format!("{}/b_f", prefix), &mut w.b_f, &grads.b_f)?;
        optimizer.update(&format!("{}/b_g", prefix), &mut w.b_g, &grads.b_g)?;
        optimizer.update(&format!("{}/b_o", prefix), &mut w.b_o, &grads.b_o)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayerWeights {
    pub w: Array2<f64>,
    pub b: Array1<f64>,
}

impl DenseLayerWeights {
    fn scaled_add(&mut self, alpha: f64, other: &DenseLayerWeights) {
        self.w.scaled_add(alpha, &other.w);
        self.b.scaled_add(alpha, &other.b);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseLayer {
    pub units: usize,
    pub input_size: usize,
    pub activation: Activation,
    pub weights: DenseLayerWeights,
}

pub struct DenseCache {
    input: Array1<f64>,
    pre: Array1<f64>,
}

impl DenseLayer {
    pub fn new<R: Rng + ?Sized>(
        input_size: usize,
        units: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Result<Self, TrainingError> {
        if units == 0 || input_size == 0 {
            return Err(TrainingError::ModelConfiguration(format!(
                "Dense needs positive sizes (input {}, units {})",
                input_size, units
            )));
        }

        Ok(DenseLayer {
            units,
            input_size,
            activation,
            weights: DenseLayerWeights {
                w: glorot_uniform(units, input_size, input_size, units, rng)?,
                b: Array1::zeros(units),
            },
        })
    }

    pub fn num_parameters(&self) -> usize {
        self.units * self.input_size + self.units
    }

    pub fn forward(&self, input: ArrayView1<f64>) -> Array1<f64> {
        let pre = self.weights.w.dot(&input) + &self.weights.b;
        self.activation.forward(&pre)
    }

    pub fn forward_train(&self, input: &Array1<f64>) -> (Array1<f64>, DenseCache) {
        let pre = self.weights.w.dot(input) + &self.weights.b;
        let out = self.activation.forward(&pre);
        (
            out,
            DenseCache {
                input: input.clone(),
                pre,
            },
        )
    }

    /// Returns the weight gradients and the gradient on the layer input.
    pub fn backward(&self, cache: &DenseCache, d_out: &Array1<f64>) -> (DenseLayerWeights, Array1<f64>) {
        let dz = d_out * &self.activation.backward(&cache.pre);
        let mut dw = Array2::zeros(self.weights.w.raw_dim());
        accumulate_outer(&mut dw, &dz, &cache.input);
        let d_input = self.weights.w.t().dot(&dz);
        (DenseLayerWeights { w: dw, b: dz }, d_input)
    }

    pub fn apply_gradients(
        &mut self,
        prefix: &str,
        grads: &DenseLayerWeights,
        optimizer: &mut AdamOptimizer,
    ) -> Result<(), TrainingError> {
        optimizer.update(&format!("{}/w", prefix), &mut self.weights.w, &grads.w)?;
        optimizer.update(&format!("{}/b", prefix), &mut self.weights.b, &grads.b)?;
        Ok(())
    }
}

/// Per-layer gradients, accumulated over a batch.
pub enum LayerGrads {
    Lstm(LstmLayerWeights),
    Dense(DenseLayerWeights),
}

impl LayerGrads {
    pub fn scaled_add(&mut self, alpha: f64, other: &LayerGrads) -> Result<(), TrainingError> {
        match (self, other) {
            (LayerGrads::Lstm(a), LayerGrads::Lstm(b)) => a.scaled_add(alpha, b),
            (LayerGrads::Dense(a), LayerGrads::Dense(b)) => a.scaled_add(alpha, b),
            _ => {
                return Err(TrainingError::Training(
                    "Gradient layer kinds do not line up".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn scale(&mut self, alpha: f64) {
        match self {
            LayerGrads::Lstm(g) => {
                for m in [
                    &mut g.w_ii, &mut g.w_if, &mut g.w_ig, &mut g.w_io,
                    &mut g.w_hi, &mut g.w_hf, &mut g.w_hg, &mut g.w_ho,
                ] {
                    *m *= alpha;
                }
                for b in [&mut g.b_i, &mut g.b_f, &mut g.b_g, &mut g.b_o] {
                    *b *= alpha;
                }
            }
            LayerGrads::Dense(g) => {
                g.w *= alpha;
                g.b *= alpha;
            }
        }
    }
}

fn accumulate_outer(target: &mut Array2<f64>, left: &Array1<f64>, right: &Array1<f64>) {
    let outer = left
        .view()
        .insert_axis(Axis(1))
        .dot(&right.view().insert_axis(Axis(0)));
    *target += &outer;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn sq_loss(out: &Array1<f64>) -> f64 {
        0.5 * out.mapv(|v| v * v).sum()
    }

    #[test]
    fn test_param_counts() {
        let mut rng = StdRng::seed_from_u64(1);
        let lstm = LstmLayer::new(1, 12, Activation::Relu, &mut rng).unwrap();
        assert_eq!(lstm.num_parameters(), 672);
        let dense = DenseLayer::new(12, 1, Activation::Sigmoid, &mut rng).unwrap();
        assert_eq!(dense.num_parameters(), 13);
    }

    #[test]
    fn test_forget_bias_starts_at_one() {
        let mut rng = StdRng::seed_from_u64(1);
        let lstm = LstmLayer::new(1, 4, Activation::Relu, &mut rng).unwrap();
        assert!(lstm.weights.b_f.iter().all(|&b| b == 1.0));
        assert!(lstm.weights.b_i.iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_zero_units_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(LstmLayer::new(1, 0, Activation::Relu, &mut rng).is_err());
        assert!(DenseLayer::new(0, 1, Activation::Sigmoid, &mut rng).is_err());
    }

    #[test]
    fn test_dense_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut layer = DenseLayer::new(3, 2, Activation::Sigmoid, &mut rng).unwrap();
        let input = array![0.3, -0.7, 1.1];

        let (out, cache) = layer.forward_train(&input);
        let (grads, d_input) = layer.backward(&cache, &out);

        let eps = 1e-6;
        for r in 0..2 {
            for c in 0..3 {
                let orig = layer.weights.w[[r, c]];
                layer.weights.w[[r, c]] = orig + eps;
                let plus = sq_loss(&layer.forward(input.view()));
                layer.weights.w[[r, c]] = orig - eps;
                let minus = sq_loss(&layer.forward(input.view()));
                layer.weights.w[[r, c]] = orig;
                let numeric = (plus - minus) / (2.0 * eps);
                assert!((numeric - grads.w[[r, c]]).abs() < 1e-7);
            }
        }

        for c in 0..3 {
            let mut shifted = input.clone();
            shifted[c] += eps;
            let plus = sq_loss(&layer.forward(shifted.view()));
            shifted[c] -= 2.0 * eps;
            let minus = sq_loss(&layer.forward(shifted.view()));
            let numeric = (plus - minus) / (2.0 * eps);
            assert!((numeric - d_input[c]).abs() < 1e-7);
        }
    }

    #[test]
    fn test_lstm_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = LstmLayer::new(1, 3, Activation::Tanh, &mut rng).unwrap();
        let input = array![[0.5], [-0.2], [0.9], [0.1]];

        let (hidden, cache) = layer.forward_train(input.view());
        let grads = layer.backward(&cache, &hidden);

        let eps = 1e-6;
        let check = |layer: &mut LstmLayer, pick: fn(&mut LstmLayerWeights) -> &mut Array2<f64>, analytic: &Array2<f64>| {
            let (rows, cols) = analytic.dim();
            for r in 0..rows {
                for c in 0..cols {
                    let orig = pick(&mut layer.weights)[[r, c]];
                    pick(&mut layer.weights)[[r, c]] = orig + eps;
                    let plus = sq_loss(&layer.forward(input.view()));
                    pick(&mut layer.weights)[[r, c]] = orig - eps;
                    let minus = sq_loss(&layer.forward(input.view()));
                    pick(&mut layer.weights)[[r, c]] = orig;
                    let numeric = (plus - minus) / (2.0 * eps);
                    assert!(
                        (numeric - analytic[[r, c]]).abs() < 1e-6,
                        "numeric {} analytic {}",
                        numeric,
                        analytic[[r, c]]
                    );
                }
            }
        };

        check(&mut layer, |w| &mut w.w_ii, &grads.w_ii);
        check(&mut layer, |w| &mut w.w_if, &grads.w_if);
        check(&mut layer, |w| &mut w.w_ig, &grads.w_ig);
        check(&mut layer, |w| &mut w.w_io, &grads.w_io);
        check(&mut layer, |w| &mut w.w_hi, &grads.w_hi);
        check(&mut layer, |w| &mut w.w_hf, &grads.w_hf);
        check(&mut layer, |w| &mut w.w_hg, &grads.w_hg);
        check(&mut layer, |w| &mut w.w_ho, &grads.w_ho);

        for u in 0..3 {
            let orig = layer.weights.b_f[u];
            layer.weights.b_f[u] = orig + eps;
            let plus = sq_loss(&layer.forward(input.view()));
            layer.weights.b_f[u] = orig - eps;
            let minus = sq_loss(&layer.forward(input.view()));
            layer.weights.b_f[u] = orig;
            let numeric = (plus - minus) / (2.0 * eps);
            assert!((numeric - grads.b_f[u]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_grads_accumulate_and_scale() {
        let mut rng = StdRng::seed_from_u64(2);
        let layer = DenseLayer::new(2, 1, Activation::Linear, &mut rng).unwrap();
        let (out, cache) = layer.forward_train(&array![1.0, 2.0]);
        let (g, _) = layer.backward(&cache, &out);

        let mut total = LayerGrads::Dense(g.clone());
        total.scaled_add(1.0, &LayerGrads::Dense(g.clone())).unwrap();
        total.scale(0.5);

        let LayerGrads::Dense(avg) = total else { panic!("dense grads expected") };
        assert!((avg.w[[0, 1]] - g.w[[0, 1]]).abs() < 1e-12);
        assert!((avg.b[0] - g.b[0]).abs() < 1e-12);
    }
}
