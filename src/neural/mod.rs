// projeto: speitrain
// file: src/neural/mod.rs
// Module declarations for the SPEI forecasting system

pub mod utils;    // Error type, activations, Adam optimizer
pub mod config;   // Hyperparameter file and derived model settings
pub mod data;     // SPEI series split and windowing
pub mod layers;   // LSTM and Dense layers
pub mod model;    // Sequential model, compile and fit
pub mod metrics;  // Training history and regression errors
pub mod plot;     // HTML charts
pub mod network;  // Top-level forecaster

pub use config::ModelConfig;
pub use data::{DataProcessor, SpeiDataProcessor};
pub use network::NeuralNetwork;
pub use utils::TrainingError;
