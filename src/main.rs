// projeto: speitrain
// file: src/main.rs
// Treinamento de rede LSTM para previsão do índice de seca SPEI

mod neural;

use chrono::Utc;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::time::Instant;

use crate::neural::network::default_prediction_chart_path;
use crate::neural::{NeuralNetwork, SpeiDataProcessor, TrainingError};

#[derive(Parser, Debug)]
#[command(
    name = "spei-train",
    version = "0.1.0",
    about = "Treina uma rede LSTM para previsão do SPEI de uma região",
    long_about = "Carrega os hiperparâmetros de um arquivo JSON, monta a rede LSTM → Dense ×3, treina com os dados de SPEI da região e gera o gráfico da curva de perda."
)]
struct Cli {
    /// Arquivo de hiperparâmetros (JSON ou TOML)
    config: PathBuf,

    /// Modo verboso de logging
    #[arg(long)]
    verbose: bool,

    /// Abrir os gráficos no navegador
    #[arg(long)]
    show: bool,

    /// Avaliar o modelo treinado nas parcelas de treino e teste
    #[arg(long)]
    evaluate: bool,

    /// Exportar o histórico de treinamento em CSV
    #[arg(long)]
    history_csv: Option<PathBuf>,
}

fn main() -> Result<(), TrainingError> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let start_time = Instant::now();
    info!("🚀 Sistema de previsão SPEI iniciado");
    info!("🕐 Iniciado em: {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));

    match run(&cli) {
        Ok(_) => {
            info!("✅ Concluído com sucesso em {:.2}s", start_time.elapsed().as_secs_f64());
        }
        Err(e) => {
            error!("❌ Erro durante treinamento: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_secs()
        .init();
}

fn run(cli: &Cli) -> Result<(), TrainingError> {
    let mut network = NeuralNetwork::new(&cli.config, SpeiDataProcessor::new())?.with_show_charts(cli.show);

    let history = network.train_ml_model()?;
    if let Some(path) = &cli.history_csv {
        history.save_to_csv(path)?;
    }

    if cli.evaluate {
        let chart = default_prediction_chart_path(&network.configs().raw.loss_chart_path);
        network.apply_ml_model(chart)?;
    }

    Ok(())
}
