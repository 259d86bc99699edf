// projeto: speitrain
// file: src/neural/plot.rs
// Loss curve and prediction charts rendered to HTML with plotly

use chrono::NaiveDate;
use log::info;
use plotly::color::NamedColor;
use plotly::common::{Line, Mode, Title};
use plotly::layout::Axis;
use plotly::{Layout, Plot, Scatter};
use std::fs;
use std::path::Path;

use crate::neural::metrics::History;
use crate::neural::utils::TrainingError;

pub fn loss_chart(history: &History) -> Plot {
    let epochs: Vec<usize> = history.epochs.iter().map(|e| e.epoch).collect();

    let trace = Scatter::new(epochs, history.loss())
        .name("loss")
        .mode(Mode::Lines)
        .line(Line::new().color(NamedColor::Black));

    let layout = Layout::new()
        .x_axis(Axis::new().title(Title::from("Epoch")))
        .y_axis(Axis::new().title(Title::from("Mean Squared Error (MSE)")))
        .show_legend(true);

    let mut plot = Plot::new();
    plot.add_trace(trace);
    plot.set_layout(layout);
    plot
}

/// True vs predicted SPEI for one partition, indexed by target month.
pub fn prediction_chart(title: &str, months: &[NaiveDate], truth: &[f64], predicted: &[f64]) -> Plot {
    let labels: Vec<String> = months.iter().map(|m| m.format("%Y-%m").to_string()).collect();

    let true_trace = Scatter::new(labels.clone(), truth.to_vec())
        .name("SPEI observado")
        .mode(Mode::Lines)
        .line(Line::new().color(NamedColor::Black));
    let pred_trace = Scatter::new(labels, predicted.to_vec())
        .name("SPEI previsto")
        .mode(Mode::Lines)
        .line(Line::new().color(NamedColor::Red));

    let layout = Layout::new()
        .title(Title::from(title))
        .x_axis(Axis::new().title(Title::from("Mês")))
        .y_axis(Axis::new().title(Title::from("SPEI")));

    let mut plot = Plot::new();
    plot.add_trace(true_trace);
    plot.add_trace(pred_trace);
    plot.set_layout(layout);
    plot
}

/// Writes the chart as a standalone HTML page, opening it in a browser when `show` is set.
pub fn save_chart<P: AsRef<Path>>(plot: &Plot, path: P, show: bool) -> Result<(), TrainingError> {
    let path = path.as_ref();
    fs::write(path, plot.to_html())?;
    info!("📈 Gráfico salvo em: {}", path.display());
    if show {
        plot.show();
    }
    Ok(())
}
