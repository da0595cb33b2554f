//! Spectrum widget
//!
//! Draws the orchestrator's analysis snapshot: linear magnitudes in evenly
//! spaced bins, shown in dB.

use ratatui::{
    layout::Rect,
    style::{Color, Style},
    symbols,
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType},
    Frame,
};

const FLOOR_DB: f64 = -100.0;

fn to_db(magnitude: f32) -> f64 {
    (20.0 * (magnitude.max(1e-6) as f64).log10()).max(FLOOR_DB)
}

pub fn render_spectrum(frame: &mut Frame, area: Rect, bins: &[f32]) {
    let block = Block::default().title(" Spectrum ").borders(Borders::ALL);

    let data: Vec<(f64, f64)> = bins
        .iter()
        .enumerate()
        .map(|(i, &magnitude)| (i as f64, to_db(magnitude)))
        .collect();
    let max_db = data.iter().map(|&(_, db)| db).fold(FLOOR_DB, f64::max);

    let dataset = Dataset::default()
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Bar)
        .style(Style::default().fg(Color::Green))
        .data(&data);

    let chart = Chart::new(vec![dataset])
        .block(block)
        .x_axis(
            Axis::default()
                .bounds([0.0, bins.len().max(1) as f64])
                .style(Style::default().fg(Color::DarkGray)),
        )
        .y_axis(
            Axis::default()
                .bounds([FLOOR_DB, max_db.max(0.0) + 10.0])
                .labels(vec!["-100", "-50", "0"])
                .style(Style::default().fg(Color::DarkGray)),
        );

    frame.render_widget(chart, area);
}
