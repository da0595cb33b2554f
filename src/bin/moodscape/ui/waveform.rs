//! Output oscilloscope
//!
//! Ambient material is quiet, so the vertical axis follows the recent peak
//! instead of sitting at full scale.

use ratatui::{
    layout::Rect,
    style::{Color, Style},
    symbols,
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType},
    Frame,
};

/// Smallest vertical range, so silence draws as a flat line
const MIN_SCALE: f32 = 0.05;

pub fn render_waveform(frame: &mut Frame, area: Rect, audio_buffer: &[f32]) {
    let peak = audio_buffer.iter().fold(MIN_SCALE, |acc, &x| acc.max(x.abs())).min(1.0);
    let block = Block::default()
        .title(format!(" Output ±{peak:.2} "))
        .borders(Borders::ALL);

    let len = audio_buffer.len().max(1) as f64;
    let data: Vec<(f64, f64)> = audio_buffer
        .iter()
        .enumerate()
        .map(|(i, &sample)| (i as f64 / len, sample as f64))
        .collect();

    let dataset = Dataset::default()
        .marker(symbols::Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(Color::Cyan))
        .data(&data);

    let chart = Chart::new(vec![dataset])
        .block(block)
        .x_axis(Axis::default().bounds([0.0, 1.0]))
        .y_axis(
            Axis::default()
                .bounds([-(peak as f64), peak as f64])
                .style(Style::default().fg(Color::DarkGray)),
        );

    frame.render_widget(chart, area);
}
