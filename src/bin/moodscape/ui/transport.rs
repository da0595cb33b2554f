//! Transport bar widget - mood, play state, volume, engine status and levels

use ratatui::{
    layout::Rect,
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

use moodscape::orchestrator::{EngineStatus, MoodState};

use super::UiState;

pub struct AudioStats {
    pub peak: f32,
    pub rms: f32,
}

impl AudioStats {
    pub fn from_buffer(buffer: &[f32]) -> Self {
        let peak = buffer.iter().fold(0.0f32, |acc, &x| acc.max(x.abs()));
        Self {
            peak,
            rms: moodscape::orchestrator::health::rms(buffer),
        }
    }
}

fn status_style(status: EngineStatus) -> (&'static str, Color) {
    match status {
        EngineStatus::Idle => ("idle", Color::DarkGray),
        EngineStatus::Running => ("ok", Color::Green),
        EngineStatus::Recovering => ("recovering", Color::Yellow),
        EngineStatus::Failed => ("failed", Color::Red),
    }
}

pub fn render_transport(frame: &mut Frame, area: Rect, state: &UiState, audio_stats: &AudioStats) {
    let block = Block::default().title(" moodscape ").borders(Borders::ALL);
    let debug = &state.debug;

    let mood = match (&debug.current_mood, &debug.target_mood, debug.state) {
        (_, Some(target), MoodState::Transitioning) => format!("→ {target}"),
        (Some(current), _, _) => current.clone(),
        _ => "-".to_string(),
    };
    let slot = state.mood_slot().map(|n| format!("[{n}] ")).unwrap_or_default();

    let (play_symbol, play_label, play_color) = if debug.playing {
        ("▶", "Playing", Color::Green)
    } else {
        ("⏸", "Paused", Color::Yellow)
    };
    let (status, status_color) = status_style(debug.status);

    let line = Line::from(vec![
        Span::styled(format!(" {slot}{mood}  "), Style::default().fg(Color::Cyan)),
        Span::styled(format!("{play_symbol} {play_label}  "), Style::default().fg(play_color)),
        Span::styled(
            format!("Vol {:>3.0}%  ", debug.volume * 100.0),
            Style::default().fg(Color::White),
        ),
        Span::styled(format!("engine: {status}  "), Style::default().fg(status_color)),
        Span::styled(
            format!("{:.1}kHz  {} nodes  ", state.sample_rate / 1000.0, debug.live_nodes),
            Style::default().fg(Color::DarkGray),
        ),
        Span::styled(
            format!("Peak: {:.2}  RMS: {:.2}", audio_stats.peak, audio_stats.rms),
            Style::default().fg(Color::Magenta),
        ),
    ]);

    frame.render_widget(Paragraph::new(line).block(block), area);
}
