//! TUI for moodscape
//!
//! The UI thread is also the host loop: every frame it ticks the
//! orchestrator, then draws what the orchestrator reports.

mod modules;
pub mod state;
mod spectrum;
mod transport;
mod waveform;

use std::time::{Duration, Instant};

use color_eyre::eyre::Result as EyreResult;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    widgets::Paragraph,
    DefaultTerminal, Frame,
};
use rtrb::Consumer;
use tracing::info;

use moodscape::{modules::ParamMap, Orchestrator};

pub use state::UiState;

use modules::render_modules;
use spectrum::render_spectrum;
use transport::{render_transport, AudioStats};
use waveform::render_waveform;

/// Samples shown by the waveform view
const VIS_BUFFER_SIZE: usize = 1024;

const VOLUME_STEP: f32 = 0.05;

pub struct UiApp {
    orchestrator: Orchestrator,
    /// Output samples from the audio callback
    audio_rx: Consumer<f32>,
    audio_buffer: Vec<f32>,
    spectrum: Vec<f32>,
    state: UiState,
    params: ParamMap,
    started: Instant,
    should_quit: bool,
}

impl UiApp {
    pub fn new(orchestrator: Orchestrator, audio_rx: Consumer<f32>, sample_rate: f32) -> Self {
        let state = UiState::new(&orchestrator, sample_rate);
        Self {
            orchestrator,
            audio_rx,
            audio_buffer: vec![0.0; VIS_BUFFER_SIZE],
            spectrum: Vec::new(),
            state,
            params: ParamMap::new(),
            started: Instant::now(),
            should_quit: false,
        }
    }

    pub fn run(&mut self, terminal: &mut DefaultTerminal) -> EyreResult<()> {
        while !self.should_quit {
            let now_ms = self.started.elapsed().as_secs_f64() * 1000.0;
            self.orchestrator.tick(now_ms, &self.params);

            self.poll_audio();
            self.spectrum = self.orchestrator.analysis_snapshot();
            self.state.refresh(&mut self.orchestrator);

            terminal.draw(|frame| self.render(frame))?;

            // ~60fps, which is also the tick rate
            if event::poll(Duration::from_millis(16))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_key(key.code);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.orchestrator.dispose();
    }

    fn poll_audio(&mut self) {
        while let Ok(sample) = self.audio_rx.pop() {
            self.audio_buffer.push(sample);
        }
        if self.audio_buffer.len() > VIS_BUFFER_SIZE {
            let excess = self.audio_buffer.len() - VIS_BUFFER_SIZE;
            self.audio_buffer.drain(..excess);
        }
    }

    fn handle_key(&mut self, key: KeyCode) {
        match key {
            KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => {
                self.should_quit = true;
            }
            KeyCode::Char(' ') => {
                let playing = !self.orchestrator.is_playing();
                self.orchestrator.set_playing(playing, None);
            }
            KeyCode::Char('+') | KeyCode::Char('=') => {
                let volume = self.orchestrator.volume() + VOLUME_STEP;
                self.orchestrator.set_volume(volume);
            }
            KeyCode::Char('-') => {
                let volume = self.orchestrator.volume() - VOLUME_STEP;
                self.orchestrator.set_volume(volume);
            }
            KeyCode::Char(c @ '1'..='9') => {
                let index = c as usize - '1' as usize;
                if let Some(key) = self.state.moods.get(index).cloned() {
                    info!(mood = %key, "mood selected");
                    if self.orchestrator.is_playing() {
                        self.orchestrator.set_playing(true, Some(&key));
                    } else {
                        self.orchestrator.change_mood(&key, false);
                    }
                }
            }
            _ => {}
        }
    }

    fn render(&self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Transport bar
                Constraint::Min(6),    // Modules
                Constraint::Length(10), // Spectrum + waveform
                Constraint::Length(1), // Notices
                Constraint::Length(1), // Help bar
            ])
            .split(frame.area());

        let stats = AudioStats::from_buffer(&self.audio_buffer);
        render_transport(frame, chunks[0], &self.state, &stats);
        render_modules(frame, chunks[1], &self.state);

        let scopes = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[2]);
        render_spectrum(frame, scopes[0], &self.spectrum);
        render_waveform(frame, scopes[1], &self.audio_buffer);

        if let Some(notice) = self.state.notices.back() {
            let line = Paragraph::new(format!(" {}", notice.message)).style(Style::default().fg(state::notice_color(notice.level)));
            frame.render_widget(line, chunks[3]);
        }

        let help = Paragraph::new(" [Q] Quit  [Space] Play/Pause  [1-9] Mood  [+/-] Volume")
            .style(Style::default().fg(Color::DarkGray));
        frame.render_widget(help, chunks[4]);
    }
}
