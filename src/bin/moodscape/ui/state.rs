//! What the UI shows, refreshed from the orchestrator each frame.

use std::collections::VecDeque;

use ratatui::style::Color;

use moodscape::orchestrator::{DebugState, Notice, NoticeLevel};
use moodscape::Orchestrator;

/// Notices kept for display
const NOTICE_HISTORY: usize = 8;

pub struct UiState {
    /// Mood keys in book order; keys 1-9 pick from here
    pub moods: Vec<String>,
    pub debug: DebugState,
    pub notices: VecDeque<Notice>,
    pub sample_rate: f32,
}

impl UiState {
    pub fn new(orchestrator: &Orchestrator, sample_rate: f32) -> Self {
        Self {
            moods: orchestrator.moods().keys().map(str::to_string).collect(),
            debug: orchestrator.debug_state(),
            notices: VecDeque::with_capacity(NOTICE_HISTORY),
            sample_rate,
        }
    }

    pub fn refresh(&mut self, orchestrator: &mut Orchestrator) {
        for notice in orchestrator.take_notices() {
            if self.notices.len() == NOTICE_HISTORY {
                self.notices.pop_front();
            }
            self.notices.push_back(notice);
        }
        self.debug = orchestrator.debug_state();
    }

    /// 1-based position of the current mood, for the transport bar.
    pub fn mood_slot(&self) -> Option<usize> {
        let current = self.debug.current_mood.as_deref()?;
        self.moods.iter().position(|m| m == current).map(|i| i + 1)
    }
}

pub fn notice_color(level: NoticeLevel) -> Color {
    match level {
        NoticeLevel::Info => Color::Cyan,
        NoticeLevel::Warning => Color::Yellow,
        NoticeLevel::Error => Color::Red,
    }
}
