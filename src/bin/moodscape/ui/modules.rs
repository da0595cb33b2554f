//! Module table: one row per live module, then the retiring ones.

use ratatui::{
    layout::{Constraint, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Cell, Row, Table},
    Frame,
};

use super::UiState;

pub fn render_modules(frame: &mut Frame, area: Rect, state: &UiState) {
    let header = Row::new(["module", "kind", "state", "voices", "vol", "occ", "int", "errors"])
        .style(Style::default().fg(Color::DarkGray).add_modifier(Modifier::BOLD));

    let live = state.debug.modules.iter().map(|m| {
        let (label, color) = match (m.enabled, m.playing) {
            (false, _) => ("disabled", Color::Red),
            (true, true) => ("playing", Color::Green),
            (true, false) => ("stopped", Color::Yellow),
        };
        Row::new(vec![
            Cell::from(m.id.clone()),
            Cell::from(m.kind.clone()),
            Cell::from(label).style(Style::default().fg(color)),
            Cell::from(m.voices.to_string()),
            Cell::from(format!("{:.0}", m.config.volume)),
            Cell::from(format!("{:.0}", m.config.occurrence)),
            Cell::from(format!("{:.0}", m.config.intensity)),
            Cell::from(m.errors.to_string()).style(Style::default().fg(if m.errors > 0 {
                Color::Red
            } else {
                Color::DarkGray
            })),
        ])
    });
    let retiring = state.debug.retiring.iter().map(|id| {
        Row::new(vec![Cell::from(id.clone()), Cell::from(""), Cell::from("fading")])
            .style(Style::default().fg(Color::DarkGray))
    });

    let widths = [
        Constraint::Length(12),
        Constraint::Length(8),
        Constraint::Length(10),
        Constraint::Length(7),
        Constraint::Length(5),
        Constraint::Length(5),
        Constraint::Length(5),
        Constraint::Length(7),
    ];
    let title = format!(" Modules ({} timers pending) ", state.debug.pending_timers);
    let table = Table::new(live.chain(retiring), widths)
        .header(header)
        .block(Block::default().title(title).borders(Borders::ALL));
    frame.render_widget(table, area);
}
