//! TUI for a checking run with progress display

use crate::check::state::{RunSnapshot, RunState, Stage};
use crate::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::sync::Arc;
use tokio::time::Duration;

/// Stages shown in the stage list, in pipeline order
const STAGES: [Stage; 3] = [Stage::Alive, Stage::Speed, Stage::Media];

/// Progress dashboard state
pub struct ProgressApp {
    state: Arc<RunState>,
    snapshot: RunSnapshot,
    /// Whether a run has been observed since the app started
    started: bool,
    status_message: String,
    is_complete: bool,
    should_quit: bool,
}

impl ProgressApp {
    pub fn new(state: Arc<RunState>) -> Self {
        let snapshot = state.snapshot();
        Self {
            state,
            snapshot,
            started: false,
            status_message: "Starting node check... Press 'q' to stop.".to_string(),
            is_complete: false,
            should_quit: false,
        }
    }

    /// Run the TUI application until the user quits
    pub async fn run(&mut self) -> Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal).await;

        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;

        result
    }

    async fn run_app<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        loop {
            self.refresh();
            terminal.draw(|f| self.ui(f))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code);
                    }
                }
            }
            if self.should_quit {
                break;
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn refresh(&mut self) {
        self.snapshot = self.state.snapshot();
        if self.snapshot.checking {
            self.started = true;
        }
        let snap = &self.snapshot;
        if self.started && !snap.checking {
            self.is_complete = true;
            self.status_message = format!(
                "Complete! Checked: {} | Available: {} | Press 'q' to quit",
                snap.checked, snap.available
            );
        } else if snap.stopping {
            self.status_message =
                "Stopping... waiting for queued checks. Press 'q' again to leave.".to_string();
        } else if snap.checking {
            self.status_message = format!(
                "Checking... {:.1}% ({}/{}) | Available: {}",
                snap.percent, snap.checked, snap.total, snap.available
            );
        }
    }

    fn handle_input(&mut self, key: KeyCode) {
        match key {
            KeyCode::Char('q') | KeyCode::Esc => {
                // first press stops the run, the next one leaves
                if self.snapshot.checking && !self.snapshot.stopping {
                    self.state.request_stop();
                    self.snapshot.stopping = true;
                } else {
                    self.should_quit = true;
                }
            }
            _ => {}
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Title
                Constraint::Length(3), // Progress bar
                Constraint::Min(0),    // Counters
                Constraint::Length(3), // Status bar
            ])
            .split(f.size());

        let title = Paragraph::new("🔍 Node Sieve")
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let snap = &self.snapshot;
        let percent = snap.percent.clamp(0.0, 100.0);
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(percent as u16)
            .label(format!("{:.1}%", percent));
        f.render_widget(gauge, chunks[1]);

        let counter_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[2]);

        let counters = vec![
            Line::from(format!("Total:     {}", snap.total)),
            Line::from(format!("Checked:   {}", snap.checked)),
            Line::from(Span::styled(
                format!("Available: {}", snap.available),
                Style::default().fg(Color::Green),
            )),
            Line::from(format!(
                "Traffic:   {:.3} GB",
                snap.total_bytes as f64 / 1024.0 / 1024.0 / 1024.0
            )),
        ];
        let counters = Paragraph::new(counters)
            .block(Block::default().borders(Borders::ALL).title("Counters"));
        f.render_widget(counters, counter_chunks[0]);

        let stages: Vec<Line> = STAGES
            .iter()
            .map(|stage| {
                if *stage == snap.stage {
                    Line::from(Span::styled(
                        format!(">> {}", stage.label()),
                        Style::default()
                            .fg(Color::Cyan)
                            .add_modifier(Modifier::BOLD),
                    ))
                } else {
                    Line::from(format!("   {}", stage.label()))
                }
            })
            .collect();
        let stages = Paragraph::new(stages)
            .block(Block::default().borders(Borders::ALL).title("Stage"));
        f.render_widget(stages, counter_chunks[1]);

        let status = Paragraph::new(self.status_message.clone())
            .style(if self.is_complete {
                Style::default().fg(Color::Green)
            } else {
                Style::default().fg(Color::Yellow)
            })
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Status"));
        f.render_widget(status, chunks[3]);
    }
}
