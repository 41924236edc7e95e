//! Live progress TUI for the checking stage
//!
//! Consumes the pool's outcome stream and renders a gauge of probes
//! completed over total, live/failed counters and the most recent
//! results. Pressing `q` requests cooperative cancellation; the pool
//! then resolves the remaining candidates and the run finishes.

use crate::proxy::models::{ProbeOutcome, ProbeStatus};
use crate::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::collections::VecDeque;
use std::io;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Maximum number of recent results kept for display
const MAX_RECENT: usize = 100;

/// Check-progress TUI application state
pub struct CheckProgressApp {
    /// Stream of probe completions from the pool
    outcomes: mpsc::UnboundedReceiver<ProbeOutcome>,
    /// Cancels the probing stage when the user quits early
    cancel: CancellationToken,
    /// Total number of candidates being probed
    total: usize,
    /// Number of resolved probes
    checked: usize,
    /// Number of live proxies found
    live_count: usize,
    /// Number of failed probes
    failed_count: usize,
    /// Recent live results (VecDeque for O(1) rotation)
    recent_live: VecDeque<ProbeOutcome>,
    /// Recent failed results
    recent_failed: VecDeque<ProbeOutcome>,
    /// Selected list (0 = live, 1 = failed)
    selected_list: usize,
    /// Selected item in the current list
    list_state: ListState,
    /// Status message
    status_message: String,
    /// Whether checking is complete
    is_complete: bool,
    /// Whether the user wants to quit
    should_quit: bool,
}

impl CheckProgressApp {
    pub fn new(
        outcomes: mpsc::UnboundedReceiver<ProbeOutcome>,
        total: usize,
        cancel: CancellationToken,
    ) -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            outcomes,
            cancel,
            total,
            checked: 0,
            live_count: 0,
            failed_count: 0,
            recent_live: VecDeque::new(),
            recent_failed: VecDeque::new(),
            selected_list: 0,
            list_state,
            status_message: "Checking proxies... Press 'q' to cancel.".to_string(),
            is_complete: false,
            should_quit: false,
        }
    }

    /// Run the TUI application until the check completes or is quit
    pub async fn run(&mut self) -> Result<()> {
        // Setup terminal
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal).await;

        // Restore terminal
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
            terminal.draw(|f| self.ui(f))?;

            // Handle key events with a short timeout
            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code);
                        if self.should_quit {
                            break;
                        }
                    }
                }
            }

            // Drain available results without blocking
            loop {
                match self.outcomes.try_recv() {
                    Ok(outcome) => self.record(outcome),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        if !self.is_complete {
                            self.is_complete = true;
                            self.status_message = format!(
                                "Complete! Checked: {} | Live: {} | Failed: {} | Press 'q' to quit",
                                self.checked, self.live_count, self.failed_count
                            );
                        }
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn record(&mut self, outcome: ProbeOutcome) {
        self.checked += 1;

        if outcome.is_alive() {
            self.live_count += 1;
            self.recent_live.push_back(outcome);
            if self.recent_live.len() > MAX_RECENT {
                self.recent_live.pop_front();
            }
        } else {
            self.failed_count += 1;
            self.recent_failed.push_back(outcome);
            if self.recent_failed.len() > MAX_RECENT {
                self.recent_failed.pop_front();
            }
        }

        if !self.is_complete {
            let percentage = if self.total > 0 {
                (self.checked as f64 / self.total as f64 * 100.0) as u32
            } else {
                100
            };
            self.status_message = format!(
                "Checking... {}% ({}/{}) | Live: {} | Failed: {}",
                percentage, self.checked, self.total, self.live_count, self.failed_count
            );
        }
    }

    fn handle_input(&mut self, key: KeyCode) {
        match key {
            KeyCode::Char('q') | KeyCode::Esc => {
                // Quitting mid-run cancels the remaining probes
                self.cancel.cancel();
                self.should_quit = true;
            }
            KeyCode::Tab => {
                self.selected_list = (self.selected_list + 1) % 2;
                self.list_state.select(Some(0));
            }
            KeyCode::Down => {
                let len = self.current_list_len();
                let i = match self.list_state.selected() {
                    Some(i) if i >= len.saturating_sub(1) => 0,
                    Some(i) => i + 1,
                    None => 0,
                };
                self.list_state.select(Some(i));
            }
            KeyCode::Up => {
                let len = self.current_list_len();
                let i = match self.list_state.selected() {
                    Some(0) | None => len.saturating_sub(1),
                    Some(i) => i - 1,
                };
                self.list_state.select(Some(i));
            }
            _ => {}
        }
    }

    fn current_list_len(&self) -> usize {
        if self.selected_list == 0 {
            self.recent_live.len()
        } else {
            self.recent_failed.len()
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Title
                Constraint::Length(3), // Progress bar
                Constraint::Min(0),    // Result lists
                Constraint::Length(3), // Status bar
            ])
            .split(f.size());

        let title = Paragraph::new("Proxy Sweep")
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let progress = if self.total > 0 {
            (self.checked as f64 / self.total as f64 * 100.0) as u16
        } else {
            0
        };
        let progress_label = format!("{}/{} ({}%)", self.checked, self.total, progress);
        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Progress"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(progress.min(100))
            .label(progress_label);
        f.render_widget(gauge, chunks[1]);

        let result_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[2]);

        Self::render_result_list(
            f,
            result_chunks[0],
            "Live",
            &self.recent_live,
            self.live_count,
            self.selected_list == 0,
            Color::Green,
            if self.selected_list == 0 {
                Some(&mut self.list_state)
            } else {
                None
            },
        );

        Self::render_result_list(
            f,
            result_chunks[1],
            "Failed",
            &self.recent_failed,
            self.failed_count,
            self.selected_list == 1,
            Color::Red,
            if self.selected_list == 1 {
                Some(&mut self.list_state)
            } else {
                None
            },
        );

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

    #[allow(clippy::too_many_arguments)]
    fn render_result_list(
        f: &mut Frame,
        area: Rect,
        title: &str,
        results: &VecDeque<ProbeOutcome>,
        total_count: usize,
        is_selected: bool,
        color: Color,
        list_state: Option<&mut ListState>,
    ) {
        let items: Vec<ListItem> = results
            .iter()
            .rev() // Show newest first
            .map(|outcome| {
                let content = match (&outcome.status, outcome.latency) {
                    (ProbeStatus::Alive, Some(latency)) => {
                        format!("{} ({}ms)", outcome.candidate.addr(), latency.as_millis())
                    }
                    (ProbeStatus::Dead(reason), _) => {
                        format!("{} ({})", outcome.candidate.addr(), reason)
                    }
                    (ProbeStatus::TimedOut, _) => {
                        format!("{} (timeout)", outcome.candidate.addr())
                    }
                    (ProbeStatus::Error(reason), _) => {
                        format!("{} ({})", outcome.candidate.addr(), reason)
                    }
                    (ProbeStatus::Alive, None) => outcome.candidate.addr(),
                };
                ListItem::new(content).style(Style::default().fg(color))
            })
            .collect();

        let block_title = format!("{} ({})", title, total_count);
        let border_style = if is_selected {
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };

        let list = List::new(items)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(block_title)
                    .border_style(border_style),
            )
            .highlight_style(Style::default().bg(Color::DarkGray))
            .highlight_symbol(">> ");

        if let Some(state) = list_state {
            f.render_stateful_widget(list, area, state);
        } else {
            f.render_widget(list, area);
        }
    }
}
