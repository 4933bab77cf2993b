pub mod render;
pub mod state;

use anyhow::Result;
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use futures_util::StreamExt;
use ratatui::prelude::*;
use state::AppState;
use std::io::stdout;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Commands the TUI sends back to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuiCommand {
    Quit,
    Refresh,
    SelectNext,
    SelectPrev,
    WatchSelected,
    Disconnect,
    ClearHistory,
}

fn command_for(code: KeyCode) -> Option<TuiCommand> {
    match code {
        KeyCode::Char('q') => Some(TuiCommand::Quit),
        KeyCode::Char('r') => Some(TuiCommand::Refresh),
        KeyCode::Char('j') | KeyCode::Down => Some(TuiCommand::SelectNext),
        KeyCode::Char('k') | KeyCode::Up => Some(TuiCommand::SelectPrev),
        KeyCode::Enter => Some(TuiCommand::WatchSelected),
        KeyCode::Char('d') => Some(TuiCommand::Disconnect),
        KeyCode::Char('c') => Some(TuiCommand::ClearHistory),
        _ => None,
    }
}

/// Run the TUI. Reads state from `state_rx`, sends commands on `cmd_tx`.
pub async fn run_tui(state_rx: watch::Receiver<AppState>, cmd_tx: mpsc::Sender<TuiCommand>) -> Result<()> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let result = tui_loop(&mut terminal, state_rx, cmd_tx).await;

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
}

async fn tui_loop(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    mut state_rx: watch::Receiver<AppState>,
    cmd_tx: mpsc::Sender<TuiCommand>,
) -> Result<()> {
    let mut events = EventStream::new();
    // Redraw at least this often so elapsed times stay fresh.
    let mut redraw = tokio::time::interval(Duration::from_millis(500));
    let mut spinner_frame: u8 = 0;

    loop {
        let state = state_rx.borrow().clone();
        terminal.draw(|f| render::draw(f, &state, spinner_frame))?;

        tokio::select! {
            _ = redraw.tick() => {
                spinner_frame = spinner_frame.wrapping_add(1);
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            maybe_event = events.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if let Some(command) = command_for(key.code) {
                            let _ = cmd_tx.send(command).await;
                            if command == TuiCommand::Quit {
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                }
            }
        }
    }
}
