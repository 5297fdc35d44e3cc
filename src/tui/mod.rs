pub mod controller;
pub mod table;
pub mod text;
pub mod widgets;

use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{self, Event};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use log::warn;
use ratatui::backend::CrosstermBackend;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::error::Result;

pub type Terminal = ratatui::Terminal<CrosstermBackend<io::Stdout>>;

pub fn setup_terminal() -> Result<Terminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = ratatui::Terminal::new(backend)?;
    terminal.clear()?;
    Ok(terminal)
}

pub fn restore_terminal(terminal: &mut Terminal) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Terminal input pump: a blocking thread forwards crossterm events over
/// a channel so the controller can `select!` on them.
///
/// While suspended (an external pager owns the terminal) the thread stops
/// polling stdin entirely, so the pager receives the user's keystrokes.
pub struct InputEvents {
    rx: mpsc::UnboundedReceiver<Event>,
    suspended: Arc<AtomicBool>,
}

impl InputEvents {
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let suspended = Arc::new(AtomicBool::new(false));
        let flag = suspended.clone();

        std::thread::spawn(move || loop {
            if flag.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            match event::poll(Duration::from_millis(100)) {
                Ok(true) => match event::read() {
                    Ok(ev) => {
                        if tx.send(ev).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("terminal event read failed: {err}");
                        break;
                    }
                },
                Ok(false) => {}
                Err(err) => {
                    warn!("terminal event poll failed: {err}");
                    break;
                }
            }
        });

        Self { rx, suspended }
    }

    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    fn suspend(&self) {
        self.suspended.store(true, Ordering::Relaxed);
    }

    fn resume(&self) {
        self.suspended.store(false, Ordering::Relaxed);
    }
}

/// Releases the terminal, feeds `content` to the pager's stdin, waits for
/// it to exit, then re-initialises the screen. UI state is untouched; the
/// caller redraws afterwards.
pub async fn run_pager(
    terminal: &mut Terminal,
    events: &InputEvents,
    pager: &str,
    content: &str,
) -> Result<()> {
    events.suspend();
    restore_terminal(terminal)?;

    let spawn = tokio::process::Command::new(pager)
        .stdin(Stdio::piped())
        .spawn();
    match spawn {
        Ok(mut child) => {
            if let Some(mut stdin) = child.stdin.take() {
                // The pager may quit before reading everything.
                let _ = stdin.write_all(content.as_bytes()).await;
            }
            if let Err(err) = child.wait().await {
                warn!("pager exited abnormally: {err}");
            }
        }
        Err(err) => warn!("failed to spawn pager '{pager}': {err}"),
    }

    *terminal = setup_terminal()?;
    events.resume();
    Ok(())
}
