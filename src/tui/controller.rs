use std::time::Instant;

use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use log::debug;
use ratatui::layout::Rect;
use ratatui::text::Line;
use ratatui::widgets::Paragraph;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::Cache;
use crate::error::{CiwatchError, Result};
use crate::git;
use crate::models::{GitRef, PipelineKey};

use super::table::{Column, ColumnId, HierarchicalTable, NodeId, TableConfig, TableNode};
use super::text::{Alignment, Class, StyledString};
use super::widgets::{CommandPrompt, TextArea};
use super::{run_pager, InputEvents, Terminal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Table,
    Search,
    Ref,
    Help,
}

/// Deferred work a key press asks for; executed by the event loop where
/// the terminal and the input pump are in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    ViewLog,
}

struct KeyBinding {
    keys: &'static [&'static str],
    action: &'static str,
}

const TABLE_KEY_BINDINGS: &[KeyBinding] = &[
    KeyBinding { keys: &["Up", "k", "Ctrl-p"], action: "Move cursor up by one line" },
    KeyBinding { keys: &["Down", "j", "Ctrl-n"], action: "Move cursor down by one line" },
    KeyBinding { keys: &["Right", "l"], action: "Scroll right" },
    KeyBinding { keys: &["Left", "h"], action: "Scroll left" },
    KeyBinding { keys: &["Ctrl-u"], action: "Move cursor up by half a page" },
    KeyBinding { keys: &["Page Up", "Ctrl-b"], action: "Move cursor up by one page" },
    KeyBinding { keys: &["Ctrl-d"], action: "Move cursor down by half a page" },
    KeyBinding { keys: &["Page Down", "Ctrl-f"], action: "Move cursor down by one page" },
    KeyBinding { keys: &["Home"], action: "Move cursor to the first line" },
    KeyBinding { keys: &["End"], action: "Move cursor to the last line" },
    KeyBinding { keys: &["<"], action: "Move sort column left" },
    KeyBinding { keys: &[">"], action: "Move sort column right" },
    KeyBinding { keys: &["!"], action: "Reverse sort order" },
    KeyBinding { keys: &["o", "+"], action: "Open the fold at the cursor" },
    KeyBinding { keys: &["O"], action: "Open the fold at the cursor and all sub-folds" },
    KeyBinding { keys: &["c", "-"], action: "Close the fold at the cursor" },
    KeyBinding { keys: &["C"], action: "Close the fold at the cursor and all sub-folds" },
    KeyBinding { keys: &["b"], action: "Open associated web page in $BROWSER" },
    KeyBinding { keys: &["v"], action: "View the log of the job at the cursor" },
    KeyBinding { keys: &["/"], action: "Open search prompt" },
    KeyBinding { keys: &["Enter", "n"], action: "Move to the next match" },
    KeyBinding { keys: &["N"], action: "Move to the previous match" },
    KeyBinding { keys: &["g"], action: "Open git reference selection prompt" },
    KeyBinding { keys: &["u"], action: "Refresh the current git reference" },
    KeyBinding { keys: &["?"], action: "Show help screen" },
    KeyBinding { keys: &["q"], action: "Quit" },
];

const SEARCH_KEY_BINDINGS: &[KeyBinding] = &[
    KeyBinding { keys: &["Enter"], action: "Search" },
    KeyBinding { keys: &["Backspace"], action: "Delete last character" },
    KeyBinding { keys: &["Ctrl-u"], action: "Delete whole line" },
    KeyBinding { keys: &["Escape"], action: "Close prompt" },
];

const REF_KEY_BINDINGS: &[KeyBinding] = &[
    KeyBinding { keys: &["Enter"], action: "Validate" },
    KeyBinding { keys: &["Backspace"], action: "Delete last character" },
    KeyBinding { keys: &["Ctrl-u"], action: "Delete whole line" },
    KeyBinding { keys: &["Tab", "Shift-Tab"], action: "Complete" },
    KeyBinding { keys: &["Up", "Down"], action: "Move through the suggestions" },
    KeyBinding { keys: &["Page Up", "Page Down"], action: "Move through the suggestions by page" },
    KeyBinding { keys: &["Escape"], action: "Close prompt" },
];

const HELP_KEY_BINDINGS: &[KeyBinding] = &[
    KeyBinding { keys: &["j", "Down"], action: "Scroll down by one line" },
    KeyBinding { keys: &["k", "Up"], action: "Scroll up by one line" },
    KeyBinding { keys: &["Ctrl-b", "Page Up"], action: "Scroll up by one page" },
    KeyBinding { keys: &["Ctrl-f", "Page Down"], action: "Scroll down by one page" },
    KeyBinding { keys: &["q"], action: "Exit help screen" },
];

const SHORT_TABLE_BINDINGS: &[KeyBinding] = &[
    KeyBinding { keys: &["j"], action: "Down" },
    KeyBinding { keys: &["k"], action: "Up" },
    KeyBinding { keys: &["oO"], action: "Open" },
    KeyBinding { keys: &["cC"], action: "Close" },
    KeyBinding { keys: &["/"], action: "Search" },
    KeyBinding { keys: &["g"], action: "Ref" },
    KeyBinding { keys: &["v"], action: "Logs" },
    KeyBinding { keys: &["b"], action: "Browser" },
    KeyBinding { keys: &["?"], action: "Help" },
    KeyBinding { keys: &["q"], action: "Quit" },
];

const SHORT_SEARCH_BINDINGS: &[KeyBinding] = &[
    KeyBinding { keys: &["Enter"], action: "Search" },
    KeyBinding { keys: &["Backspace"], action: "Delete character" },
    KeyBinding { keys: &["Ctrl-u"], action: "Delete line" },
    KeyBinding { keys: &["Escape"], action: "Abort" },
];

const SHORT_REF_BINDINGS: &[KeyBinding] = &[
    KeyBinding { keys: &["Enter"], action: "Validate" },
    KeyBinding { keys: &["Tab"], action: "Complete" },
    KeyBinding { keys: &["Up"], action: "Up" },
    KeyBinding { keys: &["Down"], action: "Down" },
    KeyBinding { keys: &["Escape"], action: "Abort" },
];

const SHORT_HELP_BINDINGS: &[KeyBinding] = &[
    KeyBinding { keys: &["j"], action: "Down" },
    KeyBinding { keys: &["k"], action: "Up" },
    KeyBinding { keys: &["Ctrl-b"], action: "Page up" },
    KeyBinding { keys: &["Ctrl-f"], action: "Page down" },
    KeyBinding { keys: &["q"], action: "Quit" },
];

fn help_screen() -> Vec<StyledString> {
    fn draw(bindings: &[KeyBinding]) -> Vec<StyledString> {
        bindings
            .iter()
            .map(|b| {
                let keys: Vec<StyledString> = b
                    .keys
                    .iter()
                    .map(|k| StyledString::styled(*k, Class::Emphasis))
                    .collect();
                let mut line = StyledString::new("   ");
                line.append_string(StyledString::join(keys, StyledString::new(", ")));
                line.fit(Alignment::Left, 25);
                line.append(b.action);
                line
            })
            .collect()
    }

    let mut lines = vec![
        StyledString::styled("HELP FOR INTERACTIVE COMMANDS", Class::Emphasis),
        StyledString::default(),
    ];
    for (title, bindings) in [
        ("Tabular view:", TABLE_KEY_BINDINGS),
        ("Search prompt:", SEARCH_KEY_BINDINGS),
        ("Git reference selection prompt:", REF_KEY_BINDINGS),
        ("Help screen:", HELP_KEY_BINDINGS),
    ] {
        lines.push(StyledString::default());
        lines.push(StyledString::styled(title, Class::Emphasis));
        lines.push(StyledString::default());
        lines.extend(draw(bindings));
    }
    lines
}

fn default_table_config() -> TableConfig {
    TableConfig::new(vec![
        (ColumnId::Pipeline, Column { header: "PIPELINE", max_width: 40, alignment: Alignment::Left, tree_prefix: true }),
        (ColumnId::State, Column { header: "STATE", max_width: 10, alignment: Alignment::Left, tree_prefix: false }),
        (ColumnId::Type, Column { header: "TYPE", max_width: 14, alignment: Alignment::Left, tree_prefix: false }),
        (ColumnId::Ref, Column { header: "REF", max_width: 25, alignment: Alignment::Left, tree_prefix: false }),
        (ColumnId::Started, Column { header: "STARTED", max_width: 16, alignment: Alignment::Left, tree_prefix: false }),
        (ColumnId::Finished, Column { header: "FINISHED", max_width: 16, alignment: Alignment::Left, tree_prefix: false }),
        (ColumnId::Duration, Column { header: "DURATION", max_width: 10, alignment: Alignment::Right, tree_prefix: false }),
    ])
}

/// Maximum height of the ref prompt's suggestion pane, prompt line included.
const REF_PANE_HEIGHT: usize = 14;

/// What the event loop selected on this iteration.
enum LoopEvent {
    Terminal(Event),
    InputClosed,
    Update,
    MonitorError(CiwatchError),
    RefRequest(String),
    Suggestions(Vec<String>),
}

/// Single-threaded mediator between the terminal, the cache and the
/// monitor tasks. Owns focus and all widget state; interacts with the
/// rest of the system only through channels and cache snapshots.
pub struct Controller {
    cache: Cache,
    repository: String,
    ref_name: String,
    width: usize,
    height: usize,
    header: TextArea,
    table: HierarchicalTable,
    table_search: String,
    status: TextArea,
    help: TextArea,
    search_prompt: CommandPrompt,
    ref_prompt: CommandPrompt,
    focus: Focus,
    monitor: Option<JoinHandle<()>>,
}

struct MonitorChannels {
    updates: mpsc::Sender<Instant>,
    errors: mpsc::UnboundedSender<CiwatchError>,
    suggestions: mpsc::UnboundedSender<Vec<String>>,
}

impl Controller {
    pub fn new(
        cache: Cache,
        repository: String,
        ref_name: String,
        width: usize,
        height: usize,
    ) -> Self {
        let mut help = TextArea::new(width, height.saturating_sub(1));
        help.write_content(help_screen());

        Self {
            cache,
            repository,
            ref_name,
            width,
            height,
            header: TextArea::new(width, 2),
            table: HierarchicalTable::new(default_table_config(), width, height),
            table_search: String::new(),
            status: TextArea::new(width, 1),
            help,
            search_prompt: CommandPrompt::new("Search: "),
            ref_prompt: CommandPrompt::new("Ref: "),
            focus: Focus::Table,
            monitor: None,
        }
    }

    /// Event loop: terminal events are always processed first; monitor
    /// updates trigger a refresh; ref requests restart the monitor.
    /// Returns on quit, a fatal error, or input exhaustion.
    pub async fn run(mut self, terminal: &mut Terminal, events: &mut InputEvents) -> Result<()> {
        let (updates_tx, mut updates_rx) = mpsc::channel::<Instant>(1);
        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel::<CiwatchError>();
        let (refs_tx, mut refs_rx) = mpsc::unbounded_channel::<String>();
        let (suggestions_tx, mut suggestions_rx) = mpsc::unbounded_channel::<Vec<String>>();
        let channels = MonitorChannels {
            updates: updates_tx,
            errors: errors_tx,
            suggestions: suggestions_tx,
        };

        // Kick off monitoring of the initial ref.
        let _ = refs_tx.send(self.ref_name.clone());

        self.refresh();
        self.draw(terminal)?;

        let outcome = loop {
            let loop_event = tokio::select! {
                // Terminal events are always processed first.
                biased;
                event = events.next() => match event {
                    Some(event) => LoopEvent::Terminal(event),
                    None => LoopEvent::InputClosed,
                },
                Some(_) = updates_rx.recv() => LoopEvent::Update,
                Some(err) = errors_rx.recv() => LoopEvent::MonitorError(err),
                Some(name) = refs_rx.recv() => LoopEvent::RefRequest(name),
                Some(refs) = suggestions_rx.recv() => LoopEvent::Suggestions(refs),
            };

            match loop_event {
                LoopEvent::Terminal(event) => match self.process(event, &refs_tx) {
                    Ok(Action::None) => self.draw(terminal)?,
                    Ok(Action::ViewLog) => {
                        if let Err(err) = self.view_log(terminal, events).await {
                            break Err(err);
                        }
                        self.draw(terminal)?;
                    }
                    Err(CiwatchError::Exit) => break Ok(()),
                    Err(err) => break Err(err),
                },
                // The input pump died (terminal gone): cooperative cancel.
                LoopEvent::InputClosed => break Err(CiwatchError::Canceled),
                LoopEvent::Update => {
                    self.refresh();
                    self.draw(terminal)?;
                }
                LoopEvent::MonitorError(err) => match err {
                    CiwatchError::Canceled => {}
                    CiwatchError::UnknownGitReference => {
                        self.write_status("error: git reference was not found on remote server(s)");
                        self.draw(terminal)?;
                    }
                    err if err.is_recoverable() => {
                        self.write_status(&format!("error: {err}"));
                        self.draw(terminal)?;
                    }
                    err => break Err(err),
                },
                LoopEvent::RefRequest(name) => {
                    self.start_monitor(name, &channels);
                    self.refresh();
                    self.draw(terminal)?;
                }
                LoopEvent::Suggestions(refs) => {
                    self.ref_prompt.set_completions(refs);
                }
            }
        };

        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        outcome
    }

    /// Cancels the previous monitor and spawns one for `ref_name`. The old
    /// monitor is aborted before its successor starts, so pipelines of the
    /// old ref can no longer reach the updates channel.
    fn start_monitor(&mut self, ref_name: String, channels: &MonitorChannels) {
        if let Some(previous) = self.monitor.take() {
            previous.abort();
        }
        debug!("monitoring git reference '{ref_name}'");
        self.ref_name = ref_name.clone();

        let cache = self.cache.clone();
        let repository = self.repository.clone();
        let updates = channels.updates.clone();
        let errors = channels.errors.clone();
        let suggestions = channels.suggestions.clone();

        self.monitor = Some(tokio::spawn(async move {
            let (urls, local_commit) = match git::remote_urls(&repository).await {
                Ok(urls) => {
                    match git::references(&repository).await {
                        Ok(refs) => {
                            let _ = suggestions.send(refs);
                        }
                        Err(err) => debug!("reference listing failed: {err}"),
                    }
                    let commit = git::resolve_commit(&repository, &ref_name).await.ok();
                    (urls, commit)
                }
                // Not a local repository: treat the input as a remote URL.
                Err(CiwatchError::UnknownRepositoryUrl(_)) => (vec![repository.clone()], None),
                Err(err) => {
                    let _ = errors.send(err);
                    return;
                }
            };

            if let Err(err) = cache
                .monitor_pipelines(urls, ref_name, local_commit, updates, errors.clone())
                .await
            {
                let _ = errors.send(err);
            }
        }));
    }

    /// Pulls a fresh snapshot from the cache into the header and table.
    fn refresh(&mut self) {
        let git_ref = GitRef {
            name: self.ref_name.clone(),
            commit: self.cache.commit(&self.ref_name),
        };

        match &git_ref.commit {
            Some(commit) => self.header.write_content(commit.styled_lines()),
            None => self.header.write_content(vec![StyledString::new(format!(
                "ref: {}",
                self.ref_name
            ))]),
        }

        let pipelines = self.cache.pipelines(&git_ref);
        let nodes: Vec<&dyn TableNode> = pipelines.iter().map(|p| p as &dyn TableNode).collect();
        self.table.replace(&nodes);
        self.resize(self.width, self.height);
    }

    fn write_status(&mut self, message: &str) {
        let mut line = StyledString::new(message);
        line.fit(Alignment::Left, self.width);
        self.status.write_content(vec![line]);
    }

    fn next_match(&mut self, ascending: bool) {
        if self.table_search.is_empty() {
            return;
        }
        let needle = self.table_search.clone();
        if !self.table.scroll_to_match(&needle, ascending) {
            self.write_status(&format!("No match found for {needle:?}"));
        }
    }

    fn header_height(&self) -> usize {
        (self.header.content_len() + 2).min(9).min(self.height)
    }

    fn table_height(&self) -> usize {
        self.height.saturating_sub(self.header_height() + 2)
    }

    fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        let header_height = self.header_height();
        self.header.resize(width, header_height);
        self.table.resize(width, self.table_height());
        self.status.resize(width, 1);
        self.help.resize(width, height.saturating_sub(1));

        if let Some(status) = self.status.first_line() {
            // Status padding depends on the width.
            self.write_status(status.trim_end());
        }
    }

    fn key_hints(&self) -> StyledString {
        let bindings = match self.focus {
            Focus::Table => SHORT_TABLE_BINDINGS,
            Focus::Search => SHORT_SEARCH_BINDINGS,
            Focus::Ref => SHORT_REF_BINDINGS,
            Focus::Help => SHORT_HELP_BINDINGS,
        };
        let mut line = StyledString::default();
        for (i, binding) in bindings.iter().enumerate() {
            if i > 0 {
                line.append("  ");
            }
            line.append(format!("{}:{}", binding.keys.join("/"), binding.action));
        }
        line.fit(Alignment::Left, self.width);
        line.add_class(Class::TableHeader);
        line
    }

    fn draw(&mut self, terminal: &mut Terminal) -> Result<()> {
        let mut panes: Vec<(Rect, Vec<StyledString>)> = Vec::new();
        let width = self.width as u16;

        if self.focus == Focus::Help {
            let height = self.height.saturating_sub(1) as u16;
            panes.push((Rect::new(0, 0, width, height), self.help.visible()));
        } else {
            let header_height = self.header_height();
            let table_height = self.table_height();
            panes.push((
                Rect::new(0, 0, width, header_height as u16),
                self.header.visible(),
            ));
            panes.push((
                Rect::new(0, header_height as u16, width, table_height as u16),
                self.table.lines(),
            ));

            // One line between the table and the key hints: status, the
            // search prompt, or the bottom of the ref suggestion pane.
            let bottom_y = header_height + table_height;
            match self.focus {
                Focus::Search => {
                    let lines = self.search_prompt.lines(self.width, 1);
                    panes.push((Rect::new(0, bottom_y as u16, width, 1), lines));
                }
                Focus::Ref => {
                    // The suggestion pane grows upward from the prompt
                    // line, overlaying the bottom of the table.
                    let pane = REF_PANE_HEIGHT.min(bottom_y + 1);
                    let lines = self.ref_prompt.lines(self.width, pane);
                    let y = (bottom_y + 1).saturating_sub(lines.len());
                    panes.push((Rect::new(0, y as u16, width, lines.len() as u16), lines));
                }
                _ => {
                    panes.push((
                        Rect::new(0, bottom_y as u16, width, 1),
                        self.status.visible(),
                    ));
                }
            }
        }

        if self.height > 0 {
            panes.push((
                Rect::new(0, (self.height - 1) as u16, width, 1),
                vec![self.key_hints()],
            ));
        }

        terminal.draw(|frame| {
            let area = frame.size();
            for (rect, lines) in panes {
                let rect = rect.intersection(area);
                if rect.width == 0 || rect.height == 0 {
                    continue;
                }
                let text: Vec<Line> = lines.iter().map(StyledString::to_line).collect();
                frame.render_widget(Paragraph::new(text), rect);
            }
        })?;
        Ok(())
    }

    /// Path of the cursor node: the owning pipeline key plus step ids.
    fn active_step_path(&self) -> Option<(PipelineKey, Vec<String>)> {
        let path = self.table.active_node_path()?;
        let mut ids = path.ids().iter();
        let NodeId::Key(key) = ids.next()? else {
            return None;
        };
        let steps = ids
            .map(|id| match id {
                NodeId::Id(s) => Some(s.clone()),
                NodeId::Key(_) => None,
            })
            .collect::<Option<Vec<String>>>()?;
        Some((key.clone(), steps))
    }

    fn open_active_row_in_browser(&mut self) -> Result<()> {
        let Some((key, steps)) = self.active_step_path() else {
            return Ok(());
        };
        let Some(step) = self.cache.step(&key, &steps) else {
            return Ok(());
        };
        let Some(url) = step.web_url else {
            return Ok(());
        };

        match std::env::var("BROWSER") {
            Ok(browser) if !browser.is_empty() => {
                std::process::Command::new(browser).arg(&url).spawn()?;
            }
            _ => {
                self.write_status(&format!(
                    "BROWSER environment variable not set. You can instead open {url} in your browser."
                ));
            }
        }
        Ok(())
    }

    /// Fetches the active step's log and pages through it; the terminal
    /// is released to the pager and re-initialised afterwards. Focus,
    /// cursor and fold state all survive the round trip.
    async fn view_log(&mut self, terminal: &mut Terminal, events: &InputEvents) -> Result<()> {
        let Some((key, steps)) = self.active_step_path() else {
            return Ok(());
        };
        self.write_status("Fetching logs...");
        self.draw(terminal)?;

        match self.cache.log(&key, &steps).await {
            Ok(log) => {
                let pager = std::env::var("PAGER")
                    .ok()
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| "less".to_string());
                run_pager(terminal, events, &pager, &log).await?;
                self.write_status("");
            }
            Err(CiwatchError::NoLogHere) => self.write_status(""),
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn process(&mut self, event: Event, refs: &mpsc::UnboundedSender<String>) -> Result<Action> {
        match event {
            Event::Resize(w, h) => {
                self.resize(w as usize, h as usize);
            }
            Event::Key(key)
                if key.kind == KeyEventKind::Press || key.kind == KeyEventKind::Repeat =>
            {
                self.write_status("");
                match self.focus {
                    Focus::Help => self.process_help_key(&key),
                    Focus::Ref => self.process_ref_key(&key, refs),
                    Focus::Search => self.process_search_key(&key),
                    Focus::Table => return self.process_table_key(&key, refs),
                }
            }
            _ => {}
        }
        Ok(Action::None)
    }

    fn process_help_key(&mut self, key: &KeyEvent) {
        let page = self.help.height() as isize;
        match (key.code, key.modifiers) {
            (KeyCode::Char('q'), _) => self.focus = Focus::Table,
            (KeyCode::Char('j'), _) | (KeyCode::Down, _) => self.help.scroll(1),
            (KeyCode::Char('k'), _) | (KeyCode::Up, _) => self.help.scroll(-1),
            (KeyCode::Char('f'), KeyModifiers::CONTROL) | (KeyCode::PageDown, _) => {
                self.help.scroll(page)
            }
            (KeyCode::Char('b'), KeyModifiers::CONTROL) | (KeyCode::PageUp, _) => {
                self.help.scroll(-page)
            }
            (KeyCode::Char('d'), KeyModifiers::CONTROL) => self.help.scroll(page / 2),
            (KeyCode::Char('u'), KeyModifiers::CONTROL) => self.help.scroll(-(page / 2)),
            _ => {}
        }
    }

    fn process_ref_key(&mut self, key: &KeyEvent, refs: &mpsc::UnboundedSender<String>) {
        match key.code {
            KeyCode::Enter => {
                let input = self.ref_prompt.input();
                if !input.is_empty() {
                    let _ = refs.send(input);
                }
                self.focus = Focus::Table;
            }
            KeyCode::Esc => self.focus = Focus::Table,
            _ => self.ref_prompt.process(key),
        }
    }

    fn process_search_key(&mut self, key: &KeyEvent) {
        match key.code {
            KeyCode::Enter => {
                self.table_search = self.search_prompt.input();
                self.next_match(true);
                self.focus = Focus::Table;
            }
            KeyCode::Esc => self.focus = Focus::Table,
            _ => self.search_prompt.process(key),
        }
    }

    fn process_table_key(
        &mut self,
        key: &KeyEvent,
        refs: &mpsc::UnboundedSender<String>,
    ) -> Result<Action> {
        let half_page = (self.table.page_size() / 2) as isize;
        let page = self.table.page_size() as isize;

        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('c') => return Err(CiwatchError::Exit),
                KeyCode::Char('n') => self.table.scroll(1),
                KeyCode::Char('p') => self.table.scroll(-1),
                KeyCode::Char('d') => self.table.scroll(half_page),
                KeyCode::Char('u') => self.table.scroll(-half_page),
                KeyCode::Char('f') => self.table.scroll(page),
                KeyCode::Char('b') => self.table.scroll(-page),
                _ => {}
            }
            return Ok(Action::None);
        }

        match key.code {
            KeyCode::Char('q') => return Err(CiwatchError::Exit),
            KeyCode::Char('j') | KeyCode::Down => self.table.scroll(1),
            KeyCode::Char('k') | KeyCode::Up => self.table.scroll(-1),
            KeyCode::Char('l') | KeyCode::Right => self.table.scroll_horizontal(1),
            KeyCode::Char('h') | KeyCode::Left => self.table.scroll_horizontal(-1),
            KeyCode::PageDown => self.table.scroll(page),
            KeyCode::PageUp => self.table.scroll(-page),
            KeyCode::Home => self.table.top(),
            KeyCode::End => self.table.bottom(),
            KeyCode::Char('<') => self.table.move_sort_column(-1),
            KeyCode::Char('>') => self.table.move_sort_column(1),
            KeyCode::Char('!') => self.table.reverse_sort(),
            KeyCode::Char('o') | KeyCode::Char('+') => self.table.set_traversable(true, false),
            KeyCode::Char('O') => self.table.set_traversable(true, true),
            KeyCode::Char('c') | KeyCode::Char('-') => self.table.set_traversable(false, false),
            KeyCode::Char('C') => self.table.set_traversable(false, true),
            KeyCode::Char('n') | KeyCode::Enter => self.next_match(true),
            KeyCode::Char('N') => self.next_match(false),
            KeyCode::Char('b') => self.open_active_row_in_browser()?,
            KeyCode::Char('v') => return Ok(Action::ViewLog),
            KeyCode::Char('g') => {
                self.focus = Focus::Ref;
                self.ref_prompt.focus();
            }
            KeyCode::Char('/') => {
                self.focus = Focus::Search;
                self.search_prompt.focus();
            }
            KeyCode::Char('u') => {
                // Force a refresh: re-send the current ref, which cancels
                // and restarts the monitor.
                let _ = refs.send(self.ref_name.clone());
            }
            KeyCode::Char('?') => self.focus = Focus::Help,
            _ => {}
        }
        Ok(Action::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Commit, Pipeline, State, Step};
    use chrono::{TimeZone, Utc};

    fn key(code: KeyCode) -> Event {
        Event::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn ctrl(c: char) -> Event {
        Event::Key(KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL))
    }

    fn sample_pipeline(provider_id: &str, id: &str) -> Pipeline {
        Pipeline {
            key: PipelineKey::new(provider_id, id),
            provider_name: "github".to_string(),
            git_ref: "main".to_string(),
            commit_sha: "shaA".to_string(),
            number: id.to_string(),
            updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            step: Step {
                id: id.to_string(),
                name: format!("pipeline {id}"),
                state: State::Passed,
                children: vec![Step {
                    id: "job".to_string(),
                    name: "job".to_string(),
                    state: State::Passed,
                    ..Step::default()
                }],
                ..Step::default()
            },
        }
    }

    fn controller_with_pipelines(pipelines: Vec<Pipeline>) -> Controller {
        let cache = Cache::new(Vec::new(), Vec::new());
        cache.save_commit(
            "main",
            Commit {
                sha: "shaA".to_string(),
                message: "initial commit".to_string(),
                ..Commit::default()
            },
        );
        for pipeline in pipelines {
            let provider_id = pipeline.key.provider_id.clone();
            cache.save_pipeline(&provider_id, pipeline);
        }
        let mut controller =
            Controller::new(cache, "/tmp/repo".to_string(), "main".to_string(), 80, 24);
        controller.refresh();
        controller
    }

    fn feed(controller: &mut Controller, event: Event) -> Result<Action> {
        let (refs_tx, _refs_rx) = mpsc::unbounded_channel();
        controller.process(event, &refs_tx)
    }

    #[test]
    fn test_focus_transitions() {
        let mut c = controller_with_pipelines(vec![sample_pipeline("github-0", "1")]);
        assert_eq!(c.focus, Focus::Table);

        feed(&mut c, key(KeyCode::Char('/'))).unwrap();
        assert_eq!(c.focus, Focus::Search);
        feed(&mut c, key(KeyCode::Esc)).unwrap();
        assert_eq!(c.focus, Focus::Table);

        feed(&mut c, key(KeyCode::Char('g'))).unwrap();
        assert_eq!(c.focus, Focus::Ref);
        feed(&mut c, key(KeyCode::Esc)).unwrap();
        assert_eq!(c.focus, Focus::Table);

        feed(&mut c, key(KeyCode::Char('?'))).unwrap();
        assert_eq!(c.focus, Focus::Help);
        feed(&mut c, key(KeyCode::Char('q'))).unwrap();
        assert_eq!(c.focus, Focus::Table);
    }

    #[test]
    fn test_quit_keys_exit() {
        let mut c = controller_with_pipelines(Vec::new());
        assert!(matches!(
            feed(&mut c, key(KeyCode::Char('q'))),
            Err(CiwatchError::Exit)
        ));

        let mut c = controller_with_pipelines(Vec::new());
        assert!(matches!(feed(&mut c, ctrl('c')), Err(CiwatchError::Exit)));
    }

    #[test]
    fn test_view_log_key_defers_to_event_loop() {
        let mut c = controller_with_pipelines(vec![sample_pipeline("github-0", "1")]);
        assert_eq!(feed(&mut c, key(KeyCode::Char('v'))).unwrap(), Action::ViewLog);
    }

    #[test]
    fn test_ref_prompt_submits_non_empty_input() {
        let mut c = controller_with_pipelines(Vec::new());
        let (refs_tx, mut refs_rx) = mpsc::unbounded_channel();

        c.process(key(KeyCode::Char('g')), &refs_tx).unwrap();
        for ch in "feature/x".chars() {
            c.process(key(KeyCode::Char(ch)), &refs_tx).unwrap();
        }
        c.process(key(KeyCode::Enter), &refs_tx).unwrap();

        assert_eq!(c.focus, Focus::Table);
        assert_eq!(refs_rx.try_recv().unwrap(), "feature/x");
    }

    #[test]
    fn test_ref_prompt_empty_submit_sends_nothing() {
        let mut c = controller_with_pipelines(Vec::new());
        let (refs_tx, mut refs_rx) = mpsc::unbounded_channel();

        c.process(key(KeyCode::Char('g')), &refs_tx).unwrap();
        c.process(key(KeyCode::Enter), &refs_tx).unwrap();

        assert_eq!(c.focus, Focus::Table);
        assert!(refs_rx.try_recv().is_err());
    }

    #[test]
    fn test_refresh_key_resends_current_ref() {
        let mut c = controller_with_pipelines(Vec::new());
        let (refs_tx, mut refs_rx) = mpsc::unbounded_channel();

        c.process(key(KeyCode::Char('u')), &refs_tx).unwrap();
        assert_eq!(refs_rx.try_recv().unwrap(), "main");
    }

    #[test]
    fn test_search_commit_moves_cursor_to_match() {
        let mut c = controller_with_pipelines(vec![
            sample_pipeline("github-0", "1"),
            sample_pipeline("travis-0", "2"),
        ]);

        feed(&mut c, key(KeyCode::Char('/'))).unwrap();
        feed(&mut c, key(KeyCode::Char('#'))).unwrap();
        feed(&mut c, key(KeyCode::Char('2'))).unwrap();
        feed(&mut c, key(KeyCode::Enter)).unwrap();

        assert_eq!(c.focus, Focus::Table);
        let (key_at_cursor, _) = c.active_step_path().unwrap();
        assert_eq!(key_at_cursor, PipelineKey::new("travis-0", "2"));
    }

    #[test]
    fn test_active_step_path_addresses_job_rows() {
        let mut c = controller_with_pipelines(vec![sample_pipeline("github-0", "1")]);
        feed(&mut c, key(KeyCode::Char('o'))).unwrap();
        feed(&mut c, key(KeyCode::Char('j'))).unwrap();

        let (pipeline_key, steps) = c.active_step_path().unwrap();
        assert_eq!(pipeline_key, PipelineKey::new("github-0", "1"));
        assert_eq!(steps, vec!["job".to_string()]);
    }

    #[test]
    fn test_open_reveals_job_rows() {
        let mut c = controller_with_pipelines(vec![sample_pipeline("github-0", "1")]);
        let rows_before = c.table.lines().len();
        feed(&mut c, key(KeyCode::Char('o'))).unwrap();
        assert_eq!(c.table.lines().len(), rows_before + 1);
    }

    #[test]
    fn test_ref_switch_clears_table_until_new_commit_resolves() {
        let mut c = controller_with_pipelines(vec![sample_pipeline("github-0", "1")]);
        assert!(c.active_step_path().is_some());

        // Switching the monitored ref: no commit cached for it yet, so
        // the snapshot (and the table) is empty.
        c.ref_name = "feature/x".to_string();
        c.refresh();
        assert!(c.active_step_path().is_none());
    }

    #[test]
    fn test_help_screen_mentions_every_focus() {
        let lines = help_screen();
        let text: Vec<String> = lines.iter().map(StyledString::plain).collect();
        let joined = text.join("\n");
        assert!(joined.contains("Tabular view:"));
        assert!(joined.contains("Search prompt:"));
        assert!(joined.contains("Git reference selection prompt:"));
        assert!(joined.contains("Help screen:"));
        assert!(joined.contains("$BROWSER"));
    }

    #[test]
    fn test_key_hints_follow_focus() {
        let mut c = controller_with_pipelines(Vec::new());
        assert!(c.key_hints().plain().contains("q:Quit"));
        c.focus = Focus::Search;
        assert!(c.key_hints().plain().contains("Escape:Abort"));
        c.focus = Focus::Ref;
        assert!(c.key_hints().plain().contains("Tab:Complete"));
    }
}
