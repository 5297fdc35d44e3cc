use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use super::text::{Class, StyledString};

/// Fixed-size scrollable styled text buffer, used for the commit header,
/// the status line and the help screen.
pub struct TextArea {
    width: usize,
    height: usize,
    content: Vec<StyledString>,
    offset: usize,
}

impl TextArea {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            content: Vec::new(),
            offset: 0,
        }
    }

    pub fn write_content(&mut self, lines: Vec<StyledString>) {
        self.content = lines;
        self.clamp_offset();
    }

    pub fn content_len(&self) -> usize {
        self.content.len()
    }

    pub fn first_line(&self) -> Option<String> {
        self.content.first().map(StyledString::plain)
    }

    pub fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.clamp_offset();
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn scroll(&mut self, amount: isize) {
        self.offset = self.offset.saturating_add_signed(amount);
        self.clamp_offset();
    }

    fn clamp_offset(&mut self) {
        let max = self.content.len().saturating_sub(self.height.max(1));
        self.offset = self.offset.min(max);
    }

    /// Lines currently in view, fitted to the widget width.
    pub fn visible(&self) -> Vec<StyledString> {
        self.content
            .iter()
            .skip(self.offset)
            .take(self.height)
            .map(|line| {
                let mut line = line.clone();
                line.fit(super::text::Alignment::Left, self.width);
                line
            })
            .collect()
    }
}

/// Single-line command prompt. The ref variant carries a completion list
/// filtered by prefix; `Tab`/`Shift-Tab` and `Up`/`Down` move through the
/// suggestion pane.
pub struct CommandPrompt {
    prompt: &'static str,
    input: String,
    completions: Vec<String>,
    filtered: Vec<String>,
    selected: Option<usize>,
}

impl CommandPrompt {
    pub fn new(prompt: &'static str) -> Self {
        Self {
            prompt,
            input: String::new(),
            completions: Vec::new(),
            filtered: Vec::new(),
            selected: None,
        }
    }

    /// Resets the editing state when the prompt gains focus.
    pub fn focus(&mut self) {
        self.input.clear();
        self.selected = None;
        self.refilter();
    }

    pub fn set_completions(&mut self, completions: Vec<String>) {
        self.completions = completions;
        self.refilter();
    }

    /// The submitted value: the highlighted suggestion when the user
    /// navigated to one, the raw input otherwise.
    pub fn input(&self) -> String {
        match self.selected {
            Some(i) => self.filtered[i].clone(),
            None => self.input.clone(),
        }
    }

    fn refilter(&mut self) {
        self.filtered = self
            .completions
            .iter()
            .filter(|c| c.starts_with(&self.input))
            .cloned()
            .collect();
        self.selected = None;
    }

    fn move_selection(&mut self, amount: isize) {
        if self.filtered.is_empty() {
            return;
        }
        let len = self.filtered.len() as isize;
        self.selected = Some(match self.selected {
            None if amount >= 0 => 0,
            None => (len - 1) as usize,
            Some(i) => crate::utils::modulo(i as isize + amount, len) as usize,
        });
    }

    pub fn process(&mut self, event: &KeyEvent) {
        match event.code {
            KeyCode::Char('u') if event.modifiers.contains(KeyModifiers::CONTROL) => {
                self.input.clear();
                self.refilter();
            }
            KeyCode::Char(c) if !event.modifiers.contains(KeyModifiers::CONTROL) => {
                self.input.push(c);
                self.refilter();
            }
            KeyCode::Backspace => {
                self.input.pop();
                self.refilter();
            }
            KeyCode::Tab | KeyCode::Down => self.move_selection(1),
            KeyCode::BackTab | KeyCode::Up => self.move_selection(-1),
            KeyCode::PageDown => self.move_selection(10),
            KeyCode::PageUp => self.move_selection(-10),
            _ => {}
        }
    }

    /// Suggestion pane plus the prompt line, bottom-aligned in `height`
    /// rows; the pane never exceeds `height - 1` rows.
    pub fn lines(&self, width: usize, height: usize) -> Vec<StyledString> {
        let mut lines = Vec::new();
        if height == 0 {
            return lines;
        }

        let pane = height.saturating_sub(1).min(self.filtered.len());
        // Window the suggestions so the selection stays visible.
        let start = match self.selected {
            Some(i) if i + 1 > pane => i + 1 - pane,
            _ => 0,
        };
        for (i, suggestion) in self.filtered.iter().enumerate().skip(start).take(pane) {
            let mut line = StyledString::new(format!("  {suggestion}"));
            line.fit(super::text::Alignment::Left, width);
            if self.selected == Some(i) {
                line.add_class(Class::ActiveRow);
            }
            lines.push(line);
        }

        let mut prompt = StyledString::styled(self.prompt, Class::Emphasis);
        prompt.append(&self.input);
        prompt.append("█");
        prompt.fit(super::text::Alignment::Left, width);
        lines.push(prompt);
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn ctrl(c: char) -> KeyEvent {
        KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL)
    }

    fn type_str(prompt: &mut CommandPrompt, s: &str) {
        for c in s.chars() {
            prompt.process(&key(KeyCode::Char(c)));
        }
    }

    #[test]
    fn test_text_area_scroll_clamps() {
        let mut area = TextArea::new(20, 3);
        area.write_content((0..10).map(|i| StyledString::new(format!("l{i}"))).collect());

        assert_eq!(area.visible().len(), 3);
        area.scroll(100);
        assert_eq!(area.visible()[0].plain().trim_end(), "l7");
        area.scroll(-100);
        assert_eq!(area.visible()[0].plain().trim_end(), "l0");
    }

    #[test]
    fn test_prompt_editing_keys() {
        let mut prompt = CommandPrompt::new("Ref: ");
        type_str(&mut prompt, "main");
        assert_eq!(prompt.input(), "main");

        prompt.process(&key(KeyCode::Backspace));
        assert_eq!(prompt.input(), "mai");

        prompt.process(&ctrl('u'));
        assert_eq!(prompt.input(), "");
    }

    #[test]
    fn test_prompt_focus_resets_state() {
        let mut prompt = CommandPrompt::new("Ref: ");
        type_str(&mut prompt, "stale");
        prompt.focus();
        assert_eq!(prompt.input(), "");
    }

    #[test]
    fn test_completion_filtering_is_prefix_based() {
        let mut prompt = CommandPrompt::new("Ref: ");
        prompt.set_completions(vec![
            "main".to_string(),
            "feature/x".to_string(),
            "feature/y".to_string(),
        ]);

        type_str(&mut prompt, "fea");
        assert_eq!(prompt.filtered, vec!["feature/x", "feature/y"]);

        prompt.process(&key(KeyCode::Backspace));
        prompt.process(&key(KeyCode::Backspace));
        prompt.process(&key(KeyCode::Backspace));
        assert_eq!(prompt.filtered.len(), 3);
    }

    #[test]
    fn test_tab_cycles_suggestions() {
        let mut prompt = CommandPrompt::new("Ref: ");
        prompt.set_completions(vec!["main".to_string(), "master".to_string()]);
        type_str(&mut prompt, "ma");

        prompt.process(&key(KeyCode::Tab));
        assert_eq!(prompt.input(), "main");
        prompt.process(&key(KeyCode::Tab));
        assert_eq!(prompt.input(), "master");
        prompt.process(&key(KeyCode::Tab));
        assert_eq!(prompt.input(), "main");

        prompt.process(&key(KeyCode::BackTab));
        assert_eq!(prompt.input(), "master");
    }

    #[test]
    fn test_typing_clears_selection() {
        let mut prompt = CommandPrompt::new("Ref: ");
        prompt.set_completions(vec!["main".to_string()]);
        type_str(&mut prompt, "m");
        prompt.process(&key(KeyCode::Tab));
        assert_eq!(prompt.input(), "main");

        prompt.process(&key(KeyCode::Char('x')));
        assert_eq!(prompt.input(), "mx");
    }

    #[test]
    fn test_prompt_lines_bounded_by_height() {
        let mut prompt = CommandPrompt::new("Ref: ");
        prompt.set_completions((0..30).map(|i| format!("branch-{i:02}")).collect());

        let lines = prompt.lines(30, 14);
        // 13 suggestions + the prompt line.
        assert_eq!(lines.len(), 14);
        assert!(lines.last().unwrap().plain().starts_with("Ref: "));

        let empty = CommandPrompt::new("Search: ");
        assert_eq!(empty.lines(30, 14).len(), 1);
    }
}
