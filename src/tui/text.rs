use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

/// Style classes attached to text segments. The mapping to terminal
/// attributes happens only at draw time, so the table and widgets can be
/// tested on plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    TableHeader,
    ActiveRow,
    Provider,
    GitRef,
    Emphasis,
    StatePassed,
    StateFailed,
    StateRunning,
    StateCanceled,
    StatePending,
    StateMuted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    text: String,
    classes: Vec<Class>,
}

/// A string carrying style classes, measured in terminal cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyledString {
    segments: Vec<Segment>,
}

impl StyledString {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment {
                text: text.into(),
                classes: Vec::new(),
            }],
        }
    }

    pub fn styled(text: impl Into<String>, class: Class) -> Self {
        Self {
            segments: vec![Segment {
                text: text.into(),
                classes: vec![class],
            }],
        }
    }

    pub fn append(&mut self, text: impl Into<String>) {
        self.segments.push(Segment {
            text: text.into(),
            classes: Vec::new(),
        });
    }

    pub fn append_styled(&mut self, text: impl Into<String>, class: Class) {
        self.segments.push(Segment {
            text: text.into(),
            classes: vec![class],
        });
    }

    pub fn append_string(&mut self, other: StyledString) {
        self.segments.extend(other.segments);
    }

    pub fn join(items: Vec<StyledString>, separator: StyledString) -> StyledString {
        let mut joined = StyledString::default();
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                joined.append_string(separator.clone());
            }
            joined.append_string(item);
        }
        joined
    }

    /// Applies `class` to every segment, on top of existing classes.
    pub fn add_class(&mut self, class: Class) {
        for segment in &mut self.segments {
            segment.classes.push(class);
        }
    }

    pub fn plain(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    /// Width in terminal cells.
    pub fn length(&self) -> usize {
        self.segments
            .iter()
            .map(|s| UnicodeWidthStr::width(s.text.as_str()))
            .sum()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.plain().contains(needle)
    }

    /// Pads or truncates to exactly `width` cells.
    pub fn fit(&mut self, alignment: Alignment, width: usize) {
        let length = self.length();
        if length > width {
            self.truncate(width);
        } else if length < width {
            let padding = " ".repeat(width - length);
            match alignment {
                Alignment::Left => self.append(padding),
                Alignment::Right => self.segments.insert(
                    0,
                    Segment {
                        text: padding,
                        classes: Vec::new(),
                    },
                ),
            }
        }
    }

    fn truncate(&mut self, width: usize) {
        let mut remaining = width;
        let mut truncated = Vec::new();
        for segment in &self.segments {
            if remaining == 0 {
                break;
            }
            let mut text = String::new();
            for c in segment.text.chars() {
                let w = UnicodeWidthChar::width(c).unwrap_or(0);
                if w > remaining {
                    remaining = 0;
                    break;
                }
                text.push(c);
                remaining -= w;
            }
            if !text.is_empty() {
                truncated.push(Segment {
                    text,
                    classes: segment.classes.clone(),
                });
            }
        }
        self.segments = truncated;
    }

    /// Drops the first `cells` terminal cells; used for horizontal scroll.
    pub fn crop_left(&mut self, cells: usize) {
        let mut to_drop = cells;
        let mut cropped = Vec::new();
        for segment in &self.segments {
            if to_drop == 0 {
                cropped.push(segment.clone());
                continue;
            }
            let mut text = String::new();
            for c in segment.text.chars() {
                let w = UnicodeWidthChar::width(c).unwrap_or(0);
                if to_drop >= w && text.is_empty() {
                    to_drop = to_drop.saturating_sub(w);
                } else {
                    to_drop = 0;
                    text.push(c);
                }
            }
            if !text.is_empty() {
                cropped.push(Segment {
                    text,
                    classes: segment.classes.clone(),
                });
            }
        }
        self.segments = cropped;
    }

    pub fn to_line(&self) -> Line<'static> {
        let spans: Vec<Span<'static>> = self
            .segments
            .iter()
            .map(|s| Span::styled(s.text.clone(), style_of(&s.classes)))
            .collect();
        Line::from(spans)
    }
}

/// Classes apply in order; later classes override earlier attributes.
fn style_of(classes: &[Class]) -> Style {
    let mut style = Style::default();
    for class in classes {
        style = match class {
            Class::TableHeader => style.add_modifier(Modifier::BOLD | Modifier::REVERSED),
            Class::ActiveRow => style
                .bg(Color::Gray)
                .fg(Color::Black)
                .remove_modifier(Modifier::BOLD),
            Class::Provider => style.add_modifier(Modifier::BOLD),
            Class::GitRef => style.fg(Color::Yellow),
            Class::Emphasis => style.add_modifier(Modifier::BOLD),
            Class::StatePassed => style.fg(Color::Green),
            Class::StateFailed => style.fg(Color::Red),
            Class::StateRunning => style.fg(Color::Blue),
            Class::StateCanceled => style.fg(Color::Magenta),
            Class::StatePending => style.fg(Color::Yellow),
            Class::StateMuted => style.fg(Color::DarkGray),
        };
    }
    style
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_and_length() {
        let mut s = StyledString::styled("failed", Class::StateFailed);
        s.append(" 2m 5s");
        assert_eq!(s.plain(), "failed 2m 5s");
        assert_eq!(s.length(), 12);
    }

    #[test]
    fn test_fit_pads_left_and_right() {
        let mut left = StyledString::new("ab");
        left.fit(Alignment::Left, 5);
        assert_eq!(left.plain(), "ab   ");

        let mut right = StyledString::new("ab");
        right.fit(Alignment::Right, 5);
        assert_eq!(right.plain(), "   ab");
    }

    #[test]
    fn test_fit_truncates_across_segments() {
        let mut s = StyledString::new("abc");
        s.append_styled("def", Class::Emphasis);
        s.fit(Alignment::Left, 4);
        assert_eq!(s.plain(), "abcd");
    }

    #[test]
    fn test_fit_is_width_aware() {
        let mut s = StyledString::new("日本語");
        s.fit(Alignment::Left, 4);
        // Each ideograph is two cells wide; the third does not fit.
        assert_eq!(s.plain(), "日本");
        s.fit(Alignment::Left, 5);
        assert_eq!(s.plain(), "日本 ");
    }

    #[test]
    fn test_crop_left() {
        let mut s = StyledString::new("abc");
        s.append_styled("def", Class::Emphasis);
        s.crop_left(4);
        assert_eq!(s.plain(), "ef");

        let mut short = StyledString::new("ab");
        short.crop_left(10);
        assert_eq!(short.plain(), "");
    }

    #[test]
    fn test_contains_ignores_styling() {
        let mut s = StyledString::styled("unit ", Class::Provider);
        s.append_styled("tests", Class::StatePassed);
        assert!(s.contains("t te"));
        assert!(!s.contains("TESTS"));
    }

    #[test]
    fn test_join() {
        let joined = StyledString::join(
            vec![StyledString::new("a"), StyledString::new("b")],
            StyledString::new(", "),
        );
        assert_eq!(joined.plain(), "a, b");
    }
}
