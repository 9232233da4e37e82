//! Plain-text shaping shared by the adapters: a line-counting sink for
//! markup-to-text conversion and the paragraph reflow used for PDF pages.

/// Accumulates rendered text while tracking the current line, so anchors can
/// be mapped to the line where their content starts.
#[derive(Debug, Default)]
pub(crate) struct TextSink {
    out: String,
    line: usize,
    pending_space: bool,
    preformatted: usize,
}

impl TextSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn line(&self) -> usize {
        self.line
    }

    pub(crate) fn enter_preformatted(&mut self) {
        self.preformatted += 1;
    }

    pub(crate) fn leave_preformatted(&mut self) {
        self.preformatted = self.preformatted.saturating_sub(1);
    }

    pub(crate) fn push_text(&mut self, s: &str) {
        if self.preformatted > 0 {
            for ch in s.chars() {
                self.push_char(if ch == '\r' { '\n' } else { ch });
            }
            self.pending_space = false;
            return;
        }

        for ch in s.chars() {
            if ch.is_whitespace() {
                self.pending_space = true;
                continue;
            }
            if self.pending_space
                && !self.out.is_empty()
                && !self.out.ends_with(['\n', ' '])
            {
                self.out.push(' ');
            }
            self.pending_space = false;
            self.push_char(ch);
        }
    }

    pub(crate) fn line_break(&mut self) {
        self.pending_space = false;
        if !self.out.is_empty() && !self.out.ends_with('\n') {
            self.push_char('\n');
        }
    }

    pub(crate) fn paragraph_break(&mut self) {
        self.line_break();
        if !self.out.is_empty() && !self.out.ends_with("\n\n") {
            self.push_char('\n');
        }
    }

    pub(crate) fn finish(self) -> String {
        self.out.trim_end().to_string()
    }

    fn push_char(&mut self, ch: char) {
        if ch == '\n' {
            while self.out.ends_with(' ') {
                self.out.pop();
            }
            self.line += 1;
        }
        self.out.push(ch);
    }
}

/// Drops control characters, replacement characters, private-use and
/// non-character code points left behind by broken font encodings.
pub(crate) fn sanitize(s: &str) -> String {
    s.chars()
        .filter_map(|ch| match ch {
            '\n' | '\t' => Some(ch),
            '\r' => Some('\n'),
            '\u{FFFD}' => None,
            _ if ch.is_control() => None,
            _ if is_private_use(ch as u32) || is_noncharacter(ch as u32) => None,
            _ => Some(ch),
        })
        .collect()
}

fn is_private_use(code: u32) -> bool {
    (0xE000..=0xF8FF).contains(&code)
        || (0xF0000..=0xFFFFD).contains(&code)
        || (0x100000..=0x10FFFD).contains(&code)
}

fn is_noncharacter(code: u32) -> bool {
    (0xFDD0..=0xFDEF).contains(&code) || (code & 0xFFFF == 0xFFFE) || (code & 0xFFFF == 0xFFFF)
}

/// Joins hard-wrapped lines into paragraphs. A paragraph ends at a blank
/// line, a bullet, an indented line, or a short line followed by a
/// capitalized one. Soft hyphens are dropped and words split across lines
/// are re-joined.
pub(crate) fn reflow(raw: &str) -> String {
    let sanitized = sanitize(raw);
    let mut lines: Vec<&str> = sanitized.split('\n').collect();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }

    let mut lens = lines
        .iter()
        .map(|line| line.trim().len())
        .filter(|len| *len > 0)
        .collect::<Vec<_>>();
    lens.sort_unstable();
    let typical = lens.get(lens.len() / 2).copied().unwrap_or(0);
    let short_threshold = (typical as f32 * 0.6).round() as usize;

    let mut out = String::new();
    let mut paragraph = String::new();
    let mut prev_len = 0usize;
    let mut prev_blank = true;

    for raw_line in lines {
        let indented = raw_line.starts_with("  ") || raw_line.starts_with('\t');
        let line = normalize_line(raw_line);
        if line.is_empty() {
            flush_paragraph(&mut out, &mut paragraph);
            prev_blank = true;
            continue;
        }

        if !paragraph.is_empty() {
            let breaks = is_bullet_start(&line)
                || (indented && !prev_blank)
                || (prev_len > 0
                    && short_threshold > 0
                    && prev_len <= short_threshold
                    && starts_with_uppercase_word(&line));
            if breaks {
                flush_paragraph(&mut out, &mut paragraph);
            }
        }

        join_line(&mut paragraph, &line);
        prev_len = line.len();
        prev_blank = false;
    }

    flush_paragraph(&mut out, &mut paragraph);
    out
}

fn normalize_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut last_was_space = false;
    for ch in line.chars().filter(|ch| *ch != '\u{00AD}') {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

fn flush_paragraph(out: &mut String, paragraph: &mut String) {
    let text = paragraph.trim();
    if text.is_empty() {
        return;
    }
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(text);
    paragraph.clear();
}

fn join_line(paragraph: &mut String, line: &str) {
    if paragraph.is_empty() {
        paragraph.push_str(line);
        return;
    }

    if paragraph.ends_with('-') && should_dehyphenate(paragraph, line) {
        paragraph.pop();
        paragraph.push_str(line);
        return;
    }

    if !paragraph.ends_with(' ') {
        paragraph.push(' ');
    }
    paragraph.push_str(line);
}

fn should_dehyphenate(paragraph: &str, next: &str) -> bool {
    if paragraph.ends_with("--") {
        return false;
    }
    let prev = paragraph
        .chars()
        .rev()
        .nth(1)
        .is_some_and(|ch| ch.is_alphabetic());
    prev && next.chars().next().is_some_and(|ch| ch.is_alphabetic())
}

fn is_bullet_start(line: &str) -> bool {
    let line = line.trim_start();
    if line.starts_with(['•', '-', '*', '–', '—']) {
        return line.chars().nth(1).is_some_and(|ch| ch.is_whitespace());
    }

    let digits = line.chars().take_while(|ch| ch.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    let mut rest = line[digits..].chars();
    matches!(rest.next(), Some('.') | Some(')')) && rest.next().is_some_and(char::is_whitespace)
}

fn starts_with_uppercase_word(line: &str) -> bool {
    line.chars()
        .find(|ch| ch.is_alphabetic())
        .is_some_and(|ch| ch.is_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflow_joins_lines() {
        assert_eq!(reflow("Hello\nworld\n"), "Hello world");
    }

    #[test]
    fn reflow_preserves_blank_lines() {
        assert_eq!(reflow("Hello\n\nWorld\n"), "Hello\n\nWorld");
    }

    #[test]
    fn reflow_dehyphenates_line_breaks() {
        assert_eq!(reflow("micro-\nscopic\n"), "microscopic");
    }

    #[test]
    fn reflow_breaks_on_short_line_then_caps() {
        let input = "This is a longer line with words\nShort.\nNext Paragraph starts here\n";
        assert_eq!(
            reflow(input),
            "This is a longer line with words Short.\n\nNext Paragraph starts here"
        );
    }

    #[test]
    fn reflow_splits_numbered_items() {
        assert_eq!(
            reflow("Steps follow here\n1. first step\n2) second step\n"),
            "Steps follow here\n\n1. first step\n\n2) second step"
        );
    }

    #[test]
    fn sanitize_drops_private_use_and_replacement() {
        assert_eq!(sanitize("a\u{E000}b\u{FFFD}c\rd"), "abc\nd");
    }

    #[test]
    fn sink_collapses_whitespace_and_counts_lines() {
        let mut sink = TextSink::new();
        sink.push_text("  Hello \n  world ");
        assert_eq!(sink.line(), 0);
        sink.paragraph_break();
        assert_eq!(sink.line(), 2);
        sink.push_text("Next");
        sink.line_break();
        sink.line_break();
        assert_eq!(sink.line(), 3);
        assert_eq!(sink.finish(), "Hello world\n\nNext");
    }

    #[test]
    fn sink_keeps_preformatted_text() {
        let mut sink = TextSink::new();
        sink.enter_preformatted();
        sink.push_text("a  b\nc");
        sink.leave_preformatted();
        assert_eq!(sink.line(), 1);
        assert_eq!(sink.finish(), "a  b\nc");
    }
}
