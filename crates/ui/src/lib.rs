//! ratatui-based reader view.

use std::io::{self, Stdout};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use folio_application::{NavigationEngine, NavigationError, ReaderView, Relocation, TocRow};
use folio_core::Settings;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{event, terminal};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, HighlightSpacing, List, ListItem, ListState, Paragraph};
use tracing::warn;
use unicode_width::UnicodeWidthStr;

const ACCENT: Color = Color::Yellow;

#[derive(Debug, Clone)]
pub struct UiOutcome {
    pub settings: Settings,
}

pub struct Ui {
    engine: NavigationEngine,
    toc_panel: TocPanel,
    reader: ReaderPanel,
}

#[derive(Debug, Clone, Default)]
struct TocPanel {
    focused: bool,
    selected: usize,
}

#[derive(Debug, Clone, Default)]
struct ReaderPanel {
    /// First visible line of the loaded unit.
    scroll: usize,
    turning_until: Option<Instant>,
    notice: Option<String>,
}

impl Ui {
    pub fn new(engine: NavigationEngine) -> Self {
        let mut ui = Self {
            engine,
            toc_panel: TocPanel {
                focused: true,
                selected: 0,
            },
            reader: ReaderPanel::default(),
        };
        if let Some(offset) = ui.engine.view().and_then(|view| view.scroll_offset) {
            ui.reader.scroll = offset.max(0.0) as usize;
        }
        ui.select_active_row();
        ui
    }

    pub fn engine(&self) -> &NavigationEngine {
        &self.engine
    }

    pub fn run(&mut self) -> anyhow::Result<UiOutcome> {
        let mut terminal = setup_terminal()?;
        terminal.clear().ok();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.event_loop(&mut terminal)
        }));
        let restore_result = restore_terminal(&mut terminal);
        self.engine.close();

        match (result, restore_result) {
            (Ok(Ok(())), Ok(())) => Ok(UiOutcome {
                settings: self.engine.settings().clone(),
            }),
            (Ok(Err(err)), _) => Err(err),
            (Ok(Ok(())), Err(err)) => Err(err),
            (Err(panic), Ok(())) => Err(anyhow::anyhow!(panic_to_string(panic))),
            (Err(panic), Err(err)) => Err(anyhow::anyhow!(
                "{}\n(additionally failed to restore terminal: {err})",
                panic_to_string(panic)
            )),
        }
    }

    fn event_loop(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    ) -> anyhow::Result<()> {
        let tick_rate = Duration::from_millis(100);
        let mut needs_redraw = true;

        loop {
            if needs_redraw {
                terminal.draw(|frame| self.draw(frame.area(), frame))?;
                needs_redraw = false;
            }

            if !event::poll(tick_rate)? {
                needs_redraw = self.tick(Instant::now());
                continue;
            }

            match event::read()? {
                Event::Resize(_, _) => {
                    needs_redraw = true;
                }
                Event::Key(key) => {
                    if key.kind == KeyEventKind::Release {
                        continue;
                    }
                    needs_redraw = true;
                    if self.handle_key(key) {
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
    }

    /// Settles debounced scroll samples and ends page transitions. Returns
    /// whether anything visible changed.
    fn tick(&mut self, now: Instant) -> bool {
        let mut changed = false;
        if self.reader.turning_until.is_some_and(|until| now >= until) {
            self.reader.turning_until = None;
            changed = true;
        }
        match self.engine.poll(now) {
            Ok(Some(_)) => {
                self.select_active_row();
                changed = true;
            }
            Ok(None) => {}
            Err(err) => {
                self.report(err);
                changed = true;
            }
        }
        changed
    }

    /// Returns `true` when the reader should quit.
    fn handle_key(&mut self, key: KeyEvent) -> bool {
        self.reader.notice = None;
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return true,
            KeyCode::Char('n') | KeyCode::Right => {
                let result = self.engine.next();
                self.after_navigation(result);
            }
            KeyCode::Char('p') | KeyCode::Left => {
                let result = self.engine.prev();
                self.after_navigation(result);
            }
            KeyCode::Char('j') => self.scroll_by(1),
            KeyCode::Char('k') => self.scroll_by(-1),
            KeyCode::Char('t') => {
                self.toc_panel.focused = !self.toc_panel.focused;
            }
            KeyCode::Up if self.toc_panel.focused => {
                self.toc_panel.selected = self.toc_panel.selected.saturating_sub(1);
            }
            KeyCode::Down if self.toc_panel.focused => {
                let len = self.toc_rows().len();
                if len > 0 {
                    self.toc_panel.selected = (self.toc_panel.selected + 1).min(len - 1);
                }
            }
            KeyCode::Up => self.scroll_by(-1),
            KeyCode::Down => self.scroll_by(1),
            KeyCode::Enter => self.activate_selected_row(),
            KeyCode::Char('m') => {
                let mut settings = self.engine.settings().clone();
                settings.cycle_view_mode();
                self.engine
                    .set_modes(settings.reading_mode, settings.manager_mode);
                self.reader.notice = Some(format!("view mode: {}", settings.view_mode()));
            }
            _ => {}
        }
        false
    }

    fn activate_selected_row(&mut self) {
        let rows = self.toc_rows();
        let Some(row) = rows.get(self.toc_panel.selected) else {
            return;
        };
        match self.engine.activate_toc(&row.id) {
            Ok(Some(relocation)) => self.apply_relocation(relocation),
            Ok(None) => {
                let rows = self.toc_rows();
                self.toc_panel.selected = self.toc_panel.selected.min(rows.len().saturating_sub(1));
            }
            Err(err) => self.report(err),
        }
    }

    fn after_navigation(&mut self, result: Result<Option<Relocation>, NavigationError>) {
        match result {
            Ok(Some(relocation)) => self.apply_relocation(relocation),
            Ok(None) => {}
            Err(err) => self.report(err),
        }
    }

    fn apply_relocation(&mut self, relocation: Relocation) {
        self.reader.scroll = relocation.scroll_to.map_or(0, |line| line.max(0.0) as usize);
        self.reader.turning_until = relocation
            .transition
            .map(|transition| Instant::now() + transition);
        self.select_active_row();
    }

    fn report(&mut self, err: NavigationError) {
        // A failed save still moved the reader; keep the view in sync.
        if matches!(err, NavigationError::Progress(_)) {
            self.reader.scroll = self
                .engine
                .view()
                .and_then(|view| view.scroll_offset)
                .map_or(0, |line| line.max(0.0) as usize);
            self.select_active_row();
        }
        warn!(error = %err, "navigation failed");
        self.reader.notice = Some(err.to_string());
    }

    fn scroll_by(&mut self, delta: isize) {
        let Some(view) = self.engine.view() else {
            return;
        };
        let max = view.content.line_count().saturating_sub(1);
        let scroll = self.reader.scroll.saturating_add_signed(delta).min(max);
        if scroll == self.reader.scroll {
            return;
        }
        self.reader.scroll = scroll;
        self.engine.on_scroll(scroll as f64, Instant::now());
    }

    fn toc_rows(&self) -> Vec<TocRow> {
        self.engine
            .toc()
            .map(|toc| toc.visible_rows())
            .unwrap_or_default()
    }

    fn select_active_row(&mut self) {
        if let Some(idx) = self.toc_rows().iter().position(|row| row.active) {
            self.toc_panel.selected = idx;
        }
    }

    fn draw(&self, area: Rect, frame: &mut ratatui::Frame) {
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(0), Constraint::Length(1)])
            .split(area);
        let panes = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(30), Constraint::Min(0)])
            .split(rows[0]);

        let Some(view) = self.engine.view() else {
            frame.render_widget(
                Paragraph::new("(no book open)").block(Block::default().borders(Borders::ALL)),
                rows[0],
            );
            return;
        };

        self.draw_toc_panel(panes[0], frame);
        self.draw_content(&view, panes[1], frame);
        frame.render_widget(Paragraph::new(self.status_line(&view)), rows[1]);
    }

    fn draw_toc_panel(&self, area: Rect, frame: &mut ratatui::Frame) {
        let rows = self.toc_rows();
        let border_style = if self.toc_panel.focused {
            Style::default().fg(ACCENT)
        } else {
            Style::default()
        };
        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(border_style)
            .title(Span::styled(
                "Contents",
                Style::default().add_modifier(Modifier::BOLD),
            ));

        let items: Vec<ListItem> = if rows.is_empty() {
            vec![ListItem::new(Line::raw("(no outline)"))]
        } else {
            rows.iter().map(toc_item).collect()
        };

        let list = List::new(items)
            .block(block)
            .highlight_style(
                Style::default()
                    .fg(Color::Black)
                    .bg(ACCENT)
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("> ")
            .highlight_spacing(HighlightSpacing::Always);

        let mut state = ListState::default();
        if self.toc_panel.focused && !rows.is_empty() {
            state.select(Some(self.toc_panel.selected.min(rows.len() - 1)));
        }
        frame.render_stateful_widget(list, area, &mut state);
    }

    fn draw_content(&self, view: &ReaderView<'_>, area: Rect, frame: &mut ratatui::Frame) {
        let title = view
            .content
            .label
            .clone()
            .unwrap_or_else(|| format!("Part {}", view.unit.index + 1));
        let block = Block::default().borders(Borders::ALL).title(Span::styled(
            title,
            Style::default().add_modifier(Modifier::BOLD),
        ));
        let inner = block.inner(area);
        frame.render_widget(block, area);

        let width = usize::from(inner.width);
        let height = usize::from(inner.height);
        let lines = view
            .content
            .text
            .lines()
            .skip(self.reader.scroll)
            .flat_map(|line| wrap_text(line, width))
            .take(height)
            .map(Line::raw)
            .collect::<Vec<_>>();

        let style = if self.reader.turning_until.is_some() {
            Style::default().add_modifier(Modifier::DIM)
        } else {
            Style::default()
        };
        frame.render_widget(Paragraph::new(Text::from(lines)).style(style), inner);
    }

    fn status_line(&self, view: &ReaderView<'_>) -> Line<'static> {
        let bold = Style::default().add_modifier(Modifier::BOLD);
        let arrows = format!(
            "{}{}",
            if view.can_go_prev { "◂" } else { " " },
            if view.can_go_next { "▸" } else { " " }
        );
        let mut spans = vec![
            Span::styled(view.metadata.title.clone(), bold),
            Span::raw(format!("  {}  ", view.location)),
            Span::raw(format!("{}/{}  ", view.unit.index + 1, view.unit_count)),
            Span::raw(format!("{arrows}  ")),
            Span::styled(self.engine.settings().view_mode().as_str(), Style::default().fg(ACCENT)),
        ];
        if let Some(notice) = &self.reader.notice {
            spans.push(Span::styled(
                format!("  {notice}"),
                Style::default().fg(Color::Red),
            ));
        }
        Line::from(spans)
    }
}

fn toc_item(row: &TocRow) -> ListItem<'static> {
    let indent = "  ".repeat(row.level.min(12));
    let marker = match (row.is_leaf, row.expanded) {
        (true, _) => " ",
        (false, true) => "▾",
        (false, false) => "▸",
    };
    let style = if row.active {
        Style::default().fg(ACCENT).add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };
    ListItem::new(Line::styled(
        format!("{indent}{marker} {}", row.label),
        style,
    ))
}

fn setup_terminal() -> anyhow::Result<Terminal<CrosstermBackend<Stdout>>> {
    terminal::enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, EnterAlternateScreen).context("enter alt screen")?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend).context("create terminal")
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> anyhow::Result<()> {
    terminal::disable_raw_mode().context("disable raw mode")?;
    crossterm::execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("leave alt screen")?;
    Ok(())
}

fn panic_to_string(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: (unknown payload)".to_string()
    }
}

/// Greedy word wrap by display width. Blank input yields one empty line so
/// paragraph gaps survive.
fn wrap_text(text: &str, max_width: usize) -> Vec<String> {
    if max_width == 0 {
        return vec![text.to_string()];
    }

    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_width = 0usize;

    for word in text.split_whitespace() {
        let word_width = UnicodeWidthStr::width(word);
        let sep_width = if current.is_empty() { 0 } else { 1 };

        if current_width + sep_width + word_width <= max_width {
            if !current.is_empty() {
                current.push(' ');
                current_width += 1;
            }
            current.push_str(word);
            current_width += word_width;
            continue;
        }

        if !current.is_empty() {
            lines.push(std::mem::take(&mut current));
            current_width = 0;
        }

        if word_width <= max_width {
            current.push_str(word);
            current_width = word_width;
            continue;
        }

        let mut chunk = String::new();
        let mut chunk_width = 0usize;
        for ch in word.chars() {
            let mut buf = [0u8; 4];
            let w = UnicodeWidthStr::width(&*ch.encode_utf8(&mut buf));
            if chunk_width + w > max_width && !chunk.is_empty() {
                lines.push(std::mem::take(&mut chunk));
                chunk_width = 0;
            }
            chunk.push(ch);
            chunk_width += w;
        }
        current = chunk;
        current_width = chunk_width;
    }

    if !current.is_empty() {
        lines.push(current);
    }

    if lines.is_empty() {
        vec![String::new()]
    } else {
        lines
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crossterm::event::KeyModifiers;
    use folio_core::{BookFile, BookId, MemoryProgressStore};
    use folio_engine::AdapterRegistry;
    use ratatui::backend::TestBackend;

    use super::*;

    fn ui_for(text: &str) -> anyhow::Result<Ui> {
        let mut engine =
            NavigationEngine::new(Arc::new(MemoryProgressStore::new()), Settings::default());
        let file = BookFile::new("guide.md", text.as_bytes().to_vec());
        engine.open(&AdapterRegistry::with_defaults(), &file, BookId("guide".to_string()))?;
        Ok(Ui::new(engine))
    }

    fn press(ui: &mut Ui, code: KeyCode) -> bool {
        ui.handle_key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn location(ui: &Ui) -> String {
        ui.engine()
            .location()
            .map(|location| location.to_string())
            .unwrap_or_default()
    }

    #[test]
    fn wrap_text_breaks_on_width() {
        assert_eq!(wrap_text("one two three", 7), ["one two", "three"]);
        assert_eq!(wrap_text("abcdefgh", 3), ["abc", "def", "gh"]);
        assert_eq!(wrap_text("   ", 10), [""]);
    }

    #[test]
    fn keys_turn_units_and_quit() -> anyhow::Result<()> {
        let mut ui = ui_for("# One\na\n# Two\nb\n")?;
        assert!(!press(&mut ui, KeyCode::Char('n')));
        assert_eq!(location(&ui), "heading-1-2");
        assert_eq!(ui.toc_panel.selected, 1);

        press(&mut ui, KeyCode::Right);
        assert_eq!(location(&ui), "heading-1-2");

        press(&mut ui, KeyCode::Left);
        assert_eq!(location(&ui), "heading-1-1");
        assert!(press(&mut ui, KeyCode::Char('q')));
        Ok(())
    }

    #[test]
    fn enter_on_toc_row_navigates() -> anyhow::Result<()> {
        let mut ui = ui_for("# One\na\n# Two\nb\n# Three\nc\n")?;
        press(&mut ui, KeyCode::Down);
        press(&mut ui, KeyCode::Down);
        press(&mut ui, KeyCode::Enter);
        assert_eq!(location(&ui), "heading-1-3");
        Ok(())
    }

    #[test]
    fn mode_key_cycles_view_mode() -> anyhow::Result<()> {
        let mut ui = ui_for("# One\n")?;
        press(&mut ui, KeyCode::Char('m'));
        assert_eq!(
            ui.engine().settings().view_mode(),
            folio_core::ViewMode::Scrolled
        );
        assert!(ui.engine().strategy().is_scrolled());
        Ok(())
    }

    #[test]
    fn draw_renders_panes_and_status() -> anyhow::Result<()> {
        let ui = ui_for("# One\nhello world\n# Two\nb\n")?;
        let mut terminal = Terminal::new(TestBackend::new(60, 10))?;
        terminal.draw(|frame| ui.draw(frame.area(), frame))?;

        let buffer = terminal.backend().buffer();
        let rendered = (0..buffer.area.height)
            .map(|y| {
                (0..buffer.area.width)
                    .map(|x| buffer[(x, y)].symbol().to_string())
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("\n");
        assert!(rendered.contains("Contents"));
        assert!(rendered.contains("hello world"));
        assert!(rendered.contains("1/2"));
        Ok(())
    }
}
