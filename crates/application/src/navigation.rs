//! The reader's navigation state machine.
//!
//! `Idle -> Loading -> Ready <-> Navigating`, with `Error` ending a failed
//! open. Every successful navigation persists the new position before it is
//! reported, and recomputes the TOC's active entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use folio_core::{
    BookFile, BookId, ContentUnit, Cover, DocumentError, DocumentFormat, Location, ManagerMode,
    Metadata, ProgressStore, ReadingMode, Settings, UnitContent,
};
use folio_engine::{AdapterRegistry, DocumentHandle};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::scroll::{ScrollDebouncer, nearest_anchor};
use crate::toc::{TocAction, TocModel};

/// Presentational delay before a page turn in the paginated/continuous
/// strategy.
pub const PAGE_TRANSITION: Duration = Duration::from_millis(250);

/// Lines below the viewport top that still count as "at the top" when
/// picking the nearest anchor.
const SCROLL_LOOKAHEAD_LINES: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderState {
    Idle,
    Loading,
    Ready,
    Navigating,
    /// Last open attempt failed; re-opening is the only way out.
    Error(String),
}

/// One of the four behaviours selected by `(ReadingMode, ManagerMode)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavStrategy {
    PageTurn,
    AnimatedPageTurn,
    Scroll,
    ContinuousScroll,
}

impl NavStrategy {
    pub fn from_modes(reading: ReadingMode, manager: ManagerMode) -> Self {
        match (reading, manager) {
            (ReadingMode::Paginated, ManagerMode::Default) => NavStrategy::PageTurn,
            (ReadingMode::Paginated, ManagerMode::Continuous) => NavStrategy::AnimatedPageTurn,
            (ReadingMode::Scrolled, ManagerMode::Default) => NavStrategy::Scroll,
            (ReadingMode::Scrolled, ManagerMode::Continuous) => NavStrategy::ContinuousScroll,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NavStrategy::PageTurn => "page turn",
            NavStrategy::AnimatedPageTurn => "animated page turn",
            NavStrategy::Scroll => "scroll",
            NavStrategy::ContinuousScroll => "continuous scroll",
        }
    }

    /// Whether the position follows the scroll offset between turns.
    pub fn is_scrolled(&self) -> bool {
        matches!(self, NavStrategy::Scroll | NavStrategy::ContinuousScroll)
    }

    pub fn transition(&self) -> Option<Duration> {
        match self {
            NavStrategy::AnimatedPageTurn => Some(PAGE_TRANSITION),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum NavigationError {
    #[error("no document is open")]
    NotReady,

    #[error("another navigation is in progress")]
    Busy,

    #[error(transparent)]
    Document(#[from] DocumentError),

    /// The position moved, but could not be persisted.
    #[error("failed to save reading progress: {0}")]
    Progress(String),
}

/// Outcome of a successful navigation, for the view to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct Relocation {
    pub location: Location,
    pub unit_index: usize,
    /// Line to scroll to inside the loaded unit.
    pub scroll_to: Option<f64>,
    pub transition: Option<Duration>,
}

/// Snapshot of everything the view renders.
#[derive(Debug, Clone, Copy)]
pub struct ReaderView<'a> {
    pub format: DocumentFormat,
    pub metadata: &'a Metadata,
    pub toc: &'a TocModel,
    pub location: &'a Location,
    pub unit: &'a ContentUnit,
    pub unit_count: usize,
    pub content: &'a UnitContent,
    pub can_go_next: bool,
    pub can_go_prev: bool,
    pub scroll_offset: Option<f64>,
    pub strategy: NavStrategy,
}

struct OpenBook {
    id: BookId,
    handle: Box<dyn DocumentHandle>,
    toc: TocModel,
    unit: ContentUnit,
    content: UnitContent,
    location: Location,
    scroll_offset: Option<f64>,
}

impl OpenBook {
    fn sync_toc(&mut self) {
        let href = self.handle.toc_href(&self.unit);
        self.toc.sync_to(href.as_deref());
    }
}

pub struct NavigationEngine {
    store: Arc<dyn ProgressStore>,
    settings: Settings,
    strategy: NavStrategy,
    state: ReaderState,
    book: Option<OpenBook>,
    debouncer: ScrollDebouncer,
}

impl NavigationEngine {
    pub fn new(store: Arc<dyn ProgressStore>, mut settings: Settings) -> Self {
        settings.normalize();
        Self {
            store,
            strategy: NavStrategy::from_modes(settings.reading_mode, settings.manager_mode),
            debouncer: ScrollDebouncer::new(settings.scroll_debounce()),
            settings,
            state: ReaderState::Idle,
            book: None,
        }
    }

    pub fn state(&self) -> &ReaderState {
        &self.state
    }

    pub fn strategy(&self) -> NavStrategy {
        self.strategy
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn book_id(&self) -> Option<&BookId> {
        self.book.as_ref().map(|book| &book.id)
    }

    pub fn location(&self) -> Option<&Location> {
        self.book.as_ref().map(|book| &book.location)
    }

    pub fn toc(&self) -> Option<&TocModel> {
        self.book.as_ref().map(|book| &book.toc)
    }

    pub fn cover(&self) -> Option<Cover> {
        self.book.as_ref().and_then(|book| book.handle.cover())
    }

    pub fn can_go_next(&self) -> bool {
        self.book
            .as_ref()
            .is_some_and(|book| book.unit.index + 1 < book.handle.location_count())
    }

    pub fn can_go_prev(&self) -> bool {
        self.book.as_ref().is_some_and(|book| book.unit.index > 0)
    }

    pub fn view(&self) -> Option<ReaderView<'_>> {
        let book = self.book.as_ref()?;
        Some(ReaderView {
            format: book.handle.format(),
            metadata: book.handle.metadata(),
            toc: &book.toc,
            location: &book.location,
            unit: &book.unit,
            unit_count: book.handle.location_count(),
            content: &book.content,
            can_go_next: self.can_go_next(),
            can_go_prev: self.can_go_prev(),
            scroll_offset: book.scroll_offset,
            strategy: self.strategy,
        })
    }

    /// Opens `file` and restores its saved position. Any open book is closed
    /// first. Failures leave the engine in `Error` with nothing retained.
    pub fn open(
        &mut self,
        registry: &AdapterRegistry,
        file: &BookFile,
        book_id: BookId,
    ) -> Result<(), NavigationError> {
        if matches!(self.state, ReaderState::Loading | ReaderState::Navigating) {
            return Err(NavigationError::Busy);
        }
        self.close();
        self.state = ReaderState::Loading;
        info!(book_id = %book_id, file = %file.name, "opening book");

        match self.load(registry, file, book_id) {
            Ok(book) => {
                info!(
                    book_id = %book.id,
                    location = %book.location,
                    unit = book.unit.index,
                    "book ready"
                );
                self.book = Some(book);
                self.state = ReaderState::Ready;
                Ok(())
            }
            Err(err) => {
                warn!(file = %file.name, error = %err, "failed to open book");
                self.state = ReaderState::Error(err.to_string());
                Err(err.into())
            }
        }
    }

    fn load(
        &self,
        registry: &AdapterRegistry,
        file: &BookFile,
        book_id: BookId,
    ) -> Result<OpenBook, DocumentError> {
        let mut handle = registry.open(file)?;
        let toc = TocModel::build(&handle.outline(), handle.href_match());

        let saved = self.store.load(&book_id).unwrap_or_else(|err| {
            warn!(book_id = %book_id, error = %err, "failed to read reading progress");
            None
        });

        let (mut unit, mut scroll_offset) = (ContentUnit::start(0), None);
        if let Some(progress) = saved {
            match handle.resolve_location(&progress.location) {
                Ok(restored) => {
                    debug!(book_id = %book_id, location = %progress.location, "restoring progress");
                    unit = restored;
                    scroll_offset = progress.scroll_offset;
                }
                Err(err) => warn!(
                    book_id = %book_id,
                    location = %progress.location,
                    error = %err,
                    "saved location no longer resolves; starting from the beginning"
                ),
            }
        }

        let content = match handle.load_unit(unit.index) {
            Ok(content) => content,
            Err(err) if unit.index != 0 => {
                warn!(book_id = %book_id, unit = unit.index, error = %err, "restored unit failed to load");
                unit = ContentUnit::start(0);
                scroll_offset = None;
                handle.load_unit(0)?
            }
            Err(err) => return Err(err),
        };

        if scroll_offset.is_none() {
            scroll_offset = unit
                .anchor
                .as_ref()
                .and_then(|anchor| content.seek_line(anchor))
                .map(|line| line as f64);
        }

        let location = handle.location_of(&unit);
        let mut book = OpenBook {
            id: book_id,
            handle,
            toc,
            unit,
            content,
            location,
            scroll_offset,
        };
        book.sync_toc();
        Ok(book)
    }

    /// Releases the document and drops any pending scroll sample.
    pub fn close(&mut self) {
        self.debouncer.cancel();
        if let Some(mut book) = self.book.take() {
            book.handle.close();
            debug!(book_id = %book.id, "book closed");
        }
        self.state = ReaderState::Idle;
    }

    fn ensure_ready(&self) -> Result<(), NavigationError> {
        match self.state {
            ReaderState::Ready => Ok(()),
            ReaderState::Loading | ReaderState::Navigating => Err(NavigationError::Busy),
            ReaderState::Idle | ReaderState::Error(_) => Err(NavigationError::NotReady),
        }
    }

    /// Next content unit; `None` at the last one.
    pub fn next(&mut self) -> Result<Option<Relocation>, NavigationError> {
        self.ensure_ready()?;
        if !self.can_go_next() {
            return Ok(None);
        }
        let index = self.current_index() + 1;
        self.relocate(ContentUnit::start(index)).map(Some)
    }

    /// Previous content unit; `None` at the first one.
    pub fn prev(&mut self) -> Result<Option<Relocation>, NavigationError> {
        self.ensure_ready()?;
        if !self.can_go_prev() {
            return Ok(None);
        }
        let index = self.current_index() - 1;
        self.relocate(ContentUnit::start(index)).map(Some)
    }

    /// Navigates to a TOC href or location token. Unresolvable targets fall
    /// back to the document start.
    pub fn jump_to(&mut self, href: &str) -> Result<Relocation, NavigationError> {
        self.ensure_ready()?;
        let book = self.book.as_mut().ok_or(NavigationError::NotReady)?;
        let target = match book.handle.resolve_location(&Location::from(href)) {
            Ok(target) => target,
            Err(err) => {
                warn!(book_id = %book.id, href, error = %err, "jump target not found; going to start");
                ContentUnit::start(0)
            }
        };
        self.relocate(target)
    }

    /// Branches toggle, leaves navigate.
    pub fn activate_toc(&mut self, id: &str) -> Result<Option<Relocation>, NavigationError> {
        self.ensure_ready()?;
        let book = self.book.as_mut().ok_or(NavigationError::NotReady)?;
        match book.toc.activate(id) {
            Some(TocAction::Navigate { href }) => self.jump_to(&href).map(Some),
            Some(TocAction::Toggled { .. }) | None => Ok(None),
        }
    }

    pub fn toggle_toc(&mut self, id: &str) -> Option<bool> {
        self.book.as_mut()?.toc.toggle(id)
    }

    /// Feeds a scroll sample. Ignored outside the scrolled strategies.
    pub fn on_scroll(&mut self, offset: f64, now: Instant) {
        if self.strategy.is_scrolled() && self.state == ReaderState::Ready {
            self.debouncer.record(offset, now);
        }
    }

    /// Settles a debounced scroll sample into a new location. Does nothing
    /// while a navigation is in flight.
    pub fn poll(&mut self, now: Instant) -> Result<Option<Relocation>, NavigationError> {
        if self.state != ReaderState::Ready {
            return Ok(None);
        }
        let Some(offset) = self.debouncer.poll(now) else {
            return Ok(None);
        };
        let Some(book) = self.book.as_mut() else {
            return Ok(None);
        };

        let anchor = nearest_anchor(offset, &book.content.anchors, SCROLL_LOOKAHEAD_LINES)
            .map(|position| position.anchor.clone());
        book.unit = ContentUnit {
            index: book.unit.index,
            anchor,
        };
        book.location = book.handle.location_of(&book.unit);
        book.scroll_offset = Some(offset);
        book.sync_toc();
        debug!(book_id = %book.id, location = %book.location, offset, "scroll settled");

        persist(self.store.as_ref(), book)?;
        Ok(Some(Relocation {
            location: book.location.clone(),
            unit_index: book.unit.index,
            scroll_to: None,
            transition: None,
        }))
    }

    pub fn set_modes(&mut self, reading: ReadingMode, manager: ManagerMode) {
        self.settings.reading_mode = reading;
        self.settings.manager_mode = manager;
        self.strategy = NavStrategy::from_modes(reading, manager);
        self.debouncer.cancel();
        debug!(strategy = self.strategy.as_str(), "navigation strategy changed");
    }

    fn current_index(&self) -> usize {
        self.book.as_ref().map_or(0, |book| book.unit.index)
    }

    /// Two phases: load the target unit if it is not the current one, then
    /// seek to the anchor inside it. Progress is written before returning.
    fn relocate(&mut self, target: ContentUnit) -> Result<Relocation, NavigationError> {
        self.debouncer.cancel();
        self.state = ReaderState::Navigating;
        let result = match self.book.as_mut() {
            Some(book) => apply(self.store.as_ref(), book, target, self.strategy),
            None => Err(NavigationError::NotReady),
        };
        self.state = ReaderState::Ready;
        result
    }
}

fn apply(
    store: &dyn ProgressStore,
    book: &mut OpenBook,
    target: ContentUnit,
    strategy: NavStrategy,
) -> Result<Relocation, NavigationError> {
    if target.index != book.content.index {
        book.content = book.handle.load_unit(target.index)?;
    }

    let scroll_to = target
        .anchor
        .as_ref()
        .and_then(|anchor| book.content.seek_line(anchor))
        .map(|line| line as f64);
    book.unit = target;
    book.location = book.handle.location_of(&book.unit);
    book.scroll_offset = scroll_to;
    book.sync_toc();
    debug!(
        book_id = %book.id,
        unit = book.unit.index,
        location = %book.location,
        "relocated"
    );

    persist(store, book)?;
    Ok(Relocation {
        location: book.location.clone(),
        unit_index: book.unit.index,
        scroll_to,
        transition: strategy.transition(),
    })
}

fn persist(store: &dyn ProgressStore, book: &OpenBook) -> Result<(), NavigationError> {
    store
        .save(&book.id, &book.location, book.scroll_offset)
        .map_err(|err| {
            warn!(book_id = %book.id, location = %book.location, error = %err, "failed to save progress");
            NavigationError::Progress(format!("{err:#}"))
        })
}
