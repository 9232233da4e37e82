//! Application orchestration layer for Folio.

mod navigation;
mod scroll;
mod toc;

pub use navigation::{
    NavStrategy, NavigationEngine, NavigationError, PAGE_TRANSITION, ReaderState, ReaderView,
    Relocation,
};
pub use scroll::{ScrollDebouncer, nearest_anchor};
pub use toc::{TocAction, TocModel, TocNode, TocRow};
