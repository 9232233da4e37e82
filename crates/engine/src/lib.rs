//! Document adapters and the registry that selects them.

mod cfi;
mod epub;
mod markdown;
mod mobi;
mod palmdoc;
mod pdf;
mod registry;
mod text;
mod xml;

use folio_core::{
    BookFile, ContentUnit, Cover, DocumentError, DocumentFormat, HrefMatch, Location, Metadata,
    OutlineEntry, UnitContent,
};

pub use cfi::Cfi;
pub use epub::EpubAdapter;
pub use markdown::MarkdownAdapter;
pub use mobi::MobiAdapter;
pub use pdf::PdfAdapter;
pub use registry::{AdapterFactory, AdapterRegistry, GENERIC_MIME_TYPES};

/// One implementation per format. Selected by [`AdapterRegistry`]; callers
/// never branch on the format after selection.
pub trait DocumentAdapter: Send + Sync {
    fn format(&self) -> DocumentFormat;

    /// Checks the container signature and parses enough structure to serve
    /// metadata, the outline and location resolution. A wrong signature is
    /// `UnsupportedFormat`, a structural failure is `CorruptDocument`.
    fn open(&self, file: &BookFile) -> Result<Box<dyn DocumentHandle>, DocumentError>;
}

/// An open document. Content units are decoded lazily by `load_unit`.
pub trait DocumentHandle {
    fn format(&self) -> DocumentFormat;

    /// Never fails: missing fields are already filled with defaults.
    fn metadata(&self) -> &Metadata;

    /// `None` when the document has no embedded cover.
    fn cover(&self) -> Option<Cover>;

    /// Number of content units (chapters, pages or sections).
    fn location_count(&self) -> usize;

    /// Raw outline in document order; hrefs are location tokens.
    fn outline(&self) -> Vec<OutlineEntry>;

    /// Maps a location token or outline href to a content unit. Stale tokens
    /// yield `LocationNotFound`.
    fn resolve_location(&mut self, location: &Location) -> Result<ContentUnit, DocumentError>;

    /// Inverse of `resolve_location` for positions produced during traversal.
    fn location_of(&self, unit: &ContentUnit) -> Location;

    /// The href form of a position, comparable with outline hrefs.
    fn toc_href(&self, unit: &ContentUnit) -> Option<String>;

    fn href_match(&self) -> HrefMatch {
        HrefMatch::Exact
    }

    fn load_unit(&mut self, index: usize) -> Result<UnitContent, DocumentError>;

    /// Releases decode buffers. Safe to call more than once.
    fn close(&mut self);
}

pub(crate) fn check_unit(
    format: DocumentFormat,
    index: usize,
    count: usize,
) -> Result<(), DocumentError> {
    if index < count {
        Ok(())
    } else {
        Err(DocumentError::not_found(format!(
            "{format} unit {index} (of {count})"
        )))
    }
}
