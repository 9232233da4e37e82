//! Maps MIME types and file extensions to adapters. This is the only place
//! that decides whether a file is supported.

use std::collections::HashMap;
use std::sync::Arc;

use folio_core::{BookFile, DocumentError};
use tracing::{debug, info};

use crate::{
    DocumentAdapter, DocumentHandle, EpubAdapter, MarkdownAdapter, MobiAdapter, PdfAdapter,
};

/// Declared types too vague to pick an adapter; the extension decides.
pub const GENERIC_MIME_TYPES: [&str; 4] = [
    "",
    "application/octet-stream",
    "text/plain",
    "application/txt",
];

pub type AdapterFactory = Arc<dyn Fn() -> Box<dyn DocumentAdapter> + Send + Sync>;

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

fn normalize_key(key: &str) -> String {
    key.trim().trim_start_matches('.').to_ascii_lowercase()
}

fn factory<A>(adapter: A) -> AdapterFactory
where
    A: DocumentAdapter + Clone + 'static,
{
    Arc::new(move || Box::new(adapter.clone()) as Box<dyn DocumentAdapter>)
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All four built-in formats.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for key in ["application/epub+zip", "epub"] {
            registry.register(key, factory(EpubAdapter));
        }
        for key in ["application/pdf", "pdf"] {
            registry.register(key, factory(PdfAdapter));
        }
        for key in ["application/x-mobipocket-ebook", "application/mobi", "mobi", "prc"] {
            registry.register(key, factory(MobiAdapter));
        }
        for key in [
            "text/markdown",
            "text/x-markdown",
            "application/markdown",
            "application/md",
            "md",
            "markdown",
            "txt",
        ] {
            registry.register(key, factory(MarkdownAdapter));
        }
        registry
    }

    /// Registers under a MIME type or a file extension (with or without the
    /// leading dot). A later registration for the same key replaces the
    /// earlier one.
    pub fn register(&mut self, key: &str, factory: AdapterFactory) {
        self.factories.insert(normalize_key(key), factory);
    }

    /// Declared MIME type first; generic or unknown types fall back to the
    /// file extension.
    pub fn get_adapter(
        &self,
        file: &BookFile,
    ) -> Result<Box<dyn DocumentAdapter>, DocumentError> {
        let mime = file
            .mime_type
            .as_deref()
            .map(normalize_key)
            .unwrap_or_default();
        if !GENERIC_MIME_TYPES.contains(&mime.as_str())
            && let Some(factory) = self.factories.get(&mime)
        {
            debug!(file = %file.name, mime = %mime, "adapter selected by mime type");
            return Ok(factory());
        }

        let extension = file.extension();
        if let Some(factory) = extension.as_ref().and_then(|ext| self.factories.get(ext)) {
            debug!(file = %file.name, extension = ?extension, "adapter selected by extension");
            return Ok(factory());
        }

        let declared = match (&file.mime_type, &extension) {
            (Some(mime), Some(ext)) => format!("{} ({mime}, .{ext})", file.name),
            (Some(mime), None) => format!("{} ({mime})", file.name),
            (None, Some(ext)) => format!("{} (.{ext})", file.name),
            (None, None) => file.name.clone(),
        };
        Err(DocumentError::UnsupportedFormat(declared))
    }

    pub fn is_supported(&self, file: &BookFile) -> bool {
        self.get_adapter(file).is_ok()
    }

    /// Registered keys, sorted, for "supported formats" listings.
    pub fn supported_keys(&self) -> Vec<String> {
        let mut keys = self.factories.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Selects an adapter and opens the file with it.
    pub fn open(&self, file: &BookFile) -> Result<Box<dyn DocumentHandle>, DocumentError> {
        let adapter = self.get_adapter(file)?;
        let handle = adapter.open(file)?;
        info!(
            file = %file.name,
            format = %handle.format(),
            units = handle.location_count(),
            "document opened"
        );
        Ok(handle)
    }
}
