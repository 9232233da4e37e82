use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Epub,
    Pdf,
    Mobi,
    Markdown,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Epub => "epub",
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Mobi => "mobi",
            DocumentFormat::Markdown => "markdown",
        }
    }
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentFormat {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "epub" => Ok(DocumentFormat::Epub),
            "pdf" => Ok(DocumentFormat::Pdf),
            "mobi" => Ok(DocumentFormat::Mobi),
            "markdown" | "md" => Ok(DocumentFormat::Markdown),
            _ => Err("unknown document format"),
        }
    }
}

/// A file handed to the reader: name, declared MIME type and raw content.
#[derive(Debug, Clone)]
pub struct BookFile {
    pub name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl BookFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: None,
            bytes,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        let mime_type = mime_type.into();
        self.mime_type = (!mime_type.trim().is_empty()).then_some(mime_type);
        self
    }

    pub fn read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self::new(name, bytes))
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub title: String,
    pub author: Option<String>,
    pub language: Option<String>,
}

impl Metadata {
    /// Defaults used when a document carries no usable metadata.
    pub fn fallback(file: &BookFile) -> Self {
        let name = file.name.trim();
        let title = if name.is_empty() {
            "untitled".to_string()
        } else {
            name.to_string()
        };
        Self {
            title,
            author: None,
            language: None,
        }
    }

    /// Builds metadata from optional embedded fields, filling gaps from the
    /// file. Blank strings count as missing.
    pub fn from_parts(
        file: &BookFile,
        title: Option<String>,
        author: Option<String>,
        language: Option<String>,
    ) -> Self {
        let clean = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let fallback = Self::fallback(file);
        Self {
            title: clean(title).unwrap_or(fallback.title),
            author: clean(author),
            language: clean(language),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cover {
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl Cover {
    pub fn sniffed(bytes: Vec<u8>) -> Option<Self> {
        let media_type = sniff_image_type(&bytes)?;
        Some(Self {
            media_type: media_type.to_string(),
            bytes,
        })
    }
}

pub fn sniff_image_type(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
        Some("image/webp")
    } else if data.starts_with(b"BM") && data.len() > 14 {
        Some("image/bmp")
    } else {
        None
    }
}

/// Opaque, format-native position token. Only comparable within one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Location(String);

impl Location {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Location {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Location {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Anchor {
    /// Element id or generated heading id inside the unit.
    Id(String),
    /// Byte offset into the document's text stream.
    Offset(usize),
}

/// What a location resolves to: a loadable unit plus an optional seek target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentUnit {
    pub index: usize,
    pub anchor: Option<Anchor>,
}

impl ContentUnit {
    pub fn start(index: usize) -> Self {
        Self {
            index,
            anchor: None,
        }
    }

    pub fn with_anchor(index: usize, anchor: Anchor) -> Self {
        Self {
            index,
            anchor: Some(anchor),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorPosition {
    pub anchor: Anchor,
    pub line: usize,
}

/// Decoded text of one content unit, with the line of every seekable anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitContent {
    pub index: usize,
    pub label: Option<String>,
    pub text: String,
    pub anchors: Vec<AnchorPosition>,
}

impl UnitContent {
    pub fn line_of(&self, anchor: &Anchor) -> Option<usize> {
        self.anchors
            .iter()
            .find(|pos| &pos.anchor == anchor)
            .map(|pos| pos.line)
    }

    /// Like `line_of`, but an offset that falls between recorded anchors
    /// lands on the closest preceding one.
    pub fn seek_line(&self, anchor: &Anchor) -> Option<usize> {
        if let Some(line) = self.line_of(anchor) {
            return Some(line);
        }
        let Anchor::Offset(target) = anchor else {
            return None;
        };
        self.anchors
            .iter()
            .filter_map(|pos| match pos.anchor {
                Anchor::Offset(at) if at <= *target => Some((at, pos.line)),
                _ => None,
            })
            .max_by_key(|(at, _)| *at)
            .map(|(_, line)| line)
    }

    pub fn line_count(&self) -> usize {
        self.text.lines().count()
    }
}

/// Flat outline entry as reported by an adapter, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineEntry {
    pub label: String,
    pub href: Option<String>,
    pub native_id: Option<String>,
    pub level: usize,
}

impl OutlineEntry {
    pub fn new(label: impl Into<String>, href: impl Into<String>, level: usize) -> Self {
        Self {
            label: label.into(),
            href: Some(href.into()),
            native_id: None,
            level,
        }
    }

    pub fn with_native_id(mut self, id: impl Into<String>) -> Self {
        self.native_id = Some(id.into());
        self
    }
}

/// How a TOC href is compared against the current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HrefMatch {
    #[default]
    Exact,
    /// A TOC href also matches positions inside the same resource
    /// (`ch1.xhtml` matches `ch1.xhtml#sec2`).
    Containment,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_is_lowercased_and_optional() {
        let file = BookFile::new("Moby Dick.EPUB", Vec::new());
        assert_eq!(file.extension().as_deref(), Some("epub"));

        let bare = BookFile::new("README", Vec::new());
        assert_eq!(bare.extension(), None);

        let dotfile = BookFile::new(".hidden", Vec::new());
        assert_eq!(dotfile.extension(), None);
    }

    #[test]
    fn metadata_falls_back_per_field() {
        let file = BookFile::new("notes.md", Vec::new());
        let metadata = Metadata::from_parts(&file, Some("  ".into()), Some("Ann".into()), None);
        assert_eq!(metadata.title, "notes.md");
        assert_eq!(metadata.author.as_deref(), Some("Ann"));
        assert_eq!(metadata.language, None);
    }

    #[test]
    fn fallback_title_is_the_whole_file_name() {
        let file = BookFile::new("Moby Dick.v2.epub", Vec::new());
        assert_eq!(Metadata::fallback(&file).title, "Moby Dick.v2.epub");
        let blank = BookFile::new("  ", Vec::new());
        assert_eq!(Metadata::fallback(&blank).title, "untitled");
    }

    #[test]
    fn blank_mime_type_is_ignored() {
        let file = BookFile::new("a.pdf", Vec::new()).with_mime_type(" ");
        assert_eq!(file.mime_type, None);
    }

    #[test]
    fn sniffs_common_images() {
        assert_eq!(sniff_image_type(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_image_type(b"\x89PNG\r\n\x1a\n"), Some("image/png"));
        assert_eq!(sniff_image_type(b"GIF89a.."), Some("image/gif"));
        assert_eq!(sniff_image_type(b"plain"), None);
    }

    #[test]
    fn unit_content_finds_anchor_lines() {
        let content = UnitContent {
            index: 0,
            label: None,
            text: "a\nb\nc".to_string(),
            anchors: vec![AnchorPosition {
                anchor: Anchor::Id("b".into()),
                line: 1,
            }],
        };
        assert_eq!(content.line_of(&Anchor::Id("b".into())), Some(1));
        assert_eq!(content.line_of(&Anchor::Offset(3)), None);
        assert_eq!(content.line_count(), 3);
    }

    #[test]
    fn seek_line_rounds_offsets_down() {
        let content = UnitContent {
            index: 0,
            label: None,
            text: "a\nb\nc".to_string(),
            anchors: vec![
                AnchorPosition {
                    anchor: Anchor::Offset(100),
                    line: 0,
                },
                AnchorPosition {
                    anchor: Anchor::Offset(250),
                    line: 2,
                },
            ],
        };
        assert_eq!(content.seek_line(&Anchor::Offset(250)), Some(2));
        assert_eq!(content.seek_line(&Anchor::Offset(249)), Some(0));
        assert_eq!(content.seek_line(&Anchor::Offset(99)), None);
        assert_eq!(content.seek_line(&Anchor::Id("x".into())), None);
    }
}
