//! PDF through the `pdf` crate: outline destinations mapped to page indices
//! and page text pulled from content-stream text operators.

use std::collections::HashMap;
use std::sync::Arc;

use folio_core::{
    BookFile, ContentUnit, Cover, DocumentError, DocumentFormat, Location, Metadata,
    OutlineEntry, UnitContent,
};
use pdf::content::{Op, TextDrawAdjusted};
use pdf::error::PdfError;
use pdf::file::{CachedFile, FileOptions};
use pdf::font::ToUnicodeMap;
use pdf::object::{
    Action, Catalog, Dest, MaybeNamedDest, OutlineItem, PageTree, PagesNode, PlainRef, RcRef,
    Resolve, Resources,
};
use pdf::primitive::{Name, PdfString, Primitive};
use tracing::{debug, warn};

use crate::text::{reflow, sanitize};
use crate::{DocumentAdapter, DocumentHandle, check_unit};

const SIGNATURE: &[u8] = b"%PDF-";
const SIGNATURE_WINDOW: usize = 1024;

const TJ_INSERT_SPACE_THRESHOLD: f32 = -200.0;
const EMPTY_PAGE_TEXT: &str = "no text found";

#[derive(Debug, Default, Clone, Copy)]
pub struct PdfAdapter;

impl DocumentAdapter for PdfAdapter {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Pdf
    }

    fn open(&self, file: &BookFile) -> Result<Box<dyn DocumentHandle>, DocumentError> {
        let window = &file.bytes[..file.bytes.len().min(SIGNATURE_WINDOW)];
        if !window.windows(SIGNATURE.len()).any(|w| w == SIGNATURE) {
            return Err(DocumentError::UnsupportedFormat(format!(
                "{}: missing %PDF- header",
                file.name
            )));
        }
        Ok(Box::new(PdfHandle::open(file)?))
    }
}

fn corrupt(err: impl std::fmt::Display) -> DocumentError {
    DocumentError::corrupt(DocumentFormat::Pdf, err.to_string())
}

pub struct PdfHandle {
    /// Parsed once on open; `None` after close.
    pdf: Option<CachedFile<Arc<[u8]>>>,
    metadata: Metadata,
    page_count: usize,
    /// (page index, entry) in document order.
    outline: Vec<(Option<usize>, OutlineEntry)>,
    pages: HashMap<usize, UnitContent>,
}

impl PdfHandle {
    fn open(file: &BookFile) -> Result<Self, DocumentError> {
        let bytes: Arc<[u8]> = Arc::from(file.bytes.as_slice());
        let pdf = FileOptions::cached().load(bytes).map_err(corrupt)?;

        let page_count = pdf.num_pages() as usize;
        if page_count == 0 {
            return Err(corrupt("document has no pages"));
        }

        let (title, author) = match pdf.trailer.info_dict.as_ref() {
            Some(info) => (
                info.title.as_ref().map(|s| s.to_string_lossy()),
                info.author.as_ref().map(|s| s.to_string_lossy()),
            ),
            None => (None, None),
        };
        let metadata = Metadata::from_parts(file, title, author, None);

        let outline = match read_outline(&pdf.resolver(), pdf.get_root()) {
            Ok(outline) => outline,
            Err(err) => {
                warn!(%err, "pdf outline unreadable");
                Vec::new()
            }
        };

        debug!(pages = page_count, toc = outline.len(), "opened pdf");

        Ok(Self {
            pdf: Some(pdf),
            metadata,
            page_count,
            outline,
            pages: HashMap::new(),
        })
    }

    fn page_text(&self, page_index: usize) -> Result<String, DocumentError> {
        let pdf = self
            .pdf
            .as_ref()
            .ok_or_else(|| DocumentError::not_found(format!("page {page_index} (closed)")))?;
        let resolver = pdf.resolver();
        let page = pdf.get_page(page_index as u32).map_err(corrupt)?;
        let resources = page.resources().map_err(corrupt)?;
        let Some(content) = &page.contents else {
            return Ok(String::new());
        };
        let ops = content.operations(&resolver).map_err(corrupt)?;
        Ok(ops_to_text(&ops, &resolver, resources))
    }
}

impl DocumentHandle for PdfHandle {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Pdf
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn cover(&self) -> Option<Cover> {
        None
    }

    fn location_count(&self) -> usize {
        self.page_count
    }

    fn outline(&self) -> Vec<OutlineEntry> {
        self.outline.iter().map(|(_, entry)| entry.clone()).collect()
    }

    fn resolve_location(&mut self, location: &Location) -> Result<ContentUnit, DocumentError> {
        let token = location.as_str().trim();
        match token.parse::<usize>() {
            Ok(page) if page < self.page_count => Ok(ContentUnit::start(page)),
            _ => Err(DocumentError::not_found(token)),
        }
    }

    fn location_of(&self, unit: &ContentUnit) -> Location {
        Location::new(unit.index.min(self.page_count.saturating_sub(1)).to_string())
    }

    fn toc_href(&self, unit: &ContentUnit) -> Option<String> {
        self.outline
            .iter()
            .rev()
            .find(|(page, _)| page.is_some_and(|p| p <= unit.index))
            .and_then(|(_, entry)| entry.href.clone())
    }

    fn load_unit(&mut self, index: usize) -> Result<UnitContent, DocumentError> {
        check_unit(DocumentFormat::Pdf, index, self.page_count)?;
        if let Some(page) = self.pages.get(&index) {
            return Ok(page.clone());
        }

        let raw = self.page_text(index)?;
        let text = reflow(raw.trim());
        let content = UnitContent {
            index,
            label: Some(format!("Page {}", index + 1)),
            text: if text.is_empty() {
                EMPTY_PAGE_TEXT.to_string()
            } else {
                text
            },
            anchors: Vec::new(),
        };
        self.pages.insert(index, content.clone());
        Ok(content)
    }

    fn close(&mut self) {
        self.pages.clear();
        self.pdf = None;
    }
}

impl Drop for PdfHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Walks `/Outlines`, resolving named and direct destinations to zero-based
/// page indices. Entries whose destination cannot be resolved keep no href.
fn read_outline(
    resolver: &impl Resolve,
    catalog: &Catalog,
) -> Result<Vec<(Option<usize>, OutlineEntry)>, PdfError> {
    let mut dest_pages_by_name: HashMap<String, PlainRef> = HashMap::new();
    if let Some(ref names) = catalog.names
        && let Some(ref dests) = names.dests
    {
        dests.walk(resolver, &mut |key: &PdfString, val: &Option<Dest>| {
            if let Some(Dest {
                page: Some(page), ..
            }) = val
            {
                dest_pages_by_name.insert(key.to_string_lossy(), page.get_inner());
            }
        })?;
    }

    let mut pages_by_ref: HashMap<PlainRef, usize> = HashMap::new();
    fn add_tree(
        r: &impl Resolve,
        pages: &mut HashMap<PlainRef, usize>,
        tree: &PageTree,
        next_index: &mut usize,
    ) {
        for &node_ref in &tree.kids {
            let Ok(node) = r.get(node_ref) else {
                continue;
            };
            match *node {
                PagesNode::Tree(ref tree) => add_tree(r, pages, tree, next_index),
                PagesNode::Leaf(_) => {
                    pages.insert(node_ref.get_inner(), *next_index);
                    *next_index += 1;
                }
            }
        }
    }
    add_tree(resolver, &mut pages_by_ref, &catalog.pages, &mut 0);

    let page_for_ref = |r: PlainRef| pages_by_ref.get(&r).copied();
    let page_for_name = |name: &str| {
        let page_ref = dest_pages_by_name.get(name).copied()?;
        page_for_ref(page_ref)
    };

    fn walk(
        r: &impl Resolve,
        mut node: RcRef<OutlineItem>,
        depth: usize,
        page_for_name: &impl Fn(&str) -> Option<usize>,
        page_for_ref: &impl Fn(PlainRef) -> Option<usize>,
        out: &mut Vec<(Option<usize>, OutlineEntry)>,
    ) {
        loop {
            let label = node
                .title
                .as_ref()
                .map(|t| t.to_string_lossy())
                .unwrap_or_else(|| "(untitled)".to_string());

            let mut page = match node.dest {
                Some(Primitive::String(ref s)) => page_for_name(&s.to_string_lossy()),
                Some(Primitive::Array(ref a)) => match a.first() {
                    Some(Primitive::Reference(r)) => page_for_ref(*r),
                    _ => None,
                },
                _ => None,
            };

            if page.is_none()
                && let Some(Action::Goto(dest)) = node.action.clone()
            {
                page = match dest {
                    MaybeNamedDest::Named(s) => page_for_name(&s.to_string_lossy()),
                    MaybeNamedDest::Direct(Dest { page: Some(p), .. }) => {
                        page_for_ref(p.get_inner())
                    }
                    _ => None,
                };
            }

            out.push((
                page,
                OutlineEntry {
                    label,
                    href: page.map(|p| p.to_string()),
                    native_id: None,
                    level: depth,
                },
            ));

            if let Some(entry_ref) = node.first
                && let Ok(entry) = r.get(entry_ref)
            {
                walk(r, entry, depth + 1, page_for_name, page_for_ref, out);
            }

            match node.next.map(|next| r.get(next)) {
                Some(Ok(entry)) => node = entry,
                _ => break,
            }
        }
    }

    let mut out = Vec::new();
    if let Some(ref outlines) = catalog.outlines
        && let Some(entry_ref) = outlines.first
    {
        let entry = resolver.get(entry_ref)?;
        walk(resolver, entry, 0, &page_for_name, &page_for_ref, &mut out);
    }
    Ok(out)
}

fn ops_to_text(ops: &[Op], resolver: &impl Resolve, resources: &Resources) -> String {
    let mut fonts = FontMaps::default();
    let mut current_font: Option<Name> = None;
    let mut pending_space = false;
    let mut out = String::new();

    for op in ops {
        match op {
            Op::TextFont { name, .. } => current_font = Some(name.clone()),
            Op::TextDraw { text } => {
                let s = fonts.decode(text, current_font.as_ref(), resolver, resources);
                append_text_piece(&mut out, &s, &mut pending_space);
            }
            Op::TextDrawAdjusted { array } => {
                for item in array {
                    match item {
                        TextDrawAdjusted::Text(text) => {
                            let s = fonts.decode(text, current_font.as_ref(), resolver, resources);
                            append_text_piece(&mut out, &s, &mut pending_space);
                        }
                        TextDrawAdjusted::Spacing(spacing) => {
                            if *spacing <= TJ_INSERT_SPACE_THRESHOLD {
                                pending_space = true;
                            }
                        }
                    }
                }
            }
            Op::TextNewline => {
                out.push('\n');
                pending_space = false;
            }
            Op::MoveTextPosition { translation } if translation.y < 0.0 => {
                out.push('\n');
                pending_space = false;
            }
            _ => {}
        }
    }

    out
}

fn append_text_piece(out: &mut String, s: &str, pending_space: &mut bool) {
    let sanitized = sanitize(s);
    let piece = sanitized.trim_matches('\0');
    if piece.is_empty() {
        return;
    }

    if std::mem::take(pending_space) {
        let closes = piece
            .chars()
            .find(|ch| !ch.is_whitespace())
            .is_some_and(|ch| matches!(ch, ',' | '.' | ';' | ':' | '!' | '?' | ')' | ']' | '}'));
        if !out.is_empty()
            && !closes
            && !out.ends_with([' ', '\n', '\t'])
            && !piece.starts_with(char::is_whitespace)
        {
            out.push(' ');
        }
    }
    out.push_str(piece);
}

/// ToUnicode maps per font resource, loaded on first use.
#[derive(Default)]
struct FontMaps {
    maps: HashMap<Name, Option<ToUnicodeMap>>,
}

impl FontMaps {
    fn decode(
        &mut self,
        text: &PdfString,
        font: Option<&Name>,
        resolver: &impl Resolve,
        resources: &Resources,
    ) -> String {
        let map = match font {
            Some(font) => self.map_for(font, resolver, resources),
            None => None,
        };
        map.and_then(|map| decode_with_tounicode(text.as_bytes(), map))
            .unwrap_or_else(|| text.to_string_lossy())
    }

    fn map_for(
        &mut self,
        font: &Name,
        resolver: &impl Resolve,
        resources: &Resources,
    ) -> Option<&ToUnicodeMap> {
        self.maps
            .entry(font.clone())
            .or_insert_with(|| {
                resources
                    .fonts
                    .get(font)
                    .and_then(|lazy| lazy.load(resolver).ok())
                    .and_then(|font| font.to_unicode(resolver))
                    .and_then(|res| res.ok())
            })
            .as_ref()
    }
}

/// Tries one- and two-byte code widths and keeps the better match. Returns
/// `None` when the map explains too little of the string to be trusted.
fn decode_with_tounicode(bytes: &[u8], map: &ToUnicodeMap) -> Option<String> {
    let mut best = decode_codes(bytes, 1, map);
    if bytes.len().is_multiple_of(2) {
        let wide = decode_codes(bytes, 2, map);
        if wide.matched > best.matched
            || (wide.matched == best.matched && wide.text.len() > best.text.len())
        {
            best = wide;
        }
    }

    if best.total == 0 {
        return None;
    }
    let ratio = best.matched as f32 / best.total as f32;
    if (best.matched < 2 && ratio < 0.3) || ratio < 0.05 {
        return None;
    }
    Some(best.text)
}

struct Decoded {
    text: String,
    matched: usize,
    total: usize,
}

fn decode_codes(bytes: &[u8], width: usize, map: &ToUnicodeMap) -> Decoded {
    let mut decoded = Decoded {
        text: String::new(),
        matched: 0,
        total: 0,
    };
    for chunk in bytes.chunks_exact(width) {
        let code = match chunk {
            [b] => *b as u16,
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            _ => continue,
        };
        decoded.total += 1;
        match map.get(code) {
            Some(s) => {
                decoded.text.push_str(s);
                decoded.matched += 1;
            }
            None => decoded.text.push('\u{FFFD}'),
        }
    }
    decoded
}
