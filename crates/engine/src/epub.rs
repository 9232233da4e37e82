//! EPUB 2/3: zip container, OPF package, nav or NCX outline, lazily decoded
//! XHTML chapters addressed by CFIs.

use std::collections::HashMap;
use std::io::{Cursor, Read as _};

use folio_core::{
    Anchor, AnchorPosition, BookFile, ContentUnit, Cover, DocumentError, DocumentFormat,
    HrefMatch, Location, Metadata, OutlineEntry, UnitContent, sniff_image_type,
};
use percent_encoding::percent_decode_str;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::cfi::{Cfi, CfiStep};
use crate::text::TextSink;
use crate::xml::{attr, local_name, resolve_entity, strip_bom};
use crate::{DocumentAdapter, DocumentHandle, check_unit};

const ZIP_SIGNATURE: &[u8] = b"PK\x03\x04";
const CONTAINER_PATH: &str = "META-INF/container.xml";

#[derive(Debug, Default, Clone, Copy)]
pub struct EpubAdapter;

impl DocumentAdapter for EpubAdapter {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Epub
    }

    fn open(&self, file: &BookFile) -> Result<Box<dyn DocumentHandle>, DocumentError> {
        if !file.bytes.starts_with(ZIP_SIGNATURE) {
            return Err(DocumentError::UnsupportedFormat(format!(
                "{}: not a zip container",
                file.name
            )));
        }
        let handle = EpubHandle::open(file)?;
        Ok(Box::new(handle))
    }
}

type Archive = ZipArchive<Cursor<Vec<u8>>>;

#[derive(Debug, Clone)]
struct SpineItem {
    idref: String,
    /// Path relative to the package document, without fragment.
    href: String,
    zip_path: String,
}

#[derive(Debug, Clone)]
struct ElementAnchor {
    id: String,
    path: Vec<CfiStep>,
    line: usize,
}

#[derive(Debug, Clone)]
struct Chapter {
    content: UnitContent,
    elements: Vec<ElementAnchor>,
}

impl Chapter {
    fn element(&self, id: &str) -> Option<&ElementAnchor> {
        self.elements.iter().find(|el| el.id == id)
    }
}

pub struct EpubHandle {
    archive: Option<Archive>,
    metadata: Metadata,
    cover: Option<Cover>,
    spine: Vec<SpineItem>,
    spine_by_href: HashMap<String, usize>,
    outline: Vec<OutlineEntry>,
    chapters: HashMap<usize, Chapter>,
}

fn corrupt(reason: impl Into<String>) -> DocumentError {
    DocumentError::corrupt(DocumentFormat::Epub, reason)
}

impl EpubHandle {
    fn open(file: &BookFile) -> Result<Self, DocumentError> {
        let mut archive = ZipArchive::new(Cursor::new(file.bytes.clone()))
            .map_err(|err| corrupt(format!("zip: {err}")))?;

        let container = read_entry(&mut archive, CONTAINER_PATH).map_err(corrupt)?;
        let opf_path = parse_container(&container).map_err(corrupt)?;
        let opf_dir = parent_dir(&opf_path);

        let opf = read_entry(&mut archive, &opf_path).map_err(corrupt)?;
        let package = parse_package(&String::from_utf8_lossy(strip_bom(&opf)))
            .map_err(|err| corrupt(format!("{opf_path}: {err}")))?;

        let spine = package
            .spine
            .iter()
            .filter_map(|idref| {
                let item = package.manifest.get(idref)?;
                let zip_path = join_path(&opf_dir, &item.href);
                Some(SpineItem {
                    idref: idref.clone(),
                    href: relative_to(&opf_dir, &zip_path),
                    zip_path,
                })
            })
            .collect::<Vec<_>>();
        if spine.is_empty() {
            return Err(corrupt("package has an empty spine"));
        }
        let spine_by_href = spine
            .iter()
            .enumerate()
            .map(|(idx, item)| (item.href.clone(), idx))
            .collect();

        let outline = load_outline(&mut archive, &package, &opf_dir, &spine);
        let cover = load_cover(&mut archive, &package, &opf_dir);
        let metadata = Metadata::from_parts(
            file,
            package.title.clone(),
            package.creator.clone(),
            package.language.clone(),
        );

        debug!(
            spine = spine.len(),
            toc = outline.len(),
            cover = cover.is_some(),
            "opened epub"
        );

        Ok(Self {
            archive: Some(archive),
            metadata,
            cover,
            spine,
            spine_by_href,
            outline,
            chapters: HashMap::new(),
        })
    }

    fn chapter(&mut self, index: usize) -> Result<&Chapter, DocumentError> {
        check_unit(DocumentFormat::Epub, index, self.spine.len())?;
        if !self.chapters.contains_key(&index) {
            let item = &self.spine[index];
            let archive = self
                .archive
                .as_mut()
                .ok_or_else(|| DocumentError::not_found(format!("{} (closed)", item.href)))?;
            let bytes = read_entry(archive, &item.zip_path).map_err(corrupt)?;
            let parsed = parse_xhtml(&String::from_utf8_lossy(strip_bom(&bytes)))
                .map_err(|err| corrupt(format!("{}: {err}", item.href)))?;

            let label = self
                .outline
                .iter()
                .find(|entry| {
                    entry
                        .href
                        .as_deref()
                        .is_some_and(|href| split_fragment(href).0 == item.href)
                })
                .map(|entry| entry.label.clone())
                .or(parsed.title);

            let anchors = parsed
                .elements
                .iter()
                .map(|el| AnchorPosition {
                    anchor: Anchor::Id(el.id.clone()),
                    line: el.line,
                })
                .collect();
            self.chapters.insert(
                index,
                Chapter {
                    content: UnitContent {
                        index,
                        label,
                        text: parsed.text,
                        anchors,
                    },
                    elements: parsed.elements,
                },
            );
        }
        self.chapters
            .get(&index)
            .ok_or_else(|| DocumentError::not_found(format!("epub unit {index}")))
    }

    fn spine_index_for(&self, href: &str) -> Option<usize> {
        let href = href.trim_start_matches("./");
        if let Some(idx) = self.spine_by_href.get(href) {
            return Some(*idx);
        }
        self.spine.iter().position(|item| {
            item.href.ends_with(&format!("/{href}")) || href.ends_with(&format!("/{}", item.href))
        })
    }

    fn anchored(
        &mut self,
        index: usize,
        id: &str,
        token: &str,
    ) -> Result<ContentUnit, DocumentError> {
        if self.chapter(index)?.element(id).is_some() {
            Ok(ContentUnit::with_anchor(index, Anchor::Id(id.to_string())))
        } else {
            Err(DocumentError::not_found(token))
        }
    }
}

impl DocumentHandle for EpubHandle {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Epub
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn cover(&self) -> Option<Cover> {
        self.cover.clone()
    }

    fn location_count(&self) -> usize {
        self.spine.len()
    }

    fn outline(&self) -> Vec<OutlineEntry> {
        self.outline.clone()
    }

    fn resolve_location(&mut self, location: &Location) -> Result<ContentUnit, DocumentError> {
        let token = location.as_str().trim();
        if token.is_empty() {
            return Err(DocumentError::not_found(token));
        }

        if let Some(cfi) = Cfi::parse(token) {
            // The id assertion wins over the step index when they disagree.
            let at_step = self.spine.get(cfi.spine_index).map(|i| i.idref.as_str());
            let index = match cfi.spine_id.as_deref() {
                Some(idref) if at_step != Some(idref) => self
                    .spine
                    .iter()
                    .position(|item| item.idref == idref)
                    .ok_or_else(|| DocumentError::not_found(token))?,
                _ => cfi.spine_index,
            };
            check_unit(DocumentFormat::Epub, index, self.spine.len())
                .map_err(|_| DocumentError::not_found(token))?;
            return match cfi.target_id() {
                Some(id) => self.anchored(index, id, token),
                None => Ok(ContentUnit::start(index)),
            };
        }

        let (path, fragment) = split_fragment(token);
        let index = self
            .spine_index_for(path)
            .ok_or_else(|| DocumentError::not_found(token))?;
        match fragment {
            Some(id) if !id.is_empty() => self.anchored(index, id, token),
            _ => Ok(ContentUnit::start(index)),
        }
    }

    fn location_of(&self, unit: &ContentUnit) -> Location {
        let (index, item) = match self.spine.get(unit.index) {
            Some(item) => (unit.index, item),
            None => match self.spine.first() {
                Some(item) => (0, item),
                None => return Location::new(String::new()),
            },
        };
        let cfi = Cfi::spine(index, &item.idref);
        let cfi = match &unit.anchor {
            Some(Anchor::Id(id)) if index == unit.index => match self
                .chapters
                .get(&index)
                .and_then(|chapter| chapter.element(id))
            {
                Some(el) => cfi.with_path(el.path.clone()),
                None => cfi,
            },
            _ => cfi,
        };
        Location::new(cfi.to_string())
    }

    fn toc_href(&self, unit: &ContentUnit) -> Option<String> {
        let item = self.spine.get(unit.index)?;
        Some(match &unit.anchor {
            Some(Anchor::Id(id)) => format!("{}#{id}", item.href),
            _ => item.href.clone(),
        })
    }

    fn href_match(&self) -> HrefMatch {
        HrefMatch::Containment
    }

    fn load_unit(&mut self, index: usize) -> Result<UnitContent, DocumentError> {
        Ok(self.chapter(index)?.content.clone())
    }

    fn close(&mut self) {
        self.chapters.clear();
        self.archive = None;
    }
}

impl Drop for EpubHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_entry(archive: &mut Archive, path: &str) -> Result<Vec<u8>, String> {
    let mut entry = archive
        .by_name(path)
        .map_err(|err| format!("{path}: {err}"))?;
    let mut buf = Vec::new();
    entry
        .read_to_end(&mut buf)
        .map_err(|err| format!("{path}: {err}"))?;
    Ok(buf)
}

fn load_outline(
    archive: &mut Archive,
    package: &Package,
    opf_dir: &str,
    spine: &[SpineItem],
) -> Vec<OutlineEntry> {
    let nav = package
        .manifest
        .values()
        .find(|item| item.has_property("nav"));
    if let Some(nav) = nav {
        let nav_path = join_path(opf_dir, &nav.href);
        match read_entry(archive, &nav_path)
            .and_then(|bytes| parse_nav(&String::from_utf8_lossy(strip_bom(&bytes))))
        {
            Ok(entries) if !entries.is_empty() => {
                return rebase(entries, &parent_dir(&nav_path), opf_dir);
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "unreadable nav document"),
        }
    }

    let ncx = package
        .ncx_id
        .as_ref()
        .and_then(|id| package.manifest.get(id))
        .or_else(|| {
            package
                .manifest
                .values()
                .find(|item| item.media_type == "application/x-dtbncx+xml")
        });
    if let Some(ncx) = ncx {
        let ncx_path = join_path(opf_dir, &ncx.href);
        match read_entry(archive, &ncx_path)
            .and_then(|bytes| parse_ncx(&String::from_utf8_lossy(strip_bom(&bytes))))
        {
            Ok(entries) if !entries.is_empty() => {
                return rebase(entries, &parent_dir(&ncx_path), opf_dir);
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "unreadable ncx"),
        }
    }

    spine
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            OutlineEntry::new(format!("Section {}", idx + 1), item.href.clone(), 0)
                .with_native_id(item.idref.clone())
        })
        .collect()
}

/// Rewrites outline hrefs from document-relative to package-relative.
fn rebase(entries: Vec<OutlineEntry>, doc_dir: &str, opf_dir: &str) -> Vec<OutlineEntry> {
    entries
        .into_iter()
        .map(|mut entry| {
            entry.href = entry.href.map(|href| {
                let (path, fragment) = split_fragment(&href);
                let base = if path.is_empty() {
                    String::new()
                } else {
                    relative_to(opf_dir, &join_path(doc_dir, path))
                };
                match fragment {
                    Some(id) if !id.is_empty() => format!("{base}#{id}"),
                    _ => base,
                }
            });
            entry
        })
        .collect()
}

fn load_cover(archive: &mut Archive, package: &Package, opf_dir: &str) -> Option<Cover> {
    let item = package
        .manifest
        .values()
        .find(|item| item.has_property("cover-image"))
        .or_else(|| {
            package
                .epub2_cover_id
                .as_ref()
                .and_then(|id| package.manifest.get(id))
        })?;

    let path = join_path(opf_dir, &item.href);
    match read_entry(archive, &path) {
        Ok(bytes) if !bytes.is_empty() => {
            let media_type = if item.media_type.starts_with("image/") {
                item.media_type.clone()
            } else {
                sniff_image_type(&bytes)?.to_string()
            };
            Some(Cover { media_type, bytes })
        }
        Ok(_) => None,
        Err(err) => {
            warn!(%err, "cover listed but unreadable");
            None
        }
    }
}

fn split_fragment(href: &str) -> (&str, Option<&str>) {
    match href.split_once('#') {
        Some((path, fragment)) => (path, Some(fragment)),
        None => (href, None),
    }
}

fn parent_dir(path: &str) -> String {
    path.rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .unwrap_or_default()
}

/// Resolves `href` against a zip directory, handling `.`, `..` and
/// percent-escapes.
fn join_path(base_dir: &str, href: &str) -> String {
    let href = percent_decode_str(href).decode_utf8_lossy();
    let mut parts: Vec<&str> = if href.starts_with('/') {
        Vec::new()
    } else {
        base_dir.split('/').filter(|p| !p.is_empty()).collect()
    };
    for part in href.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn relative_to(base_dir: &str, zip_path: &str) -> String {
    if base_dir.is_empty() {
        return zip_path.to_string();
    }
    zip_path
        .strip_prefix(base_dir)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(zip_path)
        .to_string()
}

/// Text events are kept untrimmed so entity references inside labels keep
/// their surrounding spaces; callers normalize whitespace themselves.
fn xml_reader(content: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().check_end_names = false;
    reader
}

fn parse_container(bytes: &[u8]) -> Result<String, String> {
    let content = String::from_utf8_lossy(strip_bom(bytes));
    let mut reader = xml_reader(&content);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if local_name(e.name().as_ref()) == b"rootfile" =>
            {
                if let Some(path) = attr(&e, b"full-path") {
                    return Ok(path);
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(format!("{CONTAINER_PATH}: {err}")),
            _ => {}
        }
    }
    Err(format!("{CONTAINER_PATH}: no rootfile"))
}

#[derive(Debug, Clone)]
struct ManifestItem {
    href: String,
    media_type: String,
    properties: Option<String>,
}

impl ManifestItem {
    fn has_property(&self, name: &str) -> bool {
        self.properties
            .as_deref()
            .is_some_and(|props| props.split_ascii_whitespace().any(|p| p == name))
    }
}

#[derive(Debug, Default)]
struct Package {
    title: Option<String>,
    creator: Option<String>,
    language: Option<String>,
    manifest: HashMap<String, ManifestItem>,
    spine: Vec<String>,
    ncx_id: Option<String>,
    epub2_cover_id: Option<String>,
}

fn parse_package(content: &str) -> Result<Package, String> {
    let mut reader = xml_reader(content);
    let mut package = Package::default();
    let mut in_metadata = false;
    let mut field: Option<&'static str> = None;
    let mut buf = String::new();

    fn element(e: &BytesStart<'_>, package: &mut Package, in_metadata: bool) {
        match local_name(e.name().as_ref()) {
            b"item" => {
                if let (Some(id), Some(href)) = (attr(e, b"id"), attr(e, b"href")) {
                    package.manifest.insert(
                        id,
                        ManifestItem {
                            href,
                            media_type: attr(e, b"media-type").unwrap_or_default(),
                            properties: attr(e, b"properties"),
                        },
                    );
                }
            }
            b"itemref" => {
                if let Some(idref) = attr(e, b"idref") {
                    package.spine.push(idref);
                }
            }
            b"spine" => package.ncx_id = attr(e, b"toc"),
            b"meta" if in_metadata => {
                if attr(e, b"name").as_deref() == Some("cover") {
                    package.epub2_cover_id = attr(e, b"content");
                }
            }
            _ => {}
        }
    }

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                match local_name(e.name().as_ref()) {
                    b"metadata" => in_metadata = true,
                    b"title" if in_metadata => field = Some("title"),
                    b"creator" if in_metadata => field = Some("creator"),
                    b"language" if in_metadata => field = Some("language"),
                    _ => {}
                }
                buf.clear();
                element(&e, &mut package, in_metadata);
            }
            Ok(Event::Empty(e)) => element(&e, &mut package, in_metadata),
            Ok(Event::Text(e)) if field.is_some() => {
                buf.push_str(&String::from_utf8_lossy(e.as_ref()));
            }
            Ok(Event::GeneralRef(e)) if field.is_some() => {
                if let Some(resolved) = resolve_entity(&String::from_utf8_lossy(e.as_ref())) {
                    buf.push_str(&resolved);
                }
            }
            Ok(Event::End(e)) => {
                if local_name(e.name().as_ref()) == b"metadata" {
                    in_metadata = false;
                }
                if let Some(name) = field.take() {
                    let value = Some(buf.split_whitespace().collect::<Vec<_>>().join(" "))
                        .filter(|v| !v.is_empty());
                    let slot = match name {
                        "title" => &mut package.title,
                        "creator" => &mut package.creator,
                        _ => &mut package.language,
                    };
                    if slot.is_none() {
                        *slot = value;
                    }
                    buf.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(err.to_string()),
            _ => {}
        }
    }

    Ok(package)
}

/// EPUB 3 navigation document: entries of the `nav[epub:type=toc]` list.
fn parse_nav(content: &str) -> Result<Vec<OutlineEntry>, String> {
    let mut reader = xml_reader(content);
    let mut entries = Vec::new();
    let mut in_toc = false;
    let mut ol_depth = 0usize;
    let mut pending: Option<OutlineEntry> = None;
    let mut capturing = false;

    fn emit(pending: &mut Option<OutlineEntry>, entries: &mut Vec<OutlineEntry>) {
        if let Some(mut entry) = pending.take() {
            entry.label = entry.label.split_whitespace().collect::<Vec<_>>().join(" ");
            if !entry.label.is_empty() {
                entries.push(entry);
            }
        }
    }

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match local_name(e.name().as_ref()) {
                b"nav" => {
                    in_toc = attr(&e, b"type")
                        .is_some_and(|t| t.split_ascii_whitespace().any(|v| v == "toc"));
                }
                b"ol" if in_toc => {
                    emit(&mut pending, &mut entries);
                    ol_depth += 1;
                }
                b"li" if in_toc => {
                    emit(&mut pending, &mut entries);
                    pending = Some(OutlineEntry {
                        label: String::new(),
                        href: None,
                        native_id: attr(&e, b"id"),
                        level: ol_depth.saturating_sub(1),
                    });
                }
                b"a" if in_toc => {
                    if let Some(entry) = pending.as_mut() {
                        entry.href = attr(&e, b"href");
                    }
                    capturing = true;
                }
                b"span" if in_toc => capturing = true,
                _ => {}
            },
            Ok(Event::Text(e)) if capturing => {
                if let Some(entry) = pending.as_mut() {
                    entry.label.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::GeneralRef(e)) if capturing => {
                if let (Some(entry), Some(resolved)) = (
                    pending.as_mut(),
                    resolve_entity(&String::from_utf8_lossy(e.as_ref())),
                ) {
                    entry.label.push_str(&resolved);
                }
            }
            Ok(Event::End(e)) => match local_name(e.name().as_ref()) {
                b"nav" if in_toc => {
                    emit(&mut pending, &mut entries);
                    in_toc = false;
                }
                b"ol" if in_toc => ol_depth = ol_depth.saturating_sub(1),
                b"li" if in_toc => emit(&mut pending, &mut entries),
                b"a" | b"span" => capturing = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => return Err(err.to_string()),
            _ => {}
        }
    }

    Ok(entries)
}

/// EPUB 2 NCX `navMap`, flattened in document order with nesting depth.
fn parse_ncx(content: &str) -> Result<Vec<OutlineEntry>, String> {
    struct NavPoint {
        entry: OutlineEntry,
        emitted: bool,
    }

    fn emit(point: &mut NavPoint, entries: &mut Vec<OutlineEntry>) {
        if point.emitted {
            return;
        }
        point.emitted = true;
        let label = point.entry.label.split_whitespace().collect::<Vec<_>>();
        if !label.is_empty() {
            let mut entry = point.entry.clone();
            entry.label = label.join(" ");
            entries.push(entry);
        }
    }

    let mut reader = xml_reader(content);
    let mut entries = Vec::new();
    let mut stack: Vec<NavPoint> = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match local_name(e.name().as_ref()) {
                b"navPoint" => {
                    if let Some(parent) = stack.last_mut() {
                        emit(parent, &mut entries);
                    }
                    stack.push(NavPoint {
                        entry: OutlineEntry {
                            label: String::new(),
                            href: None,
                            native_id: attr(&e, b"id"),
                            level: stack.len(),
                        },
                        emitted: false,
                    });
                }
                b"text" => in_text = true,
                b"content" => {
                    if let Some(point) = stack.last_mut() {
                        point.entry.href = attr(&e, b"src");
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(e)) if local_name(e.name().as_ref()) == b"content" => {
                if let Some(point) = stack.last_mut() {
                    point.entry.href = attr(&e, b"src");
                }
            }
            Ok(Event::Text(e)) if in_text => {
                if let Some(point) = stack.last_mut() {
                    point.entry.label.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::GeneralRef(e)) if in_text => {
                if let (Some(point), Some(resolved)) = (
                    stack.last_mut(),
                    resolve_entity(&String::from_utf8_lossy(e.as_ref())),
                ) {
                    point.entry.label.push_str(&resolved);
                }
            }
            Ok(Event::End(e)) => match local_name(e.name().as_ref()) {
                b"text" => in_text = false,
                b"navPoint" => {
                    if let Some(mut point) = stack.pop() {
                        emit(&mut point, &mut entries);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => return Err(err.to_string()),
            _ => {}
        }
    }

    Ok(entries)
}

struct ParsedXhtml {
    title: Option<String>,
    text: String,
    elements: Vec<ElementAnchor>,
}

fn is_paragraph_block(name: &[u8]) -> bool {
    matches!(
        name,
        b"p" | b"div"
            | b"section"
            | b"article"
            | b"aside"
            | b"header"
            | b"footer"
            | b"nav"
            | b"blockquote"
            | b"pre"
            | b"table"
            | b"ul"
            | b"ol"
            | b"dl"
            | b"figure"
            | b"hr"
            | b"h1"
            | b"h2"
            | b"h3"
            | b"h4"
            | b"h5"
            | b"h6"
    )
}

fn is_line_block(name: &[u8]) -> bool {
    matches!(name, b"li" | b"br" | b"tr" | b"dt" | b"dd" | b"figcaption")
}

/// Converts a content document to plain text, recording the CFI element
/// path and starting line of every element that carries an `id`.
fn parse_xhtml(content: &str) -> Result<ParsedXhtml, String> {
    let mut reader = xml_reader(content);
    let mut sink = TextSink::new();
    let mut elements = Vec::new();
    let mut title: Option<String> = None;

    // Child-element counters per open element; index 0 is the root.
    let mut counters: Vec<usize> = Vec::new();
    let mut path: Vec<CfiStep> = Vec::new();
    let mut skip = 0usize;
    let mut in_head = false;
    let mut in_title = false;

    loop {
        let event = reader.read_event().map_err(|err| err.to_string())?;
        let empty = matches!(event, Event::Empty(_));
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let raw_name = e.name();
                let name = local_name(raw_name.as_ref()).to_ascii_lowercase();

                let step = match counters.last_mut() {
                    Some(count) => {
                        let step = CfiStep::element(*count);
                        *count += 1;
                        Some(step)
                    }
                    None => None,
                };

                if skip > 0 {
                    if !empty {
                        skip += 1;
                    }
                } else if matches!(name.as_slice(), b"script" | b"style") {
                    if !empty {
                        skip = 1;
                    }
                } else if name == b"head" {
                    in_head = !empty;
                } else if name == b"title" && in_head {
                    in_title = !empty;
                } else if is_paragraph_block(&name) {
                    sink.paragraph_break();
                    if name == b"pre" && !empty {
                        sink.enter_preformatted();
                    }
                } else if is_line_block(&name) {
                    sink.line_break();
                }

                if let Some(step) = step {
                    if let Some(id) = attr(e, b"id").filter(|id| !id.is_empty()) {
                        let mut anchor_path = path.clone();
                        anchor_path.push(step.clone().with_id(id.clone()));
                        elements.push(ElementAnchor {
                            id,
                            path: anchor_path,
                            line: sink.line(),
                        });
                    }
                    if !empty {
                        path.push(step);
                    }
                }
                if !empty {
                    counters.push(0);
                }
            }
            Event::End(ref e) => {
                let raw_name = e.name();
                let name = local_name(raw_name.as_ref()).to_ascii_lowercase();
                counters.pop();
                path.truncate(counters.len().saturating_sub(1));

                if skip > 0 {
                    skip -= 1;
                } else if name == b"head" {
                    in_head = false;
                } else if name == b"title" {
                    in_title = false;
                } else if is_paragraph_block(&name) {
                    if name == b"pre" {
                        sink.leave_preformatted();
                    }
                    sink.paragraph_break();
                } else if is_line_block(&name) {
                    sink.line_break();
                }
            }
            Event::Text(ref e) => {
                let text = String::from_utf8_lossy(e.as_ref());
                if in_title {
                    title.get_or_insert_with(String::new).push_str(&text);
                } else if skip == 0 && !in_head {
                    sink.push_text(&text);
                }
            }
            Event::CData(e) => {
                if skip == 0 && !in_head {
                    sink.push_text(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::GeneralRef(ref e) => {
                if let Some(resolved) = resolve_entity(&String::from_utf8_lossy(e.as_ref())) {
                    if in_title {
                        title.get_or_insert_with(String::new).push_str(&resolved);
                    } else if skip == 0 && !in_head {
                        sink.push_text(&resolved);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(ParsedXhtml {
        title: title
            .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|t| !t.is_empty()),
        text: sink.finish(),
        elements,
    })
}
