//! MOBI / PalmDOC books: a Palm database whose first record carries the
//! PalmDOC, MOBI and EXTH headers and whose following records hold the
//! (optionally LZ77-compressed) HTML text stream.
//!
//! Positions are absolute byte offsets into the decompressed stream, the
//! same `filepos` values the book's own links use.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use folio_core::{
    Anchor, AnchorPosition, BookFile, ContentUnit, Cover, DocumentError, DocumentFormat, Location,
    Metadata, OutlineEntry, UnitContent,
};
use tracing::debug;

use crate::text::TextSink;
use crate::xml::decode_entities;
use crate::{DocumentAdapter, DocumentHandle, check_unit, palmdoc};

const PDB_HEADER_LEN: usize = 78;
const PDB_TYPES: [&[u8]; 2] = [b"BOOKMOBI", b"TEXtREAd"];
const NULL_INDEX: u32 = u32::MAX;
const EXTH_FLAG: u32 = 0x40;

const EXTH_AUTHOR: u32 = 100;
const EXTH_COVER_OFFSET: u32 = 201;
const EXTH_TITLE: u32 = 503;
const EXTH_LANGUAGE: u32 = 524;

const COMPRESSION_NONE: u16 = 1;
const COMPRESSION_PALMDOC: u16 = 2;
const COMPRESSION_HUFFMAN: u16 = 0x4448;

const PAGEBREAK: &[u8] = b"<mbp:pagebreak";
const FILEPOS_PREFIX: &str = "filepos:";

#[derive(Debug, Default, Clone, Copy)]
pub struct MobiAdapter;

impl DocumentAdapter for MobiAdapter {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Mobi
    }

    fn open(&self, file: &BookFile) -> Result<Box<dyn DocumentHandle>, DocumentError> {
        let kind = file.bytes.get(60..68);
        if !kind.is_some_and(|kind| PDB_TYPES.contains(&kind)) {
            return Err(DocumentError::UnsupportedFormat(format!(
                "{}: not a mobipocket database",
                file.name
            )));
        }
        let handle = MobiHandle::open(file)?;
        Ok(Box::new(handle))
    }
}

fn corrupt(reason: impl Into<String>) -> DocumentError {
    DocumentError::corrupt(DocumentFormat::Mobi, reason)
}

fn be_u16(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2)?.try_into().ok().map(u16::from_be_bytes)
}

fn be_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)?.try_into().ok().map(u32::from_be_bytes)
}

/// Splits a Palm database into its records.
fn pdb_records(data: &[u8]) -> Result<Vec<&[u8]>, String> {
    let count = be_u16(data, 76).ok_or("database header truncated")? as usize;
    if data.len() < PDB_HEADER_LEN + count * 8 {
        return Err(format!("record list truncated ({count} records)"));
    }

    let offsets = (0..count)
        .map(|i| be_u32(data, PDB_HEADER_LEN + i * 8).unwrap_or_default() as usize)
        .collect::<Vec<_>>();

    let mut records = Vec::with_capacity(count);
    for (i, &start) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(data.len());
        let record = data
            .get(start..end)
            .ok_or_else(|| format!("record {i} out of bounds"))?;
        records.push(record);
    }
    Ok(records)
}

/// Fields of record 0 the reader needs.
#[derive(Debug)]
struct MobiHeader {
    compression: u16,
    text_length: usize,
    text_records: usize,
    encryption: u16,
    encoding: &'static Encoding,
    full_name: Option<String>,
    first_image: Option<usize>,
    extra_data_flags: u16,
    exth: HashMap<u32, Vec<u8>>,
}

impl MobiHeader {
    fn parse(record0: &[u8]) -> Result<Self, String> {
        if record0.len() < 16 {
            return Err("record 0 too short".to_string());
        }
        let mut header = Self {
            compression: be_u16(record0, 0).unwrap_or_default(),
            text_length: be_u32(record0, 4).unwrap_or_default() as usize,
            text_records: be_u16(record0, 8).unwrap_or_default() as usize,
            encryption: be_u16(record0, 12).unwrap_or_default(),
            encoding: WINDOWS_1252,
            full_name: None,
            first_image: None,
            extra_data_flags: 0,
            exth: HashMap::new(),
        };

        // Plain PalmDOC files stop after the first 16 bytes.
        if record0.get(16..20) != Some(&b"MOBI"[..]) {
            return Ok(header);
        }

        let header_length = be_u32(record0, 20).unwrap_or_default() as usize;
        if be_u32(record0, 28) == Some(65001) {
            header.encoding = UTF_8;
        }

        if let (Some(offset), Some(len)) = (be_u32(record0, 0x54), be_u32(record0, 0x58)) {
            let (offset, len) = (offset as usize, len as usize);
            header.full_name = record0
                .get(offset..offset + len)
                .map(|raw| decode(raw, header.encoding));
        }

        header.first_image = be_u32(record0, 0x6C)
            .filter(|&index| index != NULL_INDEX)
            .map(|index| index as usize);

        if header_length >= 0xE4 {
            header.extra_data_flags = be_u16(record0, 0xF2).unwrap_or_default();
        }

        let exth_flags = be_u32(record0, 0x80).unwrap_or_default();
        if exth_flags & EXTH_FLAG != 0
            && let Some(exth) = record0.get(16 + header_length..)
        {
            header.exth = parse_exth(exth);
        }

        Ok(header)
    }

    fn exth_string(&self, kind: u32) -> Option<String> {
        self.exth.get(&kind).map(|raw| decode(raw, self.encoding))
    }
}

fn parse_exth(data: &[u8]) -> HashMap<u32, Vec<u8>> {
    let mut out = HashMap::new();
    if !data.starts_with(b"EXTH") {
        return out;
    }
    let count = be_u32(data, 8).unwrap_or_default();
    let mut pos = 12;
    for _ in 0..count {
        let (Some(kind), Some(len)) = (be_u32(data, pos), be_u32(data, pos + 4)) else {
            break;
        };
        let len = len as usize;
        let Some(value) = data.get(pos + 8..pos + len) else {
            break;
        };
        out.entry(kind).or_insert_with(|| value.to_vec());
        pos += len;
    }
    out
}

/// Removes the trailing entries text records carry after the compressed
/// payload. Bit 0 of `flags` marks multibyte overlap bytes, every higher set
/// bit one size-prefixed entry.
fn strip_trailing_entries(record: &[u8], flags: u16) -> &[u8] {
    let mut end = record.len();
    for bit in 1..16 {
        if flags & (1 << bit) == 0 {
            continue;
        }
        let size = trailing_entry_size(&record[..end]);
        if size == 0 || size > end {
            break;
        }
        end -= size;
    }
    if flags & 1 != 0 && end > 0 {
        let overlap = (record[end - 1] & 0x3) as usize + 1;
        end = end.saturating_sub(overlap);
    }
    &record[..end]
}

/// Size of the last trailing entry, stored as a backward variable-width
/// integer whose first byte has the high bit set.
fn trailing_entry_size(data: &[u8]) -> usize {
    let mut size = 0usize;
    for (shift, &byte) in data.iter().rev().take(4).enumerate() {
        size |= ((byte & 0x7F) as usize) << (7 * shift);
        if byte & 0x80 != 0 {
            break;
        }
    }
    size
}

fn decode(raw: &[u8], encoding: &'static Encoding) -> String {
    encoding.decode_without_bom_handling(raw).0.into_owned()
}

pub struct MobiHandle {
    text: Option<Vec<u8>>,
    encoding: &'static Encoding,
    metadata: Metadata,
    cover: Option<Cover>,
    sections: Vec<Range<usize>>,
    toc: Vec<(usize, OutlineEntry)>,
    /// Every `filepos` link target, sorted.
    targets: Vec<usize>,
    units: HashMap<usize, UnitContent>,
}

impl MobiHandle {
    fn open(file: &BookFile) -> Result<Self, DocumentError> {
        let records = pdb_records(&file.bytes).map_err(corrupt)?;
        let record0 = records.first().ok_or_else(|| corrupt("no records"))?;
        let header = MobiHeader::parse(record0).map_err(corrupt)?;

        if header.encryption != 0 {
            return Err(corrupt("encrypted books are not supported"));
        }
        match header.compression {
            COMPRESSION_NONE | COMPRESSION_PALMDOC => {}
            COMPRESSION_HUFFMAN => return Err(corrupt("HUFF/CDIC compression is not supported")),
            other => return Err(corrupt(format!("unknown compression {other}"))),
        }
        if header.text_records == 0 {
            return Err(corrupt("no text records"));
        }
        let text_records = records
            .get(1..=header.text_records)
            .ok_or_else(|| corrupt(format!("missing text records ({})", header.text_records)))?;

        let mut text = Vec::with_capacity(header.text_length);
        for record in text_records {
            let payload = strip_trailing_entries(record, header.extra_data_flags);
            if header.compression == COMPRESSION_PALMDOC {
                text.extend(palmdoc::decompress(payload));
            } else {
                text.extend_from_slice(payload);
            }
        }
        if header.text_length > 0 {
            text.truncate(header.text_length);
        }
        if text.is_empty() {
            return Err(corrupt("empty text stream"));
        }

        let sections = split_sections(&text);
        let targets = collect_targets(&text, &sections);
        let mut toc = read_guide_toc(&text, &sections, header.encoding);
        if toc.is_empty() {
            toc = sections
                .iter()
                .enumerate()
                .map(|(i, range)| {
                    let entry = OutlineEntry::new(
                        format!("Section {}", i + 1),
                        format!("{FILEPOS_PREFIX}{}", range.start),
                        0,
                    );
                    (range.start, entry)
                })
                .collect();
        }

        let cover = header
            .first_image
            .zip(header.exth.get(&EXTH_COVER_OFFSET))
            .and_then(|(first, raw)| {
                let offset = be_u32(raw, 0).filter(|&offset| offset != NULL_INDEX)?;
                records.get(first + offset as usize)
            })
            .and_then(|record| Cover::sniffed(record.to_vec()));

        let title = header
            .exth_string(EXTH_TITLE)
            .filter(|title| !title.trim().is_empty())
            .or_else(|| header.full_name.clone().filter(|name| !name.trim().is_empty()))
            .or_else(|| pdb_name(&file.bytes));
        let metadata = Metadata::from_parts(
            file,
            title,
            header.exth_string(EXTH_AUTHOR),
            header.exth_string(EXTH_LANGUAGE),
        );

        debug!(
            sections = sections.len(),
            toc = toc.len(),
            bytes = text.len(),
            cover = cover.is_some(),
            "opened mobi"
        );

        Ok(Self {
            text: Some(text),
            encoding: header.encoding,
            metadata,
            cover,
            sections,
            toc,
            targets,
            units: HashMap::new(),
        })
    }

    fn text_len(&self) -> usize {
        self.sections.last().map_or(0, |range| range.end)
    }

    fn section_at(&self, offset: usize) -> usize {
        self.sections
            .partition_point(|range| range.start <= offset)
            .saturating_sub(1)
    }

    fn position(&self, unit: &ContentUnit) -> usize {
        match unit.anchor {
            Some(Anchor::Offset(offset)) => offset,
            _ => self.sections.get(unit.index).map_or(0, |range| range.start),
        }
    }
}

fn pdb_name(data: &[u8]) -> Option<String> {
    let raw = data.get(..32)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let name = String::from_utf8_lossy(&raw[..end]).trim().to_string();
    (!name.is_empty()).then_some(name)
}

fn parse_filepos(token: &str) -> Option<usize> {
    token
        .strip_prefix(FILEPOS_PREFIX)
        .or_else(|| token.strip_prefix("#filepos"))?
        .trim()
        .parse()
        .ok()
}

impl DocumentHandle for MobiHandle {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Mobi
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn cover(&self) -> Option<Cover> {
        self.cover.clone()
    }

    fn location_count(&self) -> usize {
        self.sections.len()
    }

    fn outline(&self) -> Vec<OutlineEntry> {
        self.toc.iter().map(|(_, entry)| entry.clone()).collect()
    }

    fn resolve_location(&mut self, location: &Location) -> Result<ContentUnit, DocumentError> {
        let token = location.as_str().trim();
        let offset = parse_filepos(token).ok_or_else(|| DocumentError::not_found(token))?;
        if offset > self.text_len() {
            return Err(DocumentError::not_found(token));
        }
        Ok(ContentUnit::with_anchor(
            self.section_at(offset),
            Anchor::Offset(offset),
        ))
    }

    fn location_of(&self, unit: &ContentUnit) -> Location {
        Location::new(format!("{FILEPOS_PREFIX}{}", self.position(unit)))
    }

    fn toc_href(&self, unit: &ContentUnit) -> Option<String> {
        let position = self.position(unit);
        self.toc
            .iter()
            .rev()
            .find(|(offset, _)| *offset <= position)
            .and_then(|(_, entry)| entry.href.clone())
    }

    fn load_unit(&mut self, index: usize) -> Result<UnitContent, DocumentError> {
        check_unit(DocumentFormat::Mobi, index, self.sections.len())?;
        if let Some(unit) = self.units.get(&index) {
            return Ok(unit.clone());
        }

        let text = self
            .text
            .as_deref()
            .ok_or_else(|| DocumentError::not_found(format!("mobi unit {index} (closed)")))?;
        let range = self.sections[index].clone();

        let mut targets = vec![0];
        targets.extend(
            self.targets
                .iter()
                .filter(|&&offset| offset > range.start && offset < range.end)
                .map(|&offset| offset - range.start),
        );

        let (body, anchors) =
            render_section(&text[range.clone()], range.start, &targets, self.encoding);
        let label = self
            .toc
            .iter()
            .find(|(offset, _)| range.contains(offset))
            .map(|(_, entry)| entry.label.clone());

        let unit = UnitContent {
            index,
            label,
            text: body,
            anchors,
        };
        self.units.insert(index, unit.clone());
        Ok(unit)
    }

    fn close(&mut self) {
        self.units.clear();
        self.text = None;
    }
}

impl Drop for MobiHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
struct Tag<'a> {
    start: usize,
    /// One past the closing `>`.
    end: usize,
    name: String,
    closing: bool,
    body: &'a [u8],
}

impl Tag<'_> {
    fn self_closing(&self) -> bool {
        self.body.ends_with(b"/")
    }
}

fn next_tag(html: &[u8], from: usize) -> Option<Tag<'_>> {
    let start = from + html.get(from..)?.iter().position(|&b| b == b'<')?;
    let close = start + html[start..].iter().position(|&b| b == b'>')?;
    let body = &html[start + 1..close];
    let (closing, rest) = match body.strip_prefix(b"/") {
        Some(rest) => (true, rest),
        None => (false, body),
    };
    let name = rest
        .iter()
        .take_while(|b| !b.is_ascii_whitespace() && **b != b'/')
        .map(|b| b.to_ascii_lowercase() as char)
        .collect();
    Some(Tag {
        start,
        end: close + 1,
        name,
        closing,
        body,
    })
}

fn find_ci(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
        .map(|at| at + from)
}

/// Value of `key` inside a tag body; quoted or bare.
fn tag_attr(body: &[u8], key: &str) -> Option<String> {
    let needle = format!("{key}=");
    let mut from = 0;
    let value_start = loop {
        let at = find_ci(body, needle.as_bytes(), from)?;
        if at > 0 && body[at - 1].is_ascii_whitespace() {
            break at + needle.len();
        }
        from = at + 1;
    };

    let rest = &body[value_start..];
    let value = match rest.first().copied() {
        Some(quote) if quote == b'"' || quote == b'\'' => {
            let inner = &rest[1..];
            let end = inner.iter().position(|&b| b == quote).unwrap_or(inner.len());
            &inner[..end]
        }
        _ => {
            let end = rest
                .iter()
                .position(|b| b.is_ascii_whitespace() || *b == b'/')
                .unwrap_or(rest.len());
            &rest[..end]
        }
    };
    Some(String::from_utf8_lossy(value).into_owned())
}

fn filepos_attr(body: &[u8]) -> Option<usize> {
    tag_attr(body, "filepos")?.trim().parse().ok()
}

/// True when anything other than markup and whitespace is present.
fn has_text(html: &[u8]) -> bool {
    let mut pos = 0;
    loop {
        let tag = next_tag(html, pos);
        let run_end = tag.as_ref().map_or(html.len(), |tag| tag.start);
        if html[pos..run_end].iter().any(|b| !b.is_ascii_whitespace()) {
            return true;
        }
        match tag {
            Some(tag) => pos = tag.end,
            None => return false,
        }
    }
}

/// Sections start at page breaks. Breaks with nothing readable before them
/// are folded into the following section.
fn split_sections(html: &[u8]) -> Vec<Range<usize>> {
    let mut starts = vec![0];
    let mut from = 0;
    while let Some(at) = find_ci(html, PAGEBREAK, from) {
        let last = starts.last().copied().unwrap_or_default();
        if at > last && has_text(&html[last..at]) {
            starts.push(at);
        }
        from = at + PAGEBREAK.len();
    }
    if let Some(&last) = starts.last()
        && starts.len() > 1
        && !has_text(&html[last..])
    {
        starts.pop();
    }

    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| start..starts.get(i + 1).copied().unwrap_or(html.len()))
        .collect()
}

fn collect_targets(html: &[u8], sections: &[Range<usize>]) -> Vec<usize> {
    let mut targets = sections
        .iter()
        .map(|range| range.start)
        .collect::<BTreeSet<_>>();
    let mut pos = 0;
    while let Some(tag) = next_tag(html, pos) {
        if let Some(target) = filepos_attr(tag.body)
            && target <= html.len()
        {
            targets.insert(target);
        }
        pos = tag.end;
    }
    targets.into_iter().collect()
}

fn plain_text(html: &[u8], encoding: &'static Encoding) -> String {
    let mut raw = Vec::new();
    let mut pos = 0;
    loop {
        let tag = next_tag(html, pos);
        let run_end = tag.as_ref().map_or(html.len(), |tag| tag.start);
        raw.extend_from_slice(&html[pos..run_end]);
        match tag {
            Some(tag) => pos = tag.end,
            None => break,
        }
    }
    decode_entities(&decode(&raw, encoding))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reads the contents page the guide points at: every `<a filepos=..>` link
/// from the reference to the end of its section.
fn read_guide_toc(
    html: &[u8],
    sections: &[Range<usize>],
    encoding: &'static Encoding,
) -> Vec<(usize, OutlineEntry)> {
    let mut toc_start = None;
    let mut pos = 0;
    while let Some(tag) = next_tag(html, pos) {
        if tag.name == "body" && !tag.closing {
            break;
        }
        if tag.name == "reference"
            && tag_attr(tag.body, "type").is_some_and(|kind| kind.eq_ignore_ascii_case("toc"))
        {
            toc_start = filepos_attr(tag.body);
            break;
        }
        pos = tag.end;
    }
    let Some(start) = toc_start.filter(|&start| start < html.len()) else {
        return Vec::new();
    };
    let end = sections
        .iter()
        .find(|range| range.contains(&start))
        .map_or(html.len(), |range| range.end);
    let page = &html[..end];

    let mut entries: Vec<(usize, OutlineEntry)> = Vec::new();
    let mut open_link: Option<(usize, usize)> = None;
    let mut pos = start;
    while let Some(tag) = next_tag(page, pos) {
        if tag.name == "a" {
            if tag.closing {
                if let Some((target, text_start)) = open_link.take() {
                    let label = plain_text(&page[text_start..tag.start], encoding);
                    if !label.is_empty()
                        && target <= html.len()
                        && !entries.iter().any(|(offset, _)| *offset == target)
                    {
                        let href = format!("{FILEPOS_PREFIX}{target}");
                        entries.push((target, OutlineEntry::new(label, href, 0)));
                    }
                }
            } else if let Some(target) = filepos_attr(tag.body) {
                open_link = Some((target, tag.end));
            }
        }
        pos = tag.end;
    }
    entries.sort_by_key(|(offset, _)| *offset);
    entries
}

fn is_block(name: &str) -> bool {
    matches!(
        name,
        "p" | "div"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "blockquote"
            | "li"
            | "ul"
            | "ol"
            | "table"
            | "tr"
            | "hr"
            | "mbp:pagebreak"
    )
}

/// Converts one section to text. `targets` are offsets relative to the
/// section; each is recorded as an absolute `Anchor::Offset` at the line its
/// content lands on.
fn render_section(
    html: &[u8],
    base: usize,
    targets: &[usize],
    encoding: &'static Encoding,
) -> (String, Vec<AnchorPosition>) {
    let mut sink = TextSink::new();
    let mut anchors = Vec::new();
    let mut pending = targets.iter().copied().peekable();
    let mut skip = 0usize;
    let mut pos = 0;

    let push_run = |sink: &mut TextSink, raw: &[u8], skip: usize| {
        if skip == 0 && !raw.is_empty() {
            sink.push_text(&decode_entities(&decode(raw, encoding)));
        }
    };

    loop {
        let tag = next_tag(html, pos);
        let run_end = tag.as_ref().map_or(html.len(), |tag| tag.start);

        while let Some(target) = pending.next_if(|&target| target < run_end) {
            let split = target.max(pos);
            push_run(&mut sink, &html[pos..split], skip);
            pos = split;
            anchors.push(AnchorPosition {
                anchor: Anchor::Offset(base + target),
                line: sink.line(),
            });
        }
        push_run(&mut sink, &html[pos..run_end], skip);

        let Some(tag) = tag else {
            break;
        };
        match tag.name.as_str() {
            "head" | "script" | "style" => {
                if tag.closing {
                    skip = skip.saturating_sub(1);
                } else if !tag.self_closing() {
                    skip += 1;
                }
            }
            "br" => sink.line_break(),
            "pre" => {
                sink.paragraph_break();
                if tag.closing {
                    sink.leave_preformatted();
                } else {
                    sink.enter_preformatted();
                }
            }
            name if is_block(name) => sink.paragraph_break(),
            _ => {}
        }

        while let Some(target) = pending.next_if(|&target| target < tag.end) {
            anchors.push(AnchorPosition {
                anchor: Anchor::Offset(base + target),
                line: sink.line(),
            });
        }
        pos = tag.end;
    }

    for target in pending {
        anchors.push(AnchorPosition {
            anchor: Anchor::Offset(base + target),
            line: sink.line(),
        });
    }

    (sink.finish(), anchors)
}
