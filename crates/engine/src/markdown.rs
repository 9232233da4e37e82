//! Markdown documents. Content units are the sections under the shallowest
//! heading level present; ATX headings get generated ids
//! (`heading-{level}-{n}`) that serve as location tokens.

use std::ops::Range;

use folio_core::{
    Anchor, AnchorPosition, BookFile, ContentUnit, Cover, DocumentError, DocumentFormat, Location,
    Metadata, OutlineEntry, UnitContent,
};
use tracing::debug;

use crate::{DocumentAdapter, DocumentHandle, check_unit};

/// Token for the start of the document.
const TOP: &str = "top";

#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownAdapter;

impl DocumentAdapter for MarkdownAdapter {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Markdown
    }

    fn open(&self, file: &BookFile) -> Result<Box<dyn DocumentHandle>, DocumentError> {
        let handle = MarkdownHandle::open(file)?;
        Ok(Box::new(handle))
    }
}

fn corrupt(reason: impl Into<String>) -> DocumentError {
    DocumentError::corrupt(DocumentFormat::Markdown, reason)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Heading {
    level: usize,
    label: String,
    id: String,
    line: usize,
}

#[derive(Debug, Clone)]
struct Section {
    lines: Range<usize>,
    heading: Option<usize>,
}

pub struct MarkdownHandle {
    metadata: Metadata,
    lines: Vec<String>,
    headings: Vec<Heading>,
    sections: Vec<Section>,
}

impl MarkdownHandle {
    fn open(file: &BookFile) -> Result<Self, DocumentError> {
        let text = std::str::from_utf8(&file.bytes)
            .map_err(|err| corrupt(format!("not UTF-8 text: {err}")))?;
        if text.contains('\0') {
            return Err(corrupt("binary content (NUL bytes)"));
        }
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);

        let lines = text.lines().map(str::to_string).collect::<Vec<_>>();
        let headings = scan_headings(&lines);
        let sections = split_sections(&headings, lines.len());

        debug!(
            lines = lines.len(),
            headings = headings.len(),
            sections = sections.len(),
            "opened markdown"
        );

        Ok(Self {
            metadata: Metadata::fallback(file),
            lines,
            headings,
            sections,
        })
    }

    fn heading_by_id(&self, id: &str) -> Option<&Heading> {
        self.headings.iter().find(|heading| heading.id == id)
    }

    fn section_of_line(&self, line: usize) -> usize {
        self.sections
            .partition_point(|section| section.lines.start <= line)
            .saturating_sub(1)
    }

    /// Unit 0 starts at the top when something precedes its heading.
    fn starts_at_top(&self, index: usize) -> bool {
        let Some(section) = self.sections.get(index) else {
            return false;
        };
        match section.heading {
            None => true,
            Some(heading) => index == 0 && self.headings[heading].line > 0,
        }
    }
}

impl DocumentHandle for MarkdownHandle {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Markdown
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn cover(&self) -> Option<Cover> {
        None
    }

    fn location_count(&self) -> usize {
        self.sections.len()
    }

    fn outline(&self) -> Vec<OutlineEntry> {
        self.headings
            .iter()
            .map(|heading| {
                OutlineEntry::new(heading.label.clone(), heading.id.clone(), heading.level)
                    .with_native_id(heading.id.clone())
            })
            .collect()
    }

    fn resolve_location(&mut self, location: &Location) -> Result<ContentUnit, DocumentError> {
        let token = location.as_str().trim();
        let token = token.strip_prefix('#').unwrap_or(token);
        if token == TOP {
            return Ok(ContentUnit::start(0));
        }
        let heading = self
            .heading_by_id(token)
            .ok_or_else(|| DocumentError::not_found(token))?;
        Ok(ContentUnit::with_anchor(
            self.section_of_line(heading.line),
            Anchor::Id(heading.id.clone()),
        ))
    }

    fn location_of(&self, unit: &ContentUnit) -> Location {
        if let Some(Anchor::Id(id)) = &unit.anchor {
            return Location::new(id.clone());
        }
        if self.starts_at_top(unit.index) {
            return Location::new(TOP);
        }
        self.sections
            .get(unit.index)
            .and_then(|section| section.heading)
            .map(|heading| Location::new(self.headings[heading].id.clone()))
            .unwrap_or_else(|| Location::new(TOP))
    }

    fn toc_href(&self, unit: &ContentUnit) -> Option<String> {
        if let Some(Anchor::Id(id)) = &unit.anchor {
            return self.heading_by_id(id).map(|heading| heading.id.clone());
        }
        let section = self.sections.get(unit.index)?;
        if self.starts_at_top(unit.index) {
            return None;
        }
        section
            .heading
            .map(|heading| self.headings[heading].id.clone())
    }

    fn load_unit(&mut self, index: usize) -> Result<UnitContent, DocumentError> {
        check_unit(DocumentFormat::Markdown, index, self.sections.len())?;
        let section = &self.sections[index];
        let range = section.lines.clone();

        let inside = self
            .headings
            .iter()
            .filter(|heading| range.contains(&heading.line))
            .collect::<Vec<_>>();

        let lines = self
            .lines
            .get(range.clone())
            .ok_or_else(|| DocumentError::not_found(format!("markdown unit {index} (closed)")))?;
        let mut text = lines
            .iter()
            .enumerate()
            .map(|(offset, line)| {
                inside
                    .iter()
                    .find(|heading| heading.line == range.start + offset)
                    .map_or(line.as_str(), |heading| heading.label.as_str())
            })
            .collect::<Vec<_>>()
            .join("\n");
        text.truncate(text.trim_end().len());

        let anchors = inside
            .iter()
            .map(|heading| AnchorPosition {
                anchor: Anchor::Id(heading.id.clone()),
                line: heading.line - range.start,
            })
            .collect();

        Ok(UnitContent {
            index,
            label: section
                .heading
                .map(|heading| self.headings[heading].label.clone()),
            text,
            anchors,
        })
    }

    fn close(&mut self) {
        self.lines.clear();
    }
}

impl Drop for MarkdownHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opening fence marker: the fence character and its run length.
fn fence(line: &str) -> Option<(char, usize)> {
    let trimmed = strip_indent(line)?;
    let marker = trimmed.chars().next().filter(|ch| *ch == '`' || *ch == '~')?;
    let run = trimmed.chars().take_while(|ch| *ch == marker).count();
    (run >= 3).then_some((marker, run))
}

/// Up to three spaces of indentation; more makes an indented code block.
fn strip_indent(line: &str) -> Option<&str> {
    let spaces = line.chars().take_while(|ch| *ch == ' ').count();
    (spaces <= 3).then(|| &line[spaces..])
}

fn parse_heading(line: &str) -> Option<(usize, String)> {
    let trimmed = strip_indent(line)?;
    let level = trimmed.chars().take_while(|ch| *ch == '#').count();
    if !(1..=6).contains(&level) {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.starts_with([' ', '\t']) {
        return None;
    }

    let mut label = rest.trim();
    // Optional closing sequence: `## Title ##`.
    let without_closing = label.trim_end_matches('#');
    if without_closing.is_empty() || without_closing.ends_with([' ', '\t']) {
        label = without_closing.trim_end();
    }
    (!label.is_empty()).then(|| (level, label.to_string()))
}

fn scan_headings(lines: &[String]) -> Vec<Heading> {
    let mut counters = [0usize; 6];
    let mut headings = Vec::new();
    let mut open_fence: Option<(char, usize)> = None;

    for (line_no, line) in lines.iter().enumerate() {
        if let Some((marker, run)) = open_fence {
            if fence(line).is_some_and(|(m, r)| m == marker && r >= run) {
                open_fence = None;
            }
            continue;
        }
        if let Some(opening) = fence(line) {
            open_fence = Some(opening);
            continue;
        }
        if let Some((level, label)) = parse_heading(line) {
            counters[level - 1] += 1;
            headings.push(Heading {
                level,
                label,
                id: format!("heading-{level}-{}", counters[level - 1]),
                line: line_no,
            });
        }
    }
    headings
}

/// One section per heading at the shallowest level. Lines before the first
/// such heading stay with the first section.
fn split_sections(headings: &[Heading], line_count: usize) -> Vec<Section> {
    let Some(split_level) = headings.iter().map(|heading| heading.level).min() else {
        return vec![Section {
            lines: 0..line_count,
            heading: None,
        }];
    };

    let splits = headings
        .iter()
        .enumerate()
        .filter(|(_, heading)| heading.level == split_level)
        .map(|(idx, heading)| (idx, heading.line))
        .collect::<Vec<_>>();

    splits
        .iter()
        .enumerate()
        .map(|(i, &(heading, line))| {
            let start = if i == 0 { 0 } else { line };
            let end = splits
                .get(i + 1)
                .map_or(line_count, |&(_, next_line)| next_line);
            Section {
                lines: start..end,
                heading: Some(heading),
            }
        })
        .collect()
}
