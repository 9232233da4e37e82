//! EPUB canonical fragment identifiers, limited to the subset the reader
//! produces: a spine step, an indirection, and an element path whose last
//! step may carry an id assertion.
//!
//! `epubcfi(/6/4[ch2]!/4/2[sec1])` addresses the element `sec1`, the first
//! child element of `<body>` (the second child of `<html>`) in the second
//! spine item.

use std::fmt;

/// The package document's spine is always the third child of `<package>`.
const SPINE_STEP: usize = 6;

/// Characters that must be `^`-escaped inside an id assertion.
const SPECIAL: &[char] = &['^', '[', ']', '(', ')', ',', ';', '=', ':'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfiStep {
    /// Raw CFI index: even numbers address elements.
    pub index: usize,
    pub id: Option<String>,
}

impl CfiStep {
    /// Step for the zero-based `position`-th child element.
    pub fn element(position: usize) -> Self {
        Self {
            index: (position + 1) * 2,
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cfi {
    pub spine_index: usize,
    pub spine_id: Option<String>,
    pub path: Vec<CfiStep>,
}

impl Cfi {
    pub fn spine(index: usize, idref: impl Into<String>) -> Self {
        Self {
            spine_index: index,
            spine_id: Some(idref.into()),
            path: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: Vec<CfiStep>) -> Self {
        self.path = path;
        self
    }

    /// The id asserted by the deepest step, if any.
    pub fn target_id(&self) -> Option<&str> {
        self.path.last().and_then(|step| step.id.as_deref())
    }

    pub fn parse(value: &str) -> Option<Self> {
        let inner = value.trim().strip_prefix("epubcfi(")?.strip_suffix(')')?;
        let (package, content) = match structural(inner).find(|&(_, ch)| ch == '!') {
            Some((at, _)) => (&inner[..at], &inner[at + 1..]),
            None => (inner, ""),
        };

        let package = parse_steps(package)?;
        let [first, spine] = package.as_slice() else {
            return None;
        };
        if first.index != SPINE_STEP || spine.index < 2 || spine.index % 2 != 0 {
            return None;
        }

        // Character offsets (`:12`) and ranges are not tracked.
        let content = structural(content)
            .find(|&(_, ch)| matches!(ch, ':' | ',' | '~' | '@'))
            .map_or(content, |(at, _)| &content[..at]);
        let path = parse_steps(content)?;

        Some(Self {
            spine_index: spine.index / 2 - 1,
            spine_id: spine.id.clone(),
            path,
        })
    }
}

impl fmt::Display for Cfi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epubcfi(/{SPINE_STEP}/{}", (self.spine_index + 1) * 2)?;
        if let Some(id) = &self.spine_id {
            write!(f, "[{}]", escape(id))?;
        }
        f.write_str("!")?;
        for step in &self.path {
            write!(f, "/{}", step.index)?;
            if let Some(id) = &step.id {
                write!(f, "[{}]", escape(id))?;
            }
        }
        f.write_str(")")
    }
}

fn escape(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for ch in id.chars() {
        if SPECIAL.contains(&ch) {
            out.push('^');
        }
        out.push(ch);
    }
    out
}

/// Offsets of the characters that carry structure: outside `[..]`
/// assertions and not `^`-escaped.
fn structural(s: &str) -> impl Iterator<Item = (usize, char)> + '_ {
    let mut in_assertion = false;
    let mut escaped = false;
    s.char_indices().filter(move |&(_, ch)| {
        if escaped {
            escaped = false;
            return false;
        }
        match ch {
            '^' => {
                escaped = true;
                false
            }
            '[' if !in_assertion => {
                in_assertion = true;
                false
            }
            ']' if in_assertion => {
                in_assertion = false;
                false
            }
            _ => !in_assertion,
        }
    })
}

fn parse_steps(s: &str) -> Option<Vec<CfiStep>> {
    let mut bounds = structural(s)
        .filter(|&(_, ch)| ch == '/')
        .map(|(at, _)| at)
        .collect::<Vec<_>>();
    bounds.push(s.len());

    let mut steps = Vec::new();
    let mut start = 0;
    for end in bounds {
        let raw = &s[start..end];
        start = end + 1;
        if !raw.is_empty() {
            steps.push(parse_step(raw)?);
        }
    }
    Some(steps)
}

fn parse_step(raw: &str) -> Option<CfiStep> {
    let (num, id) = match raw.split_once('[') {
        Some((num, rest)) => {
            let id = assertion_id(rest.strip_suffix(']')?);
            (num, (!id.is_empty()).then_some(id))
        }
        None => (raw, None),
    };
    Some(CfiStep {
        index: num.parse().ok()?,
        id,
    })
}

/// The id part of an assertion, unescaped; parameters after `;` are dropped.
fn assertion_id(assertion: &str) -> String {
    let mut id = String::with_capacity(assertion.len());
    let mut chars = assertion.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '^' => id.extend(chars.next()),
            ';' => break,
            _ => id.push(ch),
        }
    }
    id
}
