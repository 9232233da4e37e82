//! Small quick-xml helpers shared by the EPUB package parser and the XHTML
//! text extractor.

use std::borrow::Cow;

use quick_xml::escape::{resolve_html5_entity, unescape_with};
use quick_xml::events::BytesStart;

/// Longest named reference in the HTML5 set, plus `&` and `;`.
const MAX_REFERENCE_LEN: usize = 40;

pub(crate) fn strip_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(data)
}

/// `dc:title` -> `title`
pub(crate) fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|&b| b == b':')
        .map(|i| &name[i + 1..])
        .unwrap_or(name)
}

pub(crate) fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key || local_name(a.key.as_ref()) == key)
        .map(|a| {
            let raw = String::from_utf8_lossy(a.value.as_ref());
            decode_entities(&raw)
        })
}

/// Resolves the name inside a general reference (`amp`, `eacute`, `#x2019`)
/// against the HTML5 entity set.
pub(crate) fn resolve_entity(entity: &str) -> Option<String> {
    unescape_with(&format!("&{entity};"), resolve_html5_entity)
        .ok()
        .map(Cow::into_owned)
}

/// Replaces `&name;` references in attribute values and raw markup text.
/// Unknown references and stray ampersands are kept verbatim.
pub(crate) fn decode_entities(s: &str) -> String {
    match unescape_with(s, resolve_html5_entity) {
        Ok(text) => text.into_owned(),
        Err(_) => decode_each_reference(s),
    }
}

/// Tag soup fallback: resolves references one at a time so a single bad
/// `&` does not leave the rest of the run undecoded.
fn decode_each_reference(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let reference = tail
            .find(';')
            .filter(|&end| end <= MAX_REFERENCE_LEN)
            .and_then(|end| {
                let resolved = unescape_with(&tail[..=end], resolve_html5_entity).ok()?;
                Some((resolved.into_owned(), end))
            });
        match reference {
            Some((resolved, end)) => {
                out.push_str(&resolved);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
