//! In-memory book files for every supported format.

use std::io::{Cursor, Write as _};

use folio_core::BookFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";

pub fn markdown(name: &str, text: &str) -> BookFile {
    BookFile::new(name, text.as_bytes().to_vec())
}

#[derive(Debug, Clone)]
struct EpubChapter {
    title: String,
    body: String,
    /// `(id, label)` pairs listed under the chapter in the nav document.
    sections: Vec<(String, String)>,
}

/// EPUB 3 package with a nav document, `OEBPS/Text/ch{n}.xhtml` chapters
/// and spine ids `ch{n}`. Each chapter heading carries the id
/// `ch{n}-title`.
#[derive(Debug, Clone, Default)]
pub struct EpubBuilder {
    title: Option<String>,
    author: Option<String>,
    cover: Option<Vec<u8>>,
    chapters: Vec<EpubChapter>,
}

impl EpubBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn author(mut self, author: &str) -> Self {
        self.author = Some(author.to_string());
        self
    }

    pub fn cover(mut self, bytes: &[u8]) -> Self {
        self.cover = Some(bytes.to_vec());
        self
    }

    /// `body` is XHTML placed after the chapter heading.
    pub fn chapter(mut self, title: &str, body: &str) -> Self {
        self.chapters.push(EpubChapter {
            title: title.to_string(),
            body: body.to_string(),
            sections: Vec::new(),
        });
        self
    }

    /// Lists an element id of the last chapter as a nested TOC entry.
    pub fn section(mut self, id: &str, label: &str) -> Self {
        if let Some(chapter) = self.chapters.last_mut() {
            chapter.sections.push((id.to_string(), label.to_string()));
        }
        self
    }

    pub fn build(&self, name: &str) -> anyhow::Result<BookFile> {
        let mut entries: Vec<(String, Vec<u8>)> = vec![
            ("mimetype".to_string(), b"application/epub+zip".to_vec()),
            (
                "META-INF/container.xml".to_string(),
                br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#
                    .to_vec(),
            ),
            ("OEBPS/content.opf".to_string(), self.package().into_bytes()),
            ("OEBPS/nav.xhtml".to_string(), self.nav().into_bytes()),
        ];
        for (idx, chapter) in self.chapters.iter().enumerate() {
            let n = idx + 1;
            let xhtml = format!(
                r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>{title}</title></head>
<body><h1 id="ch{n}-title">{title}</h1>{body}</body>
</html>"#,
                title = chapter.title,
                body = chapter.body,
            );
            entries.push((format!("OEBPS/Text/ch{n}.xhtml"), xhtml.into_bytes()));
        }
        if let Some(cover) = &self.cover {
            entries.push(("OEBPS/Images/cover.png".to_string(), cover.clone()));
        }

        Ok(BookFile::new(name, zip(&entries)?))
    }

    fn package(&self) -> String {
        let mut metadata = String::new();
        if let Some(title) = &self.title {
            metadata.push_str(&format!("<dc:title>{title}</dc:title>"));
        }
        if let Some(author) = &self.author {
            metadata.push_str(&format!("<dc:creator>{author}</dc:creator>"));
        }
        metadata.push_str("<dc:language>en</dc:language>");

        let mut manifest = String::from(
            r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>"#,
        );
        let mut spine = String::new();
        for n in 1..=self.chapters.len() {
            manifest.push_str(&format!(
                r#"<item id="ch{n}" href="Text/ch{n}.xhtml" media-type="application/xhtml+xml"/>"#
            ));
            spine.push_str(&format!(r#"<itemref idref="ch{n}"/>"#));
        }
        if self.cover.is_some() {
            manifest.push_str(
                r#"<item id="cover" href="Images/cover.png" media-type="image/png" properties="cover-image"/>"#,
            );
        }

        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">{metadata}</metadata>
  <manifest>{manifest}</manifest>
  <spine>{spine}</spine>
</package>"#
        )
    }

    fn nav(&self) -> String {
        let mut items = String::new();
        for (idx, chapter) in self.chapters.iter().enumerate() {
            let n = idx + 1;
            items.push_str(&format!(
                r#"<li><a href="Text/ch{n}.xhtml">{}</a>"#,
                chapter.title
            ));
            if !chapter.sections.is_empty() {
                items.push_str("<ol>");
                for (id, label) in &chapter.sections {
                    items.push_str(&format!(
                        r#"<li><a href="Text/ch{n}.xhtml#{id}">{label}</a></li>"#
                    ));
                }
                items.push_str("</ol>");
            }
            items.push_str("</li>");
        }
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head><title>Contents</title></head>
<body><nav epub:type="toc"><ol>{items}</ol></nav></body>
</html>"#
        )
    }
}

fn zip(entries: &[(String, Vec<u8>)]) -> anyhow::Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, bytes) in entries {
        writer.start_file(name.as_str(), options)?;
        writer.write_all(bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}

const PDB_HEADER_LEN: usize = 78;
const MOBI_HEADER_LEN: usize = 232;
const EXTH_TITLE: u32 = 503;
const EXTH_AUTHOR: u32 = 100;
const EXTH_COVER_OFFSET: u32 = 201;

/// Uncompressed UTF-8 MOBI. Sections are joined with `<mbp:pagebreak/>`;
/// the returned offsets are where each section starts in the text stream.
#[derive(Debug, Clone, Default)]
pub struct MobiBuilder {
    title: Option<String>,
    author: Option<String>,
    cover: Option<Vec<u8>>,
    sections: Vec<String>,
}

impl MobiBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn author(mut self, author: &str) -> Self {
        self.author = Some(author.to_string());
        self
    }

    pub fn cover(mut self, bytes: &[u8]) -> Self {
        self.cover = Some(bytes.to_vec());
        self
    }

    /// `body` is HTML for one page-broken section.
    pub fn section(mut self, body: &str) -> Self {
        self.sections.push(body.to_string());
        self
    }

    pub fn html(&self) -> (String, Vec<usize>) {
        let mut html = String::from("<html><head></head><body>");
        let mut starts = Vec::new();
        for (idx, body) in self.sections.iter().enumerate() {
            if idx == 0 {
                starts.push(0);
            } else {
                starts.push(html.len());
                html.push_str("<mbp:pagebreak/>");
            }
            html.push_str(body);
        }
        html.push_str("</body></html>");
        (html, starts)
    }

    pub fn build(&self, name: &str) -> BookFile {
        let (html, _) = self.html();
        let mut records = vec![self.record0(html.len()), html.into_bytes()];
        if let Some(cover) = &self.cover {
            records.push(cover.clone());
        }
        BookFile::new(name, pdb(&records))
    }

    fn record0(&self, text_len: usize) -> Vec<u8> {
        let mut exth: Vec<(u32, Vec<u8>)> = Vec::new();
        if let Some(title) = &self.title {
            exth.push((EXTH_TITLE, title.as_bytes().to_vec()));
        }
        if let Some(author) = &self.author {
            exth.push((EXTH_AUTHOR, author.as_bytes().to_vec()));
        }
        if self.cover.is_some() {
            exth.push((EXTH_COVER_OFFSET, 0u32.to_be_bytes().to_vec()));
        }

        let mut r = vec![0u8; 16 + MOBI_HEADER_LEN];
        put_u16(&mut r, 0, 1);
        put_u32(&mut r, 4, text_len as u32);
        put_u16(&mut r, 8, 1);
        put_u16(&mut r, 10, 4096);
        r[16..20].copy_from_slice(b"MOBI");
        put_u32(&mut r, 20, MOBI_HEADER_LEN as u32);
        put_u32(&mut r, 24, 2);
        put_u32(&mut r, 28, 65001);
        let first_image = if self.cover.is_some() { 2 } else { u32::MAX };
        put_u32(&mut r, 0x6C, first_image);

        if !exth.is_empty() {
            put_u32(&mut r, 0x80, 0x40);
            let mut body = Vec::new();
            for (kind, value) in &exth {
                body.extend_from_slice(&kind.to_be_bytes());
                body.extend_from_slice(&(value.len() as u32 + 8).to_be_bytes());
                body.extend_from_slice(value);
            }
            r.extend_from_slice(b"EXTH");
            r.extend_from_slice(&(body.len() as u32 + 12).to_be_bytes());
            r.extend_from_slice(&(exth.len() as u32).to_be_bytes());
            r.extend_from_slice(&body);
            while r.len() % 4 != 0 {
                r.push(0);
            }
        }

        let full_name = "Full Name";
        let name_offset = r.len();
        r.extend_from_slice(full_name.as_bytes());
        put_u32(&mut r, 0x54, name_offset as u32);
        put_u32(&mut r, 0x58, full_name.len() as u32);
        r
    }
}

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn pdb(records: &[Vec<u8>]) -> Vec<u8> {
    let mut out = vec![0u8; PDB_HEADER_LEN];
    out[..10].copy_from_slice(b"folio_test");
    out[60..68].copy_from_slice(b"BOOKMOBI");
    put_u16(&mut out, 76, records.len() as u16);
    let mut offset = PDB_HEADER_LEN + records.len() * 8 + 2;
    for record in records {
        out.extend_from_slice(&(offset as u32).to_be_bytes());
        out.extend_from_slice(&[0; 4]);
        offset += record.len();
    }
    out.extend_from_slice(&[0, 0]);
    for record in records {
        out.extend_from_slice(record);
    }
    out
}

/// Single-revision PDF with an Info dictionary, one text line per page and
/// an outline of `(title, page index)` entries pointing at whole pages.
pub fn pdf(name: &str, title: &str, pages: &[&str], outline: &[(&str, usize)]) -> BookFile {
    const CATALOG: usize = 1;
    const PAGES: usize = 2;
    const INFO: usize = 3;
    const OUTLINES: usize = 4;
    let page_id = |i: usize| 5 + i * 2;
    let item_id = |i: usize| 5 + pages.len() * 2 + i;

    let mut objects: Vec<String> = Vec::new();
    let outlines_ref = if outline.is_empty() {
        String::new()
    } else {
        format!(" /Outlines {OUTLINES} 0 R")
    };
    objects.push(format!(
        "<< /Type /Catalog /Pages {PAGES} 0 R{outlines_ref} >>"
    ));
    let kids = (0..pages.len())
        .map(|i| format!("{} 0 R", page_id(i)))
        .collect::<Vec<_>>()
        .join(" ");
    objects.push(format!(
        "<< /Type /Pages /Kids [{kids}] /Count {} >>",
        pages.len()
    ));
    objects.push(format!("<< /Title ({title}) /Author (Folio Tests) >>"));
    objects.push(if outline.is_empty() {
        "<< /Type /Outlines /Count 0 >>".to_string()
    } else {
        format!(
            "<< /Type /Outlines /First {} 0 R /Last {} 0 R /Count {} >>",
            item_id(0),
            item_id(outline.len() - 1),
            outline.len()
        )
    });

    for (i, text) in pages.iter().enumerate() {
        objects.push(format!(
            "<< /Type /Page /Parent {PAGES} 0 R /MediaBox [0 0 612 792] /Resources << >> /Contents {} 0 R >>",
            page_id(i) + 1
        ));
        let stream = format!("BT 72 720 Td ({text}) Tj ET");
        objects.push(format!(
            "<< /Length {} >>\nstream\n{stream}\nendstream",
            stream.len()
        ));
    }

    for (i, (label, page)) in outline.iter().enumerate() {
        let mut item = format!(
            "<< /Title ({label}) /Parent {OUTLINES} 0 R /Dest [{} 0 R /Fit]",
            page_id(*page)
        );
        if i > 0 {
            item.push_str(&format!(" /Prev {} 0 R", item_id(i - 1)));
        }
        if i + 1 < outline.len() {
            item.push_str(&format!(" /Next {} 0 R", item_id(i + 1)));
        }
        item.push_str(" >>");
        objects.push(item);
    }

    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());
    for (idx, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{body}\nendobj\n", idx + 1).as_bytes());
    }
    let xref = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1).as_bytes());
    for offset in offsets {
        out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root {CATALOG} 0 R /Info {INFO} 0 R >>\nstartxref\n{xref}\n%%EOF\n",
            objects.len() + 1
        )
        .as_bytes(),
    );
    BookFile::new(name, out)
}
