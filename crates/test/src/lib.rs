//! Test helpers and fixtures.

pub mod fixtures;

use std::sync::Arc;

use folio_application::NavigationEngine;
use folio_core::{BookFile, BookId, ProgressStore, Settings};
use folio_engine::AdapterRegistry;

/// Opens `file` in a fresh engine over `store`, with the id derived from the
/// file name.
pub fn open_engine(
    store: Arc<dyn ProgressStore>,
    file: &BookFile,
) -> anyhow::Result<NavigationEngine> {
    let mut engine = NavigationEngine::new(store, Settings::default());
    engine.open(&AdapterRegistry::with_defaults(), file, book_id(file))?;
    Ok(engine)
}

pub fn book_id(file: &BookFile) -> BookId {
    BookId(file.name.clone())
}

#[cfg(test)]
mod tests {
    use folio_application::{NavigationError, ReaderState, TocModel};
    use folio_core::{
        Anchor, ContentUnit, DocumentError, DocumentFormat, HrefMatch, Location,
        MemoryProgressStore,
    };
    use folio_storage::Storage;

    use super::fixtures::{EpubBuilder, MobiBuilder, PNG, markdown, pdf};
    use super::*;

    fn three_chapters() -> anyhow::Result<BookFile> {
        EpubBuilder::new()
            .title("Three Chapters")
            .author("A. Writer")
            .cover(PNG)
            .chapter("Chapter 1", "<p>It begins.</p>")
            .chapter(
                "Chapter 2",
                r#"<p>Middle part.</p><h2 id="deep">Deeper</h2><p>Further in.</p>"#,
            )
            .section("deep", "Deeper")
            .chapter("Chapter 3", "<p>The end.</p>")
            .build("three.epub")
    }

    fn location(engine: &NavigationEngine) -> String {
        engine
            .location()
            .map(|location| location.to_string())
            .unwrap_or_default()
    }

    #[test]
    fn epub_next_walks_chapters_then_stops() -> anyhow::Result<()> {
        let store = Arc::new(MemoryProgressStore::new());
        let mut engine = open_engine(store.clone(), &three_chapters()?)?;
        assert_eq!(location(&engine), "epubcfi(/6/2[ch1]!)");

        engine.next()?;
        engine.next()?;
        assert_eq!(location(&engine), "epubcfi(/6/6[ch3]!)");

        assert_eq!(engine.next()?, None);
        assert_eq!(location(&engine), "epubcfi(/6/6[ch3]!)");
        let saved = store.load(&BookId("three.epub".into()))?.expect("saved");
        assert_eq!(saved.location.as_str(), "epubcfi(/6/6[ch3]!)");
        Ok(())
    }

    #[test]
    fn epub_metadata_cover_and_text() -> anyhow::Result<()> {
        let engine = open_engine(Arc::new(MemoryProgressStore::new()), &three_chapters()?)?;
        let view = engine.view().expect("view");
        assert_eq!(view.format, DocumentFormat::Epub);
        assert_eq!(view.metadata.title, "Three Chapters");
        assert_eq!(view.metadata.author.as_deref(), Some("A. Writer"));
        assert_eq!(view.unit_count, 3);
        assert!(view.content.text.contains("It begins."));
        assert_eq!(view.content.label.as_deref(), Some("Chapter 1"));

        let cover = engine.cover().expect("cover");
        assert_eq!(cover.media_type, "image/png");
        assert_eq!(cover.bytes, PNG);
        Ok(())
    }

    #[test]
    fn epub_anchor_jump_syncs_nested_toc() -> anyhow::Result<()> {
        let store = Arc::new(MemoryProgressStore::new());
        let file = three_chapters()?;
        let mut engine = open_engine(store.clone(), &file)?;

        let jump = engine.jump_to("Text/ch2.xhtml#deep")?;
        assert_eq!(jump.unit_index, 1);
        assert!(jump.scroll_to.is_some());
        assert!(jump.location.as_str().starts_with("epubcfi(/6/4[ch2]!/4/"));
        assert!(jump.location.as_str().ends_with("[deep])"));

        let toc = engine.toc().expect("toc");
        assert_eq!(toc.policy(), HrefMatch::Containment);
        assert!(toc.is_expanded("Chapter 2"));
        assert_eq!(toc.active(), Some("Chapter 2-Deeper"));

        let reopened = open_engine(store, &file)?;
        let view = reopened.view().expect("view");
        assert_eq!(view.unit.index, 1);
        assert_eq!(view.unit.anchor, Some(Anchor::Id("deep".into())));
        Ok(())
    }

    #[test]
    fn epub_ids_with_cfi_delimiters_restore_after_reopen() -> anyhow::Result<()> {
        let file = EpubBuilder::new()
            .chapter("Chapter 1", "<p>Start.</p>")
            .chapter(
                "Chapter 2",
                r#"<p>Intro.</p><h2 id="part:1">One</h2><p>a</p><h2 id="a,b">Two</h2><p>b</p><h2 id="x;y">Three</h2>"#,
            )
            .build("delimiters.epub")?;

        for id in ["part:1", "a,b", "x;y"] {
            let store = Arc::new(MemoryProgressStore::new());
            let mut engine = open_engine(store.clone(), &file)?;
            let jump = engine.jump_to(&format!("Text/ch2.xhtml#{id}"))?;
            assert_eq!(jump.unit_index, 1);
            engine.close();

            let reopened = open_engine(store, &file)?;
            let view = reopened.view().expect("view");
            assert_eq!(view.unit.index, 1, "{id}");
            assert_eq!(view.unit.anchor, Some(Anchor::Id(id.into())), "{id}");
            assert_eq!(view.location, &jump.location);
        }
        Ok(())
    }

    #[test]
    fn epub_position_inside_chapter_highlights_containing_entry() -> anyhow::Result<()> {
        let mut engine = open_engine(Arc::new(MemoryProgressStore::new()), &three_chapters()?)?;
        engine.jump_to("Text/ch3.xhtml#ch3-title")?;
        assert_eq!(engine.toc().and_then(TocModel::active), Some("Chapter 3"));
        Ok(())
    }

    #[test]
    fn mobi_filepos_zero_resolves_to_first_section() -> anyhow::Result<()> {
        let builder = MobiBuilder::new()
            .title("Pocket Book")
            .author("M. Author")
            .section("<h1>One</h1><p>First section.</p>")
            .section("<h1>Two</h1><p>Second section.</p>");
        let file = builder.build("pocket.mobi");

        let mut handle = AdapterRegistry::with_defaults().open(&file)?;
        assert_eq!(handle.format(), DocumentFormat::Mobi);
        assert_eq!(handle.metadata().title, "Pocket Book");
        assert_eq!(handle.location_count(), 2);
        assert_eq!(
            handle.resolve_location(&Location::new("filepos:0"))?,
            ContentUnit::with_anchor(0, Anchor::Offset(0))
        );
        Ok(())
    }

    #[test]
    fn mobi_navigation_uses_section_offsets() -> anyhow::Result<()> {
        let builder = MobiBuilder::new()
            .section("<p>First section.</p>")
            .section("<p>Second section.</p>")
            .cover(PNG);
        let (_, starts) = builder.html();
        let file = builder.build("sections.mobi");

        let mut engine = open_engine(Arc::new(MemoryProgressStore::new()), &file)?;
        assert_eq!(location(&engine), "filepos:0");
        engine.next()?;
        assert_eq!(location(&engine), format!("filepos:{}", starts[1]));
        let view = engine.view().expect("view");
        assert!(view.content.text.contains("Second section."));
        assert_eq!(view.metadata.title, "Full Name");
        assert!(engine.cover().is_some());
        Ok(())
    }

    #[test]
    fn markdown_outline_nests_and_expands_on_navigation() -> anyhow::Result<()> {
        let file = markdown("abc.md", "# A\nintro\n## B\nbody\n# C\nend\n");
        let mut handle = AdapterRegistry::with_defaults().open(&file)?;
        let outline = handle.outline();
        let shape = outline
            .iter()
            .map(|entry| (entry.label.as_str(), entry.level))
            .collect::<Vec<_>>();
        assert_eq!(shape, [("A", 1), ("B", 2), ("C", 1)]);
        handle.close();

        let mut engine = open_engine(Arc::new(MemoryProgressStore::new()), &file)?;
        let toc = engine.toc().expect("toc");
        let nodes = toc.nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].label, "A");
        assert_eq!(nodes[0].children.len(), 1);
        assert_eq!(nodes[0].children[0].label, "B");
        assert_eq!(nodes[1].label, "C");
        assert!(nodes[1].is_leaf());

        let b_href = nodes[0].children[0].href.clone().expect("leaf href");
        engine.jump_to("heading-1-2")?;
        assert!(!engine.toc().expect("toc").is_expanded(&nodes_id(&engine, 0)));
        engine.jump_to(&b_href)?;
        let toc = engine.toc().expect("toc");
        assert!(toc.is_expanded(&toc.nodes()[0].id));
        Ok(())
    }

    fn nodes_id(engine: &NavigationEngine, idx: usize) -> String {
        engine
            .toc()
            .and_then(|toc| toc.nodes().get(idx))
            .map(|node| node.id.clone())
            .unwrap_or_default()
    }

    #[test]
    fn stale_progress_falls_back_to_start() -> anyhow::Result<()> {
        let file = markdown("notes.md", "# One\n# Two\n");
        let store = Arc::new(MemoryProgressStore::new());
        store.save(&book_id(&file), &Location::new("heading-1-9"), Some(3.0))?;

        let engine = open_engine(store, &file)?;
        assert_eq!(engine.state(), &ReaderState::Ready);
        assert_eq!(engine.view().map(|view| view.unit.index), Some(0));
        Ok(())
    }

    #[test]
    fn unsupported_upload_is_rejected_before_opening() {
        let registry = AdapterRegistry::with_defaults();
        let file = BookFile::new("novel.azw3", b"BOOKMOBI".to_vec());
        assert!(matches!(
            registry.get_adapter(&file),
            Err(DocumentError::UnsupportedFormat(_))
        ));

        let mut engine =
            NavigationEngine::new(Arc::new(MemoryProgressStore::new()), Settings::default());
        let err = engine
            .open(&registry, &file, book_id(&file))
            .expect_err("unsupported");
        assert!(matches!(
            err,
            NavigationError::Document(DocumentError::UnsupportedFormat(_))
        ));
        assert!(engine.view().is_none());
    }

    #[test]
    fn declared_mime_type_overrides_extension() -> anyhow::Result<()> {
        let file = three_chapters()?;
        let renamed = BookFile::new("download.bin", file.bytes).with_mime_type("application/epub+zip");
        let engine = open_engine(Arc::new(MemoryProgressStore::new()), &renamed)?;
        assert_eq!(engine.view().map(|view| view.format), Some(DocumentFormat::Epub));
        Ok(())
    }

    #[test]
    fn sqlite_progress_survives_reopen() -> anyhow::Result<()> {
        let storage = Arc::new(Storage::open_in_memory()?);
        let file = markdown("guide.md", "# One\na\n# Two\nb\n# Three\nc\n");

        let mut engine = open_engine(storage.clone(), &file)?;
        engine.next()?;
        engine.close();

        let reopened = open_engine(storage.clone(), &file)?;
        assert_eq!(location(&reopened), "heading-1-2");
        let records = storage.list_progress()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].book_id, book_id(&file));
        Ok(())
    }

    #[test]
    fn next_at_end_is_idempotent() -> anyhow::Result<()> {
        let file = markdown("single.md", "just one unit\n");
        let store = Arc::new(MemoryProgressStore::new());
        let mut engine = open_engine(store.clone(), &file)?;
        assert_eq!(location(&engine), "top");
        assert_eq!(engine.next()?, None);
        assert_eq!(engine.prev()?, None);
        assert!(store.is_empty());
        Ok(())
    }

    #[test]
    fn titles_fall_back_to_file_name() -> anyhow::Result<()> {
        let untitled = EpubBuilder::new()
            .chapter("Only", "<p>x</p>")
            .build("field-guide.epub")?;
        let engine = open_engine(Arc::new(MemoryProgressStore::new()), &untitled)?;
        assert_eq!(engine.view().map(|view| view.metadata.title.clone()), Some("field-guide.epub".into()));
        assert!(engine.cover().is_none());
        Ok(())
    }

    #[test]
    fn pdf_pages_outline_and_info() -> anyhow::Result<()> {
        let file = pdf(
            "paper.pdf",
            "Field Notes",
            &["First page text", "Second page text"],
            &[("Intro", 0), ("Results", 1)],
        );
        let mut engine = open_engine(Arc::new(MemoryProgressStore::new()), &file)?;
        {
            let view = engine.view().expect("view");
            assert_eq!(view.format, DocumentFormat::Pdf);
            assert_eq!(view.metadata.title, "Field Notes");
            assert_eq!(view.unit_count, 2);
            assert_eq!(view.location.as_str(), "0");
            assert_eq!(view.toc.nodes().len(), 2);
        }

        let moved = engine.activate_toc("Results")?.expect("moved");
        assert_eq!(moved.unit_index, 1);
        assert_eq!(moved.location.as_str(), "1");
        let view = engine.view().expect("view");
        assert!(view.content.text.contains("Second page text"));
        assert_eq!(view.toc.active(), Some("Results"));
        Ok(())
    }

    #[test]
    fn pdf_pages_read_from_the_open_document_until_close() -> anyhow::Result<()> {
        let file = pdf("notes.pdf", "Notes", &["Alpha page", "Beta page", "Gamma page"], &[]);
        let mut handle = AdapterRegistry::with_defaults().open(&file)?;
        assert!(handle.load_unit(2)?.text.contains("Gamma page"));
        assert!(handle.load_unit(0)?.text.contains("Alpha page"));
        assert!(handle.load_unit(1)?.text.contains("Beta page"));

        handle.close();
        assert!(matches!(
            handle.load_unit(1),
            Err(DocumentError::LocationNotFound(_))
        ));
        Ok(())
    }
}
