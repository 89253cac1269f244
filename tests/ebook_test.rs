//! EPUB parsing integration tests on archives built in a temp directory

mod common;

use abs_kosync::ebook::{EbookError, EbookParser};
use tempfile::TempDir;

#[test]
fn test_parses_spine_in_order() {
    let dir = TempDir::new().unwrap();
    common::write_epub(dir.path(), "1984.epub", &common::sample_chapters());

    let parser = EbookParser::new(dir.path());
    let book = parser.load("1984.epub").unwrap();
    assert!(!book.is_empty());

    let start = book.text_at_percentage(0.0).unwrap();
    assert!(start.starts_with("One It was a bright cold day"));

    let loc = book
        .find_text_location("the Ministry of Truth was startlingly different", None)
        .unwrap();
    assert!(loc.percentage > 0.8);
    assert_eq!(loc.xpointer.as_deref(), Some("/body/DocFragment[2]/body/p[3]/text().0"));
}

#[test]
fn test_finds_epubs_in_subdirectories() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("Orwell");
    std::fs::create_dir_all(&nested).unwrap();
    common::write_epub(&nested, "1984.epub", &common::sample_chapters());
    std::fs::write(dir.path().join("notes.txt"), "not a book").unwrap();

    let parser = EbookParser::new(dir.path());
    let found = parser.list_epubs();
    assert_eq!(found.len(), 1);
    assert!(found[0].ends_with("Orwell/1984.epub"));
    assert_eq!(parser.find_epub("1984.epub"), Some(found[0].clone()));
    assert!(parser.find_epub("Dune.epub").is_none());
}

#[test]
fn test_fragment_text_from_locator() {
    let dir = TempDir::new().unwrap();
    common::write_epub(dir.path(), "1984.epub", &common::sample_chapters());
    let parser = EbookParser::new(dir.path());

    let text = parser
        .text_for_fragment("1984.epub", "Text/ch1.xhtml", "s9")
        .unwrap()
        .unwrap();
    assert!(text.starts_with("Behind him the voice from the telescreen"));

    assert!(parser
        .text_for_fragment("1984.epub", "Text/ch1.xhtml", "nope")
        .unwrap()
        .is_none());
}

#[test]
fn test_missing_and_corrupt_books() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("broken.epub"), b"this is not a zip").unwrap();
    let parser = EbookParser::new(dir.path());

    assert!(matches!(parser.load("absent.epub"), Err(EbookError::NotFound(_))));
    assert!(matches!(parser.load("broken.epub"), Err(EbookError::Invalid { .. })));
}

#[test]
fn test_unreadable_spine_item_keeps_fragment_numbers() {
    let dir = TempDir::new().unwrap();
    let chapter = common::chapter("<p>Down with Big Brother, written over and over in large neat capitals.</p>");
    common::write_epub_spine(
        dir.path(),
        "gap.epub",
        &["Text/missing.xhtml", "Text/ch1.xhtml"],
        &[("Text/ch1.xhtml", &chapter)],
    );

    let book = EbookParser::new(dir.path()).load("gap.epub").unwrap();
    let loc = book.find_text_location("down with big brother", None).unwrap();
    assert_eq!(loc.xpointer.as_deref(), Some("/body/DocFragment[2]/body/p[1]/text().0"));
}

#[test]
fn test_spine_href_with_apostrophe() {
    let dir = TempDir::new().unwrap();
    let note = common::chapter("<p>A note from the author on the appendix about Newspeak.</p>");
    common::write_epub_spine(
        dir.path(),
        "note.epub",
        &["Text/Author's_Note.xhtml"],
        &[("Text/Author's_Note.xhtml", &note)],
    );

    let book = EbookParser::new(dir.path()).load("note.epub").unwrap();
    assert!(book.text_at_percentage(0.5).unwrap().contains("Newspeak"));
}

#[test]
fn test_book_with_nothing_readable_is_invalid() {
    let dir = TempDir::new().unwrap();
    common::write_epub_spine(dir.path(), "hollow.epub", &["Text/missing.xhtml"], &[]);

    let parser = EbookParser::new(dir.path());
    assert!(matches!(parser.load("hollow.epub"), Err(EbookError::Invalid { .. })));
}
