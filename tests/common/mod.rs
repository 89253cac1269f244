//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;

const CONTAINER_XML: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

/// Chapter body wrapped in a minimal XHTML document
pub fn chapter(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>Chapter</title></head>
<body>
{}
</body></html>"#,
        body
    )
}

/// Write an EPUB with one spine document per chapter under `OEBPS/Text/`
pub fn write_epub(dir: &Path, filename: &str, chapters: &[String]) -> PathBuf {
    let hrefs: Vec<String> = (0..chapters.len()).map(|i| format!("Text/ch{}.xhtml", i)).collect();
    let files: Vec<(&str, &str)> = hrefs
        .iter()
        .zip(chapters)
        .map(|(href, content)| (href.as_str(), content.as_str()))
        .collect();
    let spine: Vec<&str> = hrefs.iter().map(String::as_str).collect();
    write_epub_spine(dir, filename, &spine, &files)
}

/// Write an EPUB whose spine lists `spine` (hrefs relative to `OEBPS/`).
/// Only `files` are stored, so a spine href without a file is unreadable.
pub fn write_epub_spine(dir: &Path, filename: &str, spine: &[&str], files: &[(&str, &str)]) -> PathBuf {
    let path = dir.join(filename);
    let file = std::fs::File::create(&path).unwrap();
    let mut zip = zip::ZipWriter::new(file);

    let stored = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    zip.start_file("mimetype", stored).unwrap();
    zip.write_all(b"application/epub+zip").unwrap();

    let options = SimpleFileOptions::default();
    zip.start_file("META-INF/container.xml", options).unwrap();
    zip.write_all(CONTAINER_XML.as_bytes()).unwrap();

    let mut manifest = String::new();
    let mut itemrefs = String::new();
    for (i, href) in spine.iter().enumerate() {
        manifest.push_str(&format!(
            r#"<item id="item{i}" href="{href}" media-type="application/xhtml+xml"/>"#
        ));
        itemrefs.push_str(&format!(r#"<itemref idref="item{i}"/>"#));
    }
    let opf = format!(
        r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata><dc:title xmlns:dc="http://purl.org/dc/elements/1.1/">Test</dc:title></metadata>
  <manifest>{}</manifest>
  <spine>{}</spine>
</package>"#,
        manifest, itemrefs
    );
    zip.start_file("OEBPS/content.opf", options).unwrap();
    zip.write_all(opf.as_bytes()).unwrap();

    for (href, content) in files {
        zip.start_file(format!("OEBPS/{}", href), options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }

    zip.finish().unwrap();
    path
}

/// Two chapters of distinct prose, long enough for windowed text lookups
pub fn sample_chapters() -> Vec<String> {
    vec![
        chapter(
            r#"<h1>One</h1>
<p>It was a bright cold day in April, and the clocks were striking thirteen.</p>
<p id="s2">Winston Smith, his chin nuzzled into his breast in an effort to escape the vile wind, slipped quickly through the glass doors of Victory Mansions.</p>
<p>The hallway smelt of boiled cabbage and old rag mats. At one end of it a coloured poster, too large for indoor display, had been tacked to the wall.</p>"#,
        ),
        chapter(
            r#"<h1>Two</h1>
<p>Outside, even through the shut window pane, the world looked cold. Down in the street little eddies of wind were whirling dust and torn paper into spirals.</p>
<p id="s9">Behind him the voice from the telescreen was still babbling away about pig iron and the overfulfilment of the Ninth Three Year Plan.</p>
<p>The Ministry of Truth was startlingly different from any other object in sight, an enormous pyramidal structure of glittering white concrete.</p>"#,
        ),
    ]
}

/// Transcript segments reading the sample chapters aloud, ten seconds each
pub fn sample_transcript_json() -> String {
    let lines = [
        "One. It was a bright cold day in April, and the clocks were striking thirteen.",
        "Winston Smith, his chin nuzzled into his breast in an effort to escape the vile wind,",
        "slipped quickly through the glass doors of Victory Mansions.",
        "The hallway smelt of boiled cabbage and old rag mats.",
        "At one end of it a coloured poster, too large for indoor display, had been tacked to the wall.",
        "Two. Outside, even through the shut window pane, the world looked cold.",
        "Down in the street little eddies of wind were whirling dust and torn paper into spirals.",
        "Behind him the voice from the telescreen was still babbling away about pig iron",
        "and the overfulfilment of the Ninth Three Year Plan.",
        "The Ministry of Truth was startlingly different from any other object in sight,",
        "an enormous pyramidal structure of glittering white concrete.",
    ];
    let segments: Vec<serde_json::Value> = lines
        .iter()
        .enumerate()
        .map(|(i, text)| {
            serde_json::json!({
                "start": i as f64 * 10.0,
                "end": (i + 1) as f64 * 10.0,
                "text": text,
            })
        })
        .collect();
    serde_json::to_string(&segments).unwrap()
}
