//! EPUB text extraction and position mapping
//!
//! An EPUB is flattened into one character stream in spine order. Every
//! text block remembers its spine document and element path so a character
//! offset can be turned into a KOReader XPointer.

use scraper::{ElementRef, Html, Node, Selector};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::fuzzy;

/// Characters on each side of the position returned by `text_at_percentage`
const TEXT_HALF_WINDOW: usize = 400;

/// Words per anchor when the exact text cannot be found
const ANCHOR_WORDS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum EbookError {
    #[error("Ebook not found: {0}")]
    NotFound(String),

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid EPUB {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Where a piece of text sits in a book
#[derive(Debug, Clone, PartialEq)]
pub struct TextLocation {
    /// 0..1
    pub percentage: f64,
    pub xpointer: Option<String>,
}

#[derive(Debug)]
struct Word {
    norm: String,
    offset: usize,
}

#[derive(Debug)]
struct Paragraph {
    offset: usize,
    spine_index: usize,
    /// Element path below `<body>`, e.g. `/div[1]/p[2]`
    path: String,
}

/// Flattened text of one EPUB
#[derive(Debug, Default)]
pub struct Book {
    chars: Vec<char>,
    words: Vec<Word>,
    paragraphs: Vec<Paragraph>,
}

impl Book {
    /// Build from XHTML documents in spine order
    pub fn from_documents<S: AsRef<str>>(documents: &[S]) -> Self {
        let mut book = Book::default();

        for (spine_index, doc) in documents.iter().enumerate() {
            for block in xhtml_blocks(doc.as_ref()) {
                if !book.chars.is_empty() {
                    book.chars.push(' ');
                }
                let offset = book.chars.len();
                book.paragraphs.push(Paragraph {
                    offset,
                    spine_index,
                    path: block.path,
                });
                book.push_text(&block.text);
            }
        }

        book
    }

    fn push_text(&mut self, text: &str) {
        let mut current = String::new();
        let mut start = 0;

        for c in text.chars() {
            let offset = self.chars.len();
            self.chars.push(c);

            if c.is_alphanumeric() || c == '\'' {
                if current.is_empty() {
                    start = offset;
                }
                current.push(c);
            } else if !current.is_empty() {
                self.push_word(std::mem::take(&mut current), start);
            }
        }
        if !current.is_empty() {
            self.push_word(current, start);
        }
    }

    fn push_word(&mut self, raw: String, offset: usize) {
        let norm = raw.trim_matches('\'').to_lowercase();
        if !norm.is_empty() {
            self.words.push(Word { norm, offset });
        }
    }

    pub fn total_chars(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Roughly 800 characters centred on `percentage`, trimmed to whole words
    pub fn text_at_percentage(&self, percentage: f64) -> Option<String> {
        if self.chars.is_empty() {
            return None;
        }

        let len = self.chars.len();
        let center = ((percentage.clamp(0.0, 1.0) * len as f64) as usize).min(len - 1);
        let mut start = center.saturating_sub(TEXT_HALF_WINDOW);
        let mut end = (center + TEXT_HALF_WINDOW).min(len);

        if start > 0 {
            while start < center && !self.chars[start - 1].is_whitespace() {
                start += 1;
            }
        }
        if end < len {
            while end > center + 1 && !self.chars[end].is_whitespace() {
                end -= 1;
            }
        }

        let text: String = self.chars[start..end].iter().collect();
        let text = text.trim().to_string();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Locate `text` in the book. An exact word-sequence match wins; otherwise
    /// five-word anchors vote for a start position. Ties go to the candidate
    /// nearest `hint` (a 0..1 fraction).
    pub fn find_text_location(&self, text: &str, hint: Option<f64>) -> Option<TextLocation> {
        let search = fuzzy::normalize_words(text);
        if search.is_empty() || self.words.is_empty() {
            return None;
        }

        let hint_word = hint.map(|h| self.word_index_near(h));
        let distance = |start: usize| hint_word.map_or(0, |h| start.abs_diff(h));

        let start = self
            .exact_matches(&search)
            .into_iter()
            .min_by_key(|&s| distance(s))
            .or_else(|| self.anchor_vote(&search, &distance))?;

        let center = (start + search.len() / 2).min(self.words.len() - 1);
        let offset = self.words[center].offset;

        Some(TextLocation {
            percentage: offset as f64 / self.chars.len() as f64,
            xpointer: self.xpointer_at(offset),
        })
    }

    fn word_index_near(&self, fraction: f64) -> usize {
        let target = (fraction.clamp(0.0, 1.0) * self.chars.len() as f64) as usize;
        self.words
            .partition_point(|w| w.offset < target)
            .min(self.words.len() - 1)
    }

    fn matches_at(&self, start: usize, needle: &[String]) -> bool {
        start + needle.len() <= self.words.len()
            && needle
                .iter()
                .zip(&self.words[start..])
                .all(|(a, w)| *a == w.norm)
    }

    fn exact_matches(&self, search: &[String]) -> Vec<usize> {
        (0..self.words.len())
            .filter(|&i| self.words[i].norm == search[0] && self.matches_at(i, search))
            .collect()
    }

    fn anchor_vote(&self, search: &[String], distance: &dyn Fn(usize) -> usize) -> Option<usize> {
        if search.len() <= ANCHOR_WORDS {
            return None;
        }

        // First word of each anchor -> anchor positions within the search text
        let mut by_first: HashMap<&str, Vec<usize>> = HashMap::new();
        for s in 0..=search.len() - ANCHOR_WORDS {
            by_first.entry(search[s].as_str()).or_default().push(s);
        }

        let mut votes: HashMap<usize, usize> = HashMap::new();
        for (i, word) in self.words.iter().enumerate() {
            let Some(anchors) = by_first.get(word.norm.as_str()) else {
                continue;
            };
            for &s in anchors {
                if self.matches_at(i, &search[s..s + ANCHOR_WORDS]) {
                    *votes.entry(i.saturating_sub(s)).or_insert(0) += 1;
                }
            }
        }

        votes
            .into_iter()
            .filter(|(_, count)| *count >= 2)
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| distance(b.0).cmp(&distance(a.0))))
            .map(|(start, _)| start)
    }

    /// KOReader XPointer of the block holding `offset`
    pub fn xpointer_at(&self, offset: usize) -> Option<String> {
        let idx = self.paragraphs.partition_point(|p| p.offset <= offset);
        let p = self.paragraphs.get(idx.checked_sub(1)?)?;
        Some(format!(
            "/body/DocFragment[{}]/body{}/text().0",
            p.spine_index + 1,
            p.path
        ))
    }
}

/// Finds and parses EPUBs under the books directory
pub struct EbookParser {
    books_dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<Book>>>,
}

impl EbookParser {
    pub fn new(books_dir: impl Into<PathBuf>) -> Self {
        Self {
            books_dir: books_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn books_dir(&self) -> &Path {
        &self.books_dir
    }

    /// Every `.epub` under the books directory
    pub fn list_epubs(&self) -> Vec<PathBuf> {
        walkdir::WalkDir::new(&self.books_dir)
            .follow_links(true)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .map_or(false, |ext| ext.eq_ignore_ascii_case("epub"))
            })
            .map(|e| e.into_path())
            .collect()
    }

    pub fn find_epub(&self, filename: &str) -> Option<PathBuf> {
        walkdir::WalkDir::new(&self.books_dir)
            .follow_links(true)
            .into_iter()
            .filter_map(Result::ok)
            .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == filename)
            .map(|e| e.into_path())
    }

    /// Parse (once) and return the book
    pub fn load(&self, filename: &str) -> Result<Arc<Book>, EbookError> {
        if let Some(book) = self.cache_get(filename) {
            return Ok(book);
        }

        let path = self
            .find_epub(filename)
            .ok_or_else(|| EbookError::NotFound(filename.to_string()))?;

        let mut epub = Epub::open(&path)?;
        let documents = epub.spine_documents()?;
        let book = Arc::new(Book::from_documents(&documents));
        debug!(filename, chars = book.total_chars(), "Parsed ebook");

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(filename.to_string(), book.clone());
        }
        Ok(book)
    }

    fn cache_get(&self, filename: &str) -> Option<Arc<Book>> {
        self.cache.lock().ok()?.get(filename).cloned()
    }

    /// Text of the element `id="fragment"` in the spine document matching `href`
    pub fn text_for_fragment(
        &self,
        filename: &str,
        href: &str,
        fragment: &str,
    ) -> Result<Option<String>, EbookError> {
        if href.is_empty() || fragment.is_empty() {
            return Ok(None);
        }

        let path = self
            .find_epub(filename)
            .ok_or_else(|| EbookError::NotFound(filename.to_string()))?;
        let mut epub = Epub::open(&path)?;

        let Some(name) = epub.resolve_entry(href) else {
            return Ok(None);
        };
        let doc = epub.read_entry(&name)?;
        Ok(element_text_by_id(&doc, fragment))
    }
}

struct Epub {
    path: PathBuf,
    archive: zip::ZipArchive<std::fs::File>,
}

impl Epub {
    fn open(path: &Path) -> Result<Self, EbookError> {
        let file = std::fs::File::open(path).map_err(|source| EbookError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let archive = zip::ZipArchive::new(file).map_err(|e| EbookError::Invalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            archive,
        })
    }

    fn invalid(&self, reason: impl Into<String>) -> EbookError {
        EbookError::Invalid {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn read_entry(&mut self, name: &str) -> Result<String, EbookError> {
        let mut entry = self
            .archive
            .by_name(name)
            .map_err(|e| EbookError::Invalid {
                path: self.path.clone(),
                reason: format!("{}: {}", name, e),
            })?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).map_err(|source| EbookError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Exact entry name, else the first entry containing `href`
    fn resolve_entry(&self, href: &str) -> Option<String> {
        let names: Vec<&str> = self.archive.file_names().collect();
        if names.contains(&href) {
            return Some(href.to_string());
        }
        names.into_iter().find(|n| n.contains(href)).map(str::to_string)
    }

    /// Spine documents in order. An unreadable item stays in the list as an
    /// empty document so later `DocFragment` indices stay correct.
    fn spine_documents(&mut self) -> Result<Vec<String>, EbookError> {
        let container = Html::parse_document(&self.read_entry("META-INF/container.xml")?);
        let opf_path = elements_named(&container, "rootfile")
            .find_map(|e| e.value().attr("full-path").map(str::to_string))
            .ok_or_else(|| self.invalid("container.xml has no rootfile"))?;

        let opf = Html::parse_document(&self.read_entry(&opf_path)?);
        let opf_dir = opf_path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");

        let manifest: HashMap<String, String> = elements_named(&opf, "item")
            .filter_map(|e| {
                let item = e.value();
                Some((item.attr("id")?.to_string(), item.attr("href")?.to_string()))
            })
            .collect();
        let spine: Vec<Option<String>> = elements_named(&opf, "itemref")
            .map(|e| {
                e.value()
                    .attr("idref")
                    .and_then(|id| manifest.get(id))
                    .map(|href| join_zip_path(opf_dir, href))
            })
            .collect();

        let mut documents = Vec::with_capacity(spine.len());
        for name in spine {
            let doc = match name {
                Some(name) => self.read_entry(&name).unwrap_or_else(|e| {
                    warn!(entry = %name, error = %e, "Unreadable spine item");
                    String::new()
                }),
                None => {
                    warn!("Spine item missing from manifest");
                    String::new()
                }
            };
            documents.push(doc);
        }

        if documents.iter().all(String::is_empty) {
            return Err(self.invalid("empty spine"));
        }
        Ok(documents)
    }
}

/// Elements with the given local name, namespace prefix ignored
fn elements_named<'a>(html: &'a Html, name: &'a str) -> impl Iterator<Item = ElementRef<'a>> + 'a {
    html.root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(move |e| e.value().name().rsplit(':').next() == Some(name))
}

fn join_zip_path(dir: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href).replace("%20", " ");
    let mut parts: Vec<&str> = dir.split('/').filter(|p| !p.is_empty()).collect();
    for part in href.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    parts.join("/")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_block(name: &str) -> bool {
    matches!(
        name,
        "p" | "div" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "li" | "ul" | "ol"
            | "blockquote" | "section" | "article" | "aside" | "header" | "footer"
            | "br" | "table" | "tbody" | "tr" | "td" | "th" | "dl" | "dd" | "dt"
            | "pre" | "figure" | "figcaption"
    )
}

/// A run of text and the element path (below `<body>`) of its block
#[derive(Debug, Clone, PartialEq)]
struct Block {
    path: String,
    text: String,
}

/// Text blocks of an XHTML document in reading order
fn xhtml_blocks(doc: &str) -> Vec<Block> {
    let html = Html::parse_document(doc);
    let Ok(body) = Selector::parse("body") else {
        return Vec::new();
    };

    let mut blocks = Vec::new();
    if let Some(body) = html.select(&body).next() {
        collect_blocks(body, "", &mut blocks);
    }
    blocks
}

/// 1-based position among same-named element siblings
fn sibling_index(element: ElementRef) -> usize {
    let name = element.value().name();
    1 + element
        .prev_siblings()
        .filter_map(ElementRef::wrap)
        .filter(|s| s.value().name() == name)
        .count()
}

fn collect_blocks(element: ElementRef, path: &str, out: &mut Vec<Block>) {
    let mut text = String::new();
    let flush = |text: &mut String, out: &mut Vec<Block>| {
        let collapsed = collapse_whitespace(text);
        if !collapsed.is_empty() {
            out.push(Block {
                path: path.to_string(),
                text: collapsed,
            });
        }
        text.clear();
    };

    for child in element.children() {
        match child.value() {
            Node::Text(t) => text.push_str(t),
            Node::Element(e) => {
                let name = e.name();
                if name == "script" || name == "style" {
                    continue;
                }
                let Some(child) = ElementRef::wrap(child) else {
                    continue;
                };
                if is_block(name) {
                    flush(&mut text, out);
                    let child_path = format!("{}/{}[{}]", path, name, sibling_index(child));
                    collect_blocks(child, &child_path, out);
                } else {
                    text.extend(child.text());
                }
            }
            _ => {}
        }
    }
    flush(&mut text, out);
}

/// Text inside the element whose `id` is `id`
fn element_text_by_id(doc: &str, id: &str) -> Option<String> {
    let html = Html::parse_document(doc);
    let element = html
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().id() == Some(id))?;

    let mut blocks = Vec::new();
    collect_blocks(element, "", &mut blocks);
    let text = blocks
        .into_iter()
        .map(|b| b.text)
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
