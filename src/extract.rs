//! Text extraction for the supported corpus formats.
//!
//! A [`DocumentLoader`] turns a discovered file's bytes into plain UTF-8
//! text plus format metadata. [`FileLoader`] handles PDF, DOCX, XLSX,
//! Markdown and plain text. Extraction never panics; any parse problem is a
//! [`SyncError::Extraction`] and the pipeline records the document as failed.
//!
//! PDF pages and XLSX sheets are separated by a form feed on its own line,
//! which the chunker reads as a page break.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::OnceLock;

use quick_xml::events::Event;
use regex::Regex;
use serde_json::{json, Value};

use crate::error::SyncError;
use crate::models::SourceFile;

/// Separator inserted between pages (PDF) and sheets (XLSX).
pub const PAGE_SEPARATOR: &str = "\n\u{000c}\n";

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

static MARKDOWN_LINK: OnceLock<Option<Regex>> = OnceLock::new();

/// `[text](target)`, compiled once per process.
fn markdown_link() -> Option<&'static Regex> {
    MARKDOWN_LINK
        .get_or_init(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").ok())
        .as_ref()
}

/// Raw text and format facts for one document.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub text: String,
    pub metadata: BTreeMap<String, Value>,
}

/// Converts file bytes to text. Implementations must be pure over `bytes`.
pub trait DocumentLoader: Send + Sync {
    fn load(&self, file: &SourceFile, bytes: &[u8]) -> Result<Extraction, SyncError>;

    /// Lower-case extensions this loader accepts.
    fn supported_extensions(&self) -> &[&str];
}

/// Dispatches on file extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLoader;

impl DocumentLoader for FileLoader {
    fn load(&self, file: &SourceFile, bytes: &[u8]) -> Result<Extraction, SyncError> {
        match file.file_extension.as_str() {
            "pdf" => extract_pdf(bytes),
            "docx" => extract_docx(bytes),
            "xlsx" => extract_xlsx(bytes),
            "md" | "markdown" | "txt" => Ok(extract_text_file(bytes)),
            other => Err(SyncError::Extraction(format!(
                "unsupported file extension: .{}",
                other
            ))),
        }
    }

    fn supported_extensions(&self) -> &[&str] {
        &["pdf", "docx", "xlsx", "md", "markdown", "txt"]
    }
}

fn ooxml_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::Extraction(format!("OOXML extraction failed: {}", e))
}

fn extract_pdf(bytes: &[u8]) -> Result<Extraction, SyncError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| SyncError::Extraction(format!("PDF extraction failed: {}", e)))?;

    let mut metadata = BTreeMap::new();
    metadata.insert("page_count".to_string(), json!(pages.len()));

    let pages: Vec<&str> = pages.iter().map(|p| p.trim()).collect();
    let empty_pages: Vec<usize> = pages
        .iter()
        .enumerate()
        .filter(|(_, p)| p.is_empty())
        .map(|(i, _)| i + 1)
        .collect();
    if empty_pages.len() == pages.len() && !pages.is_empty() {
        metadata.insert("parse_warning".to_string(), json!("no_text_layer"));
    } else if !empty_pages.is_empty() {
        metadata.insert("empty_pages".to_string(), json!(empty_pages));
    }

    Ok(Extraction {
        text: pages.join(PAGE_SEPARATOR),
        metadata,
    })
}

/// UTF-8 first, falling back to Latin-1, which maps every byte.
fn extract_text_file(bytes: &[u8]) -> Extraction {
    let mut metadata = BTreeMap::new();
    let text = match std::str::from_utf8(bytes) {
        Ok(s) => s.strip_prefix('\u{feff}').unwrap_or(s).to_string(),
        Err(_) => {
            metadata.insert("encoding_fallback".to_string(), json!("latin-1"));
            bytes.iter().map(|&b| b as char).collect()
        }
    };

    let lines: Vec<&str> = text.lines().collect();
    metadata.insert("line_count".to_string(), json!(lines.len()));

    let mut headers: BTreeMap<String, usize> = BTreeMap::new();
    for line in &lines {
        let stripped = line.trim_start();
        let level = stripped.chars().take_while(|&c| c == '#').count();
        if (1..=6).contains(&level) {
            *headers.entry(format!("h{}", level)).or_insert(0) += 1;
        }
    }
    if !headers.is_empty() {
        metadata.insert("headers".to_string(), json!(headers));
    }

    let code_blocks = text.matches("```").count() / 2;
    if code_blocks > 0 {
        metadata.insert("code_blocks".to_string(), json!(code_blocks));
    }

    if let Some(link) = markdown_link() {
        let links = link.find_iter(&text).count();
        if links > 0 {
            metadata.insert("link_count".to_string(), json!(links));
        }
    }

    if text.starts_with("---") && text[3..].contains("\n---") {
        metadata.insert("has_frontmatter".to_string(), json!(true));
    }

    Extraction { text, metadata }
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, SyncError> {
    let entry = archive.by_name(name).map_err(ooxml_err)?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(ooxml_err)?;
    if out.len() as u64 >= max_bytes {
        return Err(ooxml_err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> Result<Extraction, SyncError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_err)?;
    if archive.by_name("word/document.xml").is_err() {
        return Err(ooxml_err("word/document.xml not found"));
    }
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    let body = parse_docx_body(&xml)?;

    let mut metadata = BTreeMap::new();
    metadata.insert("paragraph_count".to_string(), json!(body.paragraph_count));
    metadata.insert("table_count".to_string(), json!(body.table_count));
    let has_headers = archive.file_names().any(|n| n.starts_with("word/header"));
    let has_footers = archive.file_names().any(|n| n.starts_with("word/footer"));
    if has_headers {
        metadata.insert("has_headers".to_string(), json!(true));
    }
    if has_footers {
        metadata.insert("has_footers".to_string(), json!(true));
    }

    Ok(Extraction {
        text: body.blocks.join("\n\n"),
        metadata,
    })
}

#[derive(Default)]
struct DocxBody {
    blocks: Vec<String>,
    paragraph_count: usize,
    table_count: usize,
}

/// Walks `word/document.xml`: body paragraphs become blocks, heading styles
/// become Markdown `#` prefixes, tables become `[TABLE]` blocks with
/// ` | `-joined rows.
fn parse_docx_body(xml: &[u8]) -> Result<DocxBody, SyncError> {
    let mut body = DocxBody::default();
    let mut reader = quick_xml::Reader::from_reader(xml);

    let mut buf = Vec::new();
    let mut in_t = false;
    let mut table_depth = 0usize;
    let mut paragraph = String::new();
    let mut heading_level: Option<usize> = None;
    let mut cell = String::new();
    let mut row: Vec<String> = Vec::new();
    let mut rows: Vec<String> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_t = true,
                b"tbl" => table_depth += 1,
                b"p" if table_depth == 0 => {
                    paragraph.clear();
                    heading_level = None;
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => paragraph.push('\t'),
                b"br" => paragraph.push('\n'),
                b"pStyle" => {
                    for attr in e.attributes().flatten() {
                        if attr.key.local_name().as_ref() == b"val" {
                            heading_level = heading_style_level(&attr.value);
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                let text = te.unescape().map_err(ooxml_err)?;
                if table_depth > 0 {
                    cell.push_str(&text);
                } else {
                    paragraph.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" if table_depth > 0 => {
                    if !cell.is_empty() && !cell.ends_with(' ') {
                        cell.push(' ');
                    }
                }
                b"p" => {
                    let text = paragraph.trim();
                    if !text.is_empty() {
                        body.paragraph_count += 1;
                        match heading_level {
                            Some(level) => body
                                .blocks
                                .push(format!("{} {}", "#".repeat(level), text)),
                            None => body.blocks.push(text.to_string()),
                        }
                    }
                    paragraph.clear();
                }
                b"tc" => {
                    row.push(cell.trim().to_string());
                    cell.clear();
                }
                b"tr" => {
                    if row.iter().any(|c| !c.is_empty()) {
                        rows.push(row.join(" | "));
                    }
                    row.clear();
                }
                b"tbl" => {
                    table_depth = table_depth.saturating_sub(1);
                    if table_depth == 0 {
                        body.table_count += 1;
                        if !rows.is_empty() {
                            body.blocks
                                .push(format!("[TABLE]\n{}\n[/TABLE]", rows.join("\n")));
                        }
                        rows.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(body)
}

/// `Heading1`..`Heading6` and `Title` map to Markdown heading levels.
fn heading_style_level(style: &[u8]) -> Option<usize> {
    let style = std::str::from_utf8(style).ok()?;
    if style.eq_ignore_ascii_case("title") {
        return Some(1);
    }
    let level = style
        .strip_prefix("Heading")
        .or_else(|| style.strip_prefix("heading"))?
        .trim()
        .parse::<usize>()
        .ok()?;
    (1..=6).contains(&level).then_some(level)
}

fn extract_xlsx(bytes: &[u8]) -> Result<Extraction, SyncError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml_err)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let sheet_names = list_worksheet_names(&archive);

    let mut sheets = Vec::new();
    for name in sheet_names.iter().take(XLSX_MAX_SHEETS) {
        let sheet_xml = read_zip_entry_bounded(&mut archive, name, MAX_XML_ENTRY_BYTES)?;
        sheets.push(extract_xlsx_sheet_rows(&sheet_xml, &shared_strings)?);
    }

    let mut metadata = BTreeMap::new();
    metadata.insert("sheet_count".to_string(), json!(sheet_names.len()));
    if sheet_names.len() > XLSX_MAX_SHEETS {
        metadata.insert("parse_warning".to_string(), json!("sheets_truncated"));
    }

    Ok(Extraction {
        text: sheets.join(PAGE_SEPARATOR),
        metadata,
    })
}

/// Workbooks without any text cells have no shared string table.
fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, SyncError> {
    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(ooxml_err)?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.push(current.take().unwrap_or_default()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_names(archive: &zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

#[derive(Clone, Copy, PartialEq)]
enum CellType {
    Shared,
    Inline,
    Value,
}

/// One line per row, cells joined with ` | `.
fn extract_xlsx_sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<String, SyncError> {
    let mut lines: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut cell_type = CellType::Value;
    let mut in_value = false;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_type = CellType::Value;
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"t" {
                            cell_type = match attr.value.as_ref() {
                                b"s" => CellType::Shared,
                                b"inlineStr" => CellType::Inline,
                                _ => CellType::Value,
                            };
                        }
                    }
                }
                b"v" => in_value = true,
                b"t" if cell_type == CellType::Inline => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().map_err(ooxml_err)?;
                let value = raw.trim();
                if !value.is_empty() {
                    let text = match cell_type {
                        CellType::Shared => value
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i).cloned()),
                        _ => Some(value.to_string()),
                    };
                    if let Some(text) = text {
                        row.push(text);
                        cell_count += 1;
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"row" => {
                    if !row.is_empty() {
                        lines.push(row.join(" | "));
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml_err(e)),
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        lines.push(row.join(" | "));
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Write;
    use std::path::PathBuf;

    fn source(ext: &str) -> SourceFile {
        SourceFile {
            doc_id: format!("doc-{}", ext),
            source_path: PathBuf::from(format!("doc.{}", ext)),
            relative_path: format!("doc.{}", ext),
            file_extension: ext.to_string(),
            last_modified: Utc::now(),
            size_bytes: 0,
        }
    }

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options: zip::write::SimpleFileOptions = Default::default();
            for (name, body) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn unsupported_extension_returns_error() {
        let err = FileLoader.load(&source("png"), b"foo").unwrap_err();
        assert!(matches!(err, SyncError::Extraction(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = FileLoader.load(&source("pdf"), b"not a pdf").unwrap_err();
        assert!(matches!(err, SyncError::Extraction(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = FileLoader.load(&source("docx"), b"not a zip").unwrap_err();
        assert!(matches!(err, SyncError::Extraction(_)));
    }

    #[test]
    fn markdown_metadata_is_collected() {
        let md = "# Title\n\nSee [docs](http://x).\n\n## Part\n\n```\ncode\n```\n";
        let out = FileLoader.load(&source("md"), md.as_bytes()).unwrap();
        assert_eq!(out.text, md);
        assert_eq!(out.metadata["headers"], json!({"h1": 1, "h2": 1}));
        assert_eq!(out.metadata["link_count"], json!(1));
        assert_eq!(out.metadata["code_blocks"], json!(1));
    }

    #[test]
    fn link_pattern_is_compiled_once() {
        let first = markdown_link().unwrap();
        let second = markdown_link().unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(first.find_iter("[a](b) and [c](d)").count(), 2);
    }

    #[test]
    fn invalid_utf8_falls_back_to_latin1() {
        let out = FileLoader.load(&source("txt"), b"caf\xe9").unwrap();
        assert_eq!(out.text, "café");
        assert_eq!(out.metadata["encoding_fallback"], json!("latin-1"));
    }

    #[test]
    fn docx_paragraphs_headings_and_tables() {
        let document = r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>
<w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Overview</w:t></w:r></w:p>
<w:p><w:r><w:t xml:space="preserve">Hello </w:t></w:r><w:r><w:t>world</w:t></w:r></w:p>
<w:tbl><w:tr><w:tc><w:p><w:r><w:t>a</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>b</w:t></w:r></w:p></w:tc></w:tr></w:tbl>
</w:body></w:document>"#;
        let bytes = zip_of(&[("word/document.xml", document)]);
        let out = FileLoader.load(&source("docx"), &bytes).unwrap();
        assert_eq!(out.text, "# Overview\n\nHello world\n\n[TABLE]\na | b\n[/TABLE]");
        assert_eq!(out.metadata["paragraph_count"], json!(2));
        assert_eq!(out.metadata["table_count"], json!(1));
    }

    #[test]
    fn docx_without_document_xml_fails() {
        let bytes = zip_of(&[("word/other.xml", "<x/>")]);
        assert!(FileLoader.load(&source("docx"), &bytes).is_err());
    }

    #[test]
    fn xlsx_sheets_are_page_separated() {
        let shared = r#"<sst><si><t>name</t></si><si><r><t>ali</t></r><r><t>ce</t></r></si></sst>"#;
        let sheet1 = r#"<worksheet><sheetData><row><c t="s"><v>0</v></c><c><v>42</v></c></row><row><c t="s"><v>1</v></c></row></sheetData></worksheet>"#;
        let sheet2 = r#"<worksheet><sheetData><row><c t="inlineStr"><is><t>second</t></is></c></row></sheetData></worksheet>"#;
        let bytes = zip_of(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet1),
            ("xl/worksheets/sheet2.xml", sheet2),
        ]);
        let out = FileLoader.load(&source("xlsx"), &bytes).unwrap();
        assert_eq!(out.text, format!("name | 42\nalice{}second", PAGE_SEPARATOR));
        assert_eq!(out.metadata["sheet_count"], json!(2));
    }
}
