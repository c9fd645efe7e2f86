//! Paragraph-aware text chunker with token overlap.
//!
//! Splits normalized document text into [`DocumentChunk`]s of at most
//! `target_tokens` tokens. Paragraphs (blank-line separated) are packed into
//! a window until the joined text, separators included, would overflow it;
//! the window is emitted and
//! the next window starts with the trailing `overlap_tokens` of the previous
//! one. Paragraphs longer than the target are hard-split at token
//! boundaries into pieces of `target - overlap` tokens, so the carried
//! overlap still fits in front of each piece.
//!
//! Chunk ids are `{doc_id}::chunk-{index:04}`, so the same normalized text
//! with the same tokenizer and limits always yields the same chunk sequence.
//!
//! Form-feed characters mark page breaks (the extractor inserts them
//! between PDF pages and spreadsheet sheets); Markdown headings set the
//! `section` of the paragraphs that follow.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::SyncError;
use crate::models::{chunk_id, DocumentChunk};
use crate::tokenizer::{Tokenizer, WordTokenizer};

const PAGE_BREAK: char = '\u{000c}';
const PARAGRAPH_SEPARATOR: &str = "\n\n";

pub struct Chunker {
    target_tokens: usize,
    overlap_tokens: usize,
    tokenizer: Arc<dyn Tokenizer>,
}

impl Chunker {
    /// Fails with a chunking configuration error unless `0 <= overlap < target`.
    pub fn new(
        target_tokens: usize,
        overlap_tokens: usize,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<Self, SyncError> {
        if target_tokens == 0 {
            return Err(SyncError::ChunkConfig("target_tokens must be > 0".into()));
        }
        if overlap_tokens >= target_tokens {
            return Err(SyncError::ChunkConfig(format!(
                "overlap_tokens ({}) must be smaller than target_tokens ({})",
                overlap_tokens, target_tokens
            )));
        }
        Ok(Self {
            target_tokens,
            overlap_tokens,
            tokenizer,
        })
    }

    pub fn with_word_tokenizer(target_tokens: usize, overlap_tokens: usize) -> Result<Self, SyncError> {
        Self::new(target_tokens, overlap_tokens, Arc::new(WordTokenizer))
    }

    pub fn target_tokens(&self) -> usize {
        self.target_tokens
    }

    pub fn overlap_tokens(&self) -> usize {
        self.overlap_tokens
    }

    pub fn tokenizer_name(&self) -> &str {
        self.tokenizer.name()
    }

    /// Chunk one document's normalized text. The iterator is consumed once.
    pub fn chunk(
        &self,
        doc_id: &str,
        content_hash: &str,
        timestamp: DateTime<Utc>,
        normalized_text: &str,
    ) -> ChunkIter {
        let units = self.units(normalized_text);
        ChunkIter {
            doc_id: doc_id.to_string(),
            content_hash: content_hash.to_string(),
            timestamp,
            target: self.target_tokens,
            overlap: self.overlap_tokens,
            tokenizer: Arc::clone(&self.tokenizer),
            units,
            pos: 0,
            window: Vec::new(),
            carried_only: false,
            next_index: 0,
        }
    }

    /// Paragraphs as packing units, with oversized ones hard-split.
    fn units(&self, text: &str) -> Vec<Unit> {
        let paged = text.contains(PAGE_BREAK);
        let mut units = Vec::new();
        for para in paragraphs(text) {
            let tokens = self.tokenizer.count(&para.text);
            if tokens == 0 {
                continue;
            }
            let page = paged.then_some(para.page);
            if tokens <= self.target_tokens {
                units.push(Unit {
                    text: para.text,
                    tokens,
                    paragraph: para.index,
                    page,
                    section: para.section,
                });
                continue;
            }

            let piece = self.target_tokens - self.overlap_tokens;
            let spans = self.tokenizer.spans(&para.text);
            for group in spans.chunks(piece) {
                let (Some(first), Some(last)) = (group.first(), group.last()) else {
                    continue;
                };
                let text = para.text[first.start..last.end].to_string();
                units.push(Unit {
                    tokens: self.tokenizer.count(&text),
                    text,
                    paragraph: para.index,
                    page,
                    section: para.section.clone(),
                });
            }
        }
        units
    }
}

#[derive(Debug, Clone)]
struct Unit {
    text: String,
    tokens: usize,
    paragraph: usize,
    page: Option<u32>,
    section: Option<String>,
}

struct Paragraph {
    index: usize,
    text: String,
    page: u32,
    section: Option<String>,
}

fn paragraphs(text: &str) -> Vec<Paragraph> {
    let mut out = Vec::new();
    let mut lines: Vec<&str> = Vec::new();
    let mut page: u32 = 1;
    let mut start_page: u32 = 1;
    let mut section: Option<String> = None;

    for line in text.split('\n') {
        page += line.matches(PAGE_BREAK).count() as u32;
        if line.trim().is_empty() {
            push_paragraph(&mut out, &mut lines, start_page, &mut section);
            continue;
        }
        if lines.is_empty() {
            start_page = page;
        }
        lines.push(line);
    }
    push_paragraph(&mut out, &mut lines, start_page, &mut section);
    out
}

fn push_paragraph(
    out: &mut Vec<Paragraph>,
    lines: &mut Vec<&str>,
    page: u32,
    section: &mut Option<String>,
) {
    if lines.is_empty() {
        return;
    }
    let joined = lines.join("\n").replace(PAGE_BREAK, "");
    lines.clear();
    let text = joined.trim();
    if text.is_empty() {
        return;
    }
    if let Some(heading) = markdown_heading(text) {
        *section = Some(heading);
    }
    out.push(Paragraph {
        index: out.len(),
        text: text.to_string(),
        page,
        section: section.clone(),
    });
}

fn markdown_heading(paragraph: &str) -> Option<String> {
    let first_line = paragraph.lines().next()?;
    let rest = first_line.trim_start_matches('#');
    if rest.len() == first_line.len() || !rest.starts_with(' ') {
        return None;
    }
    let heading = rest.trim();
    (!heading.is_empty()).then(|| heading.to_string())
}

/// Lazily yields a document's chunks in order.
pub struct ChunkIter {
    doc_id: String,
    content_hash: String,
    timestamp: DateTime<Utc>,
    target: usize,
    overlap: usize,
    tokenizer: Arc<dyn Tokenizer>,
    units: Vec<Unit>,
    pos: usize,
    window: Vec<Unit>,
    /// Window holds only overlap carried from the previous chunk.
    carried_only: bool,
    next_index: u32,
}

impl ChunkIter {
    fn emit(&mut self) -> DocumentChunk {
        let text = join(&self.window, None);
        let index = self.next_index;
        self.next_index += 1;

        let first = &self.window[0];
        let last = &self.window[self.window.len() - 1];
        DocumentChunk {
            chunk_id: chunk_id(&self.doc_id, index),
            chunk_index: index,
            doc_id: self.doc_id.clone(),
            token_count: self.tokenizer.count(&text),
            text,
            paragraph_start: first.paragraph,
            paragraph_end: last.paragraph,
            page: first.page,
            section: first.section.clone(),
            content_hash: self.content_hash.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Trailing `budget` tokens of the current window.
    fn tail(&self, budget: usize) -> Vec<Unit> {
        let mut remaining = budget;
        let mut carried = Vec::new();
        for unit in self.window.iter().rev() {
            if remaining == 0 {
                break;
            }
            if unit.tokens <= remaining {
                remaining -= unit.tokens;
                carried.push(unit.clone());
                continue;
            }
            let spans = self.tokenizer.spans(&unit.text);
            let Some(span) = spans.get(spans.len().saturating_sub(remaining)) else {
                break;
            };
            let text = unit.text[span.start..].trim_start().to_string();
            if text.is_empty() {
                break;
            }
            carried.push(Unit {
                tokens: self.tokenizer.count(&text),
                text,
                ..unit.clone()
            });
            remaining = 0;
        }
        carried.reverse();
        carried
    }

    fn reset_window(&mut self, window: Vec<Unit>) {
        self.carried_only = !window.is_empty();
        self.window = window;
    }

    /// Tokens in `window` joined with `next`, separators included.
    fn cost_with(&self, window: &[Unit], next: &Unit) -> usize {
        self.tokenizer.count(&join(window, Some(next)))
    }

    /// Trailing overlap of the carried window, shrunk until `next` fits beside it.
    fn shrink_carried(&self, next: &Unit) -> Vec<Unit> {
        let mut room = self.target.saturating_sub(next.tokens);
        let mut carried = self.tail(room);
        while !carried.is_empty() && self.cost_with(&carried, next) > self.target {
            room = room.saturating_sub(1);
            carried = self.tail(room);
        }
        carried
    }
}

fn join(window: &[Unit], next: Option<&Unit>) -> String {
    window
        .iter()
        .chain(next)
        .map(|u| u.text.as_str())
        .collect::<Vec<_>>()
        .join(PARAGRAPH_SEPARATOR)
}

impl Iterator for ChunkIter {
    type Item = DocumentChunk;

    fn next(&mut self) -> Option<DocumentChunk> {
        loop {
            let Some(unit) = self.units.get(self.pos).cloned() else {
                if self.window.is_empty() || self.carried_only {
                    self.window.clear();
                    return None;
                }
                let chunk = self.emit();
                self.window.clear();
                return Some(chunk);
            };

            if !self.window.is_empty() && self.cost_with(&self.window, &unit) > self.target {
                if self.carried_only {
                    let shrunk = self.shrink_carried(&unit);
                    self.reset_window(shrunk);
                } else {
                    let chunk = self.emit();
                    let carried = self.tail(self.overlap);
                    self.reset_window(carried);
                    return Some(chunk);
                }
            }

            self.window.push(unit);
            self.carried_only = false;
            self.pos += 1;
        }
    }
}
