//! Deterministic text cleanup applied between extraction and chunking.
//!
//! A [`NormalizationPreset`] selects which stages of the fixed rule order
//! run. The order is part of the chunk identity contract: re-running the
//! same preset over the same raw text must give byte-identical output, and
//! the whitespace stage assumes the line-removal stages already ran.
//!
//! ```text
//! zero-width strip → quote/dash/bullet folding → page numbers
//!   → boilerplate lines → repeated header/footer lines → whitespace collapse
//! ```
//!
//! Fenced code blocks are lifted out before the first stage and restored
//! verbatim after the last.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

const ZERO_WIDTH_CHARS: &[char] = &[
    '\u{200b}', '\u{200c}', '\u{200d}', '\u{feff}', '\u{2060}', '\u{00ad}',
];

const SPECIAL_CHAR_MAP: &[(char, &str)] = &[
    ('\u{201c}', "\""),
    ('\u{201d}', "\""),
    ('\u{2018}', "'"),
    ('\u{2019}', "'"),
    ('\u{00ab}', "\""),
    ('\u{00bb}', "\""),
    ('\u{201e}', "\""),
    ('\u{201a}', "'"),
    ('\u{2013}', "-"),
    ('\u{2014}', "-"),
    ('\u{2015}', "-"),
    ('\u{2212}', "-"),
    ('\u{00a0}', " "),
    ('\u{2003}', " "),
    ('\u{2002}', " "),
    ('\u{2009}', " "),
    ('\u{200a}', " "),
];

const BULLET_CHARS: &[char] = &[
    '\u{2022}', '\u{2023}', '\u{2043}', '\u{204c}', '\u{204d}', '\u{2219}', '\u{25aa}',
    '\u{25ab}', '\u{25cf}', '\u{25cb}', '\u{25e6}', '\u{25a0}', '\u{25a1}', '\u{27a4}',
];

const PAGE_NUMBER_PATTERN: &str = r"^\s*(?:[Pp]age\s+\d+|-\s*\d+\s*-|\[\s*\d+\s*\]|\d+\s+of\s+\d+|\d+\s*/\s*\d+|\(\s*\d+\s*\)|p\.\s*\d+|pg\.\s*\d+)\s*$";

const BOILERPLATE_PATTERNS: &[&str] = &[
    r"(?i)^\s*(?:confidential|proprietary\s*(?:and\s+)?confidential|strictly\s+confidential|for\s+internal\s+use\s+only|internal\s+use\s+only|not\s+for\s+(?:public\s+)?distribution|draft|draft\s+version|working\s+draft|do\s+not\s+distribute|do\s+not\s+copy|do\s+not\s+forward|all\s+rights\s+reserved\.?|disclaimer\s*:?|legal\s+notice\s*:?)\s*$",
    r"(?i)^\s*copyright\s*(?:\x{00a9}|\(c\))?\s*\d{4}.*$",
    r"^\s*\x{00a9}\s*\d{4}.*$",
    r"(?i)^\s*\(c\)\s*\d{4}.*$",
];

const CODE_BLOCK_PATTERN: &str = r"```[\s\S]*?```";

/// Named normalization presets accepted in config and on the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationPreset {
    #[default]
    Default,
    Minimal,
    Aggressive,
    None,
}

impl NormalizationPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizationPreset::Default => "default",
            NormalizationPreset::Minimal => "minimal",
            NormalizationPreset::Aggressive => "aggressive",
            NormalizationPreset::None => "none",
        }
    }

    /// Stage toggles and thresholds for this preset.
    pub fn rules(&self) -> NormalizationRules {
        match self {
            NormalizationPreset::Default => NormalizationRules::default(),
            NormalizationPreset::Minimal => NormalizationRules {
                fold_bullets: false,
                remove_page_numbers: false,
                remove_boilerplate: false,
                remove_headers_footers: false,
                ..NormalizationRules::default()
            },
            NormalizationPreset::Aggressive => NormalizationRules {
                min_line_length: 3,
                ..NormalizationRules::default()
            },
            NormalizationPreset::None => NormalizationRules {
                strip_zero_width: false,
                fold_special_chars: false,
                fold_bullets: false,
                remove_page_numbers: false,
                remove_boilerplate: false,
                remove_headers_footers: false,
                collapse_whitespace: false,
                preserve_code_blocks: false,
                ..NormalizationRules::default()
            },
        }
    }
}

impl FromStr for NormalizationPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(NormalizationPreset::Default),
            "minimal" => Ok(NormalizationPreset::Minimal),
            "aggressive" => Ok(NormalizationPreset::Aggressive),
            "none" => Ok(NormalizationPreset::None),
            other => Err(format!(
                "unknown normalization preset '{}': expected default, minimal, aggressive, or none",
                other
            )),
        }
    }
}

impl std::fmt::Display for NormalizationPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean/threshold view of a preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationRules {
    pub strip_zero_width: bool,
    pub fold_special_chars: bool,
    pub fold_bullets: bool,
    pub remove_page_numbers: bool,
    pub remove_boilerplate: bool,
    pub remove_headers_footers: bool,
    pub collapse_whitespace: bool,
    pub preserve_code_blocks: bool,
    /// Lines shorter than this never count as header/footer candidates.
    pub min_line_length: usize,
    /// Occurrences needed before a line is treated as a header/footer.
    pub header_footer_threshold: usize,
    /// Lines this long or longer are never treated as header/footer.
    pub header_footer_max_length: usize,
}

impl Default for NormalizationRules {
    fn default() -> Self {
        Self {
            strip_zero_width: true,
            fold_special_chars: true,
            fold_bullets: true,
            remove_page_numbers: true,
            remove_boilerplate: true,
            remove_headers_footers: true,
            collapse_whitespace: true,
            preserve_code_blocks: true,
            min_line_length: 0,
            header_footer_threshold: 2,
            header_footer_max_length: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationResult {
    pub normalized_text: String,
    /// Stages that changed the text, in application order.
    pub rules_applied: Vec<String>,
    /// Characters or lines removed per stage.
    pub removed_counts: BTreeMap<String, usize>,
    pub bytes_before: usize,
    pub bytes_after: usize,
}

/// A compiled rule pipeline. Build once per run and share.
pub struct Normalizer {
    rules: NormalizationRules,
    page_number: Regex,
    boilerplate: Vec<Regex>,
    code_block: Regex,
    trailing_ws: Regex,
    multi_space: Regex,
    multi_newline: Regex,
}

impl Normalizer {
    pub fn new(rules: NormalizationRules) -> Result<Self, SyncError> {
        let compile = |p: &str| {
            Regex::new(p).map_err(|e| SyncError::Normalization(format!("bad pattern {}: {}", p, e)))
        };
        Ok(Self {
            page_number: compile(PAGE_NUMBER_PATTERN)?,
            boilerplate: BOILERPLATE_PATTERNS
                .iter()
                .map(|p| compile(*p))
                .collect::<Result<Vec<_>, _>>()?,
            code_block: compile(CODE_BLOCK_PATTERN)?,
            trailing_ws: compile(r"(?m)[ \t]+$")?,
            multi_space: compile(r"[ \t]{2,}")?,
            multi_newline: compile(r"\n{3,}")?,
            rules,
        })
    }

    pub fn from_preset(preset: NormalizationPreset) -> Result<Self, SyncError> {
        Self::new(preset.rules())
    }

    pub fn rules(&self) -> &NormalizationRules {
        &self.rules
    }

    pub fn normalize(&self, raw_text: &str) -> Result<NormalizationResult, SyncError> {
        if raw_text.contains('\0') {
            return Err(SyncError::Normalization(
                "input contains NUL bytes; refusing to treat binary content as text".into(),
            ));
        }

        let rules = &self.rules;
        let mut rules_applied = Vec::new();
        let mut removed_counts = BTreeMap::new();
        let mut record = |name: &str, count: usize| {
            if count > 0 {
                rules_applied.push(name.to_string());
                removed_counts.insert(name.to_string(), count);
            }
        };

        let mut code_blocks = Vec::new();
        let mut text = if rules.preserve_code_blocks {
            let lifted = self.code_block.replace_all(raw_text, |caps: &regex::Captures<'_>| {
                code_blocks.push(caps[0].to_string());
                placeholder(code_blocks.len() - 1)
            });
            lifted.into_owned()
        } else {
            raw_text.to_string()
        };
        record("preserve_code_blocks", code_blocks.len());

        if rules.strip_zero_width {
            let before = text.chars().count();
            text.retain(|c| !ZERO_WIDTH_CHARS.contains(&c));
            record("remove_zero_width", before - text.chars().count());
        }

        if rules.fold_special_chars {
            let (folded, count) = fold_chars(&text, |c| {
                SPECIAL_CHAR_MAP
                    .iter()
                    .find(|(from, _)| *from == c)
                    .map(|(_, to)| *to)
            });
            text = folded;
            record("normalize_special_chars", count);
        }

        if rules.fold_bullets {
            let (folded, count) =
                fold_chars(&text, |c| BULLET_CHARS.contains(&c).then_some("-"));
            text = folded;
            record("normalize_bullets", count);
        }

        if rules.remove_page_numbers {
            let (kept, count) = drop_lines(&text, |line| self.page_number.is_match(line));
            text = kept;
            record("remove_page_numbers", count);
        }

        if rules.remove_boilerplate {
            let (kept, count) =
                drop_lines(&text, |line| self.boilerplate.iter().any(|re| re.is_match(line)));
            text = kept;
            record("remove_boilerplate", count);
        }

        if rules.remove_headers_footers {
            let (kept, count) = self.remove_headers_footers(&text);
            text = kept;
            record("remove_headers_footers", count);
        }

        if rules.collapse_whitespace {
            text = text.replace("\r\n", "\n").replace('\r', "\n");
            text = self.trailing_ws.replace_all(&text, "").into_owned();
            text = self.multi_space.replace_all(&text, " ").into_owned();
            text = self.multi_newline.replace_all(&text, "\n\n").into_owned();
            text = text.trim().to_string();
            rules_applied.push("normalize_whitespace".to_string());
        }

        for (i, block) in code_blocks.iter().enumerate() {
            text = text.replace(&placeholder(i), block);
        }

        Ok(NormalizationResult {
            bytes_before: raw_text.len(),
            bytes_after: text.len(),
            normalized_text: text,
            rules_applied,
            removed_counts,
        })
    }

    /// Drop short lines that repeat across the document (running headers,
    /// footers, per-page banners). Detection is by frequency, not a list.
    fn remove_headers_footers(&self, text: &str) -> (String, usize) {
        let lines: Vec<&str> = text.split('\n').collect();
        if lines.len() < 3 {
            return (text.to_string(), 0);
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for line in &lines {
            let stripped = line.trim();
            if !stripped.is_empty() && stripped.chars().count() >= self.rules.min_line_length {
                *counts.entry(stripped).or_default() += 1;
            }
        }

        let repeated: HashSet<&str> = counts
            .into_iter()
            .filter(|(line, n)| {
                *n >= self.rules.header_footer_threshold
                    && line.chars().count() < self.rules.header_footer_max_length
            })
            .map(|(line, _)| line)
            .collect();

        drop_lines(text, |line| repeated.contains(line.trim()))
    }
}

/// Normalize with a named preset.
pub fn normalize(
    raw_text: &str,
    preset: NormalizationPreset,
) -> Result<NormalizationResult, SyncError> {
    Normalizer::from_preset(preset)?.normalize(raw_text)
}

fn placeholder(i: usize) -> String {
    format!("__CODE_BLOCK_{}__", i)
}

fn fold_chars(text: &str, map: impl Fn(char) -> Option<&'static str>) -> (String, usize) {
    let mut out = String::with_capacity(text.len());
    let mut count = 0;
    for c in text.chars() {
        match map(c) {
            Some(replacement) => {
                out.push_str(replacement);
                count += 1;
            }
            None => out.push(c),
        }
    }
    (out, count)
}

fn drop_lines(text: &str, is_noise: impl Fn(&str) -> bool) -> (String, usize) {
    let mut removed = 0;
    let kept: Vec<&str> = text
        .split('\n')
        .filter(|line| {
            let noise = is_noise(line);
            if noise {
                removed += 1;
            }
            !noise
        })
        .collect();
    (kept.join("\n"), removed)
}
