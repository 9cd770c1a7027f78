//! Chunking strategy selector.
//!
//! Turns normalized markdown into ordered [`PassageDraft`]s using one of a
//! closed set of strategies. Sizes are byte budgets for the character-based
//! strategies and whitespace-token counts for the token-window strategy.
//!
//! A strategy that fails mid-split falls back to the default
//! recursive-character strategy with the same size/overlap; the failure is
//! logged and never surfaced to the ingestion caller. Empty input yields an
//! empty sequence, which the pipeline reports as "no extractable content".

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::PassageDraft;

/// The closed set of splitting strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    RecursiveCharacter,
    Character,
    Token,
    MarkdownHeader,
    Sentence,
    SentenceWindow,
}

impl ChunkingStrategy {
    pub const ALL: [ChunkingStrategy; 6] = [
        ChunkingStrategy::RecursiveCharacter,
        ChunkingStrategy::Character,
        ChunkingStrategy::Token,
        ChunkingStrategy::MarkdownHeader,
        ChunkingStrategy::Sentence,
        ChunkingStrategy::SentenceWindow,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "recursive_character" => Some(Self::RecursiveCharacter),
            "character" => Some(Self::Character),
            "token" => Some(Self::Token),
            "markdown_header" => Some(Self::MarkdownHeader),
            "sentence" => Some(Self::Sentence),
            "sentence_window" => Some(Self::SentenceWindow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecursiveCharacter => "recursive_character",
            Self::Character => "character",
            Self::Token => "token",
            Self::MarkdownHeader => "markdown_header",
            Self::Sentence => "sentence",
            Self::SentenceWindow => "sentence_window",
        }
    }
}

impl std::fmt::Display for ChunkingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::RecursiveCharacter
    }
}

/// Split markdown into ordered passage drafts with the given strategy.
pub fn split(
    text: &str,
    strategy: ChunkingStrategy,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<PassageDraft> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let result = match strategy {
        ChunkingStrategy::RecursiveCharacter => {
            Ok(recursive_character(text, chunk_size, chunk_overlap))
        }
        ChunkingStrategy::Character => Ok(character(text, chunk_size, chunk_overlap)),
        ChunkingStrategy::Token => Ok(token_window(text, chunk_size, chunk_overlap)),
        ChunkingStrategy::MarkdownHeader => markdown_header(text),
        ChunkingStrategy::Sentence => Ok(sentence(text, chunk_size)),
        ChunkingStrategy::SentenceWindow => Ok(sentence_window(text, chunk_size, chunk_overlap)),
    };

    let drafts = match result {
        Ok(drafts) => drafts,
        Err(e) => {
            warn!(
                "chunking strategy {} failed ({}); falling back to recursive_character",
                strategy, e
            );
            recursive_character(text, chunk_size, chunk_overlap)
        }
    };

    drafts
        .into_iter()
        .filter(|d| !d.text.trim().is_empty())
        .collect()
}

fn draft(text: String) -> PassageDraft {
    PassageDraft {
        text,
        section_heading: None,
        page_number: None,
    }
}

// ============ Token window ============

/// Sliding window over whitespace tokens. Each window of `chunk_size`
/// tokens is emitted joined by single spaces; the next window starts
/// `chunk_size - chunk_overlap` tokens later.
///
/// When `chunk_overlap >= chunk_size` the computed advance would stall, so
/// the start is forced forward by one token instead of re-emitting an
/// identical window.
fn token_window(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<PassageDraft> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let end = (start + chunk_size).min(tokens.len());
        chunks.push(draft(tokens[start..end].join(" ")));
        if end == tokens.len() {
            break;
        }
        let next = end.saturating_sub(chunk_overlap);
        start = if next > start { next } else { start + 1 };
    }

    chunks
}

// ============ Character-based strategies ============

/// Separator hierarchy for the recursive splitter: paragraph, line, word,
/// then a hard character split as the last resort.
const SEPARATORS: [&str; 3] = ["\n\n", "\n", " "];

fn recursive_character(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<PassageDraft> {
    let pieces = split_by_separators(text, chunk_size, &SEPARATORS);
    merge_pieces(&pieces, chunk_size, chunk_overlap, " ")
        .into_iter()
        .map(draft)
        .collect()
}

/// Split on `\n\n` only, then greedily merge paragraphs to the size budget.
fn character(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<PassageDraft> {
    let pieces: Vec<String> = text
        .split("\n\n")
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect();

    merge_pieces(&pieces, chunk_size, chunk_overlap, "\n\n")
        .into_iter()
        .map(draft)
        .collect()
}

/// Recursively split `text` into pieces no larger than `chunk_size` bytes,
/// preferring the earliest separator in the hierarchy.
fn split_by_separators(text: &str, chunk_size: usize, separators: &[&str]) -> Vec<String> {
    if text.len() <= chunk_size {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        return vec![trimmed.to_string()];
    }

    let Some((sep, rest)) = separators.split_first() else {
        // No separators left: hard split at char boundaries.
        return hard_split(text, chunk_size);
    };

    let mut out = Vec::new();
    for piece in text.split(sep) {
        let trimmed = piece.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.len() <= chunk_size {
            out.push(trimmed.to_string());
        } else {
            out.extend(split_by_separators(trimmed, chunk_size, rest));
        }
    }
    out
}

fn hard_split(text: &str, chunk_size: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > chunk_size && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Greedily merge adjacent pieces into chunks within `chunk_size`, carrying
/// the tail pieces (up to `chunk_overlap` bytes) into the next chunk.
fn merge_pieces(
    pieces: &[String],
    chunk_size: usize,
    chunk_overlap: usize,
    sep: &str,
) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for piece in pieces {
        let plen = piece.len();
        let sep_len = if current.is_empty() { 0 } else { sep.len() };

        if total + sep_len + plen > chunk_size && !current.is_empty() {
            chunks.push(
                current
                    .iter()
                    .copied()
                    .collect::<Vec<_>>()
                    .join(sep),
            );

            // Shrink the window from the front until it fits in the overlap
            // budget and leaves room for the incoming piece.
            while !current.is_empty()
                && (total > chunk_overlap || total + sep.len() + plen > chunk_size)
            {
                let removed = current.pop_front().unwrap();
                let extra = if current.is_empty() { 0 } else { sep.len() };
                total = total.saturating_sub(removed.len() + extra);
            }
        }

        if !current.is_empty() {
            total += sep.len();
        }
        current.push_back(piece);
        total += plen;
    }

    if !current.is_empty() {
        chunks.push(current.iter().copied().collect::<Vec<_>>().join(sep));
    }

    chunks
}

// ============ Markdown header strategy ============

/// Split on markdown headings, tagging each content block with the deepest
/// heading active over its region. Heading lines themselves are not part of
/// the passage text; setting a heading at level L clears all deeper levels.
fn markdown_header(text: &str) -> anyhow::Result<Vec<PassageDraft>> {
    let mut headings: [Option<String>; 6] = Default::default();
    let mut out = Vec::new();
    let mut buf = String::new();

    fn flush(buf: &mut String, headings: &[Option<String>; 6], out: &mut Vec<PassageDraft>) {
        let content = buf.trim();
        if !content.is_empty() {
            let deepest = headings.iter().rev().find_map(|h| h.clone());
            out.push(PassageDraft {
                text: content.to_string(),
                section_heading: deepest,
                page_number: None,
            });
        }
        buf.clear();
    }

    for line in text.lines() {
        if let Some((level, title)) = parse_heading(line) {
            flush(&mut buf, &headings, &mut out);
            headings[level - 1] = Some(title);
            for deeper in headings.iter_mut().skip(level) {
                *deeper = None;
            }
        } else {
            buf.push_str(line);
            buf.push('\n');
        }
    }
    flush(&mut buf, &headings, &mut out);

    Ok(out)
}

/// Recognize an ATX heading: 1–6 `#` characters followed by a space.
fn parse_heading(line: &str) -> Option<(usize, String)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.starts_with(' ') && !rest.is_empty() {
        return None;
    }
    Some((level, rest.trim().to_string()))
}

// ============ Sentence strategies ============

/// Split text into sentences at `.`, `!`, `?` boundaries followed by
/// whitespace. Newlines inside a sentence are preserved.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            if chars.peek().map(|c| c.is_whitespace()).unwrap_or(true) {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                current.clear();
            }
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }

    sentences
}

/// Sentence-boundary splitting with a greedy merge to the size budget and
/// no overlap between chunks.
fn sentence(text: &str, chunk_size: usize) -> Vec<PassageDraft> {
    let sentences = split_sentences(text);
    merge_pieces(&sentences, chunk_size, 0, " ")
        .into_iter()
        .map(draft)
        .collect()
}

/// Like [`sentence`], but trailing sentences up to the overlap budget are
/// carried into the next chunk.
fn sentence_window(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<PassageDraft> {
    let sentences = split_sentences(text);
    merge_pieces(&sentences, chunk_size, chunk_overlap, " ")
        .into_iter()
        .map(draft)
        .collect()
}
