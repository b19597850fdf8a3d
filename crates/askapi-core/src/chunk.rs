//! Paragraph chunker for auxiliary documents.
//!
//! User-supplied notes are split on blank lines and packed into chunks of
//! at most `max_chars` characters. A paragraph longer than the limit is cut
//! at the last newline or space before the limit.
//!
//! Chunk IDs are derived from the chunk text, not its position, so adding
//! the same document twice produces the same IDs and the second add is a
//! no-op in the vector index.
//!
//! ```rust
//! use askapi_core::chunk::chunk_document;
//!
//! let chunks = chunk_document("notes.md", "Auth uses bearer tokens.\n\nRate limit is 100/min.", 2000);
//! assert_eq!(chunks.len(), 1);
//! assert!(chunks[0].id.starts_with("aux:"));
//! ```

use crate::fingerprint::sha256_hex;

/// Default chunk size for auxiliary documents.
pub const DEFAULT_MAX_CHARS: usize = 2000;

/// One piece of an auxiliary document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxChunk {
    /// `aux:<sha256(text)[..16]>`.
    pub id: String,
    /// Label of the document the chunk came from (file name or `pasted`).
    pub source: String,
    pub index: usize,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Split `text` into chunks of at most `max_chars` bytes on paragraph
/// boundaries. Empty input yields no chunks.
pub fn chunk_document(source: &str, text: &str, max_chars: usize) -> Vec<AuxChunk> {
    let max_chars = max_chars.max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let needed = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if needed > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }
        if para.len() > max_chars {
            pieces.extend(hard_split(para, max_chars).into_iter().map(str::to_string));
            continue;
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }
    if !buf.is_empty() {
        pieces.push(buf);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| {
            let hash = sha256_hex(&text);
            AuxChunk {
                id: format!("aux:{}", &hash[..16]),
                source: source.to_string(),
                index,
                text,
                hash,
            }
        })
        .collect()
}

/// Cut an oversized paragraph at whitespace, never inside a UTF-8 char.
fn hard_split(mut remaining: &str, max_chars: usize) -> Vec<&str> {
    let mut out = Vec::new();
    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            out.push(remaining.trim());
            break;
        }
        let mut limit = max_chars;
        while limit > 0 && !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        if limit == 0 {
            // A single char wider than the limit.
            limit = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        let cut = remaining[..limit]
            .rfind(['\n', ' '])
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            out.push(piece);
        }
        remaining = &remaining[cut..];
    }
    out.retain(|p| !p.is_empty());
    out
}
