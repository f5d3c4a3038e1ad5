//! Paragraph-boundary text chunker.
//!
//! Splits file text into [`TextChunk`]s that respect a configurable
//! `max_tokens` limit. Splitting occurs on paragraph boundaries (`\n\n`)
//! to preserve semantic coherence within each chunk; a paragraph longer than
//! the limit is hard-split on the nearest newline or space.
//!
//! Every chunk records the byte offset where it starts in the source text
//! and a SHA-256 of its text. Chunk ids in the index are `"{path}#{index}"`.

use sha2::{Digest, Sha256};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    /// Byte offset of the chunk's first character in the source text.
    pub offset: usize,
    pub text: String,
    pub hash: String,
}

/// External index id for chunk `index` of `path`.
pub fn chunk_id(path: &str, index: usize) -> String {
    format!("{}#{}", path, index)
}

/// Split text into chunks on paragraph boundaries, respecting max_tokens.
/// Returns chunks with contiguous indices starting at 0. Whitespace-only
/// text yields no chunks.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<TextChunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);

    let mut chunks = Vec::new();
    let mut current_buf = String::new();
    let mut current_offset = 0usize;
    let mut para_start = 0usize;

    for para in text.split("\n\n") {
        let start = para_start;
        para_start += para.len() + 2;

        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        let trimmed_offset = start + (para.len() - para.trim_start().len());

        // If adding this paragraph would exceed max, flush current buffer
        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len() // +2 for \n\n separator
        };

        if would_be > max_chars && !current_buf.is_empty() {
            push_chunk(&mut chunks, current_offset, &current_buf);
            current_buf.clear();
        }

        if trimmed.len() > max_chars {
            // Hard split at max_chars boundaries
            let mut remaining = trimmed;
            let mut at = trimmed_offset;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, remaining.len().min(max_chars));
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = &remaining[..actual_split];
                let lead = piece.len() - piece.trim_start().len();
                if !piece.trim().is_empty() {
                    push_chunk(&mut chunks, at + lead, piece.trim());
                }
                at += actual_split;
                remaining = &remaining[actual_split..];
            }
        } else {
            if current_buf.is_empty() {
                current_offset = trimmed_offset;
            } else {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    // Flush remaining
    if !current_buf.is_empty() {
        push_chunk(&mut chunks, current_offset, &current_buf);
    }

    chunks
}

/// Largest char boundary `<= at`, never zero for non-empty input.
fn floor_char_boundary(s: &str, at: usize) -> usize {
    let mut i = at.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    if i == 0 {
        s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
    } else {
        i
    }
}

fn push_chunk(chunks: &mut Vec<TextChunk>, offset: usize, text: &str) {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    chunks.push(TextChunk {
        index: chunks.len(),
        offset,
        text: text.to_string(),
        hash,
    });
}

/// Share of alphanumeric characters in `text`, in `[0, 1]`.
pub fn density(text: &str) -> f64 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let alnum = text.chars().filter(|c| c.is_alphanumeric()).count();
    alnum as f64 / total as f64
}

/// Mean density over a file's chunks; 0 for a file with no chunks.
pub fn file_score(chunks: &[TextChunk]) -> f64 {
    if chunks.is_empty() {
        return 0.0;
    }
    chunks.iter().map(|c| density(&c.text)).sum::<f64>() / chunks.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("", 700).is_empty());
        assert!(chunk_text("  \n\n \n", 700).is_empty());
    }

    #[test]
    fn test_multiple_paragraphs_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_text(text, 700);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph."));
        assert!(chunks[0].text.contains("Third paragraph."));
    }

    #[test]
    fn test_offsets_point_into_source() {
        // max_tokens=5 => max_chars=20
        let text = "  This is paragraph one.\n\nThis is paragraph two.\n\n\n\nThird para.";
        let chunks = chunk_text(text, 5);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(
                text[c.offset..].starts_with(&c.text[..c.text.len().min(8)]),
                "chunk {} at {} does not match source",
                c.index,
                c.offset
            );
        }
        assert_eq!(chunks[0].offset, 2);
    }

    #[test]
    fn test_long_paragraph_hard_split() {
        let text = "word ".repeat(40);
        let chunks = chunk_text(&text, 5);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.text.len() <= 20));
        for c in &chunks {
            assert!(text[c.offset..].starts_with(&c.text));
        }
    }

    #[test]
    fn test_multibyte_hard_split_does_not_panic() {
        let text = "é".repeat(50);
        let chunks = chunk_text(&text, 1);
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn test_chunk_indices_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text(&text, 10);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i, "Index mismatch at position {}", i);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        assert_eq!(chunk_text(text, 5), chunk_text(text, 5));
    }

    #[test]
    fn test_density_and_score() {
        assert_eq!(density(""), 0.0);
        assert_eq!(density("abcd"), 1.0);
        assert_eq!(density("ab  "), 0.5);

        let chunks = chunk_text("abcd\n\n----", 1);
        assert_eq!(chunks.len(), 2);
        assert!((file_score(&chunks) - 0.5).abs() < 1e-12);
        assert_eq!(file_score(&[]), 0.0);
    }

    #[test]
    fn test_chunk_id_format() {
        assert_eq!(chunk_id("/docs/a.md", 3), "/docs/a.md#3");
    }
}
