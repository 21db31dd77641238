//! Deterministic sliding-window chunker.
//!
//! Splits normalized page text into spans of at most `max_chunk_len`
//! characters, with consecutive spans sharing exactly `overlap_len`
//! characters. Spans are trimmed and dropped when shorter than
//! `min_chunk_len`. Given identical input text and configuration the output
//! is byte-for-byte identical, including chunk IDs — the idempotent
//! re-training path depends on this.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::{DocumentChunk, Page};

/// Split text into character-exact sliding windows.
///
/// Windows advance by `max_len - overlap` characters, so every pair of
/// consecutive windows shares exactly `overlap` characters. All indexing is
/// on char boundaries; multi-byte input never splits a code point.
pub fn split_spans(text: &str, max_len: usize, overlap: usize) -> Vec<&str> {
    if text.is_empty() || max_len == 0 {
        return Vec::new();
    }

    let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    bounds.push(text.len());
    let n_chars = bounds.len() - 1;

    let step = max_len.saturating_sub(overlap).max(1);
    let mut spans = Vec::new();
    let mut start = 0usize;

    loop {
        let end = (start + max_len).min(n_chars);
        spans.push(&text[bounds[start]..bounds[end]]);
        if end == n_chars {
            break;
        }
        start += step;
    }

    spans
}

/// Deterministic chunk ID: SHA-256 over the page URL, ordinal, and text.
fn chunk_id(page_url: &str, ordinal: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(page_url.as_bytes());
    hasher.update([0u8]);
    hasher.update(ordinal.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Chunk all pages of a crawl into ordered [`DocumentChunk`] candidates.
///
/// Ordinals are contiguous across pages in crawl order and count only kept
/// chunks, so they form a total order over the source. `max_total` caps the
/// corpus size; chunking stops once the cap is reached.
pub fn chunk_pages(
    source_id: &str,
    pages: &[Page],
    config: &ChunkingConfig,
    max_total: usize,
) -> Vec<DocumentChunk> {
    let mut chunks = Vec::new();
    let mut ordinal = 0usize;

    'pages: for page in pages {
        for span in split_spans(&page.text, config.max_chunk_len, config.overlap_len) {
            let trimmed = span.trim();
            if trimmed.chars().count() < config.min_chunk_len {
                continue;
            }
            if chunks.len() >= max_total {
                break 'pages;
            }
            chunks.push(DocumentChunk {
                chunk_id: chunk_id(&page.url, ordinal, trimmed),
                source_id: source_id.to_string(),
                page_url: page.url.clone(),
                ordinal,
                text: trimmed.to_string(),
            });
            ordinal += 1;
        }
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: usize, overlap: usize, min: usize) -> ChunkingConfig {
        ChunkingConfig {
            max_chunk_len: max,
            overlap_len: overlap,
            min_chunk_len: min,
        }
    }

    fn page(url: &str, text: &str) -> Page {
        Page {
            url: url.to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_spans_respect_max_len() {
        let text: String = std::iter::repeat("abcdefghij").take(50).collect();
        for span in split_spans(&text, 37, 5) {
            assert!(span.chars().count() <= 37);
        }
    }

    #[test]
    fn test_consecutive_spans_share_exact_overlap() {
        let text: String = ('a'..='z').cycle().take(400).collect();
        let overlap = 7;
        let spans = split_spans(&text, 50, overlap);
        assert!(spans.len() > 2);
        for pair in spans.windows(2) {
            let prev_tail: String = pair[0]
                .chars()
                .skip(pair[0].chars().count() - overlap)
                .collect();
            let next_head: String = pair[1].chars().take(overlap).collect();
            assert_eq!(prev_tail, next_head);
        }
    }

    #[test]
    fn test_spans_cover_all_input() {
        let text: String = ('a'..='z').cycle().take(333).collect();
        let spans = split_spans(&text, 100, 20);
        let covered: usize = spans.iter().map(|s| s.chars().count()).sum::<usize>()
            - (spans.len() - 1) * 20;
        assert_eq!(covered, 333);
    }

    #[test]
    fn test_multibyte_never_splits_codepoint() {
        let text: String = std::iter::repeat('é').take(120).collect::<String>() + "日本語テキスト";
        // Would panic on a non-boundary slice.
        let spans = split_spans(&text, 30, 5);
        assert!(!spans.is_empty());
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(split_spans("", 100, 10).is_empty());
        assert!(chunk_pages("s1", &[page("https://x/", "")], &config(100, 10, 5), 100).is_empty());
    }

    #[test]
    fn test_short_chunks_dropped() {
        let pages = [page("https://x/", "tiny")];
        let chunks = chunk_pages("s1", &pages, &config(100, 10, 50), 100);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_ordinals_contiguous_across_pages() {
        let long: String = ('a'..='z').cycle().take(500).collect();
        let pages = [page("https://x/a", &long), page("https://x/b", &long)];
        let chunks = chunk_pages("s1", &pages, &config(120, 20, 10), 1000);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i);
        }
        assert!(chunks.iter().any(|c| c.page_url.ends_with("/a")));
        assert!(chunks.iter().any(|c| c.page_url.ends_with("/b")));
    }

    #[test]
    fn test_deterministic_ids() {
        let long: String = ('a'..='z').cycle().take(500).collect();
        let pages = [page("https://x/a", &long)];
        let first = chunk_pages("s1", &pages, &config(120, 20, 10), 1000);
        let second = chunk_pages("s2", &pages, &config(120, 20, 10), 1000);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            // IDs depend on page, ordinal, and text — not on the source ID.
            assert_eq!(a.chunk_id, b.chunk_id);
            assert_eq!(a.text, b.text);
        }
    }

    #[test]
    fn test_total_cap_enforced() {
        let long: String = ('a'..='z').cycle().take(5000).collect();
        let pages = [page("https://x/a", &long)];
        let chunks = chunk_pages("s1", &pages, &config(100, 10, 10), 7);
        assert_eq!(chunks.len(), 7);
    }
}
