//! Word-window chunking with overlap, used by the `chunk_embed` stage.

use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::metadata::MetadataBag;
use crate::model::Chunk;

#[derive(Clone, Copy, Debug)]
pub struct ChunkStrategy {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl ChunkStrategy {
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Self {
        assert!(max_tokens > 0, "max_tokens must be positive");
        let overlap_tokens = overlap_tokens.min(max_tokens.saturating_sub(1));
        Self {
            max_tokens,
            overlap_tokens,
        }
    }
}

/// `chunk_id = SHA1(doc_id ∥ index ∥ text)`, stable across re-ingests so
/// upserts are idempotent.
pub fn chunk_id(doc_id: Uuid, index: usize, text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(doc_id.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Word-tokenizes `text` and produces overlapping windows of `max_tokens`
/// words with `overlap_tokens` words shared between consecutive windows,
/// stopping once the last window reaches end-of-text. Every word position is
/// covered by at least one window.
pub fn chunk_text(text: &str, strategy: ChunkStrategy) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Vec::new();
    }
    let stride = strategy.max_tokens - strategy.overlap_tokens;
    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + strategy.max_tokens).min(words.len());
        windows.push(words[start..end].join(" "));
        if end >= words.len() {
            break;
        }
        start += stride;
    }
    windows
}

#[allow(clippy::too_many_arguments)]
pub fn build_chunks(
    doc_id: Uuid,
    tenant_id: &str,
    text: &str,
    strategy: ChunkStrategy,
    lang: Option<String>,
    section_path: Option<String>,
    is_table: bool,
    base_metadata: &MetadataBag,
) -> Vec<Chunk> {
    chunk_text(text, strategy)
        .into_iter()
        .enumerate()
        .map(|(index, window)| {
            let token_count = window.split_whitespace().count();
            Chunk {
                chunk_id: chunk_id(doc_id, index, &window),
                doc_id,
                tenant_id: tenant_id.to_string(),
                text: window,
                lang: lang.clone(),
                token_count,
                section_path: section_path.clone(),
                page_start: None,
                page_end: None,
                is_table,
                chunk_index: index,
                metadata: base_metadata.clone(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_stable_for_identical_input() {
        let doc_id = Uuid::new_v4();
        assert_eq!(chunk_id(doc_id, 0, "hello"), chunk_id(doc_id, 0, "hello"));
        assert_ne!(chunk_id(doc_id, 0, "hello"), chunk_id(doc_id, 1, "hello"));
    }

    #[test]
    fn windows_cover_every_word_at_least_once() {
        let text = (0..50).map(|i| i.to_string()).collect::<Vec<_>>().join(" ");
        let strategy = ChunkStrategy::new(10, 3);
        let windows = chunk_text(&text, strategy);
        let mut covered = std::collections::HashSet::new();
        for window in &windows {
            for word in window.split_whitespace() {
                covered.insert(word.to_string());
            }
        }
        for i in 0..50 {
            assert!(covered.contains(&i.to_string()));
        }
    }

    #[test]
    fn short_text_produces_single_window() {
        let windows = chunk_text("just a few words", ChunkStrategy::new(256, 32));
        assert_eq!(windows.len(), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_windows_cover_every_word(
            word_count in 1usize..200,
            max_tokens in 1usize..40,
            overlap_tokens in 0usize..40,
        ) {
            let text = (0..word_count).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
            let strategy = ChunkStrategy::new(max_tokens, overlap_tokens);
            let windows = chunk_text(&text, strategy);

            let mut covered = std::collections::HashSet::new();
            for window in &windows {
                for word in window.split_whitespace() {
                    covered.insert(word.to_string());
                }
            }
            for i in 0..word_count {
                proptest::prop_assert!(covered.contains(&format!("w{i}")));
            }
        }
    }
}
