//! Per-thread conversational memory: a bounded recent-turn deque, a rolling
//! long summary, and Jaccard-overlap recall.
//!
//! Sharded per thread_id behind a per-thread `parking_lot::Mutex`; a global
//! map is guarded only to insert a new thread_id, matching the teacher's
//! event-bus sink pattern of holding a lock only for registration, not for
//! steady-state reads.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::model::MemoryTurn;

#[derive(Debug)]
struct ThreadMemory {
    turns: VecDeque<MemoryTurn>,
    long_summary: String,
    turn_counter: u64,
}

impl ThreadMemory {
    fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity),
            long_summary: String::new(),
            turn_counter: 0,
        }
    }
}

pub struct MemoryStore {
    capacity: usize,
    threads: RwLock<FxHashMap<String, Arc<Mutex<ThreadMemory>>>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            threads: RwLock::new(FxHashMap::default()),
        }
    }

    fn thread(&self, thread_id: &str) -> Arc<Mutex<ThreadMemory>> {
        if let Some(existing) = self.threads.read().get(thread_id) {
            return existing.clone();
        }
        let mut threads = self.threads.write();
        threads
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ThreadMemory::new(self.capacity))))
            .clone()
    }

    pub fn append_turn(&self, thread_id: &str, user: impl Into<String>, assistant: impl Into<String>) {
        let thread = self.thread(thread_id);
        let mut state = thread.lock();
        if state.turns.len() == self.capacity {
            state.turns.pop_front();
        }
        state.turns.push_back(MemoryTurn::new(user, assistant));
        state.turn_counter += 1;
    }

    /// Walks turns newest-first, accumulating `User: .. / Assistant: ..`
    /// blocks until the next block would exceed `token_cap`; always returns
    /// at least one block, unless `token_cap` is zero. Result is
    /// chronological, blank-line separated.
    pub fn get_recent_window(&self, thread_id: &str, token_cap: usize) -> String {
        if token_cap == 0 {
            return String::new();
        }
        let thread = self.thread(thread_id);
        let state = thread.lock();
        let mut blocks = Vec::new();
        let mut tokens_used = 0usize;
        for turn in state.turns.iter().rev() {
            let block = format!("User: {}\nAssistant: {}", turn.user, turn.assistant);
            let block_tokens = crate::model::approx_token_count(&block);
            if !blocks.is_empty() && tokens_used + block_tokens > token_cap {
                break;
            }
            tokens_used += block_tokens;
            blocks.push(block);
        }
        blocks.reverse();
        blocks.join("\n\n")
    }

    pub fn retrieve_long_summary(&self, thread_id: &str) -> String {
        let thread = self.thread(thread_id);
        thread.lock().long_summary.clone()
    }

    /// Per-turn Jaccard overlap on lowercased word tokens of `user ∥
    /// assistant` against the query's tokens; top-k with score > 0.
    pub fn vector_recall(&self, thread_id: &str, query: &str, k: usize) -> Vec<(MemoryTurn, f32)> {
        let thread = self.thread(thread_id);
        let state = thread.lock();
        let query_tokens = tokenize(query);
        let mut scored: Vec<(MemoryTurn, f32)> = state
            .turns
            .iter()
            .map(|turn| {
                let combined = format!("{} {}", turn.user, turn.assistant);
                let score = jaccard(&query_tokens, &tokenize(&combined));
                (turn.clone(), score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        scored.truncate(k);
        scored
    }

    /// When `counter mod every == 0`, recomputes a truncated (≤ `cap` chars)
    /// concatenation of retained turns, newest-aligned. Returns whether an
    /// update happened.
    pub fn maybe_update_long_summary(&self, thread_id: &str, every: u64, cap: usize) -> bool {
        let thread = self.thread(thread_id);
        let mut state = thread.lock();
        if every == 0 || state.turn_counter % every != 0 {
            return false;
        }
        let mut summary = String::new();
        for turn in state.turns.iter().rev() {
            let block = format!("User: {}\nAssistant: {}\n", turn.user, turn.assistant);
            if summary.len() + block.len() > cap {
                break;
            }
            summary.insert_str(0, &block);
        }
        state.long_summary = summary;
        true
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|t| t.to_string())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_window_always_returns_at_least_one_block() {
        let store = MemoryStore::new(40);
        store.append_turn("t1", "a very long user message ".repeat(50), "reply");
        let window = store.get_recent_window("t1", 1);
        assert!(!window.is_empty());
    }

    #[test]
    fn recent_window_is_chronological() {
        let store = MemoryStore::new(40);
        store.append_turn("t1", "first", "one");
        store.append_turn("t1", "second", "two");
        let window = store.get_recent_window("t1", 1000);
        assert!(window.find("first").unwrap() < window.find("second").unwrap());
    }

    #[test]
    fn capacity_evicts_oldest_turn() {
        let store = MemoryStore::new(2);
        store.append_turn("t1", "one", "a");
        store.append_turn("t1", "two", "b");
        store.append_turn("t1", "three", "c");
        let window = store.get_recent_window("t1", 10_000);
        assert!(!window.contains("one"));
        assert!(window.contains("three"));
    }

    #[test]
    fn vector_recall_ranks_by_jaccard_overlap() {
        let store = MemoryStore::new(40);
        store.append_turn("t1", "revenue grew in 2024", "yes it did");
        store.append_turn("t1", "weather is nice today", "indeed");
        let recalls = store.vector_recall("t1", "revenue 2024", 5);
        assert_eq!(recalls[0].0.user, "revenue grew in 2024");
    }

    #[test]
    fn summary_updates_only_on_cadence() {
        let store = MemoryStore::new(40);
        store.append_turn("t1", "one", "a");
        assert!(!store.maybe_update_long_summary("t1", 2, 1000));
        store.append_turn("t1", "two", "b");
        assert!(store.maybe_update_long_summary("t1", 2, 1000));
        assert!(!store.retrieve_long_summary("t1").is_empty());
    }
}
