//! Bounded, self-compacting log of tool invocations and execution records.
//!
//! Every call and execution appends one entry. Oversized payloads are
//! truncated at append time so no single event dominates the budget. After
//! each append, entries that aged out of the per-category recency window are
//! downgraded once to a one-line summary, a hard cap evicts the oldest
//! summarized entries, and a character-based token estimate over a
//! configured ceiling triggers an aggressive cleanup of the oldest
//! unprotected entries. The most recent window per category survives
//! regardless of budget pressure.

use crate::config::HistoryConfig;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::debug;

const COMPACTED_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    ToolCall,
    ExecutionInput,
    ExecutionOutput,
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: u64,
    pub kind: EntryKind,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    pub estimated_tokens: usize,
    pub compacted: bool,
}

struct HistoryState {
    entries: Vec<HistoryEntry>,
    next_id: u64,
}

pub struct HistoryStore {
    config: HistoryConfig,
    inner: Mutex<HistoryState>,
}

impl HistoryStore {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(HistoryState {
                entries: Vec::new(),
                next_id: 1,
            }),
        }
    }

    pub fn record_tool_call(&self, server: &str, tool: &str, arguments: &Value, result: &str) {
        let args = serde_json::to_string(arguments).unwrap_or_default();
        let payload = format!("tool_call {server}/{tool} args={args} -> {result}");
        self.append(EntryKind::ToolCall, payload);
    }

    pub fn record_execution_input(&self, execution_id: &str, runtime: &str, code: &str) {
        let payload = format!("execution {execution_id} [{runtime}] code: {code}");
        self.append(EntryKind::ExecutionInput, payload);
    }

    pub fn record_execution_output(&self, execution_id: &str, success: bool, output: &str) {
        let status = if success { "ok" } else { "failed" };
        let payload = format!("execution {execution_id} {status}: {output}");
        self.append(EntryKind::ExecutionOutput, payload);
    }

    pub fn estimated_tokens(&self) -> usize {
        let state = self.inner.lock().expect("history lock");
        state.entries.iter().map(|e| e.estimated_tokens).sum()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("history lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.inner.lock().expect("history lock").entries.clone()
    }

    fn append(&self, kind: EntryKind, payload: String) {
        let payload = self.inline_summarize(payload);
        let mut state = self.inner.lock().expect("history lock");
        let id = state.next_id;
        state.next_id += 1;
        let estimated_tokens = estimate_tokens(&payload);
        state.entries.push(HistoryEntry {
            id,
            kind,
            payload,
            timestamp: Utc::now(),
            estimated_tokens,
            compacted: false,
        });

        self.compact(&mut state);
        self.enforce_hard_cap(&mut state);
        self.enforce_ceiling(&mut state);
    }

    /// Truncate payloads beyond the inline threshold at append time.
    fn inline_summarize(&self, payload: String) -> String {
        let length = payload.chars().count();
        if length <= self.config.inline_threshold {
            return payload;
        }
        let kept: String = payload.chars().take(self.config.inline_threshold).collect();
        let dropped = length - self.config.inline_threshold;
        format!("{kept}… [truncated {dropped} chars]")
    }

    /// Downgrade entries outside the per-category recency window. Each entry
    /// is downgraded at most once, tracked by the `compacted` flag.
    fn compact(&self, state: &mut HistoryState) {
        let protected = self.protected_ids(state);
        for entry in &mut state.entries {
            if entry.compacted || protected.contains(&entry.id) {
                continue;
            }
            entry.payload = compacted_preview(&entry.payload);
            entry.estimated_tokens = estimate_tokens(&entry.payload);
            entry.compacted = true;
        }
    }

    fn enforce_hard_cap(&self, state: &mut HistoryState) {
        while state.entries.len() > self.config.hard_cap {
            let Some(position) = state.entries.iter().position(|e| e.compacted) else {
                break;
            };
            let evicted = state.entries.remove(position);
            debug!(entry = evicted.id, "evicting summarized history entry over hard cap");
        }
    }

    /// Aggressive cleanup: while over the token ceiling, drop roughly half
    /// of the oldest unprotected entries and re-estimate.
    fn enforce_ceiling(&self, state: &mut HistoryState) {
        loop {
            let total: usize = state.entries.iter().map(|e| e.estimated_tokens).sum();
            if total <= self.config.token_ceiling {
                return;
            }
            let protected = self.protected_ids(state);
            let removable: Vec<u64> = state
                .entries
                .iter()
                .filter(|e| !protected.contains(&e.id))
                .map(|e| e.id)
                .collect();
            if removable.is_empty() {
                return;
            }
            let drop_count = removable.len().div_ceil(2);
            let doomed: HashSet<u64> = removable.into_iter().take(drop_count).collect();
            state.entries.retain(|e| !doomed.contains(&e.id));
            debug!(
                dropped = doomed.len(),
                "history over token ceiling; dropped oldest entries"
            );
        }
    }

    /// Ids of the most recent window per category; these are never
    /// compacted or discarded.
    fn protected_ids(&self, state: &HistoryState) -> HashSet<u64> {
        let mut protected = HashSet::new();
        for (kind, window) in [
            (EntryKind::ToolCall, self.config.recent_tool_calls),
            (EntryKind::ExecutionInput, self.config.recent_executions),
            (EntryKind::ExecutionOutput, self.config.recent_executions),
        ] {
            let mut kept = 0;
            for entry in state.entries.iter().rev() {
                if entry.kind == kind {
                    protected.insert(entry.id);
                    kept += 1;
                    if kept == window {
                        break;
                    }
                }
            }
        }
        protected
    }
}

fn estimate_tokens(payload: &str) -> usize {
    (payload.chars().count() / 4).max(1)
}

fn compacted_preview(payload: &str) -> String {
    let first_line = payload.lines().next().unwrap_or_default();
    let preview: String = first_line.chars().take(COMPACTED_PREVIEW_CHARS).collect();
    format!("{preview} [compacted]")
}
