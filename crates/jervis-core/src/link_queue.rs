use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;

use crate::types::LinkQueueEntry;

/// Normalizes a URL for dedup/identity purposes: trim, lowercase, strip a
/// trailing slash, drop query string and fragment.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let lower = without_query.to_lowercase();
    lower.strip_suffix('/').map(str::to_string).unwrap_or(lower)
}

/// Classifies a normalized URL into the source kind its handoff target
/// speaks, by well-known substring patterns.
pub fn classify_url(normalized: &str) -> Option<&'static str> {
    if normalized.contains("/browse/") {
        Some("issue_tracker")
    } else if normalized.contains("/wiki/spaces/") || normalized.contains("/wiki/display/") {
        Some("wiki")
    } else if normalized.contains("/commit/") || normalized.contains("/blob/") {
        Some("git")
    } else {
        None
    }
}

/// In-memory bus between polling handlers (C11). Never persisted: a process
/// restart drops in-flight handoffs, same as the teacher's in-process queues.
pub struct LinkQueue {
    entries: Mutex<HashMap<String, LinkQueueEntry>>,
    max_attempts: u32,
}

/// Outcome of a failed handoff attempt.
pub enum SubmitOutcome {
    /// Accepted (new or already-tracked entry), still below `max_attempts`.
    Accepted,
    /// Rejected: the URL belongs to the submitting source itself.
    SelfHandoff,
    /// Removed after exceeding `max_attempts`; caller should raise a
    /// user-facing task naming `url` and `source_ref`.
    ExhaustedRaiseTask { url: String, source_ref: String },
}

impl LinkQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_attempts,
        }
    }

    /// Idempotent on the normalized URL. Rejects a handoff whose
    /// `source_indexer` matches the target kind its own URL classifies to
    /// (no self-handoff).
    pub fn submit(
        &self,
        url: &str,
        client_id: i64,
        project_id: Option<i64>,
        source_indexer: &str,
        source_ref: &str,
    ) -> SubmitOutcome {
        let normalized = normalize_url(url);
        if classify_url(&normalized) == Some(source_indexer) {
            return SubmitOutcome::SelfHandoff;
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(normalized)
            .or_insert_with(|| LinkQueueEntry {
                url: url.to_string(),
                client_id,
                project_id,
                source_indexer: source_indexer.to_string(),
                source_ref: source_ref.to_string(),
                attempts: 0,
                first_seen_at: Utc::now(),
            });
        SubmitOutcome::Accepted
    }

    /// Records one failed handoff attempt for `url`. Past `max_attempts`,
    /// the entry is removed and the caller is told to raise a user task.
    pub fn record_failed_handoff(&self, url: &str) -> SubmitOutcome {
        let normalized = normalize_url(url);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(&normalized) else {
            warn!(url = %url, "record_failed_handoff for unknown entry");
            return SubmitOutcome::Accepted;
        };
        entry.attempts += 1;
        if entry.attempts >= self.max_attempts {
            let removed = entries.remove(&normalized).expect("entry present");
            SubmitOutcome::ExhaustedRaiseTask {
                url: removed.url,
                source_ref: removed.source_ref,
            }
        } else {
            SubmitOutcome::Accepted
        }
    }

    pub fn pending_for(&self, source_indexer: &str) -> Vec<LinkQueueEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .values()
            .filter(|e| classify_url(&normalize_url(&e.url)) == Some(source_indexer))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_url("HTTPS://Example.com/wiki/spaces/ABC/?x=1#frag");
        let twice = normalize_url(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "https://example.com/wiki/spaces/abc");
    }

    #[test]
    fn submit_is_idempotent_on_normalized_url() {
        let queue = LinkQueue::new(3);
        let url = "https://example.com/browse/ABC-1";
        matches!(queue.submit(url, 1, None, "git", "commit:abc"), SubmitOutcome::Accepted);
        queue.submit(url, 1, None, "git", "commit:abc");
        queue.submit(&format!("{url}/"), 1, None, "git", "commit:abc");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn self_handoff_is_rejected() {
        let queue = LinkQueue::new(3);
        let outcome = queue.submit("https://example.com/browse/ABC-1", 1, None, "issue_tracker", "issue:1");
        assert!(matches!(outcome, SubmitOutcome::SelfHandoff));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn three_failures_raise_a_task_and_remove_the_entry() {
        let queue = LinkQueue::new(3);
        let url = "https://example.com/browse/ABC-2";
        queue.submit(url, 1, None, "git", "commit:def");
        queue.record_failed_handoff(url);
        queue.record_failed_handoff(url);
        let outcome = queue.record_failed_handoff(url);
        assert!(matches!(outcome, SubmitOutcome::ExhaustedRaiseTask { .. }));
        assert_eq!(queue.len(), 0);
    }
}
