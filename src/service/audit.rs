//! In-memory audit ring
//!
//! One bounded deque per interface, newest first, process lifetime only.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::store::unix_now_string;

/// Entries kept per interface; older entries are tail-dropped.
pub const AUDIT_CAPACITY: usize = 500;

/// One recorded mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: u64,
    pub action: String,
    pub at: String,
    pub details: serde_json::Value,
}

/// A page of audit entries, newest first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPage {
    pub items: Vec<AuditEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<u64>,
}

/// Process-local audit log keyed by interface name.
#[derive(Debug, Default)]
pub struct AuditLog {
    next_id: AtomicU64,
    rings: Mutex<HashMap<String, VecDeque<AuditEntry>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one entry for `interface`.
    pub fn record(&self, interface: &str, action: &str, details: serde_json::Value) {
        let entry = AuditEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            action: action.to_string(),
            at: unix_now_string(),
            details,
        };

        let mut rings = self.rings.lock().expect("audit lock poisoned");
        let ring = rings.entry(interface.to_string()).or_default();
        ring.push_front(entry);
        ring.truncate(AUDIT_CAPACITY);
    }

    /// Pages newest-first. The cursor is the id of the last entry of the
    /// previous page; paging resumes right after it. `next_cursor` is
    /// only present when a full page was returned.
    pub fn page(&self, interface: &str, limit: usize, cursor: Option<u64>) -> AuditPage {
        let rings = self.rings.lock().expect("audit lock poisoned");
        let Some(ring) = rings.get(interface) else {
            return AuditPage {
                items: Vec::new(),
                next_cursor: None,
            };
        };

        let start = match cursor {
            Some(id) => match ring.iter().position(|e| e.id == id) {
                Some(pos) => pos + 1,
                // Cursor already evicted: restart from the newest entry.
                None => 0,
            },
            None => 0,
        };

        let items: Vec<AuditEntry> = ring.iter().skip(start).take(limit).cloned().collect();
        let next_cursor = if items.len() == limit && limit > 0 {
            items.last().map(|e| e.id)
        } else {
            None
        };

        AuditPage { items, next_cursor }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_n(log: &AuditLog, n: usize) {
        for i in 0..n {
            log.record("wg0", "peer.add", serde_json::json!({ "seq": i }));
        }
    }

    #[test]
    fn newest_first_ordering() {
        let log = AuditLog::new();
        log_n(&log, 3);
        let page = log.page("wg0", 10, None);
        assert_eq!(page.items.len(), 3);
        assert!(page.items[0].id > page.items[1].id);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn capacity_is_tail_dropped() {
        let log = AuditLog::new();
        log_n(&log, AUDIT_CAPACITY + 25);
        let page = log.page("wg0", AUDIT_CAPACITY + 25, None);
        assert_eq!(page.items.len(), AUDIT_CAPACITY);
        // The newest entry survives, the oldest 25 are gone.
        assert_eq!(page.items[0].id, (AUDIT_CAPACITY + 25) as u64);
        assert_eq!(page.items.last().unwrap().id, 26);
    }

    #[test]
    fn cursor_pages_without_overlap() {
        let log = AuditLog::new();
        log_n(&log, 10);

        let first = log.page("wg0", 4, None);
        assert_eq!(first.items.len(), 4);
        let cursor = first.next_cursor.expect("full page sets cursor");

        let second = log.page("wg0", 4, Some(cursor));
        assert_eq!(second.items.len(), 4);
        let first_ids: Vec<u64> = first.items.iter().map(|e| e.id).collect();
        assert!(second.items.iter().all(|e| !first_ids.contains(&e.id)));

        let third = log.page("wg0", 4, second.next_cursor);
        assert_eq!(third.items.len(), 2);
        assert!(third.next_cursor.is_none());
    }

    #[test]
    fn interfaces_are_isolated() {
        let log = AuditLog::new();
        log.record("wg0", "peer.add", serde_json::json!({}));
        log.record("wg1", "peer.remove", serde_json::json!({}));
        assert_eq!(log.page("wg0", 10, None).items.len(), 1);
        assert_eq!(log.page("wg1", 10, None).items.len(), 1);
        assert!(log.page("wg2", 10, None).items.is_empty());
    }
}
