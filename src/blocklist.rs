//! Blocklist (C7): process-wide set of poisoned `ContentId`s.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::warn;

use crate::ids::ContentId;

/// Read-mostly shared set of blocked ids, keyed by the raw id string — an
/// invalid-shape id is stored verbatim, never normalized (spec §4.7).
#[derive(Default)]
pub struct Blocklist {
    reasons: RwLock<HashMap<String, String>>,
}

impl Blocklist {
    pub fn new() -> Self {
        Blocklist::default()
    }

    /// Idempotent: blocking an already-blocked id just replaces the reason.
    pub fn block(&self, id: &ContentId, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(content_id = %id, %reason, "content id blocked");
        self.reasons.write().insert(id.as_str().to_string(), reason);
    }

    /// Same as `block`, but accepts a raw string so malformed ids can be
    /// blocked without first succeeding `ContentId::parse`.
    pub fn block_raw(&self, id: impl Into<String>, reason: impl Into<String>) {
        self.reasons.write().insert(id.into(), reason.into());
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        self.reasons.read().contains_key(id)
    }

    pub fn reason(&self, id: &str) -> Option<String> {
        self.reasons.read().get(id).cloned()
    }

    pub fn unblock(&self, id: &str) {
        self.reasons.write().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_then_is_blocked() {
        let blocklist = Blocklist::new();
        let id = ContentId::new_unchecked("a".repeat(40));
        blocklist.block(&id, "Test");
        assert!(blocklist.is_blocked(id.as_str()));
        assert_eq!(blocklist.reason(id.as_str()).as_deref(), Some("Test"));
    }

    #[test]
    fn invalid_shape_ids_are_stored_verbatim() {
        let blocklist = Blocklist::new();
        blocklist.block_raw("not-a-real-id", "garbage");
        assert!(blocklist.is_blocked("not-a-real-id"));
    }

    #[test]
    fn block_is_idempotent() {
        let blocklist = Blocklist::new();
        let id = ContentId::new_unchecked("b".repeat(40));
        blocklist.block(&id, "first");
        blocklist.block(&id, "second");
        assert_eq!(blocklist.reason(id.as_str()).as_deref(), Some("second"));
    }
}
