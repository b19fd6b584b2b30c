//! Connection ID generation.
//!
//! Generates identifiers for accepted connections so proxy errors can be
//! attributed to a specific connection in the logs.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Counter for short connection IDs.
static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Connection ID that can be included in tracing spans.
#[derive(Clone, Debug)]
pub struct ConnId(String);

impl ConnId {
    /// Create a new UUID-based connection ID.
    ///
    /// Globally unique, suitable when logs from several processes are merged.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a counter-based connection ID.
    ///
    /// Faster than UUID but only unique within a single process.
    /// Format: `conn-{counter}` zero-padded to 12 hex digits.
    pub fn short() -> Self {
        let count = CONN_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn-{count:012x}"))
    }

    /// Get the connection ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ConnId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uuid_ids_unique() {
        let id1 = ConnId::new();
        let id2 = ConnId::new();
        assert_ne!(id1.as_str(), id2.as_str());
        assert_eq!(id1.as_str().len(), 36);
    }

    #[test]
    fn test_short_ids_unique() {
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            let id = ConnId::short();
            assert!(id.as_str().starts_with("conn-"));
            assert!(ids.insert(id.as_str().to_string()));
        }
    }
}
