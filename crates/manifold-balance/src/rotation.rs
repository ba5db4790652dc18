//! Round-robin rotation inside a multi-key binding group
//!
//! A provider declared with K credentials expands to K bindings sharing
//! endpoint and model. In-group selection is strict round-robin over the
//! keys that are not individually blacklisted; when every key is dark
//! the group as a whole is ineligible.

use std::sync::atomic::{AtomicUsize, Ordering};

/// One multi-key binding group
#[derive(Debug)]
pub struct KeyGroup {
    /// Binding ids of the member keys, in declaration order
    members: Vec<String>,
    cursor: AtomicUsize,
}

impl KeyGroup {
    /// Create a group over the given member binding ids
    pub fn new(members: Vec<String>) -> Self {
        Self {
            members,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Member binding ids
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Pick the next eligible member, strict round-robin
    ///
    /// Scans at most one full revolution; returns `None` when every key
    /// is filtered out.
    pub fn next<F>(&self, eligible: F) -> Option<&str>
    where
        F: Fn(&str) -> bool,
    {
        if self.members.is_empty() {
            return None;
        }

        let len = self.members.len();
        for _ in 0..len {
            let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
            let candidate = &self.members[slot];
            if eligible(candidate) {
                return Some(candidate);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn group() -> KeyGroup {
        KeyGroup::new(vec![
            "p-key0".to_owned(),
            "p-key1".to_owned(),
            "p-key2".to_owned(),
            "p-key3".to_owned(),
        ])
    }

    #[test]
    fn rotation_is_fair_within_an_epoch() {
        let group = group();
        let mut counts: HashMap<String, u32> = HashMap::new();

        for _ in 0..20 {
            let key = group.next(|_| true).unwrap();
            *counts.entry(key.to_owned()).or_default() += 1;
        }

        // 20 selections over 4 keys: exactly 5 each
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == 5));
    }

    #[test]
    fn dark_key_is_skipped() {
        let group = group();
        let mut counts: HashMap<String, u32> = HashMap::new();

        for _ in 0..20 {
            let key = group.next(|k| k != "p-key0").unwrap();
            *counts.entry(key.to_owned()).or_default() += 1;
        }

        assert_eq!(counts.get("p-key0"), None);
        let (min, max) = counts
            .values()
            .fold((u32::MAX, 0), |(lo, hi), &c| (lo.min(c), hi.max(c)));
        assert!(max - min <= 1, "rotation stayed fair without key 0: {counts:?}");
    }

    #[test]
    fn all_dark_yields_none() {
        let group = group();
        assert!(group.next(|_| false).is_none());
    }
}
