use dashmap::DashMap;
use std::collections::HashSet;

/// Reverse index from reporting group to the currently-queued job keys
/// carrying that label, plus the key-to-group direction.
///
/// Rep groups are not identities: a resubmitted job may move to a new group,
/// and `set` handles the move. Lookups for completed jobs go through the
/// persistence façade instead. Buckets lock independently, so readers of one
/// group never contend with writers of another.
#[derive(Debug, Default)]
pub struct RepGroupIndex {
    groups: DashMap<String, HashSet<String>>,
    group_of: DashMap<String, String>,
}

impl RepGroupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label a key, moving it out of any previous group.
    pub fn set(&self, key: &str, rep_group: &str) {
        if let Some(previous) = self.group_of.insert(key.to_string(), rep_group.to_string()) {
            if previous != rep_group {
                if let Some(mut members) = self.groups.get_mut(&previous) {
                    members.remove(key);
                }
            }
        }
        self.groups
            .entry(rep_group.to_string())
            .or_default()
            .insert(key.to_string());
    }

    /// Forget a key entirely (job removed or archived).
    pub fn remove(&self, key: &str) {
        if let Some((_, group)) = self.group_of.remove(key) {
            let now_empty = match self.groups.get_mut(&group) {
                Some(mut members) => {
                    members.remove(key);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.groups.remove_if(&group, |_, members| members.is_empty());
            }
        }
    }

    /// Keys currently labelled with this group.
    pub fn keys_for(&self, rep_group: &str) -> Vec<String> {
        self.groups
            .get(rep_group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The group a key currently carries.
    pub fn group_of(&self, key: &str) -> Option<String> {
        self.group_of.get(key).map(|entry| entry.value().clone())
    }

    /// Every group with at least one queued key.
    pub fn groups(&self) -> Vec<String> {
        self.groups.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_lookup() {
        let index = RepGroupIndex::new();
        index.set("k1", "step1");
        index.set("k2", "step1");
        index.set("k3", "step2");

        let mut keys = index.keys_for("step1");
        keys.sort();
        assert_eq!(keys, ["k1", "k2"]);
        assert_eq!(index.group_of("k3").as_deref(), Some("step2"));
    }

    #[test]
    fn resubmission_moves_between_groups() {
        let index = RepGroupIndex::new();
        index.set("k1", "first");
        index.set("k1", "second");

        assert!(index.keys_for("first").is_empty());
        assert_eq!(index.keys_for("second"), ["k1"]);
        assert_eq!(index.group_of("k1").as_deref(), Some("second"));
    }

    #[test]
    fn remove_drops_key_and_empty_groups() {
        let index = RepGroupIndex::new();
        index.set("k1", "g");
        index.set("k2", "g");
        index.remove("k1");
        assert_eq!(index.keys_for("g"), ["k2"]);

        index.remove("k2");
        assert!(index.keys_for("g").is_empty());
        assert!(index.groups().is_empty());
        assert_eq!(index.group_of("k1"), None);
    }

    #[test]
    fn remove_unknown_key_is_harmless() {
        let index = RepGroupIndex::new();
        index.remove("ghost");
        assert!(index.groups().is_empty());
    }
}
