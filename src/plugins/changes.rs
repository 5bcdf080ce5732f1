//! Registry snapshot diffing.
//!
//! Snapshots map qualified tool names to descriptors with no executable
//! handles attached. The tracker keeps the two most recent snapshots and a
//! bounded chronological log of non-empty diffs.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

use super::ToolDescriptor;

/// Qualified tool name to descriptor.
pub type Snapshot = BTreeMap<String, ToolDescriptor>;

#[derive(Debug, Clone, Serialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

/// Structured added/removed/modified view of two snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeSet {
    pub timestamp: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Changed tool name to a key-by-key diff of its descriptor.
    pub modified: BTreeMap<String, BTreeMap<String, FieldChange>>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Compute the delta between two successive snapshots.
pub fn diff_snapshots(previous: &Snapshot, current: &Snapshot) -> ChangeSet {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut modified = BTreeMap::new();

    for (name, descriptor) in current {
        match previous.get(name) {
            None => added.push(name.clone()),
            Some(old) if old != descriptor => {
                modified.insert(name.clone(), descriptor_diff(old, descriptor));
            }
            Some(_) => {}
        }
    }

    for name in previous.keys() {
        if !current.contains_key(name) {
            removed.push(name.clone());
        }
    }

    ChangeSet {
        timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        added,
        removed,
        modified,
    }
}

/// Key-by-key diff of two descriptors over their serialized fields.
fn descriptor_diff(old: &ToolDescriptor, new: &ToolDescriptor) -> BTreeMap<String, FieldChange> {
    let old_value = serde_json::to_value(old).unwrap_or(Value::Null);
    let new_value = serde_json::to_value(new).unwrap_or(Value::Null);
    let empty = serde_json::Map::new();
    let old_map = old_value.as_object().unwrap_or(&empty);
    let new_map = new_value.as_object().unwrap_or(&empty);

    let mut diff = BTreeMap::new();
    let keys: std::collections::BTreeSet<&String> =
        old_map.keys().chain(new_map.keys()).collect();
    for key in keys {
        let old_field = old_map.get(key).cloned().unwrap_or(Value::Null);
        let new_field = new_map.get(key).cloned().unwrap_or(Value::Null);
        if old_field != new_field {
            diff.insert(
                key.clone(),
                FieldChange {
                    old: old_field,
                    new: new_field,
                },
            );
        }
    }
    diff
}

/// Summary view for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeSummary {
    pub total_recorded: usize,
    /// The two most recent non-empty diffs, newest last.
    pub recent: Vec<ChangeSet>,
    pub previous_tools: Vec<String>,
    pub current_tools: Vec<String>,
}

/// Owns the previous/current snapshots and the bounded change log.
#[derive(Debug)]
pub struct ChangeTracker {
    previous: Snapshot,
    current: Snapshot,
    log: VecDeque<ChangeSet>,
    capacity: usize,
}

impl ChangeTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            previous: Snapshot::new(),
            current: Snapshot::new(),
            log: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record the next snapshot, returning the diff against the current
    /// one. Only non-empty diffs enter the log.
    pub fn record(&mut self, next: Snapshot) -> ChangeSet {
        let diff = diff_snapshots(&self.current, &next);

        self.previous = std::mem::replace(&mut self.current, next);

        if !diff.is_empty() {
            if self.log.len() == self.capacity {
                self.log.pop_front();
            }
            self.log.push_back(diff.clone());
        }

        diff
    }

    pub fn summary(&self) -> ChangeSummary {
        let recent: Vec<ChangeSet> = self
            .log
            .iter()
            .rev()
            .take(2)
            .rev()
            .cloned()
            .collect();

        ChangeSummary {
            total_recorded: self.log.len(),
            recent,
            previous_tools: self.previous.keys().cloned().collect(),
            current_tools: self.current.keys().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, description: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
            tags: Vec::new(),
            source_module: "tool.py".to_string(),
            function_name: name.split('-').last().unwrap_or(name).to_string(),
            tool_name_prefix: name.split('-').next().unwrap_or("").to_string(),
        }
    }

    fn snapshot(entries: &[(&str, &str)]) -> Snapshot {
        entries
            .iter()
            .map(|(name, description)| (name.to_string(), descriptor(name, description)))
            .collect()
    }

    #[test]
    fn test_diff_partitions_current_keys() {
        let previous = snapshot(&[("calc-add", "Add"), ("calc-sub", "Subtract")]);
        let current = snapshot(&[("calc-add", "Add"), ("calc-mul", "Multiply")]);

        let diff = diff_snapshots(&previous, &current);
        assert_eq!(diff.added, vec!["calc-mul"]);
        assert_eq!(diff.removed, vec!["calc-sub"]);
        assert!(diff.modified.is_empty());

        // added, modified, and unchanged partition the current key set;
        // removed comes from the previous key set only.
        let unchanged: Vec<&String> = current
            .keys()
            .filter(|k| !diff.added.contains(k) && !diff.modified.contains_key(*k))
            .collect();
        assert_eq!(
            diff.added.len() + diff.modified.len() + unchanged.len(),
            current.len()
        );
        for name in &diff.removed {
            assert!(previous.contains_key(name) && !current.contains_key(name));
        }
    }

    #[test]
    fn test_diff_reports_field_level_changes() {
        let previous = snapshot(&[("calc-add", "Add")]);
        let current = snapshot(&[("calc-add", "Add two numbers")]);

        let diff = diff_snapshots(&previous, &current);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());

        let changes = &diff.modified["calc-add"];
        assert_eq!(changes.len(), 1);
        let change = &changes["description"];
        assert_eq!(change.old, serde_json::json!("Add"));
        assert_eq!(change.new, serde_json::json!("Add two numbers"));
    }

    #[test]
    fn test_identical_snapshots_produce_empty_diff() {
        let snap = snapshot(&[("calc-add", "Add")]);
        assert!(diff_snapshots(&snap, &snap).is_empty());
    }

    #[test]
    fn test_tracker_logs_only_nonempty_diffs() {
        let mut tracker = ChangeTracker::new(10);

        let first = tracker.record(snapshot(&[("calc-add", "Add")]));
        assert_eq!(first.added, vec!["calc-add"]);

        let second = tracker.record(snapshot(&[("calc-add", "Add")]));
        assert!(second.is_empty());

        let summary = tracker.summary();
        assert_eq!(summary.total_recorded, 1);
        assert_eq!(summary.current_tools, vec!["calc-add"]);
        assert_eq!(summary.previous_tools, vec!["calc-add"]);
    }

    #[test]
    fn test_tracker_log_is_bounded() {
        let mut tracker = ChangeTracker::new(3);
        for i in 0..6 {
            let name = format!("calc-f{}", i);
            tracker.record(snapshot(&[(&name, "gen")]));
        }

        let summary = tracker.summary();
        assert_eq!(summary.total_recorded, 3);
        // The two most recent diffs, newest last.
        assert_eq!(summary.recent.len(), 2);
        assert_eq!(summary.recent[1].added, vec!["calc-f5"]);
        assert_eq!(summary.recent[0].added, vec!["calc-f4"]);
    }
}
