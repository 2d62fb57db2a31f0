//! Change set: the tables a unit of work has modified

use std::collections::BTreeSet;

/// Distinct table names touched in one unit of work
///
/// Ordered so that notifications go out in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    tables: BTreeSet<String>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `table` was modified. Returns false if it already was.
    pub fn touch(&mut self, table: &str) -> bool {
        if self.tables.contains(table) {
            return false;
        }
        self.tables.insert(table.to_string())
    }

    /// Take every recorded table, leaving the set empty
    pub fn drain(&mut self) -> BTreeSet<String> {
        std::mem::take(&mut self.tables)
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_is_idempotent() {
        let mut changes = ChangeSet::new();
        assert!(changes.touch("nodes"));
        assert!(!changes.touch("nodes"));
        assert!(changes.touch("comp_status"));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_drain_empties_the_set() {
        let mut changes = ChangeSet::new();
        changes.touch("nodes");
        changes.touch("comp_status");

        let drained: Vec<String> = changes.drain().into_iter().collect();
        assert_eq!(drained, vec!["comp_status".to_string(), "nodes".to_string()]);
        assert!(changes.is_empty());
        assert!(changes.drain().is_empty());
    }
}
