// ABOUTME: Table registry - ordered mapping of local names to tracked tables
// ABOUTME: Derives the visible table list and the source publication set

use crate::error::{Result, SyncError};
use crate::table::{TableId, TrackedTable};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: BTreeMap<String, TrackedTable>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tables(tables: impl IntoIterator<Item = TrackedTable>) -> Result<Self> {
        let mut registry = Self::new();
        for table in tables {
            registry.track(table)?;
        }
        Ok(registry)
    }

    pub fn track(&mut self, table: TrackedTable) -> Result<()> {
        if self.tables.contains_key(&table.local_name) {
            return Err(SyncError::AlreadyTracked(table.local_name));
        }
        self.tables.insert(table.local_name.clone(), table);
        Ok(())
    }

    pub fn untrack(&mut self, local_name: &str) -> Result<TrackedTable> {
        self.tables
            .remove(local_name)
            .ok_or_else(|| SyncError::NotTracked(local_name.to_string()))
    }

    pub fn lookup(&self, local_name: &str) -> Option<&TrackedTable> {
        self.tables.get(local_name)
    }

    pub fn lookup_mut(&mut self, local_name: &str) -> Option<&mut TrackedTable> {
        self.tables.get_mut(local_name)
    }

    /// Find the tracked table fed by a source table.
    pub fn by_source(&self, id: &TableId) -> Option<&TrackedTable> {
        self.tables.values().find(|t| &t.id == id)
    }

    pub fn by_source_mut(&mut self, id: &TableId) -> Option<&mut TrackedTable> {
        self.tables.values_mut().find(|t| &t.id == id)
    }

    pub fn contains(&self, local_name: &str) -> bool {
        self.tables.contains_key(local_name)
    }

    /// All tracked tables ordered by local name.
    pub fn list(&self) -> impl Iterator<Item = &TrackedTable> {
        self.tables.values()
    }

    pub fn list_mut(&mut self) -> impl Iterator<Item = &mut TrackedTable> {
        self.tables.values_mut()
    }

    /// Local names of non-detached tables in lexicographic order.
    pub fn visible(&self) -> Vec<String> {
        self.tables
            .values()
            .filter(|t| t.is_visible())
            .map(|t| t.local_name.clone())
            .collect()
    }

    /// Source tables whose changes the stream must deliver.
    pub fn publication(&self) -> BTreeSet<TableId> {
        self.tables
            .values()
            .filter(|t| t.is_visible())
            .map(|t| t.id.clone())
            .collect()
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

    fn table(name: &str) -> TrackedTable {
        TrackedTable::new(TableId::new("public", name), name)
    }

    #[test]
    fn test_track_and_lookup() {
        let mut registry = TableRegistry::new();
        registry.track(table("users")).unwrap();
        assert!(registry.contains("users"));
        assert_eq!(
            registry
                .by_source(&TableId::new("public", "users"))
                .map(|t| t.local_name.as_str()),
            Some("users")
        );
        assert!(registry.lookup("orders").is_none());
    }

    #[test]
    fn test_track_duplicate_fails() {
        let mut registry = TableRegistry::new();
        registry.track(table("users")).unwrap();
        let err = registry.track(table("users")).unwrap_err();
        assert!(matches!(err, SyncError::AlreadyTracked(name) if name == "users"));
    }

    #[test]
    fn test_untrack_unknown_fails() {
        let mut registry = TableRegistry::new();
        let err = registry.untrack("ghost").unwrap_err();
        assert!(matches!(err, SyncError::NotTracked(_)));
    }

    #[test]
    fn test_visible_is_sorted_and_hides_detached() {
        let mut registry = TableRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.track(table(name)).unwrap();
        }
        assert_eq!(registry.visible(), vec!["alpha", "mid", "zeta"]);

        registry.lookup_mut("mid").unwrap().detach();
        assert_eq!(registry.visible(), vec!["alpha", "zeta"]);
        assert_eq!(registry.publication().len(), 2);
        assert_eq!(registry.len(), 3);
    }
}
