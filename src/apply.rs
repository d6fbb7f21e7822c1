// ABOUTME: Apply engine - classifies change events and turns them into storage operations
// ABOUTME: Defers events for tables awaiting a baseline and quarantines tables whose shape drifted

use crate::position::Position;
use crate::registry::TableRegistry;
use crate::source::{ChangeEvent, ChangeKind, Row};
use crate::storage::RowOp;
use crate::table::{TableSchema, TableState, TrackedTable};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// What happens to one change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Apply,
    /// Discarded: untracked, detached or quarantined table, or already applied.
    Skip,
    /// Held until the table's baseline lands.
    Defer,
    Quarantine(String),
    /// Schema change that leaves the recorded column set intact.
    SchemaChangeEvent,
}

/// Decide what to do with `event` given the table it targets.
///
/// `applied_through` is the table's last applied position as of the start of the
/// batch. Every change of one source transaction carries the same commit position,
/// so comparing against the live position would drop all but the first of them.
pub fn classify(
    table: Option<&TrackedTable>,
    applied_through: Position,
    event: &ChangeEvent,
) -> Outcome {
    let Some(table) = table else {
        return Outcome::Skip;
    };
    match table.state {
        TableState::Detached | TableState::Skipped => return Outcome::Skip,
        TableState::Initializing | TableState::Snapshotting => return Outcome::Defer,
        TableState::Syncing => {}
    }
    if event.position <= applied_through {
        return Outcome::Skip;
    }
    let Some(schema) = &table.schema else {
        return Outcome::Quarantine("no recorded column set".to_string());
    };

    match &event.kind {
        ChangeKind::Insert { row } => shape_outcome(schema, row),
        ChangeKind::Update { row, old_key } => match update_shape_outcome(schema, row) {
            Outcome::Apply => match old_key {
                Some(key) if key.project(&schema.primary_key).is_none() => Outcome::Quarantine(
                    "previous key does not cover the primary key".to_string(),
                ),
                _ => Outcome::Apply,
            },
            other => other,
        },
        ChangeKind::Delete { key } => {
            if key.project(&schema.primary_key).is_some() {
                Outcome::Apply
            } else {
                Outcome::Quarantine(format!(
                    "delete key does not cover primary key ({})",
                    schema.primary_key.join(", ")
                ))
            }
        }
        ChangeKind::SchemaChange { columns } => {
            let declared = columns
                .iter()
                .map(|c| (c.name.as_str(), c.type_name.as_str()));
            match schema.shape_difference(declared) {
                Some(reason) => Outcome::Quarantine(reason),
                None => Outcome::SchemaChangeEvent,
            }
        }
    }
}

fn shape_outcome(schema: &TableSchema, row: &Row) -> Outcome {
    match schema.shape_difference(row.shape()) {
        Some(reason) => Outcome::Quarantine(reason),
        None => Outcome::Apply,
    }
}

/// Updates leave out unchanged TOASTed columns, so a narrower row is not drift.
fn update_shape_outcome(schema: &TableSchema, row: &Row) -> Outcome {
    if row.len() >= schema.columns.len() {
        return shape_outcome(schema, row);
    }
    match schema.partial_difference(row.shape()) {
        Some(reason) => Outcome::Quarantine(reason),
        None => Outcome::Apply,
    }
}

/// Counters for one flush.
#[derive(Debug, Clone, Default)]
pub struct ApplyStats {
    pub applied: u64,
    pub skipped: u64,
    pub deferred: u64,
    /// (local name, reason) of every table quarantined during the flush
    pub quarantined: Vec<(String, String)>,
}

/// Storage operations produced by a flush.
#[derive(Debug, Default)]
pub struct BatchPlan {
    pub operations: Vec<RowOp>,
    pub schemas: BTreeMap<String, TableSchema>,
    pub stats: ApplyStats,
}

/// Applies classified events to the registry and collects the matching operations.
///
/// Works on the locked database state: table state transitions happen in place and
/// must be rolled back by the caller if the resulting commit fails.
pub struct ApplyEngine<'a> {
    registry: &'a mut TableRegistry,
    pending: &'a mut BTreeMap<String, Vec<ChangeEvent>>,
    /// Last applied position of each table when the engine first saw it
    applied_through: BTreeMap<String, Position>,
    plan: BatchPlan,
}

impl<'a> ApplyEngine<'a> {
    pub fn new(
        registry: &'a mut TableRegistry,
        pending: &'a mut BTreeMap<String, Vec<ChangeEvent>>,
    ) -> Self {
        Self {
            registry,
            pending,
            applied_through: BTreeMap::new(),
            plan: BatchPlan::default(),
        }
    }

    pub fn apply(&mut self, event: ChangeEvent) {
        let table = self.registry.by_source(&event.table);
        let applied_through = match table {
            Some(table) => *self
                .applied_through
                .entry(table.local_name.clone())
                .or_insert(table.last_applied_position),
            None => Position::ZERO,
        };
        let outcome = classify(table, applied_through, &event);
        match outcome {
            Outcome::Skip => self.plan.stats.skipped += 1,
            Outcome::Defer => {
                if let Some(table) = self.registry.by_source(&event.table) {
                    self.pending
                        .entry(table.local_name.clone())
                        .or_default()
                        .push(event);
                    self.plan.stats.deferred += 1;
                }
            }
            Outcome::Quarantine(reason) => {
                if let Some(table) = self.registry.by_source_mut(&event.table) {
                    tracing::warn!(
                        "Table {} is skipped from replication stream because its schema has changed: {}",
                        table.local_name,
                        reason
                    );
                    table.quarantine(reason.clone());
                    self.plan
                        .stats
                        .quarantined
                        .push((table.local_name.clone(), reason));
                }
            }
            Outcome::SchemaChangeEvent => {
                if let Some(table) = self.registry.by_source_mut(&event.table) {
                    tracing::debug!(
                        "Schema change on {} keeps the recorded columns, ignoring",
                        table.local_name
                    );
                    table.advance(event.position);
                }
            }
            Outcome::Apply => {
                if let Some(table) = self.registry.by_source_mut(&event.table) {
                    if let Some(schema) = &table.schema {
                        push_operations(&mut self.plan, &table.local_name, schema, event.kind);
                    }
                    table.advance(event.position);
                    self.plan.stats.applied += 1;
                }
            }
        }
    }

    /// Replay the events held for `local_name` once its baseline is in place.
    ///
    /// Events at or below the snapshot position are already part of the baseline
    /// and get skipped by classification.
    pub fn replay_pending(&mut self, local_name: &str) {
        self.applied_through.remove(local_name);
        let events = self.pending.remove(local_name).unwrap_or_default();
        if !events.is_empty() {
            tracing::debug!(
                "Replaying {} deferred events for table {}",
                events.len(),
                local_name
            );
        }
        for event in events {
            self.apply(event);
        }
    }

    pub fn finish(self) -> BatchPlan {
        self.plan
    }
}

fn push_operations(plan: &mut BatchPlan, local_name: &str, schema: &TableSchema, kind: ChangeKind) {
    let pk = &schema.primary_key;
    match kind {
        ChangeKind::Insert { row } => plan.operations.push(RowOp::Upsert {
            table: local_name.to_string(),
            row,
        }),
        ChangeKind::Update { row, old_key } => {
            let old = old_key.and_then(|key| key.project(pk));
            if let (Some(old), Some(new)) = (old, row.project(pk)) {
                if old.cmp_values(&new) != Ordering::Equal {
                    plan.operations.push(RowOp::Delete {
                        table: local_name.to_string(),
                        key: old,
                    });
                }
            }
            plan.operations.push(RowOp::Upsert {
                table: local_name.to_string(),
                row,
            });
        }
        ChangeKind::Delete { key } => {
            if let Some(key) = key.project(pk) {
                plan.operations.push(RowOp::Delete {
                    table: local_name.to_string(),
                    key,
                });
            }
        }
        ChangeKind::SchemaChange { .. } => return,
    }
    plan.schemas
        .entry(local_name.to_string())
        .or_insert_with(|| schema.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Value;
    use crate::table::{ColumnDef, TableId};

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", "int8", false),
            ColumnDef::new("name", "text", true),
        ]
    }

    fn schema() -> TableSchema {
        TableSchema::new(columns(), vec!["id".to_string()])
    }

    fn id() -> TableId {
        TableId::new("public", "users")
    }

    fn row(id: i64, name: &str) -> Row {
        Row::from_values(&columns(), vec![Value::Int(id), name.into()])
    }

    fn key(id: i64) -> Row {
        Row::from_values(&columns()[..1], vec![Value::Int(id)])
    }

    fn syncing(at: u64) -> TrackedTable {
        let mut table = TrackedTable::new(id(), "users");
        table.finish_snapshot(schema(), Position(at));
        table
    }

    fn insert(position: u64, row: Row) -> ChangeEvent {
        ChangeEvent::new(id(), Position(position), ChangeKind::Insert { row })
    }

    fn outcome(table: &TrackedTable, event: &ChangeEvent) -> Outcome {
        classify(Some(table), table.last_applied_position, event)
    }

    #[test]
    fn test_classify_by_state() {
        let event = insert(20, row(1, "a"));
        assert_eq!(classify(None, Position::ZERO, &event), Outcome::Skip);

        let mut table = TrackedTable::new(id(), "users");
        assert_eq!(outcome(&table, &event), Outcome::Defer);
        table.begin_snapshot();
        assert_eq!(outcome(&table, &event), Outcome::Defer);

        let mut table = syncing(10);
        assert_eq!(outcome(&table, &event), Outcome::Apply);
        table.quarantine("drift");
        assert_eq!(outcome(&table, &event), Outcome::Skip);
        table.detach();
        assert_eq!(outcome(&table, &event), Outcome::Skip);
    }

    #[test]
    fn test_classify_skips_redelivery() {
        let table = syncing(10);
        assert_eq!(outcome(&table, &insert(10, row(1, "a"))), Outcome::Skip);
        assert_eq!(outcome(&table, &insert(9, row(1, "a"))), Outcome::Skip);
        assert_eq!(outcome(&table, &insert(11, row(1, "a"))), Outcome::Apply);
    }

    #[test]
    fn test_classify_shape_mismatch() {
        let table = syncing(0);
        let mut extra = columns();
        extra.push(ColumnDef::new("age", "int4", true));
        let wide = Row::from_values(&extra, vec![Value::Int(1), "a".into(), Value::Int(3)]);
        assert!(matches!(
            outcome(&table, &insert(1, wide)),
            Outcome::Quarantine(_)
        ));

        let same = ChangeEvent::new(
            id(),
            Position(2),
            ChangeKind::SchemaChange { columns: columns() },
        );
        assert_eq!(outcome(&table, &same), Outcome::SchemaChangeEvent);

        let changed = ChangeEvent::new(id(), Position(3), ChangeKind::SchemaChange { columns: extra });
        assert!(matches!(outcome(&table, &changed), Outcome::Quarantine(_)));

        let bad_delete = ChangeEvent::new(
            id(),
            Position(4),
            ChangeKind::Delete {
                key: Row::from_values(&columns()[1..], vec!["a".into()]),
            },
        );
        assert!(matches!(outcome(&table, &bad_delete), Outcome::Quarantine(_)));
    }

    #[test]
    fn test_engine_builds_operations_in_order() {
        let mut registry = TableRegistry::new();
        registry.track(syncing(0)).unwrap();
        let mut pending = BTreeMap::new();

        let mut engine = ApplyEngine::new(&mut registry, &mut pending);
        engine.apply(insert(1, row(1, "a")));
        engine.apply(ChangeEvent::new(
            id(),
            Position(2),
            ChangeKind::Update {
                row: row(2, "a"),
                old_key: Some(key(1)),
            },
        ));
        engine.apply(ChangeEvent::new(id(), Position(3), ChangeKind::Delete { key: key(2) }));
        let plan = engine.finish();

        assert_eq!(plan.stats.applied, 3);
        assert_eq!(
            plan.operations,
            vec![
                RowOp::Upsert {
                    table: "users".into(),
                    row: row(1, "a")
                },
                RowOp::Delete {
                    table: "users".into(),
                    key: key(1)
                },
                RowOp::Upsert {
                    table: "users".into(),
                    row: row(2, "a")
                },
                RowOp::Delete {
                    table: "users".into(),
                    key: key(2)
                },
            ]
        );
        assert!(plan.schemas.contains_key("users"));
        assert_eq!(
            registry.lookup("users").unwrap().last_applied_position,
            Position(3)
        );
    }

    #[test]
    fn test_engine_quarantines_and_skips_followers() {
        let mut registry = TableRegistry::new();
        registry.track(syncing(0)).unwrap();
        let mut pending = BTreeMap::new();

        let mut extra = columns();
        extra.push(ColumnDef::new("age", "int4", true));
        let wide = Row::from_values(&extra, vec![Value::Int(1), "a".into(), Value::Int(3)]);

        let mut engine = ApplyEngine::new(&mut registry, &mut pending);
        engine.apply(insert(1, row(1, "a")));
        engine.apply(insert(2, wide));
        engine.apply(insert(3, row(3, "c")));
        let plan = engine.finish();

        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.stats.quarantined.len(), 1);
        assert_eq!(plan.stats.skipped, 1);
        let table = registry.lookup("users").unwrap();
        assert_eq!(table.state, TableState::Skipped);
        assert!(table.quarantine_reason.as_deref().unwrap().contains("expected 2 columns"));
    }

    #[test]
    fn test_deferred_events_replay_above_snapshot() {
        let mut registry = TableRegistry::new();
        let mut table = TrackedTable::new(id(), "users");
        table.begin_snapshot();
        registry.track(table).unwrap();
        let mut pending = BTreeMap::new();

        {
            let mut engine = ApplyEngine::new(&mut registry, &mut pending);
            engine.apply(insert(5, row(1, "a")));
            engine.apply(insert(8, row(2, "b")));
            assert_eq!(engine.finish().stats.deferred, 2);
        }
        assert_eq!(pending["users"].len(), 2);

        registry
            .lookup_mut("users")
            .unwrap()
            .finish_snapshot(schema(), Position(5));

        let mut engine = ApplyEngine::new(&mut registry, &mut pending);
        engine.replay_pending("users");
        let plan = engine.finish();
        assert_eq!(plan.stats.applied, 1);
        assert_eq!(plan.stats.skipped, 1);
        assert_eq!(
            plan.operations,
            vec![RowOp::Upsert {
                table: "users".into(),
                row: row(2, "b")
            }]
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn test_engine_applies_every_row_of_one_transaction() {
        let mut registry = TableRegistry::new();
        registry.track(syncing(3)).unwrap();
        let mut pending = BTreeMap::new();
        let transaction: Vec<ChangeEvent> = (1..=5).map(|i| insert(7, row(i, "t"))).collect();

        let mut engine = ApplyEngine::new(&mut registry, &mut pending);
        for event in transaction.clone() {
            engine.apply(event);
        }
        let plan = engine.finish();
        assert_eq!(plan.stats.applied, 5);
        assert_eq!(plan.operations.len(), 5);
        assert_eq!(
            registry.lookup("users").unwrap().last_applied_position,
            Position(7)
        );

        // Redelivered after a restart: the whole transaction is already applied
        let mut engine = ApplyEngine::new(&mut registry, &mut pending);
        for event in transaction {
            engine.apply(event);
        }
        let plan = engine.finish();
        assert_eq!(plan.stats.skipped, 5);
        assert!(plan.operations.is_empty());
    }

    #[test]
    fn test_deferred_transaction_replays_every_row() {
        let mut registry = TableRegistry::new();
        let mut table = TrackedTable::new(id(), "users");
        table.begin_snapshot();
        registry.track(table).unwrap();
        let mut pending = BTreeMap::new();

        {
            let mut engine = ApplyEngine::new(&mut registry, &mut pending);
            engine.apply(insert(5, row(1, "in baseline")));
            engine.apply(insert(5, row(2, "in baseline")));
            for i in 3..=6 {
                engine.apply(insert(9, row(i, "after baseline")));
            }
            assert_eq!(engine.finish().stats.deferred, 6);
        }

        registry
            .lookup_mut("users")
            .unwrap()
            .finish_snapshot(schema(), Position(5));
        let mut engine = ApplyEngine::new(&mut registry, &mut pending);
        engine.replay_pending("users");
        let plan = engine.finish();
        assert_eq!(plan.stats.skipped, 2);
        assert_eq!(plan.stats.applied, 4);
        assert_eq!(plan.operations.len(), 4);
    }

    #[test]
    fn test_update_without_toasted_columns_is_applied() {
        let wide = vec![
            ColumnDef::new("id", "int8", false),
            ColumnDef::new("name", "text", true),
            ColumnDef::new("document", "text", true),
        ];
        let mut table = TrackedTable::new(id(), "users");
        table.finish_snapshot(TableSchema::new(wide.clone(), vec!["id".to_string()]), Position(1));

        // `document` is unchanged and left out of the decoded row
        let narrow = Row::from_values(&wide[..2], vec![Value::Int(1), "renamed".into()]);
        let update = ChangeEvent::new(
            id(),
            Position(2),
            ChangeKind::Update {
                row: narrow.clone(),
                old_key: None,
            },
        );
        assert_eq!(outcome(&table, &update), Outcome::Apply);

        let mut registry = TableRegistry::new();
        registry.track(table.clone()).unwrap();
        let mut pending = BTreeMap::new();
        let mut engine = ApplyEngine::new(&mut registry, &mut pending);
        engine.apply(update);
        assert_eq!(
            engine.finish().operations,
            vec![RowOp::Upsert {
                table: "users".into(),
                row: narrow
            }]
        );

        // An insert must still carry every column
        let short_insert = insert(3, Row::from_values(&wide[..2], vec![Value::Int(2), "x".into()]));
        assert!(matches!(outcome(&table, &short_insert), Outcome::Quarantine(_)));

        // A column the table never had is drift, even in an update
        let mut unknown = wide[..1].to_vec();
        unknown.push(ColumnDef::new("age", "int4", true));
        let drifted = ChangeEvent::new(
            id(),
            Position(4),
            ChangeKind::Update {
                row: Row::from_values(&unknown, vec![Value::Int(1), Value::Int(30)]),
                old_key: None,
            },
        );
        match outcome(&table, &drifted) {
            Outcome::Quarantine(reason) => assert!(reason.contains("unknown column 'age'")),
            other => panic!("expected quarantine, got {:?}", other),
        }
    }
}
