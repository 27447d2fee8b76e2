//! Renaming a logical entity.
//!
//! Several migrations in a schema's history rename the same kind of thing: a
//! table, the indexes named after it, and the foreign keys (and FK columns)
//! of the tables that point at it. [`EntityRename`] describes such a rename
//! once and derives the state descriptors, operation lists and target shape
//! for both directions.

use crate::classify::{Condition, Probe, StateDescriptor, TargetState};
use crate::{Operation, ReferentialAction};

/// A logical entity under one of its physical names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaEntity {
    /// Stable name across renames, for logs.
    pub logical: &'static str,
    pub table: String,
    /// Indexes named after the table, paired by position across a rename.
    pub indexes: Vec<String>,
}

impl SchemaEntity {
    pub fn new(logical: &'static str, table: impl Into<String>) -> Self {
        Self {
            logical,
            table: table.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.indexes.push(index.into());
        self
    }
}

/// Foreign-key column and constraint name on a referencing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRef {
    pub column: String,
    pub constraint: String,
}

impl ForeignKeyRef {
    pub fn new(column: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            constraint: constraint.into(),
        }
    }
}

/// A table whose foreign key follows the renamed entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentReference {
    pub table: String,
    pub from: ForeignKeyRef,
    pub to: ForeignKeyRef,
    pub references_column: String,
    pub on_delete: ReferentialAction,
}

impl DependentReference {
    fn swapped(&self) -> Self {
        Self {
            table: self.table.clone(),
            from: self.to.clone(),
            to: self.from.clone(),
            references_column: self.references_column.clone(),
            on_delete: self.on_delete,
        }
    }
}

/// Rename `from` to `to` and carry every dependent foreign key along.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRename {
    pub from: SchemaEntity,
    pub to: SchemaEntity,
    pub dependents: Vec<DependentReference>,
}

impl EntityRename {
    pub fn new(from: SchemaEntity, to: SchemaEntity) -> Self {
        Self {
            from,
            to,
            dependents: Vec::new(),
        }
    }

    pub fn with_dependent(mut self, dependent: DependentReference) -> Self {
        self.dependents.push(dependent);
        self
    }

    /// The same rename in the other direction.
    pub fn inverse(&self) -> Self {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
            dependents: self.dependents.iter().map(DependentReference::swapped).collect(),
        }
    }

    fn table_ops(&self) -> Vec<Operation> {
        vec![Operation::RenameTable {
            from: self.from.table.clone(),
            to: self.to.table.clone(),
        }]
    }

    fn index_ops(&self) -> Vec<Operation> {
        self.from
            .indexes
            .iter()
            .zip(&self.to.indexes)
            .map(|(from, to)| Operation::RenameIndex {
                from: from.clone(),
                to: to.clone(),
            })
            .collect()
    }

    fn dependent_ops(&self) -> Vec<Operation> {
        let mut ops = Vec::new();
        for dep in &self.dependents {
            ops.push(Operation::DropConstraint {
                table: dep.table.clone(),
                name: dep.from.constraint.clone(),
            });
            if dep.from.column != dep.to.column {
                ops.push(Operation::RenameColumn {
                    table: dep.table.clone(),
                    from: dep.from.column.clone(),
                    to: dep.to.column.clone(),
                });
            }
            ops.push(Operation::AddForeignKey {
                table: dep.table.clone(),
                name: dep.to.constraint.clone(),
                column: dep.to.column.clone(),
                references_table: self.to.table.clone(),
                references_column: dep.references_column.clone(),
                on_delete: dep.on_delete,
            });
        }
        ops
    }

    /// Every operation of the rename, in execution order.
    pub fn operations(&self) -> Vec<Operation> {
        let mut ops = self.table_ops();
        ops.extend(self.index_ops());
        ops.extend(self.dependent_ops());
        ops
    }

    fn renamed(&self) -> Vec<Condition> {
        vec![
            Probe::table(&self.from.table).absent(),
            Probe::table(&self.to.table).present(),
        ]
    }

    fn indexes_renamed(&self) -> Vec<Condition> {
        let mut conditions: Vec<_> = self
            .to
            .indexes
            .iter()
            .map(|index| Probe::index(index).present())
            .collect();
        conditions.extend(
            self.from
                .indexes
                .iter()
                .map(|index| Probe::index(index).absent()),
        );
        conditions
    }

    fn dependents_moved(&self) -> Vec<Condition> {
        let mut conditions = Vec::new();
        for dep in &self.dependents {
            if dep.from.column != dep.to.column {
                conditions.push(Probe::column(&dep.table, &dep.from.column).absent());
            }
            conditions.push(Probe::column(&dep.table, &dep.to.column).present());
            if dep.from.constraint != dep.to.constraint {
                conditions.push(Probe::constraint(&dep.table, &dep.from.constraint).absent());
            }
            conditions.push(Probe::constraint(&dep.table, &dep.to.constraint).present());
        }
        conditions
    }

    /// End shape of the rename.
    pub fn target(&self) -> TargetState {
        let mut conditions = self.renamed();
        conditions.extend(self.indexes_renamed());
        conditions.extend(self.dependents_moved());
        TargetState::new(conditions)
    }

    /// Recognizable states, highest priority first.
    ///
    /// Neither table existing matches nothing and classifies as unknown.
    pub fn states(&self) -> Vec<StateDescriptor> {
        let from = &self.from.table;
        let to = &self.to.table;

        let mut in_target = self.renamed();
        in_target.extend(self.indexes_renamed());
        in_target.extend(self.dependents_moved());

        let mut pending_foreign_keys = self.renamed();
        pending_foreign_keys.extend(self.indexes_renamed());

        vec![
            StateDescriptor::ambiguous(
                "Ambiguous",
                vec![Probe::table(from).present(), Probe::table(to).present()],
                format!(
                    "{} exists as both {} and {}; refusing to pick one",
                    self.from.logical, from, to
                ),
            ),
            StateDescriptor::in_target_shape("InTargetShape", in_target),
            StateDescriptor::plan(
                "RenamedPendingForeignKeys",
                pending_foreign_keys,
                self.dependent_ops(),
            ),
            StateDescriptor::plan("RenamedPendingIndexes", self.renamed(), {
                let mut ops = self.index_ops();
                ops.extend(self.dependent_ops());
                ops
            }),
            StateDescriptor::plan(
                "OldName",
                vec![Probe::table(from).present(), Probe::table(to).absent()],
                self.operations(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Classification, classify};
    use crate::simulate::VirtualSchema;
    use crate::{ApplyOutcome, Migration, apply, revert};
    use proptest::prelude::*;

    fn rename() -> EntityRename {
        EntityRename::new(
            SchemaEntity::new("component catalog", "product_components")
                .with_index("idx_product_components_name"),
            SchemaEntity::new("component catalog", "product_component_types")
                .with_index("idx_product_component_types_name"),
        )
        .with_dependent(DependentReference {
            table: "product_component_versions".into(),
            from: ForeignKeyRef::new(
                "product_component_id",
                "fk_product_component_versions_product_component",
            ),
            to: ForeignKeyRef::new(
                "product_component_type_id",
                "fk_product_component_versions_product_component_type",
            ),
            references_column: "id".into(),
            on_delete: ReferentialAction::SetNull,
        })
    }

    fn old_shape() -> VirtualSchema {
        VirtualSchema::new()
            .with_table("product_components", &["id", "code", "name"])
            .with_index("idx_product_components_name", "product_components")
            .with_table(
                "product_component_versions",
                &["id", "product_component_id"],
            )
            .with_foreign_key(
                "product_component_versions",
                "fk_product_component_versions_product_component",
                "product_component_id",
                "product_components",
            )
            .with_rows("product_components", [1, 2])
            .with_rows("product_component_versions", [10, 11, 12])
    }

    struct RenameMigration(EntityRename);

    impl Migration for RenameMigration {
        fn name(&self) -> &'static str {
            "1-Rename"
        }
        fn version(&self) -> i64 {
            1
        }
        fn forward(&self) -> Vec<StateDescriptor> {
            self.0.states()
        }
        fn target(&self) -> TargetState {
            self.0.target()
        }
        fn reverse(&self) -> Vec<StateDescriptor> {
            self.0.inverse().states()
        }
        fn reverse_target(&self) -> TargetState {
            self.0.inverse().target()
        }
    }

    async fn classified(schema: &VirtualSchema, rename: &EntityRename) -> &'static str {
        let states = rename.states();
        match classify(schema, &states).await.unwrap() {
            Classification::Known(state) => state.name,
            Classification::Unknown(observed) => {
                panic!("unknown: {}", Classification::describe_observed(&observed))
            }
        }
    }

    #[test]
    fn test_operations_order() {
        let ops: Vec<_> = rename().operations().iter().map(|o| o.to_string()).collect();
        assert_eq!(
            ops,
            vec![
                "~ rename product_components -> product_component_types",
                "~ rename index idx_product_components_name -> idx_product_component_types_name",
                "- CONSTRAINT product_component_versions.fk_product_component_versions_product_component",
                "~ rename product_component_versions.product_component_id -> product_component_type_id",
                "+ FOREIGN KEY fk_product_component_versions_product_component_type \
                 product_component_versions.product_component_type_id -> product_component_types.id",
            ]
        );
    }

    #[tokio::test]
    async fn test_each_state_is_recognized() {
        let rename = rename();
        let ops = rename.operations();
        let expected = [
            "OldName",
            "RenamedPendingIndexes",
            "RenamedPendingForeignKeys",
            "RenamedPendingForeignKeys",
            "RenamedPendingForeignKeys",
            "InTargetShape",
        ];

        // Replay the rename one operation at a time, classifying in between.
        let schema = old_shape();
        for (step, name) in expected.iter().enumerate() {
            assert_eq!(classified(&schema, &rename).await, *name, "after {} ops", step);
            if let Some(op) = ops.get(step) {
                schema.apply(op).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_both_tables_is_ambiguous_and_neither_is_unknown() {
        let rename = rename();
        let states = rename.states();

        let schema = old_shape().with_table("product_component_types", &["id"]);
        assert_eq!(classified(&schema, &rename).await, "Ambiguous");

        let schema = VirtualSchema::new().with_table("product_component_versions", &["id"]);
        assert!(matches!(
            classify(&schema, &states).await.unwrap(),
            Classification::Unknown(_)
        ));
    }

    #[tokio::test]
    async fn test_inverse_restores_original_names() {
        let migration = RenameMigration(rename());
        let schema = old_shape();
        let before = schema.snapshot();

        assert!(matches!(
            apply(&schema, &migration).await.unwrap(),
            ApplyOutcome::Applied {
                state: "OldName",
                ..
            }
        ));
        let report = revert(&schema, &migration).await.unwrap();
        assert_eq!(report.state, "OldName");
        assert!(report.lossy.is_empty());
        assert_eq!(schema.snapshot(), before);
    }

    fn converge(crashed_after: usize, reruns: usize) -> Result<(), TestCaseError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        rt.block_on(async {
            let migration = RenameMigration(rename());

            let reference = old_shape();
            apply(&reference, &migration).await.unwrap();

            // Operations committed one by one by an earlier, non-transactional tool.
            let schema = old_shape();
            for op in migration.0.operations().iter().take(crashed_after) {
                schema.apply(op).unwrap();
            }
            for _ in 0..=reruns {
                apply(&schema, &migration).await.unwrap();
            }

            prop_assert_eq!(schema.snapshot(), reference.snapshot());
            Ok(())
        })
    }

    proptest! {
        /// Wherever an earlier attempt stopped, applying converges on the same shape.
        #[test]
        fn prop_rename_converges(crashed_after in 0usize..=5, reruns in 0usize..3) {
            converge(crashed_after, reruns)?;
        }
    }
}
