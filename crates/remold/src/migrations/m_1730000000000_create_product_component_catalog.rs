use super::{
    COMPONENT_TYPE_ENUM, PRODUCT_COMPONENT_TYPES, PRODUCT_COMPONENT_VERSIONS, PRODUCT_COMPONENTS,
};
use crate::{
    ColumnDef, Migration, Operation, Probe, ReferentialAction, Registration, StateDescriptor,
    TargetState, quote_ident,
};

pub(super) const CATALOG_NAME_INDEX: &str = "idx_product_components_name";
pub(super) const CATALOG_FOREIGN_KEY: &str = "fk_product_component_versions_product_component";
pub(super) const CATALOG_FOREIGN_KEY_COLUMN: &str = "product_component_id";

/// Turn the component type enum into a `product_components` catalog table and
/// point every version row at its catalog entry.
pub struct CreateProductComponentCatalog;

impl CreateProductComponentCatalog {
    fn create_catalog() -> Vec<Operation> {
        vec![
            Operation::CreateTable {
                name: PRODUCT_COMPONENTS.to_string(),
                columns: vec![
                    ColumnDef::new("id", "SERIAL").primary_key(),
                    ColumnDef::new("code", "VARCHAR(50)"),
                    ColumnDef::new("name", "VARCHAR(255)"),
                ],
            },
            Operation::CreateIndex {
                name: CATALOG_NAME_INDEX.to_string(),
                table: PRODUCT_COMPONENTS.to_string(),
                columns: vec!["name".to_string()],
                unique: true,
            },
        ]
    }

    /// One catalog row per enum literal, skipping codes already present.
    fn seed() -> Operation {
        Operation::Sql {
            description: "seed product_components from enum literals".to_string(),
            sql: format!(
                "INSERT INTO {catalog} (code, name) \
                 SELECT v::text, initcap(v::text) FROM unnest(enum_range(NULL::{ty})) AS v \
                 WHERE NOT EXISTS (SELECT 1 FROM {catalog} c WHERE c.code = v::text)",
                catalog = quote_ident(PRODUCT_COMPONENTS),
                ty = quote_ident(COMPONENT_TYPE_ENUM),
            ),
            only_if: vec![
                Probe::table(PRODUCT_COMPONENTS).present(),
                Probe::enum_type(COMPONENT_TYPE_ENUM).present(),
            ],
        }
    }

    fn add_column() -> Operation {
        Operation::AddColumn {
            table: PRODUCT_COMPONENT_VERSIONS.to_string(),
            column: ColumnDef::new(CATALOG_FOREIGN_KEY_COLUMN, "INTEGER").nullable(),
        }
    }

    fn link() -> Vec<Operation> {
        vec![
            Self::seed(),
            Operation::SetFromReference {
                table: PRODUCT_COMPONENT_VERSIONS.to_string(),
                column: CATALOG_FOREIGN_KEY_COLUMN.to_string(),
                match_column: "component_type".to_string(),
                reference: PRODUCT_COMPONENTS.to_string(),
                reference_key: "id".to_string(),
                reference_match: "code".to_string(),
            },
            Operation::AddForeignKey {
                table: PRODUCT_COMPONENT_VERSIONS.to_string(),
                name: CATALOG_FOREIGN_KEY.to_string(),
                column: CATALOG_FOREIGN_KEY_COLUMN.to_string(),
                references_table: PRODUCT_COMPONENTS.to_string(),
                references_column: "id".to_string(),
                on_delete: ReferentialAction::SetNull,
            },
        ]
    }
}

impl Migration for CreateProductComponentCatalog {
    fn name(&self) -> &'static str {
        "1730000000000-CreateProductComponentCatalog"
    }

    fn version(&self) -> i64 {
        1730000000000
    }

    fn forward(&self) -> Vec<StateDescriptor> {
        let catalog = Probe::column(PRODUCT_COMPONENTS, "code");
        let column = Probe::column(PRODUCT_COMPONENT_VERSIONS, CATALOG_FOREIGN_KEY_COLUMN);
        let foreign_key = Probe::constraint(PRODUCT_COMPONENT_VERSIONS, CATALOG_FOREIGN_KEY);

        vec![
            // The catalog has since been renamed.
            StateDescriptor::in_target_shape(
                "Superseded",
                vec![Probe::table(PRODUCT_COMPONENT_TYPES).present()],
            ),
            StateDescriptor::in_target_shape(
                "InTargetShape",
                vec![
                    catalog.clone().present(),
                    Probe::index(CATALOG_NAME_INDEX).present(),
                    column.clone().present(),
                    foreign_key.clone().present(),
                ],
            ),
            StateDescriptor::plan(
                "ForeignKeyPending",
                vec![catalog.clone().present(), column.clone().present()],
                {
                    let mut ops = Self::create_catalog();
                    ops.extend(Self::link());
                    ops
                },
            ),
            StateDescriptor::plan(
                "ColumnPending",
                vec![catalog.present(), column.absent()],
                {
                    let mut ops = Self::create_catalog();
                    ops.push(Self::add_column());
                    ops.extend(Self::link());
                    ops
                },
            ),
            StateDescriptor::plan(
                "CatalogPending",
                vec![
                    Probe::table(PRODUCT_COMPONENTS).absent(),
                    Probe::column(PRODUCT_COMPONENT_VERSIONS, "component_type").present(),
                ],
                {
                    let mut ops = Self::create_catalog();
                    ops.push(Self::add_column());
                    ops.extend(Self::link());
                    ops
                },
            ),
        ]
    }

    fn target(&self) -> TargetState {
        TargetState::new(vec![
            Probe::column(PRODUCT_COMPONENTS, "code").present(),
            Probe::index(CATALOG_NAME_INDEX).present(),
            Probe::column(PRODUCT_COMPONENT_VERSIONS, CATALOG_FOREIGN_KEY_COLUMN).present(),
            Probe::constraint(PRODUCT_COMPONENT_VERSIONS, CATALOG_FOREIGN_KEY).present(),
        ])
    }

    fn reverse(&self) -> Vec<StateDescriptor> {
        let column = Probe::column(PRODUCT_COMPONENT_VERSIONS, CATALOG_FOREIGN_KEY_COLUMN);
        let unlink = vec![
            Operation::DropConstraint {
                table: PRODUCT_COMPONENT_VERSIONS.to_string(),
                name: CATALOG_FOREIGN_KEY.to_string(),
            },
            Operation::DropColumn {
                table: PRODUCT_COMPONENT_VERSIONS.to_string(),
                column: CATALOG_FOREIGN_KEY_COLUMN.to_string(),
            },
            Operation::DropTable {
                name: PRODUCT_COMPONENTS.to_string(),
            },
        ];

        vec![
            StateDescriptor::in_target_shape(
                "Removed",
                vec![
                    Probe::table(PRODUCT_COMPONENTS).absent(),
                    column.clone().absent(),
                ],
            ),
            StateDescriptor::plan("Linked", vec![column.present()], unlink.clone()),
            StateDescriptor::plan(
                "CatalogOnly",
                vec![Probe::column(PRODUCT_COMPONENTS, "code").present()],
                unlink,
            ),
        ]
    }

    fn reverse_target(&self) -> TargetState {
        TargetState::new(vec![
            Probe::table(PRODUCT_COMPONENTS).absent(),
            Probe::column(PRODUCT_COMPONENT_VERSIONS, CATALOG_FOREIGN_KEY_COLUMN).absent(),
        ])
    }
}

inventory::submit!(Registration::new(|| Box::new(CreateProductComponentCatalog)));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::VirtualSchema;
    use crate::{ApplyOutcome, Catalog, apply, revert};

    /// Versions still carry the enum; the catalog exists with its index.
    fn catalog_created() -> VirtualSchema {
        VirtualSchema::new()
            .with_enum_type(COMPONENT_TYPE_ENUM, &["HARDWARE"])
            .with_table(PRODUCT_COMPONENT_VERSIONS, &["id"])
            .with_enum_column(
                PRODUCT_COMPONENT_VERSIONS,
                "component_type",
                COMPONENT_TYPE_ENUM,
            )
            .with_table(PRODUCT_COMPONENTS, &["id", "code", "name"])
            .with_index(CATALOG_NAME_INDEX, PRODUCT_COMPONENTS)
    }

    fn column_added() -> VirtualSchema {
        catalog_created().with_table(PRODUCT_COMPONENT_VERSIONS, &[CATALOG_FOREIGN_KEY_COLUMN])
    }

    #[test]
    fn test_seed_sql() {
        insta::assert_snapshot!(CreateProductComponentCatalog::seed().to_sql(), @r#"INSERT INTO "product_components" (code, name) SELECT v::text, initcap(v::text) FROM unnest(enum_range(NULL::"product_components_component_type_enum")) AS v WHERE NOT EXISTS (SELECT 1 FROM "product_components" c WHERE c.code = v::text)"#);
    }

    #[tokio::test]
    async fn test_catalog_created_but_not_linked() {
        let schema = catalog_created();

        match apply(&schema, &CreateProductComponentCatalog)
            .await
            .unwrap()
        {
            ApplyOutcome::Applied {
                state,
                operations_run,
                operations_skipped,
            } => {
                assert_eq!(state, "ColumnPending");
                assert_eq!(
                    operations_skipped,
                    vec![
                        "+ table product_components",
                        "+ UNIQUE INDEX idx_product_components_name ON product_components (name)",
                    ]
                );
                assert_eq!(operations_run.len(), 4);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_column_added_but_foreign_key_missing() {
        let schema = column_added();

        match apply(&schema, &CreateProductComponentCatalog)
            .await
            .unwrap()
        {
            ApplyOutcome::Applied {
                state,
                operations_run,
                operations_skipped,
            } => {
                assert_eq!(state, "ForeignKeyPending");
                assert_eq!(
                    operations_skipped,
                    vec![
                        "+ table product_components",
                        "+ UNIQUE INDEX idx_product_components_name ON product_components (name)",
                    ]
                );
                assert_eq!(
                    operations_run,
                    vec![
                        "» seed product_components from enum literals",
                        "» fill product_component_versions.product_component_id from product_components",
                        "+ FOREIGN KEY fk_product_component_versions_product_component \
                         product_component_versions.product_component_id -> product_components.id",
                    ]
                );
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_linked_catalog_is_in_target_shape() {
        let linked = || {
            column_added().with_foreign_key(
                PRODUCT_COMPONENT_VERSIONS,
                CATALOG_FOREIGN_KEY,
                CATALOG_FOREIGN_KEY_COLUMN,
                PRODUCT_COMPONENTS,
            )
        };
        let schema = linked();

        assert_eq!(
            apply(&schema, &CreateProductComponentCatalog)
                .await
                .unwrap(),
            ApplyOutcome::AlreadyInTargetShape {
                state: "InTargetShape"
            }
        );
        // Only the ledger row was written.
        let expected = linked().with_applied(
            CreateProductComponentCatalog.name(),
            CreateProductComponentCatalog.version(),
        );
        assert_eq!(schema.snapshot(), expected.snapshot());
    }

    #[tokio::test]
    async fn test_revert_drops_unlinked_catalog() {
        let schema = catalog_created().with_applied(
            CreateProductComponentCatalog.name(),
            CreateProductComponentCatalog.version(),
        );

        let report = revert(&schema, &CreateProductComponentCatalog)
            .await
            .unwrap();
        assert_eq!(report.state, "CatalogOnly");
        assert_eq!(report.operations_run, vec!["- table product_components"]);
        assert_eq!(
            schema.snapshot().table_names(),
            vec![PRODUCT_COMPONENT_VERSIONS]
        );
        assert!(!schema.index_exists(CATALOG_NAME_INDEX).await.unwrap());
    }
}
