use super::{
    COMPONENT_TYPE_ENUM, PRODUCT_COMPONENT_TYPES, PRODUCT_COMPONENT_VERSIONS,
    create_component_type_enum,
};
use crate::{ColumnDef, Migration, Operation, Probe, Registration, StateDescriptor, TargetState};

const TYPE_FOREIGN_KEY_COLUMN: &str = "product_component_type_id";

/// Drop the enum `component_type` column now that versions reference
/// `product_component_types`, then the enum type itself.
///
/// Reverting rebuilds the column from `product_component_types.code`. Codes
/// added to the catalog after this migration have no enum literal; those rows
/// stay NULL and are reported.
pub struct DropComponentTypeEnumFromVersions;

impl DropComponentTypeEnumFromVersions {
    fn drop_column() -> Operation {
        Operation::DropColumn {
            table: PRODUCT_COMPONENT_VERSIONS.to_string(),
            column: "component_type".to_string(),
        }
    }

    fn drop_enum() -> Operation {
        Operation::DropEnumType {
            name: COMPONENT_TYPE_ENUM.to_string(),
        }
    }

    fn add_column() -> Operation {
        // Nullable: rows whose code has no literal cannot be restored.
        Operation::AddColumn {
            table: PRODUCT_COMPONENT_VERSIONS.to_string(),
            column: ColumnDef::new("component_type", COMPONENT_TYPE_ENUM).nullable(),
        }
    }

    fn restore() -> Operation {
        Operation::RestoreEnumFromCode {
            table: PRODUCT_COMPONENT_VERSIONS.to_string(),
            column: "component_type".to_string(),
            enum_type: COMPONENT_TYPE_ENUM.to_string(),
            foreign_key_column: TYPE_FOREIGN_KEY_COLUMN.to_string(),
            reference: PRODUCT_COMPONENT_TYPES.to_string(),
            reference_key: "id".to_string(),
            code_column: "code".to_string(),
        }
    }
}

impl Migration for DropComponentTypeEnumFromVersions {
    fn name(&self) -> &'static str {
        "1750000000000-DropComponentTypeEnumFromVersions"
    }

    fn version(&self) -> i64 {
        1750000000000
    }

    fn forward(&self) -> Vec<StateDescriptor> {
        let column = Probe::column(PRODUCT_COMPONENT_VERSIONS, "component_type");
        let enum_type = Probe::enum_type(COMPONENT_TYPE_ENUM);

        vec![
            StateDescriptor::in_target_shape(
                "InTargetShape",
                vec![column.clone().absent(), enum_type.clone().absent()],
            ),
            StateDescriptor::plan(
                "EnumTypeRemaining",
                vec![column.clone().absent(), enum_type.present()],
                vec![Self::drop_enum()],
            ),
            // Only drop the enum column once its meaning lives in the FK.
            StateDescriptor::plan(
                "EnumColumnPresent",
                vec![
                    column.present(),
                    Probe::column(PRODUCT_COMPONENT_VERSIONS, TYPE_FOREIGN_KEY_COLUMN).present(),
                    Probe::table(PRODUCT_COMPONENT_TYPES).present(),
                ],
                vec![Self::drop_column(), Self::drop_enum()],
            ),
        ]
    }

    fn target(&self) -> TargetState {
        TargetState::new(vec![
            Probe::column(PRODUCT_COMPONENT_VERSIONS, "component_type").absent(),
            Probe::enum_type(COMPONENT_TYPE_ENUM).absent(),
        ])
    }

    fn reverse(&self) -> Vec<StateDescriptor> {
        let column = Probe::column(PRODUCT_COMPONENT_VERSIONS, "component_type");
        let enum_type = Probe::enum_type(COMPONENT_TYPE_ENUM);

        vec![
            // Rerunning the restore only touches rows still NULL.
            StateDescriptor::plan(
                "ColumnRestored",
                vec![column.clone().present()],
                vec![Self::restore()],
            ),
            StateDescriptor::plan(
                "EnumTypeRestored",
                vec![column.clone().absent(), enum_type.clone().present()],
                vec![Self::add_column(), Self::restore()],
            ),
            StateDescriptor::plan(
                "Dropped",
                vec![column.absent(), enum_type.absent()],
                vec![
                    create_component_type_enum(),
                    Self::add_column(),
                    Self::restore(),
                ],
            ),
        ]
    }

    fn reverse_target(&self) -> TargetState {
        TargetState::new(vec![
            Probe::column(PRODUCT_COMPONENT_VERSIONS, "component_type").present(),
            Probe::enum_type(COMPONENT_TYPE_ENUM).present(),
        ])
    }

    fn lossy_revert(&self) -> bool {
        true
    }
}

inventory::submit!(Registration::new(|| Box::new(
    DropComponentTypeEnumFromVersions
)));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::VirtualSchema;
    use crate::{ApplyOutcome, LossyRestore, apply, revert};

    fn final_shape() -> VirtualSchema {
        VirtualSchema::new()
            .with_table(PRODUCT_COMPONENT_TYPES, &["id", "code", "name"])
            .with_table(PRODUCT_COMPONENT_VERSIONS, &["id", TYPE_FOREIGN_KEY_COLUMN])
    }

    #[tokio::test]
    async fn test_revert_reports_restored_column() {
        let schema = final_shape().with_applied(DropComponentTypeEnumFromVersions.name(), 1);

        let report = revert(&schema, &DropComponentTypeEnumFromVersions)
            .await
            .unwrap();
        assert_eq!(report.state, "Dropped");
        assert_eq!(
            report.lossy,
            vec![LossyRestore {
                table: PRODUCT_COMPONENT_VERSIONS.into(),
                column: "component_type".into(),
                unresolved_rows: 0,
            }]
        );
        assert!(!report.is_lossy());
        assert!(DropComponentTypeEnumFromVersions.lossy_revert());

        // Forward again from the restored shape.
        apply(&schema, &DropComponentTypeEnumFromVersions)
            .await
            .unwrap();
        let expected = final_shape().with_applied(
            DropComponentTypeEnumFromVersions.name(),
            DropComponentTypeEnumFromVersions.version(),
        );
        assert_eq!(schema.snapshot(), expected.snapshot());
    }

    #[tokio::test]
    async fn test_enum_column_without_foreign_key_is_unknown() {
        let schema = VirtualSchema::new()
            .with_enum_type(COMPONENT_TYPE_ENUM, &["HARDWARE"])
            .with_table(PRODUCT_COMPONENT_VERSIONS, &["id"])
            .with_enum_column(
                PRODUCT_COMPONENT_VERSIONS,
                "component_type",
                COMPONENT_TYPE_ENUM,
            );

        let err = apply(&schema, &DropComponentTypeEnumFromVersions)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::UnknownSchemaState { .. }));
    }

    #[tokio::test]
    async fn test_column_dropped_but_enum_type_remaining() {
        let schema = final_shape().with_enum_type(COMPONENT_TYPE_ENUM, &["HARDWARE"]);

        assert_eq!(
            apply(&schema, &DropComponentTypeEnumFromVersions)
                .await
                .unwrap(),
            ApplyOutcome::Applied {
                state: "EnumTypeRemaining",
                operations_run: vec!["- enum type product_components_component_type_enum".into()],
                operations_skipped: vec![],
            }
        );
    }

    #[tokio::test]
    async fn test_revert_with_column_already_restored() {
        let schema = final_shape()
            .with_enum_type(COMPONENT_TYPE_ENUM, &["HARDWARE"])
            .with_enum_column(
                PRODUCT_COMPONENT_VERSIONS,
                "component_type",
                COMPONENT_TYPE_ENUM,
            )
            .with_applied(
                DropComponentTypeEnumFromVersions.name(),
                DropComponentTypeEnumFromVersions.version(),
            );

        let report = revert(&schema, &DropComponentTypeEnumFromVersions)
            .await
            .unwrap();
        assert_eq!(report.state, "ColumnRestored");
        assert_eq!(
            report.operations_run,
            vec!["» restore product_component_versions.component_type from product_component_types codes"]
        );
        assert_eq!(report.lossy.len(), 1);
    }

    #[tokio::test]
    async fn test_revert_with_enum_type_already_restored() {
        let schema = final_shape()
            .with_enum_type(COMPONENT_TYPE_ENUM, &["HARDWARE"])
            .with_applied(
                DropComponentTypeEnumFromVersions.name(),
                DropComponentTypeEnumFromVersions.version(),
            );

        let report = revert(&schema, &DropComponentTypeEnumFromVersions)
            .await
            .unwrap();
        assert_eq!(report.state, "EnumTypeRestored");
        assert_eq!(
            report.operations_run,
            vec![
                "+ product_component_versions.component_type: product_components_component_type_enum (nullable)",
                "» restore product_component_versions.component_type from product_component_types codes",
            ]
        );
        assert!(!report.is_lossy());
    }
}
