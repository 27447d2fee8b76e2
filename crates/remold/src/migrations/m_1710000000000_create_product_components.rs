use super::{
    COMPONENT_TYPE_ENUM, PRODUCT_COMPONENT_VERSIONS, PRODUCT_COMPONENTS,
    component_version_columns, create_component_type_enum,
};
use crate::{Migration, Operation, Probe, Registration, StateDescriptor, TargetState};

/// Create the original per-version `product_components` table and its
/// component type enum.
pub struct CreateProductComponents;

impl CreateProductComponents {
    fn create_table() -> Operation {
        Operation::CreateTable {
            name: PRODUCT_COMPONENTS.to_string(),
            columns: component_version_columns(),
        }
    }
}

impl Migration for CreateProductComponents {
    fn name(&self) -> &'static str {
        "1710000000000-CreateProductComponents"
    }

    fn version(&self) -> i64 {
        1710000000000
    }

    fn forward(&self) -> Vec<StateDescriptor> {
        vec![
            StateDescriptor::in_target_shape(
                "InTargetShape",
                vec![
                    Probe::column(PRODUCT_COMPONENTS, "component_type").present(),
                    Probe::enum_type(COMPONENT_TYPE_ENUM).present(),
                ],
            ),
            // Rows already live in product_component_versions.
            StateDescriptor::in_target_shape(
                "Superseded",
                vec![Probe::table(PRODUCT_COMPONENT_VERSIONS).present()],
            ),
            StateDescriptor::plan(
                "EnumOnly",
                vec![
                    Probe::table(PRODUCT_COMPONENTS).absent(),
                    Probe::enum_type(COMPONENT_TYPE_ENUM).present(),
                ],
                vec![Self::create_table()],
            ),
            StateDescriptor::plan(
                "Fresh",
                vec![
                    Probe::table(PRODUCT_COMPONENTS).absent(),
                    Probe::enum_type(COMPONENT_TYPE_ENUM).absent(),
                ],
                vec![create_component_type_enum(), Self::create_table()],
            ),
        ]
    }

    fn target(&self) -> TargetState {
        TargetState::new(vec![
            Probe::column(PRODUCT_COMPONENTS, "component_type").present(),
            Probe::enum_type(COMPONENT_TYPE_ENUM).present(),
        ])
    }

    fn reverse(&self) -> Vec<StateDescriptor> {
        let drop = vec![
            Operation::DropTable {
                name: PRODUCT_COMPONENTS.to_string(),
            },
            Operation::DropEnumType {
                name: COMPONENT_TYPE_ENUM.to_string(),
            },
        ];
        vec![
            StateDescriptor::in_target_shape(
                "Removed",
                vec![
                    Probe::table(PRODUCT_COMPONENTS).absent(),
                    Probe::enum_type(COMPONENT_TYPE_ENUM).absent(),
                ],
            ),
            StateDescriptor::plan(
                "Present",
                vec![Probe::column(PRODUCT_COMPONENTS, "component_type").present()],
                drop.clone(),
            ),
            StateDescriptor::plan(
                "EnumOnly",
                vec![
                    Probe::table(PRODUCT_COMPONENTS).absent(),
                    Probe::enum_type(COMPONENT_TYPE_ENUM).present(),
                ],
                drop,
            ),
        ]
    }

    fn reverse_target(&self) -> TargetState {
        TargetState::new(vec![
            Probe::table(PRODUCT_COMPONENTS).absent(),
            Probe::enum_type(COMPONENT_TYPE_ENUM).absent(),
        ])
    }
}

inventory::submit!(Registration::new(|| Box::new(CreateProductComponents)));

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::VirtualSchema;
    use crate::{ApplyOutcome, apply, revert};

    #[tokio::test]
    async fn test_enum_left_by_earlier_attempt() {
        let schema = VirtualSchema::new().with_enum_type(COMPONENT_TYPE_ENUM, &["HARDWARE"]);

        match apply(&schema, &CreateProductComponents).await.unwrap() {
            ApplyOutcome::Applied {
                state,
                operations_run,
                ..
            } => {
                assert_eq!(state, "EnumOnly");
                assert_eq!(operations_run, vec!["+ table product_components"]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_catalog_shape_is_not_mistaken_for_target() {
        // The later catalog table reuses the name but has no component_type.
        let schema = VirtualSchema::new()
            .with_enum_type(COMPONENT_TYPE_ENUM, &["HARDWARE"])
            .with_table(PRODUCT_COMPONENTS, &["id", "code", "name"])
            .with_table(PRODUCT_COMPONENT_VERSIONS, &["id"]);

        assert_eq!(
            apply(&schema, &CreateProductComponents).await.unwrap(),
            ApplyOutcome::AlreadyInTargetShape { state: "Superseded" }
        );
    }

    #[tokio::test]
    async fn test_revert_drops_enum_left_without_table() {
        let schema = VirtualSchema::new()
            .with_enum_type(COMPONENT_TYPE_ENUM, &["HARDWARE"])
            .with_applied(CreateProductComponents.name(), CreateProductComponents.version());

        let report = revert(&schema, &CreateProductComponents).await.unwrap();
        assert_eq!(report.state, "EnumOnly");
        assert_eq!(
            report.operations_run,
            vec!["- enum type product_components_component_type_enum"]
        );
        assert_eq!(schema.snapshot(), VirtualSchema::new().snapshot());
    }
}
