use super::{PRODUCT_COMPONENT_VERSIONS, PRODUCT_COMPONENTS, component_version_columns, move_rows};
use crate::{Migration, Operation, Probe, Registration, StateDescriptor, TargetState};

/// Move per-version rows from `product_components` into
/// `product_component_versions`, freeing the old name.
///
/// A crash between creating the new table and dropping the old one used to
/// leave both tables behind. That shape is recognized as `BothPresent`: only
/// rows whose id is missing from the new table are copied, then the old table
/// is dropped.
pub struct MoveProductComponentsToVersions;

fn create_table(name: &str) -> Operation {
    Operation::CreateTable {
        name: name.to_string(),
        columns: component_version_columns(),
    }
}

fn drop_table(name: &str) -> Operation {
    Operation::DropTable {
        name: name.to_string(),
    }
}

/// `from` holds the rows, `to` is created if needed and receives them.
fn move_table(from: &str, to: &str) -> Vec<Operation> {
    let mut ops = vec![create_table(to)];
    ops.extend(move_rows(from, to));
    ops.push(drop_table(from));
    ops
}

impl Migration for MoveProductComponentsToVersions {
    fn name(&self) -> &'static str {
        "1720000000000-MoveProductComponentsToVersions"
    }

    fn version(&self) -> i64 {
        1720000000000
    }

    fn forward(&self) -> Vec<StateDescriptor> {
        let old_shape = Probe::column(PRODUCT_COMPONENTS, "component_type");
        vec![
            StateDescriptor::plan(
                "BothPresent",
                vec![
                    old_shape.clone().present(),
                    Probe::table(PRODUCT_COMPONENT_VERSIONS).present(),
                ],
                move_table(PRODUCT_COMPONENTS, PRODUCT_COMPONENT_VERSIONS),
            ),
            // The old name may since have been reused for the catalog table.
            StateDescriptor::in_target_shape(
                "InTargetShape",
                vec![
                    old_shape.clone().absent(),
                    Probe::table(PRODUCT_COMPONENT_VERSIONS).present(),
                ],
            ),
            StateDescriptor::plan(
                "OldOnly",
                vec![
                    old_shape.present(),
                    Probe::table(PRODUCT_COMPONENT_VERSIONS).absent(),
                ],
                move_table(PRODUCT_COMPONENTS, PRODUCT_COMPONENT_VERSIONS),
            ),
        ]
    }

    fn target(&self) -> TargetState {
        TargetState::new(vec![
            Probe::column(PRODUCT_COMPONENTS, "component_type").absent(),
            Probe::table(PRODUCT_COMPONENT_VERSIONS).present(),
        ])
    }

    fn reverse(&self) -> Vec<StateDescriptor> {
        let old_shape = Probe::column(PRODUCT_COMPONENTS, "component_type");
        vec![
            StateDescriptor::plan(
                "BothPresent",
                vec![
                    old_shape.clone().present(),
                    Probe::table(PRODUCT_COMPONENT_VERSIONS).present(),
                ],
                move_table(PRODUCT_COMPONENT_VERSIONS, PRODUCT_COMPONENTS),
            ),
            StateDescriptor::in_target_shape(
                "Restored",
                vec![
                    old_shape.present(),
                    Probe::table(PRODUCT_COMPONENT_VERSIONS).absent(),
                ],
            ),
            StateDescriptor::plan(
                "VersionsOnly",
                vec![
                    Probe::table(PRODUCT_COMPONENTS).absent(),
                    Probe::table(PRODUCT_COMPONENT_VERSIONS).present(),
                ],
                move_table(PRODUCT_COMPONENT_VERSIONS, PRODUCT_COMPONENTS),
            ),
        ]
    }

    fn reverse_target(&self) -> TargetState {
        TargetState::new(vec![
            Probe::column(PRODUCT_COMPONENTS, "component_type").present(),
            Probe::table(PRODUCT_COMPONENT_VERSIONS).absent(),
        ])
    }
}

inventory::submit!(Registration::new(|| Box::new(MoveProductComponentsToVersions)));
