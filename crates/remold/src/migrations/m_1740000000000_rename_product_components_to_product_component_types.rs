use super::m_1730000000000_create_product_component_catalog::{
    CATALOG_FOREIGN_KEY, CATALOG_FOREIGN_KEY_COLUMN, CATALOG_NAME_INDEX,
};
use super::{PRODUCT_COMPONENT_TYPES, PRODUCT_COMPONENT_VERSIONS, PRODUCT_COMPONENTS};
use crate::{
    DependentReference, EntityRename, ForeignKeyRef, Migration, ReferentialAction, Registration,
    SchemaEntity, StateDescriptor, TargetState,
};

/// Rename the catalog to `product_component_types`, together with its name
/// index and the foreign key (and FK column) on `product_component_versions`.
pub struct RenameProductComponentsToProductComponentTypes;

impl RenameProductComponentsToProductComponentTypes {
    pub fn rename() -> EntityRename {
        EntityRename::new(
            SchemaEntity::new("component type catalog", PRODUCT_COMPONENTS)
                .with_index(CATALOG_NAME_INDEX),
            SchemaEntity::new("component type catalog", PRODUCT_COMPONENT_TYPES)
                .with_index("idx_product_component_types_name"),
        )
        .with_dependent(DependentReference {
            table: PRODUCT_COMPONENT_VERSIONS.to_string(),
            from: ForeignKeyRef::new(CATALOG_FOREIGN_KEY_COLUMN, CATALOG_FOREIGN_KEY),
            to: ForeignKeyRef::new(
                "product_component_type_id",
                "fk_product_component_versions_product_component_type",
            ),
            references_column: "id".to_string(),
            on_delete: ReferentialAction::SetNull,
        })
    }
}

impl Migration for RenameProductComponentsToProductComponentTypes {
    fn name(&self) -> &'static str {
        "1740000000000-RenameProductComponentsToProductComponentTypes"
    }

    fn version(&self) -> i64 {
        1740000000000
    }

    fn forward(&self) -> Vec<StateDescriptor> {
        Self::rename().states()
    }

    fn target(&self) -> TargetState {
        Self::rename().target()
    }

    fn reverse(&self) -> Vec<StateDescriptor> {
        Self::rename().inverse().states()
    }

    fn reverse_target(&self) -> TargetState {
        Self::rename().inverse().target()
    }
}

inventory::submit!(Registration::new(|| Box::new(
    RenameProductComponentsToProductComponentTypes
)));
