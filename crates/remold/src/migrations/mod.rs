//! The product-component entity history.
//!
//! | Version         | Migration                                          |
//! |-----------------|----------------------------------------------------|
//! | `1710000000000` | [`CreateProductComponents`]                        |
//! | `1720000000000` | [`MoveProductComponentsToVersions`]                |
//! | `1730000000000` | [`CreateProductComponentCatalog`]                  |
//! | `1740000000000` | [`RenameProductComponentsToProductComponentTypes`] |
//! | `1750000000000` | [`DropComponentTypeEnumFromVersions`]              |
//!
//! `product_components` means two different things over this history: the
//! original per-version table (with an enum `component_type` column) until
//! 1720000000000 moves it to `product_component_versions`, then the catalog
//! of component types (with a `code` column) that 1730000000000 creates and
//! 1740000000000 renames. States tell the two apart by their columns.

mod m_1710000000000_create_product_components;
mod m_1720000000000_move_product_components_to_versions;
mod m_1730000000000_create_product_component_catalog;
mod m_1740000000000_rename_product_components_to_product_component_types;
mod m_1750000000000_drop_component_type_enum_from_versions;

pub use m_1710000000000_create_product_components::CreateProductComponents;
pub use m_1720000000000_move_product_components_to_versions::MoveProductComponentsToVersions;
pub use m_1730000000000_create_product_component_catalog::CreateProductComponentCatalog;
pub use m_1740000000000_rename_product_components_to_product_component_types::RenameProductComponentsToProductComponentTypes;
pub use m_1750000000000_drop_component_type_enum_from_versions::DropComponentTypeEnumFromVersions;

use crate::{ColumnDef, Operation};

pub const PRODUCT_COMPONENTS: &str = "product_components";
pub const PRODUCT_COMPONENT_VERSIONS: &str = "product_component_versions";
pub const PRODUCT_COMPONENT_TYPES: &str = "product_component_types";
pub const COMPONENT_TYPE_ENUM: &str = "product_components_component_type_enum";
pub const COMPONENT_TYPES: [&str; 3] = ["HARDWARE", "SOFTWARE", "DOCUMENTATION"];

fn create_component_type_enum() -> Operation {
    Operation::CreateEnumType {
        name: COMPONENT_TYPE_ENUM.to_string(),
        variants: COMPONENT_TYPES.iter().map(|v| v.to_string()).collect(),
    }
}

/// Columns of a per-version component row, shared by the original
/// `product_components` table and `product_component_versions`.
fn component_version_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new("id", "SERIAL").primary_key(),
        ColumnDef::new("name", "VARCHAR(255)"),
        ColumnDef::new("version", "VARCHAR(50)"),
        ColumnDef::new("component_type", COMPONENT_TYPE_ENUM),
        ColumnDef::new("created_at", "TIMESTAMPTZ").default_expr("now()"),
    ]
}

/// Copy per-version rows from `source` to `target` by primary key, then move
/// `target`'s id sequence past the copied keys.
fn move_rows(source: &str, target: &str) -> Vec<Operation> {
    vec![
        Operation::Backfill {
            source: source.to_string(),
            target: target.to_string(),
            key: "id".to_string(),
            columns: component_version_columns()
                .into_iter()
                .map(|c| c.name)
                .collect(),
        },
        Operation::ResyncSequence {
            table: target.to_string(),
            column: "id".to_string(),
        },
    ]
}
