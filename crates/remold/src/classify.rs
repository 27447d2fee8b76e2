//! Schema state classification.
//!
//! A migration lists the schema shapes it knows how to handle as
//! [`StateDescriptor`]s, in priority order. Each descriptor is a conjunction of
//! catalog [`Condition`]s plus the [`Action`] to take when it matches.
//! [`classify`] evaluates the descriptors in order and returns the first one
//! whose conditions all hold.
//!
//! ```text
//! Ambiguous                  product_components present, product_component_types present
//! InTargetShape              product_components absent,  product_component_types present, ...
//! RenamedPendingForeignKeys  product_components absent,  product_component_types present, idx_* present
//! OldName                    product_components present, product_component_types absent
//! ```
//!
//! Anything else is [`Classification::Unknown`]: a shape nobody anticipated,
//! which the executor refuses to touch.

use std::fmt;

use indexmap::IndexMap;

use crate::{Catalog, Operation, Result};

/// One catalog question.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Probe {
    Table(String),
    Column { table: String, column: String },
    Index(String),
    Constraint { table: String, name: String },
    EnumType(String),
}

impl Probe {
    pub fn table(name: impl Into<String>) -> Self {
        Probe::Table(name.into())
    }

    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Probe::Column {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn index(name: impl Into<String>) -> Self {
        Probe::Index(name.into())
    }

    pub fn constraint(table: impl Into<String>, name: impl Into<String>) -> Self {
        Probe::Constraint {
            table: table.into(),
            name: name.into(),
        }
    }

    pub fn enum_type(name: impl Into<String>) -> Self {
        Probe::EnumType(name.into())
    }

    /// Condition that holds when the object exists.
    pub fn present(self) -> Condition {
        Condition {
            probe: self,
            present: true,
        }
    }

    /// Condition that holds when the object does not exist.
    pub fn absent(self) -> Condition {
        Condition {
            probe: self,
            present: false,
        }
    }

    /// Ask the catalog whether the object exists.
    pub async fn observe<C: Catalog + ?Sized>(&self, catalog: &C) -> Result<bool> {
        match self {
            Probe::Table(name) => catalog.table_exists(name).await,
            Probe::Column { table, column } => catalog.column_exists(table, column).await,
            Probe::Index(name) => catalog.index_exists(name).await,
            Probe::Constraint { table, name } => catalog.constraint_exists(table, name).await,
            Probe::EnumType(name) => catalog.enum_type_exists(name).await,
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probe::Table(name) => write!(f, "table {}", name),
            Probe::Column { table, column } => write!(f, "column {}.{}", table, column),
            Probe::Index(name) => write!(f, "index {}", name),
            Probe::Constraint { table, name } => write!(f, "constraint {}.{}", table, name),
            Probe::EnumType(name) => write!(f, "enum type {}", name),
        }
    }
}

/// A probe together with the answer it must produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub probe: Probe,
    pub present: bool,
}

impl Condition {
    pub async fn holds<C: Catalog + ?Sized>(&self, catalog: &C) -> Result<bool> {
        Ok(self.probe.observe(catalog).await? == self.present)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = if self.present { "present" } else { "absent" };
        write!(f, "{} {}", self.probe, word)
    }
}

/// What to do once a state is recognized.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Run these operations in order; each is still guarded individually.
    Plan(Vec<Operation>),
    /// Nothing to do. The migration is recorded as applied.
    InTargetShape,
    /// Both the old and the new shape exist and the migration cannot tell
    /// which one holds the truth.
    Ambiguous { detail: String },
}

/// A named, recognizable schema shape.
#[derive(Debug, Clone, PartialEq)]
pub struct StateDescriptor {
    pub name: &'static str,
    pub when: Vec<Condition>,
    pub action: Action,
}

impl StateDescriptor {
    pub fn plan(name: &'static str, when: Vec<Condition>, operations: Vec<Operation>) -> Self {
        Self {
            name,
            when,
            action: Action::Plan(operations),
        }
    }

    pub fn in_target_shape(name: &'static str, when: Vec<Condition>) -> Self {
        Self {
            name,
            when,
            action: Action::InTargetShape,
        }
    }

    pub fn ambiguous(name: &'static str, when: Vec<Condition>, detail: impl Into<String>) -> Self {
        Self {
            name,
            when,
            action: Action::Ambiguous {
                detail: detail.into(),
            },
        }
    }

    /// Operations attached to this state, empty unless the action is a plan.
    pub fn operations(&self) -> &[Operation] {
        match &self.action {
            Action::Plan(ops) => ops,
            _ => &[],
        }
    }
}

/// Result of [`classify`].
#[derive(Debug)]
pub enum Classification<'d> {
    Known(&'d StateDescriptor),
    /// No descriptor matched. Carries every probe evaluated along the way, in
    /// evaluation order, for the operator.
    Unknown(Vec<(Probe, bool)>),
}

impl Classification<'_> {
    /// Render the observations of an unknown classification, `"table a present, ..."`.
    pub fn describe_observed(observed: &[(Probe, bool)]) -> String {
        observed
            .iter()
            .map(|(probe, present)| {
                let word = if *present { "present" } else { "absent" };
                format!("{} {}", probe, word)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Return the first descriptor whose conditions all hold.
///
/// Each distinct probe hits the catalog at most once per call.
pub async fn classify<'d, C: Catalog + ?Sized>(
    catalog: &C,
    states: &'d [StateDescriptor],
) -> Result<Classification<'d>> {
    let mut observed: IndexMap<&'d Probe, bool> = IndexMap::new();

    'states: for state in states {
        for condition in &state.when {
            let present = match observed.get(&condition.probe) {
                Some(present) => *present,
                None => {
                    let present = condition.probe.observe(catalog).await?;
                    observed.insert(&condition.probe, present);
                    present
                }
            };
            if present != condition.present {
                continue 'states;
            }
        }
        return Ok(Classification::Known(state));
    }

    Ok(Classification::Unknown(
        observed
            .into_iter()
            .map(|(probe, present)| (probe.clone(), present))
            .collect(),
    ))
}

/// The declarative end shape of a migration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetState {
    pub conditions: Vec<Condition>,
}

impl TargetState {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    /// Conditions that do not currently hold.
    pub async fn unmet<C: Catalog + ?Sized>(&self, catalog: &C) -> Result<Vec<&Condition>> {
        let mut unmet = Vec::new();
        for condition in &self.conditions {
            if !condition.holds(catalog).await? {
                unmet.push(condition);
            }
        }
        Ok(unmet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::VirtualSchema;

    fn states() -> Vec<StateDescriptor> {
        vec![
            StateDescriptor::ambiguous(
                "Both",
                vec![
                    Probe::table("old").present(),
                    Probe::table("new").present(),
                ],
                "old and new both exist",
            ),
            StateDescriptor::in_target_shape(
                "Done",
                vec![Probe::table("old").absent(), Probe::table("new").present()],
            ),
            StateDescriptor::plan(
                "Pending",
                vec![Probe::table("old").present(), Probe::table("new").absent()],
                vec![Operation::RenameTable {
                    from: "old".into(),
                    to: "new".into(),
                }],
            ),
        ]
    }

    #[tokio::test]
    async fn test_classify_returns_first_match() {
        let states = states();

        let schema = VirtualSchema::new().with_table("old", &["id"]);
        match classify(&schema, &states).await.unwrap() {
            Classification::Known(state) => assert_eq!(state.name, "Pending"),
            other => panic!("expected Pending, got {:?}", other),
        }

        let schema = VirtualSchema::new()
            .with_table("old", &["id"])
            .with_table("new", &["id"]);
        match classify(&schema, &states).await.unwrap() {
            Classification::Known(state) => assert_eq!(state.name, "Both"),
            other => panic!("expected Both, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_classify_unknown_reports_observations() {
        let states = states();
        let schema = VirtualSchema::new();

        match classify(&schema, &states).await.unwrap() {
            Classification::Unknown(observed) => {
                assert_eq!(
                    Classification::describe_observed(&observed),
                    "table old absent, table new absent"
                );
            }
            other => panic!("expected Unknown, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_target_state_unmet() {
        let schema = VirtualSchema::new().with_table("new", &["id"]);
        let target = TargetState::new(vec![
            Probe::table("new").present(),
            Probe::column("new", "code").present(),
            Probe::table("old").absent(),
        ]);

        let unmet = target.unmet(&schema).await.unwrap();
        assert_eq!(unmet.len(), 1);
        assert_eq!(unmet[0].to_string(), "column new.code present");
    }

    #[test]
    fn test_condition_display() {
        assert_eq!(
            Probe::constraint("product_component_versions", "fk_x")
                .absent()
                .to_string(),
            "constraint product_component_versions.fk_x absent"
        );
        assert_eq!(
            Probe::enum_type("product_components_component_type_enum")
                .present()
                .to_string(),
            "enum type product_components_component_type_enum present"
        );
    }
}
