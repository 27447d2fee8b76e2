//! Migration definitions and registration.

use std::collections::HashSet;

use crate::{Error, Result, StateDescriptor, TargetState};

/// A hand-written, ordered schema transformation.
///
/// Forward and reverse are each described as a list of recognizable schema
/// states (see [`crate::classify`]) plus the end shape they converge on.
pub trait Migration: Send + Sync {
    /// Globally unique name, conventionally `<version>-<Description>`.
    fn name(&self) -> &'static str;

    /// Ordering key. Migrations run in ascending order of this key.
    fn version(&self) -> i64;

    fn forward(&self) -> Vec<StateDescriptor>;

    fn target(&self) -> TargetState;

    fn reverse(&self) -> Vec<StateDescriptor>;

    fn reverse_target(&self) -> TargetState;

    /// Whether reverting can only approximate the data the forward step
    /// discarded.
    fn lossy_revert(&self) -> bool {
        false
    }
}

/// Entry in the global migration registry.
///
/// ```ignore
/// remold::inventory::submit!(Registration::new(|| Box::new(MyMigration)));
/// ```
pub struct Registration {
    build: fn() -> Box<dyn Migration>,
}

impl Registration {
    pub const fn new(build: fn() -> Box<dyn Migration>) -> Self {
        Self { build }
    }

    pub fn build(&self) -> Box<dyn Migration> {
        (self.build)()
    }
}

inventory::collect!(Registration);

/// All registered migrations, sorted by ordering key.
pub fn registered() -> Vec<Box<dyn Migration>> {
    let mut migrations: Vec<_> = inventory::iter::<Registration>
        .into_iter()
        .map(Registration::build)
        .collect();
    migrations.sort_by_key(|m| m.version());
    migrations
}

/// Check that names are unique and ordering keys strictly ascend.
pub fn validate_order(migrations: &[Box<dyn Migration>]) -> Result<()> {
    let mut names = HashSet::new();
    for migration in migrations {
        if !names.insert(migration.name()) {
            return Err(Error::InvalidDefinitions(format!(
                "duplicate migration name {}",
                migration.name()
            )));
        }
    }

    for pair in migrations.windows(2) {
        if pair[0].version() >= pair[1].version() {
            return Err(Error::InvalidDefinitions(format!(
                "{} (key {}) must come after {} (key {})",
                pair[0].name(),
                pair[0].version(),
                pair[1].name(),
                pair[1].version()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, i64);

    impl Migration for Named {
        fn name(&self) -> &'static str {
            self.0
        }
        fn version(&self) -> i64 {
            self.1
        }
        fn forward(&self) -> Vec<StateDescriptor> {
            Vec::new()
        }
        fn target(&self) -> TargetState {
            TargetState::default()
        }
        fn reverse(&self) -> Vec<StateDescriptor> {
            Vec::new()
        }
        fn reverse_target(&self) -> TargetState {
            TargetState::default()
        }
    }

    fn list(items: &[(&'static str, i64)]) -> Vec<Box<dyn Migration>> {
        items
            .iter()
            .map(|(name, version)| Box::new(Named(name, *version)) as Box<dyn Migration>)
            .collect()
    }

    #[test]
    fn test_validate_order() {
        assert!(validate_order(&list(&[("1-A", 1), ("2-B", 2)])).is_ok());
        assert!(matches!(
            validate_order(&list(&[("1-A", 1), ("1-A", 2)])),
            Err(Error::InvalidDefinitions(_))
        ));
        assert!(matches!(
            validate_order(&list(&[("1-A", 2), ("2-B", 2)])),
            Err(Error::InvalidDefinitions(_))
        ));
        assert!(matches!(
            validate_order(&list(&[("2-B", 2), ("1-A", 1)])),
            Err(Error::InvalidDefinitions(_))
        ));
    }

    #[test]
    fn test_registered_is_sorted_and_valid() {
        let migrations = registered();
        assert_eq!(migrations.len(), 5);
        validate_order(&migrations).unwrap();
        assert_eq!(
            migrations[3].name(),
            "1740000000000-RenameProductComponentsToProductComponentTypes"
        );
    }
}
