//! In-memory schema simulation.
//!
//! [`VirtualSchema`] implements the same [`Session`](crate::Session) seam as a
//! Postgres transaction, so classification, guarded execution and ledger
//! bookkeeping can be exercised without a database. It tracks structure
//! (tables, columns, indexes, constraints, enum types), the primary keys of
//! rows so backfills can be checked for duplicates, and the ledger.
//!
//! Operations are validated the way Postgres would validate them: renaming a
//! table onto an existing name, dropping a table that is still referenced, or
//! dropping an enum type that a column still uses are all rejected with a
//! [`SimulationError`]. Data rewrites (`UPDATE`s, hand-written SQL) have no
//! structural effect and are accepted as no-ops.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::{AppliedMigration, BoxFuture, Catalog, Error, Ledger, Operation, Result, Session};

/// Error when an operation cannot be applied to the virtual schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimulationError {
    #[error("{operation}: {kind} '{name}' does not exist")]
    NotFound {
        operation: String,
        kind: &'static str,
        name: String,
    },
    #[error("{operation}: {kind} '{name}' already exists")]
    AlreadyExists {
        operation: String,
        kind: &'static str,
        name: String,
    },
    #[error("{operation}: '{name}' is still used by {}", dependents.join(", "))]
    Dependents {
        operation: String,
        name: String,
        dependents: Vec<String>,
    },
    #[error("{operation}: injected failure")]
    Injected { operation: String },
}

impl From<SimulationError> for Error {
    fn from(err: SimulationError) -> Self {
        Error::Backend(Box::new(err))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct VirtualConstraint {
    column: Option<String>,
    references: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct VirtualTable {
    /// Column name to enum type, when the column is enum-typed.
    columns: BTreeMap<String, Option<String>>,
    constraints: BTreeMap<String, VirtualConstraint>,
    rows: BTreeSet<i64>,
}

/// Complete state of a [`VirtualSchema`]. Two equal snapshots describe the same
/// schema, the same row keys and the same ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    tables: BTreeMap<String, VirtualTable>,
    /// Index name to owning table.
    indexes: BTreeMap<String, String>,
    enum_types: BTreeMap<String, Vec<String>>,
    ledger: BTreeMap<String, i64>,
}

impl Snapshot {
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }
}

/// Virtual schema state for simulating migrations.
#[derive(Debug, Default)]
pub struct VirtualSchema {
    state: Mutex<Snapshot>,
    fail_on: Mutex<Option<String>>,
}

impl VirtualSchema {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Snapshot> {
        // A poisoned lock only means a test panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a table with untyped columns. A column named `id` gets a primary key.
    pub fn with_table(self, name: &str, columns: &[&str]) -> Self {
        {
            let mut state = self.state();
            let table = state.tables.entry(name.to_string()).or_default();
            for column in columns {
                table.columns.insert(column.to_string(), None);
                if *column == "id" {
                    table
                        .constraints
                        .insert(format!("{}_pkey", name), VirtualConstraint::default());
                }
            }
        }
        self
    }

    /// Add an enum-typed column to an existing table.
    pub fn with_enum_column(self, table: &str, column: &str, enum_type: &str) -> Self {
        self.state()
            .tables
            .entry(table.to_string())
            .or_default()
            .columns
            .insert(column.to_string(), Some(enum_type.to_string()));
        self
    }

    pub fn with_index(self, name: &str, table: &str) -> Self {
        self.state()
            .indexes
            .insert(name.to_string(), table.to_string());
        self
    }

    pub fn with_foreign_key(self, table: &str, name: &str, column: &str, references: &str) -> Self {
        self.state()
            .tables
            .entry(table.to_string())
            .or_default()
            .constraints
            .insert(
                name.to_string(),
                VirtualConstraint {
                    column: Some(column.to_string()),
                    references: Some(references.to_string()),
                },
            );
        self
    }

    pub fn with_enum_type(self, name: &str, variants: &[&str]) -> Self {
        self.state().enum_types.insert(
            name.to_string(),
            variants.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    pub fn with_rows(self, table: &str, keys: impl IntoIterator<Item = i64>) -> Self {
        self.state()
            .tables
            .entry(table.to_string())
            .or_default()
            .rows
            .extend(keys);
        self
    }

    pub fn with_applied(self, name: &str, version: i64) -> Self {
        self.state().ledger.insert(name.to_string(), version);
        self
    }

    /// Make the next operation whose display matches `operation` fail.
    pub fn fail_on(&self, operation: impl Into<String>) {
        *self.fail_on.lock().unwrap_or_else(|e| e.into_inner()) = Some(operation.into());
    }

    /// Capture the full state, e.g. to roll back after a failed apply.
    pub fn snapshot(&self) -> Snapshot {
        self.state().clone()
    }

    pub fn restore(&self, snapshot: Snapshot) {
        *self.state() = snapshot;
    }

    /// Primary keys currently stored in `table`.
    pub fn rows(&self, table: &str) -> Vec<i64> {
        self.state()
            .tables
            .get(table)
            .map(|t| t.rows.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Apply an operation, validating its preconditions.
    pub fn apply(&self, op: &Operation) -> std::result::Result<u64, SimulationError> {
        let desc = op.to_string();

        {
            let mut fail_on = self.fail_on.lock().unwrap_or_else(|e| e.into_inner());
            if fail_on.as_deref() == Some(desc.as_str()) {
                *fail_on = None;
                return Err(SimulationError::Injected { operation: desc });
            }
        }

        let mut state = self.state();
        let not_found = |kind: &'static str, name: &str| SimulationError::NotFound {
            operation: desc.clone(),
            kind,
            name: name.to_string(),
        };
        let exists = |kind: &'static str, name: &str| SimulationError::AlreadyExists {
            operation: desc.clone(),
            kind,
            name: name.to_string(),
        };

        match op {
            Operation::CreateEnumType { name, variants } => {
                if state.enum_types.contains_key(name) {
                    return Err(exists("enum type", name));
                }
                state.enum_types.insert(name.clone(), variants.clone());
                Ok(0)
            }

            Operation::DropEnumType { name } => {
                if !state.enum_types.contains_key(name) {
                    return Err(not_found("enum type", name));
                }
                let dependents = state.enum_dependents(name);
                if !dependents.is_empty() {
                    return Err(SimulationError::Dependents {
                        operation: desc.clone(),
                        name: name.clone(),
                        dependents,
                    });
                }
                state.enum_types.remove(name);
                Ok(0)
            }

            Operation::CreateTable { name, columns } => {
                if state.tables.contains_key(name) {
                    return Err(exists("table", name));
                }
                let mut table = VirtualTable::default();
                for column in columns {
                    let enum_type = state
                        .enum_types
                        .contains_key(&column.ty)
                        .then(|| column.ty.clone());
                    table.columns.insert(column.name.clone(), enum_type);
                    if column.primary_key {
                        table
                            .constraints
                            .insert(format!("{}_pkey", name), VirtualConstraint::default());
                    }
                }
                state.tables.insert(name.clone(), table);
                Ok(0)
            }

            Operation::DropTable { name } => {
                if !state.tables.contains_key(name) {
                    return Err(not_found("table", name));
                }
                let referencing = state.referencing(name);
                if !referencing.is_empty() {
                    return Err(SimulationError::Dependents {
                        operation: desc.clone(),
                        name: name.clone(),
                        dependents: referencing,
                    });
                }
                state.tables.remove(name);
                state.indexes.retain(|_, table| table != name);
                Ok(0)
            }

            Operation::RenameTable { from, to } => {
                if !state.tables.contains_key(from) {
                    return Err(not_found("table", from));
                }
                if state.tables.contains_key(to) {
                    return Err(exists("table", to));
                }
                if let Some(table) = state.tables.remove(from) {
                    state.tables.insert(to.clone(), table);
                }
                for table in state.indexes.values_mut() {
                    if table == from {
                        *table = to.clone();
                    }
                }
                for table in state.tables.values_mut() {
                    for constraint in table.constraints.values_mut() {
                        if constraint.references.as_deref() == Some(from.as_str()) {
                            constraint.references = Some(to.clone());
                        }
                    }
                }
                Ok(0)
            }

            Operation::AddColumn { table, column } => {
                let enum_type = state
                    .enum_types
                    .contains_key(&column.ty)
                    .then(|| column.ty.clone());
                let t = state
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| not_found("table", table))?;
                if t.columns.contains_key(&column.name) {
                    return Err(exists("column", &format!("{}.{}", table, column.name)));
                }
                t.columns.insert(column.name.clone(), enum_type);
                Ok(0)
            }

            Operation::DropColumn { table, column } => {
                let t = state
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| not_found("table", table))?;
                if t.columns.remove(column).is_none() {
                    return Err(not_found("column", &format!("{}.{}", table, column)));
                }
                // Postgres drops constraints that involve the column.
                t.constraints
                    .retain(|_, c| c.column.as_deref() != Some(column.as_str()));
                Ok(0)
            }

            Operation::RenameColumn { table, from, to } => {
                let t = state
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| not_found("table", table))?;
                if t.columns.contains_key(to) {
                    return Err(exists("column", &format!("{}.{}", table, to)));
                }
                let enum_type = t
                    .columns
                    .remove(from)
                    .ok_or_else(|| not_found("column", &format!("{}.{}", table, from)))?;
                t.columns.insert(to.clone(), enum_type);
                for constraint in t.constraints.values_mut() {
                    if constraint.column.as_deref() == Some(from.as_str()) {
                        constraint.column = Some(to.clone());
                    }
                }
                Ok(0)
            }

            Operation::CreateIndex { name, table, .. } => {
                if !state.tables.contains_key(table) {
                    return Err(not_found("table", table));
                }
                if state.indexes.contains_key(name) {
                    return Err(exists("index", name));
                }
                state.indexes.insert(name.clone(), table.clone());
                Ok(0)
            }

            Operation::RenameIndex { from, to } => {
                if state.indexes.contains_key(to) {
                    return Err(exists("index", to));
                }
                let table = state
                    .indexes
                    .remove(from)
                    .ok_or_else(|| not_found("index", from))?;
                state.indexes.insert(to.clone(), table);
                Ok(0)
            }

            Operation::DropIndex { name } => {
                state
                    .indexes
                    .remove(name)
                    .ok_or_else(|| not_found("index", name))?;
                Ok(0)
            }

            Operation::AddForeignKey {
                table,
                name,
                column,
                references_table,
                ..
            } => {
                if !state.tables.contains_key(references_table) {
                    return Err(not_found("table", references_table));
                }
                let t = state
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| not_found("table", table))?;
                if !t.columns.contains_key(column) {
                    return Err(not_found("column", &format!("{}.{}", table, column)));
                }
                if t.constraints.contains_key(name) {
                    return Err(exists("constraint", name));
                }
                t.constraints.insert(
                    name.clone(),
                    VirtualConstraint {
                        column: Some(column.clone()),
                        references: Some(references_table.clone()),
                    },
                );
                Ok(0)
            }

            Operation::DropConstraint { table, name } => {
                let t = state
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| not_found("table", table))?;
                t.constraints
                    .remove(name)
                    .ok_or_else(|| not_found("constraint", name))?;
                Ok(0)
            }

            Operation::Backfill { source, target, .. } => {
                let rows = state
                    .tables
                    .get(source)
                    .ok_or_else(|| not_found("table", source))?
                    .rows
                    .clone();
                let t = state
                    .tables
                    .get_mut(target)
                    .ok_or_else(|| not_found("table", target))?;
                let before = t.rows.len();
                t.rows.extend(rows);
                Ok((t.rows.len() - before) as u64)
            }

            Operation::ResyncSequence { table, .. } => {
                if !state.tables.contains_key(table) {
                    return Err(not_found("table", table));
                }
                Ok(1)
            }

            Operation::SetFromReference {
                table, reference, ..
            }
            | Operation::RestoreEnumFromCode {
                table, reference, ..
            } => {
                if !state.tables.contains_key(reference) {
                    return Err(not_found("table", reference));
                }
                if !state.tables.contains_key(table) {
                    return Err(not_found("table", table));
                }
                Ok(0)
            }

            Operation::Sql { .. } => Ok(0),
        }
    }
}

impl Snapshot {
    fn enum_dependents(&self, enum_type: &str) -> Vec<String> {
        let mut dependents = Vec::new();
        for (table_name, table) in &self.tables {
            for (column, ty) in &table.columns {
                if ty.as_deref() == Some(enum_type) {
                    dependents.push(format!("{}.{}", table_name, column));
                }
            }
        }
        dependents
    }

    fn referencing(&self, table: &str) -> Vec<String> {
        let mut referencing = Vec::new();
        for (table_name, t) in &self.tables {
            if table_name == table {
                continue;
            }
            for (name, constraint) in &t.constraints {
                if constraint.references.as_deref() == Some(table) {
                    referencing.push(format!("{}.{}", table_name, name));
                }
            }
        }
        referencing
    }
}

fn ready<'a, T: Send + 'a>(value: T) -> BoxFuture<'a, T> {
    Box::pin(std::future::ready(value))
}

impl Catalog for VirtualSchema {
    fn table_exists<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<bool>> {
        ready(Ok(self.state().tables.contains_key(table)))
    }

    fn column_exists<'a>(
        &'a self,
        table: &'a str,
        column: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        let exists = self
            .state()
            .tables
            .get(table)
            .is_some_and(|t| t.columns.contains_key(column));
        ready(Ok(exists))
    }

    fn index_exists<'a>(&'a self, index: &'a str) -> BoxFuture<'a, Result<bool>> {
        ready(Ok(self.state().indexes.contains_key(index)))
    }

    fn constraint_exists<'a>(
        &'a self,
        table: &'a str,
        constraint: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        let exists = self
            .state()
            .tables
            .get(table)
            .is_some_and(|t| t.constraints.contains_key(constraint));
        ready(Ok(exists))
    }

    fn enum_type_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        ready(Ok(self.state().enum_types.contains_key(name)))
    }

    fn enum_type_dependents<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        ready(Ok(self.state().enum_dependents(name)))
    }

    fn row_count<'a>(&'a self, table: &'a str) -> BoxFuture<'a, Result<i64>> {
        let count = self.state().tables.get(table).map(|t| t.rows.len() as i64);
        ready(count.ok_or_else(|| {
            SimulationError::NotFound {
                operation: "row count".to_string(),
                kind: "table",
                name: table.to_string(),
            }
            .into()
        }))
    }

    // Column values are not modelled, so nothing is ever unresolved.
    fn null_count<'a>(&'a self, _table: &'a str, _column: &'a str) -> BoxFuture<'a, Result<i64>> {
        ready(Ok(0))
    }
}

impl Ledger for VirtualSchema {
    fn is_applied<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        ready(Ok(self.state().ledger.contains_key(name)))
    }

    fn mark_applied<'a>(&'a self, name: &'a str, version: i64) -> BoxFuture<'a, Result<()>> {
        self.state()
            .ledger
            .entry(name.to_string())
            .or_insert(version);
        ready(Ok(()))
    }

    fn unmark<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        ready(Ok(self.state().ledger.remove(name).is_some()))
    }

    fn applied(&self) -> BoxFuture<'_, Result<Vec<AppliedMigration>>> {
        let mut applied: Vec<_> = self
            .state()
            .ledger
            .iter()
            .map(|(name, version)| AppliedMigration {
                name: name.clone(),
                version: *version,
                applied_at: DateTime::<Utc>::default(),
            })
            .collect();
        applied.sort_by_key(|m| m.version);
        ready(Ok(applied))
    }
}

impl Session for VirtualSchema {
    fn run<'a>(&'a self, op: &'a Operation) -> BoxFuture<'a, Result<u64>> {
        ready(self.apply(op).map_err(Into::into))
    }
}
