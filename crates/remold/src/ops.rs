//! Schema operations.
//!
//! An [`Operation`] is one DDL/DML statement together with the catalog
//! predicate ([`Operation::guard`]) that must hold for the statement to still
//! be needed. When the guard does not hold, the object is already in the
//! desired state and the executor skips the statement. This is what makes a
//! plan safe to replay against a schema that got part of the way there.

use std::fmt;

use crate::{Catalog, Condition, Probe, Result, quote_ident, quote_literal};

/// Column definition used by [`Operation::CreateTable`] and [`Operation::AddColumn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// SQL type as written, e.g. `VARCHAR(255)` or the name of an enum type.
    pub ty: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

impl ColumnDef {
    /// A `NOT NULL` column without default.
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            nullable: false,
            default: None,
            primary_key: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn to_sql(&self) -> String {
        let mut def = format!("{} {}", quote_ident(&self.name), self.ty);
        if self.primary_key {
            def.push_str(" PRIMARY KEY");
        } else if !self.nullable {
            // PK columns are implicitly NOT NULL
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            def.push_str(&format!(" DEFAULT {}", default));
        }
        def
    }
}

/// `ON DELETE` behavior of a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferentialAction {
    NoAction,
    Restrict,
    Cascade,
    SetNull,
}

impl ReferentialAction {
    pub fn to_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
        }
    }
}

/// A single guarded schema or data operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    CreateEnumType {
        name: String,
        variants: Vec<String>,
    },
    /// Only runs once no column uses the type; the executor checks this first.
    DropEnumType {
        name: String,
    },
    CreateTable {
        name: String,
        columns: Vec<ColumnDef>,
    },
    DropTable {
        name: String,
    },
    RenameTable {
        from: String,
        to: String,
    },
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    DropColumn {
        table: String,
        column: String,
    },
    RenameColumn {
        table: String,
        from: String,
        to: String,
    },
    CreateIndex {
        name: String,
        table: String,
        columns: Vec<String>,
        unique: bool,
    },
    RenameIndex {
        from: String,
        to: String,
    },
    DropIndex {
        name: String,
    },
    AddForeignKey {
        table: String,
        name: String,
        column: String,
        references_table: String,
        references_column: String,
        on_delete: ReferentialAction,
    },
    DropConstraint {
        table: String,
        name: String,
    },
    /// Copy rows whose `key` is not yet present in `target`.
    ///
    /// Replaying after a crash mid-copy completes the copy without duplicates.
    Backfill {
        source: String,
        target: String,
        key: String,
        columns: Vec<String>,
    },
    /// Move a serial column's sequence past the highest existing value, after
    /// rows were inserted with explicit keys.
    ResyncSequence {
        table: String,
        column: String,
    },
    /// Fill `table.column` (where NULL) with `reference.key` of the reference
    /// row whose `reference_match` equals `table.match_column`.
    SetFromReference {
        table: String,
        column: String,
        match_column: String,
        reference: String,
        reference_key: String,
        reference_match: String,
    },
    /// Rebuild an enum column (where NULL) from the code column of the row
    /// its foreign key points at. Codes that are not a literal of the enum
    /// stay NULL; the executor reports them as unresolved.
    RestoreEnumFromCode {
        table: String,
        column: String,
        enum_type: String,
        foreign_key_column: String,
        reference: String,
        reference_key: String,
        code_column: String,
    },
    /// A hand-written statement, run when every `only_if` condition holds.
    /// The statement itself must be safe to replay.
    Sql {
        description: String,
        sql: String,
        only_if: Vec<Condition>,
    },
}

impl Operation {
    /// Generate the SQL statement for this operation.
    pub fn to_sql(&self) -> String {
        match self {
            Operation::CreateEnumType { name, variants } => {
                let literals: Vec<_> = variants.iter().map(|v| quote_literal(v)).collect();
                format!(
                    "CREATE TYPE {} AS ENUM ({})",
                    quote_ident(name),
                    literals.join(", ")
                )
            }
            Operation::DropEnumType { name } => format!("DROP TYPE {}", quote_ident(name)),
            Operation::CreateTable { name, columns } => {
                let defs: Vec<_> = columns
                    .iter()
                    .map(|c| format!("    {}", c.to_sql()))
                    .collect();
                format!(
                    "CREATE TABLE {} (\n{}\n)",
                    quote_ident(name),
                    defs.join(",\n")
                )
            }
            Operation::DropTable { name } => format!("DROP TABLE {}", quote_ident(name)),
            Operation::RenameTable { from, to } => format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(from),
                quote_ident(to)
            ),
            Operation::AddColumn { table, column } => format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                column.to_sql()
            ),
            Operation::DropColumn { table, column } => format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table),
                quote_ident(column)
            ),
            Operation::RenameColumn { table, from, to } => format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote_ident(table),
                quote_ident(from),
                quote_ident(to)
            ),
            Operation::CreateIndex {
                name,
                table,
                columns,
                unique,
            } => {
                let unique = if *unique { "UNIQUE " } else { "" };
                let cols: Vec<_> = columns.iter().map(|c| quote_ident(c)).collect();
                format!(
                    "CREATE {}INDEX {} ON {} ({})",
                    unique,
                    quote_ident(name),
                    quote_ident(table),
                    cols.join(", ")
                )
            }
            Operation::RenameIndex { from, to } => format!(
                "ALTER INDEX {} RENAME TO {}",
                quote_ident(from),
                quote_ident(to)
            ),
            Operation::DropIndex { name } => format!("DROP INDEX {}", quote_ident(name)),
            Operation::AddForeignKey {
                table,
                name,
                column,
                references_table,
                references_column,
                on_delete,
            } => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {}",
                quote_ident(table),
                quote_ident(name),
                quote_ident(column),
                quote_ident(references_table),
                quote_ident(references_column),
                on_delete.to_sql()
            ),
            Operation::DropConstraint { table, name } => format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                quote_ident(table),
                quote_ident(name)
            ),
            Operation::Backfill {
                source,
                target,
                key,
                columns,
            } => {
                let targets: Vec<_> = columns.iter().map(|c| quote_ident(c)).collect();
                let sources: Vec<_> = columns
                    .iter()
                    .map(|c| format!("s.{}", quote_ident(c)))
                    .collect();
                format!(
                    "INSERT INTO {target} ({}) SELECT {} FROM {} s \
                     WHERE NOT EXISTS (SELECT 1 FROM {target} t WHERE t.{key} = s.{key})",
                    targets.join(", "),
                    sources.join(", "),
                    quote_ident(source),
                    target = quote_ident(target),
                    key = quote_ident(key),
                )
            }
            Operation::ResyncSequence { table, column } => format!(
                "SELECT setval(pg_get_serial_sequence({}, {}), COALESCE(MAX({}), 0) + 1, false) FROM {}",
                quote_literal(&quote_ident(table)),
                quote_literal(column),
                quote_ident(column),
                quote_ident(table)
            ),
            Operation::SetFromReference {
                table,
                column,
                match_column,
                reference,
                reference_key,
                reference_match,
            } => format!(
                "UPDATE {} AS x SET {} = r.{} FROM {} AS r \
                 WHERE r.{} = x.{}::text AND x.{} IS NULL",
                quote_ident(table),
                quote_ident(column),
                quote_ident(reference_key),
                quote_ident(reference),
                quote_ident(reference_match),
                quote_ident(match_column),
                quote_ident(column)
            ),
            Operation::RestoreEnumFromCode {
                table,
                column,
                enum_type,
                foreign_key_column,
                reference,
                reference_key,
                code_column,
            } => format!(
                "UPDATE {} AS x SET {col} = r.{code}::{ty} FROM {} AS r \
                 WHERE r.{} = x.{} AND x.{col} IS NULL \
                 AND r.{code} = ANY(enum_range(NULL::{ty})::text[])",
                quote_ident(table),
                quote_ident(reference),
                quote_ident(reference_key),
                quote_ident(foreign_key_column),
                col = quote_ident(column),
                code = quote_ident(code_column),
                ty = quote_ident(enum_type),
            ),
            Operation::Sql { sql, .. } => sql.clone(),
        }
    }

    /// Conditions under which this operation still has work to do.
    pub fn guard(&self) -> Vec<Condition> {
        match self {
            Operation::CreateEnumType { name, .. } => vec![Probe::enum_type(name).absent()],
            Operation::DropEnumType { name } => vec![Probe::enum_type(name).present()],
            Operation::CreateTable { name, .. } => vec![Probe::table(name).absent()],
            Operation::DropTable { name } => vec![Probe::table(name).present()],
            Operation::RenameTable { from, to } => vec![
                Probe::table(from).present(),
                Probe::table(to).absent(),
            ],
            Operation::AddColumn { table, column } => {
                vec![Probe::column(table, &column.name).absent()]
            }
            Operation::DropColumn { table, column } => {
                vec![Probe::column(table, column).present()]
            }
            Operation::RenameColumn { table, from, to } => vec![
                Probe::column(table, from).present(),
                Probe::column(table, to).absent(),
            ],
            Operation::CreateIndex { name, .. } => vec![Probe::index(name).absent()],
            Operation::RenameIndex { from, to } => vec![
                Probe::index(from).present(),
                Probe::index(to).absent(),
            ],
            Operation::DropIndex { name } => vec![Probe::index(name).present()],
            Operation::AddForeignKey { table, name, .. } => {
                vec![Probe::constraint(table, name).absent()]
            }
            Operation::DropConstraint { table, name } => {
                vec![Probe::constraint(table, name).present()]
            }
            Operation::Backfill { source, target, .. } => vec![
                Probe::table(source).present(),
                Probe::table(target).present(),
            ],
            Operation::ResyncSequence { table, column } => {
                vec![Probe::column(table, column).present()]
            }
            Operation::SetFromReference {
                table,
                column,
                match_column,
                reference,
                ..
            } => vec![
                Probe::column(table, column).present(),
                Probe::column(table, match_column).present(),
                Probe::table(reference).present(),
            ],
            Operation::RestoreEnumFromCode {
                table,
                column,
                foreign_key_column,
                reference,
                ..
            } => vec![
                Probe::column(table, column).present(),
                Probe::column(table, foreign_key_column).present(),
                Probe::table(reference).present(),
            ],
            Operation::Sql { only_if, .. } => only_if.clone(),
        }
    }

    /// Whether every guard condition currently holds.
    pub async fn is_pending<C: Catalog + ?Sized>(&self, catalog: &C) -> Result<bool> {
        for condition in self.guard() {
            if !condition.holds(catalog).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// `(table, column)` rebuilt by a lossy restore, if this is one.
    pub fn restores(&self) -> Option<(&str, &str)> {
        match self {
            Operation::RestoreEnumFromCode { table, column, .. } => Some((table, column)),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateEnumType { name, variants } => {
                write!(f, "+ enum type {} ({})", name, variants.join(", "))
            }
            Operation::DropEnumType { name } => write!(f, "- enum type {}", name),
            Operation::CreateTable { name, .. } => write!(f, "+ table {}", name),
            Operation::DropTable { name } => write!(f, "- table {}", name),
            Operation::RenameTable { from, to } => write!(f, "~ rename {} -> {}", from, to),
            Operation::AddColumn { table, column } => {
                let nullable = if column.nullable { " (nullable)" } else { "" };
                write!(f, "+ {}.{}: {}{}", table, column.name, column.ty, nullable)
            }
            Operation::DropColumn { table, column } => write!(f, "- {}.{}", table, column),
            Operation::RenameColumn { table, from, to } => {
                write!(f, "~ rename {}.{} -> {}", table, from, to)
            }
            Operation::CreateIndex {
                name,
                table,
                columns,
                unique,
            } => {
                let unique = if *unique { "UNIQUE " } else { "" };
                write!(
                    f,
                    "+ {}INDEX {} ON {} ({})",
                    unique,
                    name,
                    table,
                    columns.join(", ")
                )
            }
            Operation::RenameIndex { from, to } => write!(f, "~ rename index {} -> {}", from, to),
            Operation::DropIndex { name } => write!(f, "- INDEX {}", name),
            Operation::AddForeignKey {
                table,
                name,
                column,
                references_table,
                references_column,
                ..
            } => write!(
                f,
                "+ FOREIGN KEY {} {}.{} -> {}.{}",
                name, table, column, references_table, references_column
            ),
            Operation::DropConstraint { table, name } => {
                write!(f, "- CONSTRAINT {}.{}", table, name)
            }
            Operation::Backfill {
                source,
                target,
                key,
                ..
            } => write!(f, "» backfill {} -> {} by {}", source, target, key),
            Operation::ResyncSequence { table, column } => {
                write!(f, "» resync sequence {}.{}", table, column)
            }
            Operation::SetFromReference {
                table,
                column,
                reference,
                ..
            } => write!(f, "» fill {}.{} from {}", table, column, reference),
            Operation::RestoreEnumFromCode {
                table,
                column,
                reference,
                ..
            } => write!(f, "» restore {}.{} from {} codes", table, column, reference),
            Operation::Sql { description, .. } => write!(f, "» {}", description),
        }
    }
}
