use std::collections::HashSet;
use std::fmt;

use sea_orm::{DbBackend, Schema};
use serde::Serialize;

use crate::entity::role;

// ---------- catalog reads ----------

/// Snapshot of one column as the catalog reports it. Recomputed every run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogColumnState {
    pub exists: bool,
    /// Catalog type name (e.g. "lifecycle_stage_enum", "text", "int4")
    pub type_name: Option<String>,
    /// `pg_type.typtype = 'e'`
    pub is_enum: bool,
    pub is_nullable: bool,
    /// Default expression as rendered by `pg_get_expr`
    pub default_expr: Option<String>,
}

impl CatalogColumnState {
    pub fn absent() -> Self {
        Self::default()
    }
}

// ---------- errors ----------

/// SQLSTATE codes the engine reacts to.
pub mod sqlstate {
    pub const DUPLICATE_OBJECT: &str = "42710";
    pub const DEPENDENT_OBJECTS_STILL_EXIST: &str = "2BP01";
    pub const UNDEFINED_OBJECT: &str = "42704";
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const INVALID_TEXT_REPRESENTATION: &str = "22P02";
    pub const INSUFFICIENT_PRIVILEGE: &str = "42501";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The database could not be reached at all.
    Connect(String),
    /// A statement was rejected. `code` is the SQLSTATE when the server sent one.
    Statement { code: Option<String>, message: String },
}

impl CatalogError {
    pub fn statement(code: &str, message: impl Into<String>) -> Self {
        CatalogError::Statement {
            code: Some(code.to_string()),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            CatalogError::Connect(_) => None,
            CatalogError::Statement { code, .. } => code.as_deref(),
        }
    }

    pub fn is_duplicate_object(&self) -> bool {
        self.code() == Some(sqlstate::DUPLICATE_OBJECT)
    }

    pub fn is_still_referenced(&self) -> bool {
        self.code() == Some(sqlstate::DEPENDENT_OBJECTS_STILL_EXIST)
    }
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Connect(msg) => write!(f, "Connection error: {msg}"),
            CatalogError::Statement {
                code: Some(code),
                message,
            } => write!(f, "Statement error [{code}]: {message}"),
            CatalogError::Statement { code: None, message } => {
                write!(f, "Statement error: {message}")
            }
        }
    }
}

impl std::error::Error for CatalogError {}

// ---------- schema changes ----------

/// Target of an `ALTER COLUMN ... TYPE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnDefault {
    /// An enum literal cast to its type: `'lead'::"lifecycle_stage_enum"`
    EnumLiteral { enum_type: String, value: String },
    /// A raw expression read back from the catalog.
    Expression { sql: String },
}

/// One DDL/DML statement the engine may issue. Every identifier comes from the
/// registry, the bootstrap plan, or the catalog itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaChange {
    CreateEnumType {
        name: String,
        values: Vec<String>,
    },
    DropEnumType {
        name: String,
    },
    AddEnumColumn {
        table: String,
        column: String,
        enum_type: String,
        default: Option<String>,
        not_null: bool,
    },
    DropColumnDefault {
        table: String,
        column: String,
    },
    SetColumnDefault {
        table: String,
        column: String,
        default: ColumnDefault,
    },
    AlterColumnType {
        table: String,
        column: String,
        target: ColumnType,
    },
    EnsureRolesTable,
    AddReferenceColumn {
        table: String,
        column: String,
    },
    BackfillReference {
        table: String,
        column: String,
        value: i32,
    },
    SetNotNull {
        table: String,
        column: String,
    },
    AddForeignKey {
        table: String,
        column: String,
        constraint: String,
        referenced_table: String,
        referenced_column: String,
    },
    CreateIndex {
        table: String,
        column: String,
        index: String,
    },
}

impl SchemaChange {
    /// Render as a single Postgres statement.
    pub fn to_sql(&self) -> String {
        match self {
            SchemaChange::CreateEnumType { name, values } => {
                let values: Vec<String> = values.iter().map(|v| quote_literal(v)).collect();
                format!(
                    "CREATE TYPE {} AS ENUM ({})",
                    quote_ident(name),
                    values.join(", ")
                )
            }
            SchemaChange::DropEnumType { name } => format!("DROP TYPE {}", quote_ident(name)),
            SchemaChange::AddEnumColumn {
                table,
                column,
                enum_type,
                default,
                not_null,
            } => {
                let mut sql = format!(
                    "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                    quote_ident(table),
                    quote_ident(column),
                    quote_ident(enum_type)
                );
                if *not_null {
                    sql.push_str(" NOT NULL");
                }
                if let Some(value) = default {
                    sql.push_str(&format!(
                        " DEFAULT {}::{}",
                        quote_literal(value),
                        quote_ident(enum_type)
                    ));
                }
                sql
            }
            SchemaChange::DropColumnDefault { table, column } => format!(
                "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
                quote_ident(table),
                quote_ident(column)
            ),
            SchemaChange::SetColumnDefault {
                table,
                column,
                default,
            } => {
                let expr = match default {
                    ColumnDefault::EnumLiteral { enum_type, value } => {
                        format!("{}::{}", quote_literal(value), quote_ident(enum_type))
                    }
                    ColumnDefault::Expression { sql } => sql.clone(),
                };
                format!(
                    "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                    quote_ident(table),
                    quote_ident(column),
                    expr
                )
            }
            SchemaChange::AlterColumnType {
                table,
                column,
                target,
            } => {
                let ty = match target {
                    ColumnType::Text => "text".to_string(),
                    ColumnType::Named(name) => quote_ident(name),
                };
                format!(
                    "ALTER TABLE {} ALTER COLUMN {} TYPE {ty} USING {}::{ty}",
                    quote_ident(table),
                    quote_ident(column),
                    quote_ident(column)
                )
            }
            SchemaChange::EnsureRolesTable => {
                let backend = DbBackend::Postgres;
                let stmt = Schema::new(backend)
                    .create_table_from_entity(role::Entity)
                    .if_not_exists()
                    .to_owned();
                backend.build(&stmt).to_string()
            }
            SchemaChange::AddReferenceColumn { table, column } => format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} integer",
                quote_ident(table),
                quote_ident(column)
            ),
            SchemaChange::BackfillReference {
                table,
                column,
                value,
            } => format!(
                "UPDATE {} SET {col} = {value} WHERE {col} IS NULL",
                quote_ident(table),
                col = quote_ident(column)
            ),
            SchemaChange::SetNotNull { table, column } => format!(
                "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
                quote_ident(table),
                quote_ident(column)
            ),
            SchemaChange::AddForeignKey {
                table,
                column,
                constraint,
                referenced_table,
                referenced_column,
            } => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) \
                 ON UPDATE CASCADE ON DELETE RESTRICT",
                quote_ident(table),
                quote_ident(constraint),
                quote_ident(column),
                quote_ident(referenced_table),
                quote_ident(referenced_column)
            ),
            SchemaChange::CreateIndex {
                table,
                column,
                index,
            } => format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(index),
                quote_ident(table),
                quote_ident(column)
            ),
        }
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quote a string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// ---------- trait ----------

/// Everything the reconcilers need from the database. Reads are catalog
/// inspections; [`Catalog::apply`] commits exactly one statement.
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    async fn type_exists(&self, name: &str) -> Result<bool, CatalogError>;

    /// Values of an enum type in declared order (empty if the type is absent).
    async fn enum_values(&self, name: &str) -> Result<Vec<String>, CatalogError>;

    async fn column_state(&self, table: &str, column: &str)
    -> Result<CatalogColumnState, CatalogError>;

    /// Enum types following the generated-type naming convention that are not
    /// in `canonical`.
    async fn list_orphan_enum_types(
        &self,
        canonical: &HashSet<String>,
    ) -> Result<Vec<String>, CatalogError>;

    /// Distinct non-null values of a column, rendered as text.
    async fn column_values(&self, table: &str, column: &str) -> Result<Vec<String>, CatalogError>;

    async fn count_roles(&self) -> Result<u64, CatalogError>;

    async fn find_role_id(&self, name: &str) -> Result<Option<i32>, CatalogError>;

    async fn insert_role(&self, name: &str, description: &str) -> Result<i32, CatalogError>;

    /// Execute one change. Returns the number of rows affected.
    async fn apply(&self, change: &SchemaChange) -> Result<u64, CatalogError>;
}
