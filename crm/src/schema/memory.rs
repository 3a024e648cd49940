//! In-memory [`Catalog`] used by the unit tests. It models just enough of
//! Postgres to exercise the reconcilers: enum types, columns with per-row
//! values, constraints, indexes, the roles table and SQLSTATE failures.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use super::catalog::{
    Catalog, CatalogColumnState, CatalogError, ColumnDefault, ColumnType, SchemaChange, sqlstate,
};
use super::registry::GENERATED_TYPE_PREFIX;

#[derive(Debug, Clone)]
pub struct MemColumn {
    pub type_name: String,
    pub nullable: bool,
    pub default_expr: Option<String>,
    pub values: Vec<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemTable {
    pub rows: usize,
    pub columns: BTreeMap<String, MemColumn>,
}

type Matcher = Box<dyn Fn(&SchemaChange) -> bool + Send + Sync>;

struct Fault {
    matches: Matcher,
    code: &'static str,
    /// Apply the change anyway before reporting the error (models a race).
    apply: bool,
}

#[derive(Default)]
struct State {
    types: BTreeMap<String, Vec<String>>,
    tables: BTreeMap<String, MemTable>,
    constraints: HashSet<String>,
    indexes: HashSet<String>,
    roles: Option<Vec<(i32, String, String)>>,
    applied: Vec<SchemaChange>,
}

#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<State>,
    faults: Mutex<Vec<Fault>>,
    offline: Mutex<bool>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    // ---------- fixtures ----------

    pub fn with_type(self, name: &str, values: &[&str]) -> Self {
        self.state.lock().unwrap().types.insert(
            name.to_string(),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    pub fn with_table(self, name: &str, rows: usize) -> Self {
        self.state.lock().unwrap().tables.insert(
            name.to_string(),
            MemTable {
                rows,
                columns: BTreeMap::new(),
            },
        );
        self
    }

    /// Add a column whose per-row values are given explicitly.
    pub fn with_column(self, table: &str, column: &str, type_name: &str, values: &[Option<&str>]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let t = state.tables.entry(table.to_string()).or_default();
            t.rows = values.len();
            t.columns.insert(
                column.to_string(),
                MemColumn {
                    type_name: type_name.to_string(),
                    nullable: true,
                    default_expr: None,
                    values: values.iter().map(|v| v.map(str::to_string)).collect(),
                },
            );
        }
        self
    }

    pub fn with_default(self, table: &str, column: &str, expr: &str) -> Self {
        if let Some(col) = self
            .state
            .lock()
            .unwrap()
            .tables
            .get_mut(table)
            .and_then(|t| t.columns.get_mut(column))
        {
            col.default_expr = Some(expr.to_string());
        }
        self
    }

    pub fn with_roles_table(self, roles: &[(i32, &str)]) -> Self {
        self.state.lock().unwrap().roles = Some(
            roles
                .iter()
                .map(|(id, name)| (*id, name.to_string(), String::new()))
                .collect(),
        );
        self
    }

    /// Fail every change matching `matches` with `code`.
    pub fn fail_when(
        self,
        code: &'static str,
        matches: impl Fn(&SchemaChange) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.faults.lock().unwrap().push(Fault {
            matches: Box::new(matches),
            code,
            apply: false,
        });
        self
    }

    /// Apply matching changes, then report `code` as if another process won the race.
    pub fn race_when(
        self,
        code: &'static str,
        matches: impl Fn(&SchemaChange) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.faults.lock().unwrap().push(Fault {
            matches: Box::new(matches),
            code,
            apply: true,
        });
        self
    }

    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock().unwrap() = offline;
    }

    // ---------- assertions ----------

    pub fn applied(&self) -> Vec<SchemaChange> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn clear_applied(&self) {
        self.state.lock().unwrap().applied.clear();
    }

    pub fn type_values(&self, name: &str) -> Option<Vec<String>> {
        self.state.lock().unwrap().types.get(name).cloned()
    }

    pub fn column(&self, table: &str, column: &str) -> Option<MemColumn> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .and_then(|t| t.columns.get(column))
            .cloned()
    }

    pub fn has_constraint(&self, name: &str) -> bool {
        self.state.lock().unwrap().constraints.contains(name)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.state.lock().unwrap().indexes.contains(name)
    }

    pub fn roles(&self) -> Vec<(i32, String)> {
        self.state
            .lock()
            .unwrap()
            .roles
            .as_ref()
            .map(|r| r.iter().map(|(id, name, _)| (*id, name.clone())).collect())
            .unwrap_or_default()
    }

    fn check_online(&self) -> Result<(), CatalogError> {
        if *self.offline.lock().unwrap() {
            Err(CatalogError::Connect("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

fn err(code: &'static str, message: impl Into<String>) -> CatalogError {
    CatalogError::statement(code, message)
}

impl State {
    fn table_mut(&mut self, table: &str) -> Result<&mut MemTable, CatalogError> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| err(sqlstate::UNDEFINED_TABLE, format!("relation \"{table}\" does not exist")))
    }

    fn column_mut(&mut self, table: &str, column: &str) -> Result<&mut MemColumn, CatalogError> {
        self.table_mut(table)?.columns.get_mut(column).ok_or_else(|| {
            err(
                "42703",
                format!("column \"{column}\" of relation \"{table}\" does not exist"),
            )
        })
    }

    fn is_referenced(&self, type_name: &str) -> bool {
        self.tables
            .values()
            .flat_map(|t| t.columns.values())
            .any(|c| c.type_name == type_name)
    }

    fn execute(&mut self, change: &SchemaChange) -> Result<u64, CatalogError> {
        match change {
            SchemaChange::CreateEnumType { name, values } => {
                if self.types.contains_key(name) {
                    return Err(err(sqlstate::DUPLICATE_OBJECT, format!("type \"{name}\" already exists")));
                }
                self.types.insert(name.clone(), values.clone());
                Ok(0)
            }
            SchemaChange::DropEnumType { name } => {
                if !self.types.contains_key(name) {
                    return Err(err(sqlstate::UNDEFINED_OBJECT, format!("type \"{name}\" does not exist")));
                }
                if self.is_referenced(name) {
                    return Err(err(
                        sqlstate::DEPENDENT_OBJECTS_STILL_EXIST,
                        format!("cannot drop type {name} because other objects depend on it"),
                    ));
                }
                self.types.remove(name);
                Ok(0)
            }
            SchemaChange::AddEnumColumn {
                table,
                column,
                enum_type,
                default,
                not_null,
            } => {
                if !self.types.contains_key(enum_type) {
                    return Err(err(sqlstate::UNDEFINED_OBJECT, format!("type \"{enum_type}\" does not exist")));
                }
                let t = self.table_mut(table)?;
                if t.columns.contains_key(column) {
                    return Ok(0);
                }
                let rows = t.rows;
                t.columns.insert(
                    column.clone(),
                    MemColumn {
                        type_name: enum_type.clone(),
                        nullable: !not_null,
                        default_expr: default.as_ref().map(|v| format!("'{v}'::{enum_type}")),
                        values: vec![default.clone(); rows],
                    },
                );
                Ok(0)
            }
            SchemaChange::DropColumnDefault { table, column } => {
                self.column_mut(table, column)?.default_expr = None;
                Ok(0)
            }
            SchemaChange::SetColumnDefault {
                table,
                column,
                default,
            } => {
                let expr = match default {
                    ColumnDefault::EnumLiteral { enum_type, value } => format!("'{value}'::{enum_type}"),
                    ColumnDefault::Expression { sql } => sql.clone(),
                };
                self.column_mut(table, column)?.default_expr = Some(expr);
                Ok(0)
            }
            SchemaChange::AlterColumnType {
                table,
                column,
                target,
            } => {
                let allowed = match target {
                    ColumnType::Text => None,
                    ColumnType::Named(name) => Some(
                        self.types
                            .get(name)
                            .cloned()
                            .ok_or_else(|| err(sqlstate::UNDEFINED_OBJECT, format!("type \"{name}\" does not exist")))?,
                    ),
                };
                let col = self.column_mut(table, column)?;
                if col.default_expr.is_some() {
                    return Err(err(
                        "42804",
                        format!("default for column \"{column}\" cannot be cast automatically"),
                    ));
                }
                if let Some(allowed) = &allowed {
                    if let Some(bad) = col.values.iter().flatten().find(|v| !allowed.contains(v)) {
                        return Err(err(
                            sqlstate::INVALID_TEXT_REPRESENTATION,
                            format!("invalid input value for enum: \"{bad}\""),
                        ));
                    }
                }
                col.type_name = match target {
                    ColumnType::Text => "text".to_string(),
                    ColumnType::Named(name) => name.clone(),
                };
                Ok(col.values.len() as u64)
            }
            SchemaChange::EnsureRolesTable => {
                self.roles.get_or_insert_with(Vec::new);
                Ok(0)
            }
            SchemaChange::AddReferenceColumn { table, column } => {
                let t = self.table_mut(table)?;
                let rows = t.rows;
                t.columns.entry(column.clone()).or_insert(MemColumn {
                    type_name: "int4".to_string(),
                    nullable: true,
                    default_expr: None,
                    values: vec![None; rows],
                });
                Ok(0)
            }
            SchemaChange::BackfillReference {
                table,
                column,
                value,
            } => {
                let col = self.column_mut(table, column)?;
                let mut touched = 0;
                for slot in col.values.iter_mut().filter(|v| v.is_none()) {
                    *slot = Some(value.to_string());
                    touched += 1;
                }
                Ok(touched)
            }
            SchemaChange::SetNotNull { table, column } => {
                let col = self.column_mut(table, column)?;
                if col.values.iter().any(Option::is_none) {
                    return Err(err("23502", format!("column \"{column}\" contains null values")));
                }
                col.nullable = false;
                Ok(0)
            }
            SchemaChange::AddForeignKey { constraint, .. } => {
                if !self.constraints.insert(constraint.clone()) {
                    return Err(err(
                        sqlstate::DUPLICATE_OBJECT,
                        format!("constraint \"{constraint}\" already exists"),
                    ));
                }
                Ok(0)
            }
            SchemaChange::CreateIndex { index, .. } => {
                self.indexes.insert(index.clone());
                Ok(0)
            }
        }
    }
}

#[async_trait::async_trait]
impl Catalog for MemoryCatalog {
    async fn type_exists(&self, name: &str) -> Result<bool, CatalogError> {
        self.check_online()?;
        Ok(self.state.lock().unwrap().types.contains_key(name))
    }

    async fn enum_values(&self, name: &str) -> Result<Vec<String>, CatalogError> {
        self.check_online()?;
        Ok(self.type_values(name).unwrap_or_default())
    }

    async fn column_state(&self, table: &str, column: &str) -> Result<CatalogColumnState, CatalogError> {
        self.check_online()?;
        let state = self.state.lock().unwrap();
        let Some(col) = state.tables.get(table).and_then(|t| t.columns.get(column)) else {
            return Ok(CatalogColumnState::absent());
        };
        Ok(CatalogColumnState {
            exists: true,
            type_name: Some(col.type_name.clone()),
            is_enum: state.types.contains_key(&col.type_name),
            is_nullable: col.nullable,
            default_expr: col.default_expr.clone(),
        })
    }

    async fn list_orphan_enum_types(&self, canonical: &HashSet<String>) -> Result<Vec<String>, CatalogError> {
        self.check_online()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .types
            .keys()
            .filter(|name| name.starts_with(GENERATED_TYPE_PREFIX) && !canonical.contains(*name))
            .cloned()
            .collect())
    }

    async fn column_values(&self, table: &str, column: &str) -> Result<Vec<String>, CatalogError> {
        self.check_online()?;
        let mut state = self.state.lock().unwrap();
        let col = state.column_mut(table, column)?;
        let mut values: Vec<String> = col.values.iter().flatten().cloned().collect();
        values.sort();
        values.dedup();
        Ok(values)
    }

    async fn count_roles(&self) -> Result<u64, CatalogError> {
        self.check_online()?;
        match &self.state.lock().unwrap().roles {
            Some(roles) => Ok(roles.len() as u64),
            None => Err(err(sqlstate::UNDEFINED_TABLE, "relation \"roles\" does not exist")),
        }
    }

    async fn find_role_id(&self, name: &str) -> Result<Option<i32>, CatalogError> {
        self.check_online()?;
        match &self.state.lock().unwrap().roles {
            Some(roles) => Ok(roles.iter().find(|(_, n, _)| n == name).map(|(id, _, _)| *id)),
            None => Err(err(sqlstate::UNDEFINED_TABLE, "relation \"roles\" does not exist")),
        }
    }

    async fn insert_role(&self, name: &str, description: &str) -> Result<i32, CatalogError> {
        self.check_online()?;
        let mut state = self.state.lock().unwrap();
        let roles = state
            .roles
            .as_mut()
            .ok_or_else(|| err(sqlstate::UNDEFINED_TABLE, "relation \"roles\" does not exist"))?;
        let id = roles.iter().map(|(id, _, _)| *id).max().unwrap_or(0) + 1;
        roles.push((id, name.to_string(), description.to_string()));
        Ok(id)
    }

    async fn apply(&self, change: &SchemaChange) -> Result<u64, CatalogError> {
        self.check_online()?;
        let fault = self
            .faults
            .lock()
            .unwrap()
            .iter()
            .find(|f| (f.matches)(change))
            .map(|f| (f.code, f.apply));

        let mut state = self.state.lock().unwrap();
        state.applied.push(change.clone());
        match fault {
            Some((code, apply)) => {
                if apply {
                    let _ = state.execute(change);
                }
                Err(err(code, format!("injected failure for: {change}")))
            }
            None => state.execute(change),
        }
    }
}
