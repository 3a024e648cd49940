use std::collections::HashSet;
use std::sync::Mutex;

use super::catalog::{
    Catalog, CatalogColumnState, CatalogError, SchemaChange, quote_ident, quote_literal, sqlstate,
};

/// Wraps a real catalog: reads go through, writes are recorded as SQL and
/// never executed.
///
/// Roles that would be inserted are remembered and handed out placeholder ids
/// (negative, so they never collide with real ones). Statements that use such
/// an id refer to the role by name instead.
pub struct DryRunCatalog<'a, C: ?Sized> {
    inner: &'a C,
    planned: Mutex<Vec<String>>,
    pending_roles: Mutex<Vec<String>>,
}

impl<'a, C: Catalog + ?Sized> DryRunCatalog<'a, C> {
    pub fn new(inner: &'a C) -> Self {
        Self {
            inner,
            planned: Mutex::new(Vec::new()),
            pending_roles: Mutex::new(Vec::new()),
        }
    }

    pub fn into_planned(self) -> Vec<String> {
        self.planned.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, sql: String) {
        tracing::info!(sql = %sql, "dry run: would execute");
        self.planned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sql);
    }

    fn pending_roles(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.pending_roles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending_role_id(&self, name: &str) -> Option<i32> {
        self.pending_roles()
            .iter()
            .position(|n| n == name)
            .map(placeholder_id)
    }

    fn pending_role_name(&self, id: i32) -> Option<String> {
        if id >= 0 {
            return None;
        }
        let index = usize::try_from(-(i64::from(id)) - 1).ok()?;
        self.pending_roles().get(index).cloned()
    }

    fn render(&self, change: &SchemaChange) -> String {
        match change {
            SchemaChange::BackfillReference {
                table,
                column,
                value,
            } => match self.pending_role_name(*value) {
                Some(role) => format!(
                    "UPDATE {} SET {col} = (SELECT {} FROM {} WHERE {} = {}) WHERE {col} IS NULL",
                    quote_ident(table),
                    quote_ident("id"),
                    quote_ident("roles"),
                    quote_ident("name"),
                    quote_literal(&role),
                    col = quote_ident(column)
                ),
                None => change.to_sql(),
            },
            _ => change.to_sql(),
        }
    }
}

fn placeholder_id(index: usize) -> i32 {
    -(i32::try_from(index).unwrap_or(i32::MAX - 1) + 1)
}

/// A relation that does not exist yet reads as empty; anything else is real.
fn missing_table_as<T>(result: Result<T, CatalogError>, empty: T) -> Result<T, CatalogError> {
    match result {
        Err(e) if e.code() == Some(sqlstate::UNDEFINED_TABLE) => Ok(empty),
        other => other,
    }
}

#[async_trait::async_trait]
impl<C: Catalog + ?Sized> Catalog for DryRunCatalog<'_, C> {
    async fn type_exists(&self, name: &str) -> Result<bool, CatalogError> {
        self.inner.type_exists(name).await
    }

    async fn enum_values(&self, name: &str) -> Result<Vec<String>, CatalogError> {
        self.inner.enum_values(name).await
    }

    async fn column_state(&self, table: &str, column: &str) -> Result<CatalogColumnState, CatalogError> {
        self.inner.column_state(table, column).await
    }

    async fn list_orphan_enum_types(&self, canonical: &HashSet<String>) -> Result<Vec<String>, CatalogError> {
        self.inner.list_orphan_enum_types(canonical).await
    }

    async fn column_values(&self, table: &str, column: &str) -> Result<Vec<String>, CatalogError> {
        self.inner.column_values(table, column).await
    }

    // The roles table may not exist yet in a dry run.
    async fn count_roles(&self) -> Result<u64, CatalogError> {
        let existing = missing_table_as(self.inner.count_roles().await, 0)?;
        Ok(existing + self.pending_roles().len() as u64)
    }

    async fn find_role_id(&self, name: &str) -> Result<Option<i32>, CatalogError> {
        match missing_table_as(self.inner.find_role_id(name).await, None)? {
            Some(id) => Ok(Some(id)),
            None => Ok(self.pending_role_id(name)),
        }
    }

    async fn insert_role(&self, name: &str, description: &str) -> Result<i32, CatalogError> {
        self.record(format!(
            "INSERT INTO {} ({}, {}, {}, {}) VALUES ({}, {}, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)",
            quote_ident("roles"),
            quote_ident("name"),
            quote_ident("description"),
            quote_ident("createdAt"),
            quote_ident("updatedAt"),
            quote_literal(name),
            quote_literal(description)
        ));
        let mut pending = self.pending_roles();
        pending.push(name.to_string());
        Ok(placeholder_id(pending.len() - 1))
    }

    async fn apply(&self, change: &SchemaChange) -> Result<u64, CatalogError> {
        self.record(self.render(change));
        Ok(0)
    }
}
