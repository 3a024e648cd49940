use std::collections::HashSet;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, RuntimeErr, Set, Statement,
};

use super::catalog::{
    Catalog, CatalogColumnState, CatalogError, SchemaChange, quote_ident,
};
use super::registry::GENERATED_TYPE_PREFIX;
use crate::entity::role;

/// [`Catalog`] over the application's SeaORM connection. All catalog reads are
/// scoped to `current_schema()`.
pub struct PgCatalog {
    db: DatabaseConnection,
}

impl PgCatalog {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn query_all(
        &self,
        sql: &str,
        values: Vec<sea_orm::Value>,
    ) -> Result<Vec<sea_orm::QueryResult>, CatalogError> {
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, values);
        Ok(self.db.query_all(stmt).await?)
    }
}

impl From<DbErr> for CatalogError {
    fn from(e: DbErr) -> Self {
        match &e {
            DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => CatalogError::Connect(e.to_string()),
            _ => CatalogError::Statement {
                code: sqlstate_of(&e),
                message: e.to_string(),
            },
        }
    }
}

/// Pull the SQLSTATE out of the sqlx database error wrapped by SeaORM.
fn sqlstate_of(e: &DbErr) -> Option<String> {
    let runtime = match e {
        DbErr::Exec(r) | DbErr::Query(r) | DbErr::Conn(r) => r,
        _ => return None,
    };
    match runtime {
        RuntimeErr::SqlxError(err) => err
            .as_database_error()
            .and_then(|db_err| db_err.code())
            .map(|code| code.into_owned()),
        _ => None,
    }
}

#[async_trait::async_trait]
impl Catalog for PgCatalog {
    async fn type_exists(&self, name: &str) -> Result<bool, CatalogError> {
        let rows = self
            .query_all(
                "SELECT 1 AS present \
                 FROM pg_type t \
                 JOIN pg_namespace n ON n.oid = t.typnamespace \
                 WHERE n.nspname = current_schema() AND t.typname = $1",
                vec![name.into()],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn enum_values(&self, name: &str) -> Result<Vec<String>, CatalogError> {
        let rows = self
            .query_all(
                "SELECT e.enumlabel::text AS label \
                 FROM pg_enum e \
                 JOIN pg_type t ON t.oid = e.enumtypid \
                 JOIN pg_namespace n ON n.oid = t.typnamespace \
                 WHERE n.nspname = current_schema() AND t.typname = $1 \
                 ORDER BY e.enumsortorder",
                vec![name.into()],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String>("", "label").map_err(CatalogError::from))
            .collect()
    }

    async fn column_state(
        &self,
        table: &str,
        column: &str,
    ) -> Result<CatalogColumnState, CatalogError> {
        let rows = self
            .query_all(
                "SELECT t.typname::text AS type_name, \
                        t.typtype::text AS type_kind, \
                        NOT a.attnotnull AS is_nullable, \
                        pg_get_expr(d.adbin, d.adrelid) AS default_expr \
                 FROM pg_attribute a \
                 JOIN pg_class c ON c.oid = a.attrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 JOIN pg_type t ON t.oid = a.atttypid \
                 LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum \
                 WHERE n.nspname = current_schema() AND c.relname = $1 AND a.attname = $2 \
                 AND a.attnum > 0 AND NOT a.attisdropped",
                vec![table.into(), column.into()],
            )
            .await?;

        let Some(row) = rows.first() else {
            return Ok(CatalogColumnState::absent());
        };
        let type_kind: String = row.try_get("", "type_kind")?;
        Ok(CatalogColumnState {
            exists: true,
            type_name: Some(row.try_get("", "type_name")?),
            is_enum: type_kind == "e",
            is_nullable: row.try_get("", "is_nullable")?,
            default_expr: row.try_get("", "default_expr")?,
        })
    }

    async fn list_orphan_enum_types(
        &self,
        canonical: &HashSet<String>,
    ) -> Result<Vec<String>, CatalogError> {
        let rows = self
            .query_all(
                "SELECT t.typname::text AS type_name \
                 FROM pg_type t \
                 JOIN pg_namespace n ON n.oid = t.typnamespace \
                 WHERE n.nspname = current_schema() AND t.typtype = 'e' \
                 ORDER BY t.typname",
                vec![],
            )
            .await?;

        let mut orphans = Vec::new();
        for row in rows {
            let name: String = row.try_get("", "type_name")?;
            if name.starts_with(GENERATED_TYPE_PREFIX) && !canonical.contains(&name) {
                orphans.push(name);
            }
        }
        Ok(orphans)
    }

    async fn column_values(&self, table: &str, column: &str) -> Result<Vec<String>, CatalogError> {
        // Identifiers come from the registry and are quoted.
        let sql = format!(
            "SELECT DISTINCT {col}::text AS value FROM {table} WHERE {col} IS NOT NULL ORDER BY 1",
            col = quote_ident(column),
            table = quote_ident(table),
        );
        let rows = self.query_all(&sql, vec![]).await?;
        rows.iter()
            .map(|row| row.try_get::<String>("", "value").map_err(CatalogError::from))
            .collect()
    }

    async fn count_roles(&self) -> Result<u64, CatalogError> {
        Ok(role::Entity::find().count(&self.db).await?)
    }

    async fn find_role_id(&self, name: &str) -> Result<Option<i32>, CatalogError> {
        let found = role::Entity::find()
            .filter(role::Column::Name.eq(name))
            .one(&self.db)
            .await?;
        Ok(found.map(|r| r.id))
    }

    async fn insert_role(&self, name: &str, description: &str) -> Result<i32, CatalogError> {
        let now = Utc::now().fixed_offset();
        let model = role::ActiveModel {
            name: Set(name.to_string()),
            description: Set(Some(description.to_string())),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;
        Ok(model.id)
    }

    async fn apply(&self, change: &SchemaChange) -> Result<u64, CatalogError> {
        let sql = change.to_sql();
        tracing::debug!(sql = %sql, "applying schema change");
        let result = self.db.execute_unprepared(&sql).await?;
        Ok(result.rows_affected())
    }
}
