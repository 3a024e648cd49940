//! One-time introduction of `users.roleId`.
//!
//! Gated on the column's existence: once it is present the bootstrap never
//! issues another statement. While it is absent every step must succeed, in
//! order, or startup is aborted.

use std::fmt;

use serde::Serialize;

use super::catalog::{Catalog, CatalogError, SchemaChange};
use super::report::BootstrapOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSeed {
    pub name: &'static str,
    pub description: &'static str,
}

/// Where the role reference lives and what it is seeded with.
#[derive(Debug, Clone, Copy)]
pub struct RoleBootstrap {
    pub table: &'static str,
    pub column: &'static str,
    pub referenced_table: &'static str,
    pub referenced_column: &'static str,
    pub constraint: &'static str,
    pub index: &'static str,
    /// Role assigned to every pre-existing row.
    pub default_role: &'static str,
    pub seeds: &'static [RoleSeed],
}

pub const ROLE_BOOTSTRAP: RoleBootstrap = RoleBootstrap {
    table: "users",
    column: "roleId",
    referenced_table: "roles",
    referenced_column: "id",
    constraint: "users_roleId_fkey",
    index: "users_role_id",
    default_role: "user",
    seeds: &[
        RoleSeed {
            name: "admin",
            description: "Full access, including user and role management",
        },
        RoleSeed {
            name: "manager",
            description: "Manages teams, pipelines and reports",
        },
        RoleSeed {
            name: "sales",
            description: "Works contacts, companies and deals",
        },
        RoleSeed {
            name: "user",
            description: "Default role for regular users",
        },
    ],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapStep {
    Inspect,
    SeedRoles,
    AddColumn,
    Backfill,
    SetNotNull,
    AddForeignKey,
    CreateIndex,
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootstrapStep::Inspect => "inspect",
            BootstrapStep::SeedRoles => "seed roles",
            BootstrapStep::AddColumn => "add column",
            BootstrapStep::Backfill => "backfill",
            BootstrapStep::SetNotNull => "set not null",
            BootstrapStep::AddForeignKey => "add foreign key",
            BootstrapStep::CreateIndex => "create index",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapError {
    pub step: BootstrapStep,
    pub source: CatalogError,
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "role bootstrap failed at step '{}': {}", self.step, self.source)
    }
}

impl std::error::Error for BootstrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

trait StepContext<T> {
    fn at(self, step: BootstrapStep) -> Result<T, BootstrapError>;
}

impl<T> StepContext<T> for Result<T, CatalogError> {
    fn at(self, step: BootstrapStep) -> Result<T, BootstrapError> {
        self.map_err(|source| BootstrapError { step, source })
    }
}

pub async fn run_role_bootstrap<C: Catalog + ?Sized>(
    catalog: &C,
    plan: &RoleBootstrap,
) -> Result<BootstrapOutcome, BootstrapError> {
    let state = catalog
        .column_state(plan.table, plan.column)
        .await
        .at(BootstrapStep::Inspect)?;
    if state.exists {
        tracing::debug!(table = plan.table, column = plan.column, "role bootstrap already applied");
        return Ok(BootstrapOutcome::AlreadyApplied);
    }

    tracing::info!(table = plan.table, column = plan.column, "running role bootstrap");

    // 1. seed table
    let default_role_id = seed_roles(catalog, plan).await.at(BootstrapStep::SeedRoles)?;

    let table = plan.table.to_string();
    let column = plan.column.to_string();

    // 2. nullable column
    catalog
        .apply(&SchemaChange::AddReferenceColumn {
            table: table.clone(),
            column: column.clone(),
        })
        .await
        .at(BootstrapStep::AddColumn)?;

    // 3. backfill
    let backfilled = catalog
        .apply(&SchemaChange::BackfillReference {
            table: table.clone(),
            column: column.clone(),
            value: default_role_id,
        })
        .await
        .at(BootstrapStep::Backfill)?;
    tracing::info!(rows = backfilled, role_id = default_role_id, "backfilled role references");

    // 4. NOT NULL
    catalog
        .apply(&SchemaChange::SetNotNull {
            table: table.clone(),
            column: column.clone(),
        })
        .await
        .at(BootstrapStep::SetNotNull)?;

    // 5. constraint; only left behind by an earlier partial run
    let fk = SchemaChange::AddForeignKey {
        table: table.clone(),
        column: column.clone(),
        constraint: plan.constraint.to_string(),
        referenced_table: plan.referenced_table.to_string(),
        referenced_column: plan.referenced_column.to_string(),
    };
    match catalog.apply(&fk).await {
        Ok(_) => {}
        Err(e) if e.is_duplicate_object() => {
            tracing::debug!(constraint = plan.constraint, "foreign key already exists");
        }
        Err(source) => {
            return Err(BootstrapError {
                step: BootstrapStep::AddForeignKey,
                source,
            });
        }
    }

    // 6. index
    catalog
        .apply(&SchemaChange::CreateIndex {
            table,
            column,
            index: plan.index.to_string(),
        })
        .await
        .at(BootstrapStep::CreateIndex)?;

    tracing::info!(table = plan.table, column = plan.column, "role bootstrap complete");
    Ok(BootstrapOutcome::Applied)
}

/// Create the roles table if needed, seed it when empty, and return the id
/// of the default role.
async fn seed_roles<C: Catalog + ?Sized>(
    catalog: &C,
    plan: &RoleBootstrap,
) -> Result<i32, CatalogError> {
    catalog.apply(&SchemaChange::EnsureRolesTable).await?;

    if catalog.count_roles().await? == 0 {
        for seed in plan.seeds {
            let id = catalog.insert_role(seed.name, seed.description).await?;
            tracing::info!(role = seed.name, id, "seeded role");
        }
    }

    match catalog.find_role_id(plan.default_role).await? {
        Some(id) => Ok(id),
        None => {
            // Table was already populated without the default entry.
            let id = catalog
                .insert_role(plan.default_role, "Default role for regular users")
                .await?;
            tracing::warn!(role = plan.default_role, id, "default role was missing; created it");
            Ok(id)
        }
    }
}
