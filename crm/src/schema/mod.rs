//! Startup schema reconciliation.
//!
//! Brings enum-typed columns and the role foreign key into line with the
//! canonical data model by inspecting the live catalog on every start. There
//! is no history table: every run re-derives what to do from the catalog, so
//! a second run over a reconciled database issues no DDL.
//!
//! Order is fixed: enum types, column bindings, role bootstrap, orphan sweep.
//! Catalog read failures and bootstrap failures abort startup; everything else
//! is recorded in the [`ReconciliationReport`] and retried on the next start.

use std::fmt;

use sea_orm::DatabaseConnection;

pub mod bindings;
pub mod bootstrap;
pub mod catalog;
pub mod dry_run;
pub mod enum_types;
pub mod lock;
pub mod postgres;
pub mod registry;
pub mod report;
pub mod sweeper;

#[cfg(test)]
pub(crate) mod memory;

pub use bootstrap::{BootstrapError, ROLE_BOOTSTRAP, RoleBootstrap};
pub use catalog::{Catalog, CatalogColumnState, CatalogError, SchemaChange};
pub use registry::{ColumnBinding, EnumTypeDef, Registry, RegistryError};
pub use report::{ReconciliationOutcome, ReconciliationReport};

use dry_run::DryRunCatalog;
use lock::SchemaLock;
use postgres::PgCatalog;

// ---------- config ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaConfig {
    /// Hold a Postgres advisory lock for the whole pass.
    pub advisory_lock: bool,
    pub lock_key: i64,
    /// Record statements instead of executing them.
    pub dry_run: bool,
}

pub const DEFAULT_LOCK_KEY: i64 = 7_240_311_001;

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            advisory_lock: true,
            lock_key: DEFAULT_LOCK_KEY,
            dry_run: false,
        }
    }
}

// ---------- errors ----------

/// Failures that must stop the process before it serves traffic.
#[derive(Debug)]
pub enum SchemaError {
    Registry(RegistryError),
    Inspect(CatalogError),
    Bootstrap(BootstrapError),
    Lock(CatalogError),
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::Registry(e) => write!(f, "Invalid schema registry: {e}"),
            SchemaError::Inspect(e) => write!(f, "Catalog inspection failed: {e}"),
            SchemaError::Bootstrap(e) => write!(f, "{e}"),
            SchemaError::Lock(e) => write!(f, "Could not acquire schema lock: {e}"),
        }
    }
}

impl std::error::Error for SchemaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SchemaError::Registry(e) => Some(e),
            SchemaError::Inspect(e) | SchemaError::Lock(e) => Some(e),
            SchemaError::Bootstrap(e) => Some(e),
        }
    }
}

impl From<RegistryError> for SchemaError {
    fn from(e: RegistryError) -> Self {
        SchemaError::Registry(e)
    }
}

impl From<BootstrapError> for SchemaError {
    fn from(e: BootstrapError) -> Self {
        SchemaError::Bootstrap(e)
    }
}

// ---------- orchestrator ----------

/// Runs one reconciliation pass against any [`Catalog`].
pub struct SchemaReconciler<'a, C: ?Sized> {
    catalog: &'a C,
    registry: &'a Registry,
    bootstrap: &'a RoleBootstrap,
}

impl<'a, C: Catalog + ?Sized> SchemaReconciler<'a, C> {
    pub fn new(catalog: &'a C, registry: &'a Registry) -> Self {
        Self {
            catalog,
            registry,
            bootstrap: &ROLE_BOOTSTRAP,
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: &'a RoleBootstrap) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub async fn run(&self, report: &mut ReconciliationReport) -> Result<(), SchemaError> {
        report.enum_types = enum_types::reconcile_enum_types(self.catalog, self.registry)
            .await
            .map_err(SchemaError::Inspect)?;

        report.bindings =
            bindings::reconcile_bindings(self.catalog, self.registry, &report.enum_types)
                .await
                .map_err(SchemaError::Inspect)?;

        report.bootstrap =
            Some(bootstrap::run_role_bootstrap(self.catalog, self.bootstrap).await?);

        report.dropped_types = sweeper::sweep_orphan_types(self.catalog, self.registry).await;

        Ok(())
    }
}

/// Reconcile the live database with `registry`. Call once, before binding
/// any listener; an `Err` means the process must exit.
pub async fn reconcile_schema(
    db: &DatabaseConnection,
    database_url: &str,
    registry: &Registry,
    config: &SchemaConfig,
) -> Result<ReconciliationReport, SchemaError> {
    let lock = if config.advisory_lock && !config.dry_run {
        Some(
            SchemaLock::acquire(database_url, config.lock_key)
                .await
                .map_err(SchemaError::Lock)?,
        )
    } else {
        None
    };

    let catalog = PgCatalog::new(db.clone());
    let mut report = ReconciliationReport::new(config.dry_run);

    let result = if config.dry_run {
        let dry = DryRunCatalog::new(&catalog);
        let result = SchemaReconciler::new(&dry, registry).run(&mut report).await;
        report.finish(dry.into_planned());
        result
    } else {
        let result = SchemaReconciler::new(&catalog, registry).run(&mut report).await;
        report.finish(Vec::new());
        result
    };

    if let Some(lock) = lock {
        if let Err(e) = lock.release().await {
            tracing::warn!(error = %e, "failed to release schema advisory lock");
        }
    }

    result?;
    log_summary(&report);
    Ok(report)
}

fn log_summary(report: &ReconciliationReport) {
    let counts = report.counts();
    if report.is_clean() {
        tracing::info!(
            created = counts.created,
            converted = counts.converted,
            unchanged = counts.unchanged,
            skipped = counts.skipped,
            dropped_types = report.dropped_types.len(),
            "schema reconciliation complete"
        );
    } else {
        tracing::warn!(
            created = counts.created,
            converted = counts.converted,
            unchanged = counts.unchanged,
            skipped = counts.skipped,
            failed = counts.failed,
            "schema reconciliation finished with failures; affected columns are retried on next start"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::catalog::sqlstate;
    use crate::schema::memory::MemoryCatalog;
    use crate::schema::registry::LIFECYCLE_STAGE;
    use crate::schema::report::BootstrapOutcome;

    /// Every table the canonical registry and the bootstrap touch, empty.
    fn fresh_catalog() -> MemoryCatalog {
        [
            "companies",
            "contacts",
            "deals",
            "tasks",
            "tickets",
            "campaigns",
            "payments",
            "users",
        ]
        .into_iter()
        .fold(MemoryCatalog::new(), |c, t| c.with_table(t, 0))
    }

    async fn run(catalog: &MemoryCatalog) -> Result<ReconciliationReport, SchemaError> {
        let registry = Registry::canonical().unwrap();
        let mut report = ReconciliationReport::new(false);
        SchemaReconciler::new(catalog, &registry)
            .run(&mut report)
            .await?;
        Ok(report)
    }

    #[tokio::test]
    async fn test_fresh_catalog_gets_full_schema() {
        let catalog = fresh_catalog();
        let report = run(&catalog).await.unwrap();

        assert!(report.is_clean());
        assert_eq!(
            catalog.type_values("lifecycle_stage_enum").unwrap().len(),
            14
        );
        let column = catalog.column("companies", "lifecycleStage").unwrap();
        assert_eq!(column.type_name, "lifecycle_stage_enum");
        assert!(!column.nullable);
        assert_eq!(
            column.default_expr.as_deref(),
            Some("'lead'::lifecycle_stage_enum")
        );
        assert_eq!(report.bootstrap, Some(BootstrapOutcome::Applied));
        assert_eq!(report.counts().created, report.bindings.len());
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let catalog = fresh_catalog();
        run(&catalog).await.unwrap();
        catalog.clear_applied();

        let report = run(&catalog).await.unwrap();

        assert!(
            catalog.applied().is_empty(),
            "second run issued DDL: {:?}",
            catalog.applied()
        );
        assert!(
            report
                .bindings
                .iter()
                .all(|b| b.outcome == ReconciliationOutcome::Unchanged)
        );
        assert_eq!(report.bootstrap, Some(BootstrapOutcome::AlreadyApplied));
        assert!(report.dropped_types.is_empty());
    }

    #[tokio::test]
    async fn test_legacy_type_converted_then_swept() {
        let catalog = fresh_catalog()
            .with_type("enum_companies_lifecycleStage", &["lead", "customer"])
            .with_column(
                "companies",
                "lifecycleStage",
                "enum_companies_lifecycleStage",
                &[Some("customer")],
            )
            .with_default(
                "companies",
                "lifecycleStage",
                "'lead'::\"enum_companies_lifecycleStage\"",
            );

        let report = run(&catalog).await.unwrap();

        let binding = report.binding("companies", "lifecycleStage").unwrap();
        assert_eq!(binding.outcome, ReconciliationOutcome::Converted);
        let column = catalog.column("companies", "lifecycleStage").unwrap();
        assert_eq!(column.type_name, LIFECYCLE_STAGE.name);
        assert_eq!(column.values, vec![Some("customer".to_string())]);
        // The legacy type lost its last reference during conversion.
        assert_eq!(
            report.dropped_types,
            vec!["enum_companies_lifecycleStage".to_string()]
        );
    }

    #[tokio::test]
    async fn test_incompatible_legacy_value_fails_but_run_completes() {
        let catalog = fresh_catalog()
            .with_type("enum_companies_lifecycleStage", &["lead", "partner"])
            .with_column(
                "companies",
                "lifecycleStage",
                "enum_companies_lifecycleStage",
                &[Some("partner")],
            );

        let report = run(&catalog).await.unwrap();

        assert!(!report.is_clean());
        assert!(
            report
                .binding("companies", "lifecycleStage")
                .unwrap()
                .outcome
                .is_failed()
        );
        let column = catalog.column("companies", "lifecycleStage").unwrap();
        assert_eq!(column.type_name, "enum_companies_lifecycleStage");
        assert_eq!(column.values, vec![Some("partner".to_string())]);
        // Still referenced, so the sweeper keeps it.
        assert!(catalog.type_values("enum_companies_lifecycleStage").is_some());
        assert_eq!(report.bootstrap, Some(BootstrapOutcome::Applied));
    }

    #[tokio::test]
    async fn test_orphan_swept_and_canonical_unused_type_kept() {
        let catalog = fresh_catalog().with_type("enum_old_unused_field", &["x"]);
        let report = run(&catalog).await.unwrap();

        assert_eq!(report.dropped_types, vec!["enum_old_unused_field".to_string()]);
        assert!(catalog.type_values("enum_old_unused_field").is_none());
        for def in Registry::canonical().unwrap().types() {
            assert!(catalog.type_values(def.name).is_some(), "{} was dropped", def.name);
        }
    }

    #[tokio::test]
    async fn test_inspector_failure_aborts() {
        let catalog = fresh_catalog();
        catalog.set_offline(true);
        let err = run(&catalog).await.unwrap_err();
        assert!(matches!(err, SchemaError::Inspect(CatalogError::Connect(_))));
    }

    #[tokio::test]
    async fn test_bootstrap_failure_aborts_before_sweep() {
        let catalog = fresh_catalog()
            .with_type("enum_old_unused_field", &["x"])
            .fail_when(sqlstate::INSUFFICIENT_PRIVILEGE, |c| {
                matches!(c, SchemaChange::SetNotNull { .. })
            });
        let err = run(&catalog).await.unwrap_err();

        assert!(matches!(err, SchemaError::Bootstrap(_)), "got {err:?}");
        assert!(
            catalog.type_values("enum_old_unused_field").is_some(),
            "sweeper must not run after a fatal bootstrap error"
        );
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_applying() {
        let catalog = fresh_catalog();
        let registry = Registry::canonical().unwrap();
        let dry = DryRunCatalog::new(&catalog);
        let mut report = ReconciliationReport::new(true);
        SchemaReconciler::new(&dry, &registry)
            .run(&mut report)
            .await
            .unwrap();
        let planned = dry.into_planned();

        assert!(catalog.applied().is_empty());
        assert!(catalog.type_values("lifecycle_stage_enum").is_none());
        assert!(
            planned
                .iter()
                .any(|sql| sql.starts_with("CREATE TYPE \"lifecycle_stage_enum\""))
        );
        assert!(planned.iter().any(|sql| sql.contains("\"roleId\"")));
    }
}
