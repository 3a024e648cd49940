use std::collections::HashSet;

use super::catalog::{
    Catalog, CatalogColumnState, CatalogError, ColumnDefault, ColumnType, SchemaChange,
};
use super::registry::{ColumnBinding, EnumTypeDef, Registry};
use super::report::{BindingReport, ReconciliationOutcome, SkipReason, TypeOutcome, TypeReport};

/// Reconcile every bound column, in registry order.
///
/// Statement failures are isolated per binding and recorded as `Failed`.
/// Only a failure to read a column's catalog state is returned as `Err`.
pub async fn reconcile_bindings<C: Catalog + ?Sized>(
    catalog: &C,
    registry: &Registry,
    types: &[TypeReport],
) -> Result<Vec<BindingReport>, CatalogError> {
    let available: HashSet<&str> = types
        .iter()
        .filter(|t| !matches!(t.outcome, TypeOutcome::Failed { .. }))
        .map(|t| t.name.as_str())
        .collect();

    let mut reports = Vec::with_capacity(registry.bindings().len());
    for binding in registry.bindings() {
        let report = match registry.enum_type(binding.enum_type) {
            Some(def) if available.contains(def.name) => {
                reconcile_binding(catalog, registry, binding, def).await?
            }
            _ => {
                tracing::warn!(
                    table = binding.table,
                    column = binding.column,
                    enum_type = binding.enum_type,
                    "enum type unavailable; skipping column until next start"
                );
                BindingReport {
                    table: binding.table.to_string(),
                    column: binding.column.to_string(),
                    enum_type: binding.enum_type.to_string(),
                    previous_type: None,
                    outcome: ReconciliationOutcome::Skipped {
                        reason: SkipReason::TypeUnavailable,
                    },
                }
            }
        };
        reports.push(report);
    }
    Ok(reports)
}

async fn reconcile_binding<C: Catalog + ?Sized>(
    catalog: &C,
    registry: &Registry,
    binding: &ColumnBinding,
    def: &EnumTypeDef,
) -> Result<BindingReport, CatalogError> {
    let state = catalog.column_state(binding.table, binding.column).await?;

    let outcome = match state.type_name.as_deref() {
        None => add_column(catalog, binding).await,
        Some(current) if current == def.name => ensure_default(catalog, binding, &state).await,
        Some(current) if state.is_enum && registry.is_managed_type(current) => {
            convert_column(catalog, binding, def, current, &state).await
        }
        Some(current) => {
            if current == "text" {
                tracing::warn!(
                    table = binding.table,
                    column = binding.column,
                    "column is text; it may be left over from an interrupted conversion"
                );
            } else {
                tracing::info!(
                    table = binding.table,
                    column = binding.column,
                    current_type = current,
                    "column is not an application enum; leaving it as is"
                );
            }
            ReconciliationOutcome::Skipped {
                reason: SkipReason::NotEnum,
            }
        }
    };

    Ok(BindingReport {
        table: binding.table.to_string(),
        column: binding.column.to_string(),
        enum_type: def.name.to_string(),
        previous_type: state.type_name.clone(),
        outcome,
    })
}

async fn add_column<C: Catalog + ?Sized>(
    catalog: &C,
    binding: &ColumnBinding,
) -> ReconciliationOutcome {
    let change = SchemaChange::AddEnumColumn {
        table: binding.table.to_string(),
        column: binding.column.to_string(),
        enum_type: binding.enum_type.to_string(),
        default: binding.default.map(str::to_string),
        not_null: binding.not_null(),
    };
    match catalog.apply(&change).await {
        Ok(_) => {
            tracing::info!(
                table = binding.table,
                column = binding.column,
                enum_type = binding.enum_type,
                "added enum column"
            );
            ReconciliationOutcome::Created
        }
        Err(e) => failed(binding, "failed to add column", e),
    }
}

/// A column already carrying the right type but missing its default (e.g. a
/// previous conversion died after the second cast) gets the default back.
async fn ensure_default<C: Catalog + ?Sized>(
    catalog: &C,
    binding: &ColumnBinding,
    state: &CatalogColumnState,
) -> ReconciliationOutcome {
    let Some(value) = binding.default else {
        return ReconciliationOutcome::Unchanged;
    };
    if state.default_expr.is_some() {
        return ReconciliationOutcome::Unchanged;
    }
    tracing::warn!(
        table = binding.table,
        column = binding.column,
        "column has the bound type but no default; restoring it"
    );
    match catalog.apply(&set_default(binding, value)).await {
        Ok(_) => ReconciliationOutcome::Unchanged,
        Err(e) => failed(binding, "failed to restore column default", e),
    }
}

/// Move a column from one managed enum type to the bound one by way of text.
/// Values outside the target set are detected up front so the column is
/// never left half-migrated because of incompatible data.
async fn convert_column<C: Catalog + ?Sized>(
    catalog: &C,
    binding: &ColumnBinding,
    def: &EnumTypeDef,
    current: &str,
    state: &CatalogColumnState,
) -> ReconciliationOutcome {
    let values = match catalog.column_values(binding.table, binding.column).await {
        Ok(values) => values,
        Err(e) => return failed(binding, "failed to read existing values", e),
    };
    let offending: Vec<&String> = values.iter().filter(|v| !def.contains(v)).collect();
    if !offending.is_empty() {
        tracing::error!(
            table = binding.table,
            column = binding.column,
            from = current,
            to = def.name,
            offending = ?offending,
            "existing values are not members of the target enum; manual intervention required"
        );
        return ReconciliationOutcome::Failed {
            error: format!(
                "{binding}: values {offending:?} are not members of {}",
                def.name
            ),
        };
    }

    let table = binding.table.to_string();
    let column = binding.column.to_string();

    if state.default_expr.is_some() {
        let drop_default = SchemaChange::DropColumnDefault {
            table: table.clone(),
            column: column.clone(),
        };
        if let Err(e) = catalog.apply(&drop_default).await {
            return failed(binding, "failed to drop default before conversion", e);
        }
    }

    let to_text = SchemaChange::AlterColumnType {
        table: table.clone(),
        column: column.clone(),
        target: ColumnType::Text,
    };
    if let Err(e) = catalog.apply(&to_text).await {
        restore_default(catalog, binding, state).await;
        return failed(binding, "failed to cast column to text", e);
    }

    let to_enum = SchemaChange::AlterColumnType {
        table,
        column,
        target: ColumnType::Named(def.name.to_string()),
    };
    if let Err(e) = catalog.apply(&to_enum).await {
        revert_to(catalog, binding, current, state).await;
        return failed(binding, "failed to cast column to target enum", e);
    }

    if let Some(value) = binding.default {
        if let Err(e) = catalog.apply(&set_default(binding, value)).await {
            return failed(binding, "converted but failed to set default", e);
        }
    }

    tracing::info!(
        table = binding.table,
        column = binding.column,
        from = current,
        to = def.name,
        rows = values.len(),
        "converted enum column"
    );
    ReconciliationOutcome::Converted
}

/// Put a text column back on its original type so it stays readable.
async fn revert_to<C: Catalog + ?Sized>(
    catalog: &C,
    binding: &ColumnBinding,
    original: &str,
    state: &CatalogColumnState,
) {
    let revert = SchemaChange::AlterColumnType {
        table: binding.table.to_string(),
        column: binding.column.to_string(),
        target: ColumnType::Named(original.to_string()),
    };
    match catalog.apply(&revert).await {
        Ok(_) => restore_default(catalog, binding, state).await,
        Err(e) => tracing::error!(
            table = binding.table,
            column = binding.column,
            original_type = original,
            error = %e,
            "could not revert column after failed conversion; it is now text"
        ),
    }
}

async fn restore_default<C: Catalog + ?Sized>(
    catalog: &C,
    binding: &ColumnBinding,
    state: &CatalogColumnState,
) {
    let Some(expr) = &state.default_expr else {
        return;
    };
    let change = SchemaChange::SetColumnDefault {
        table: binding.table.to_string(),
        column: binding.column.to_string(),
        default: ColumnDefault::Expression { sql: expr.clone() },
    };
    if let Err(e) = catalog.apply(&change).await {
        tracing::warn!(
            table = binding.table,
            column = binding.column,
            error = %e,
            "could not restore original default"
        );
    }
}

fn set_default(binding: &ColumnBinding, value: &str) -> SchemaChange {
    SchemaChange::SetColumnDefault {
        table: binding.table.to_string(),
        column: binding.column.to_string(),
        default: ColumnDefault::EnumLiteral {
            enum_type: binding.enum_type.to_string(),
            value: value.to_string(),
        },
    }
}

fn failed(binding: &ColumnBinding, what: &str, e: CatalogError) -> ReconciliationOutcome {
    tracing::error!(
        table = binding.table,
        column = binding.column,
        enum_type = binding.enum_type,
        error = %e,
        "{what}"
    );
    ReconciliationOutcome::Failed {
        error: format!("{binding}: {what}: {e}"),
    }
}
