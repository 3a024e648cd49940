use super::catalog::{Catalog, CatalogError, SchemaChange};
use super::registry::{EnumTypeDef, Registry};
use super::report::{TypeOutcome, TypeReport};

/// Make sure every canonical enum type exists. Existing value sets are never
/// altered. Only inspector failures are returned as `Err`.
pub async fn reconcile_enum_types<C: Catalog + ?Sized>(
    catalog: &C,
    registry: &Registry,
) -> Result<Vec<TypeReport>, CatalogError> {
    let mut reports = Vec::with_capacity(registry.types().len());
    for def in registry.types() {
        reports.push(reconcile_one(catalog, def).await?);
    }
    Ok(reports)
}

async fn reconcile_one<C: Catalog + ?Sized>(
    catalog: &C,
    def: &EnumTypeDef,
) -> Result<TypeReport, CatalogError> {
    if catalog.type_exists(def.name).await? {
        let missing_values = missing_values(catalog, def).await;
        if !missing_values.is_empty() {
            tracing::warn!(
                enum_type = def.name,
                missing = ?missing_values,
                "existing enum type lacks canonical values; leaving it unchanged"
            );
        }
        return Ok(TypeReport {
            name: def.name.to_string(),
            outcome: TypeOutcome::Unchanged,
            missing_values,
        });
    }

    let change = SchemaChange::CreateEnumType {
        name: def.name.to_string(),
        values: def.values.iter().map(|v| v.to_string()).collect(),
    };
    let outcome = match catalog.apply(&change).await {
        Ok(_) => {
            tracing::info!(enum_type = def.name, values = def.values.len(), "created enum type");
            TypeOutcome::Created
        }
        Err(e) => {
            // Another process may have created it between our check and the CREATE.
            if catalog.type_exists(def.name).await? {
                tracing::info!(enum_type = def.name, error = %e, "enum type appeared concurrently");
                TypeOutcome::Unchanged
            } else {
                tracing::error!(
                    enum_type = def.name,
                    error = %e,
                    "failed to create enum type; dependent columns will be skipped this run"
                );
                TypeOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    };

    Ok(TypeReport {
        name: def.name.to_string(),
        outcome,
        missing_values: Vec::new(),
    })
}

/// Drift check only; a read failure here is not worth aborting over.
async fn missing_values<C: Catalog + ?Sized>(catalog: &C, def: &EnumTypeDef) -> Vec<String> {
    match catalog.enum_values(def.name).await {
        Ok(existing) => def
            .values
            .iter()
            .filter(|v| !existing.iter().any(|e| e == *v))
            .map(|v| v.to_string())
            .collect(),
        Err(e) => {
            tracing::warn!(enum_type = def.name, error = %e, "could not read enum values");
            Vec::new()
        }
    }
}
