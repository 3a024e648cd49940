use super::catalog::{Catalog, SchemaChange};
use super::registry::Registry;

/// Drop generated enum types that are no longer canonical. Best effort: a type
/// still referenced by some column (even one outside the registry) stays, and
/// no failure here ever propagates. Returns the names actually dropped.
pub async fn sweep_orphan_types<C: Catalog + ?Sized>(catalog: &C, registry: &Registry) -> Vec<String> {
    let canonical = registry.canonical_names();
    let candidates = match catalog.list_orphan_enum_types(&canonical).await {
        Ok(candidates) => candidates,
        Err(e) => {
            tracing::warn!(error = %e, "could not list orphan enum types; skipping sweep");
            return Vec::new();
        }
    };

    let mut dropped = Vec::new();
    for name in candidates {
        if registry.is_canonical(&name) {
            continue;
        }
        let change = SchemaChange::DropEnumType { name: name.clone() };
        match catalog.apply(&change).await {
            Ok(_) => {
                tracing::info!(enum_type = %name, "dropped orphan enum type");
                dropped.push(name);
            }
            Err(e) if e.is_still_referenced() => {
                tracing::info!(enum_type = %name, "orphan enum type still referenced; keeping it");
            }
            Err(e) => {
                tracing::info!(enum_type = %name, error = %e, "could not drop orphan enum type");
            }
        }
    }
    dropped
}
