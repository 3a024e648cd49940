use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeOutcome {
    Created,
    Unchanged,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeReport {
    pub name: String,
    pub outcome: TypeOutcome,
    /// Canonical values missing from an existing type. Never added in place.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The column exists with a type that is not an application enum.
    NotEnum,
    /// The bound enum type could not be created this run.
    TypeUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconciliationOutcome {
    Created,
    Converted,
    Unchanged,
    Skipped { reason: SkipReason },
    Failed { error: String },
}

impl ReconciliationOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ReconciliationOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BindingReport {
    pub table: String,
    pub column: String,
    pub enum_type: String,
    /// Catalog type before this run, if the column existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_type: Option<String>,
    pub outcome: ReconciliationOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapOutcome {
    /// Target column already present; nothing was done.
    AlreadyApplied,
    Applied,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub enum_types: Vec<TypeReport>,
    pub bindings: Vec<BindingReport>,
    pub bootstrap: Option<BootstrapOutcome>,
    pub dropped_types: Vec<String>,
    /// Statements recorded instead of executed (dry runs only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub planned: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub created: usize,
    pub converted: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ReconciliationReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            enum_types: Vec::new(),
            bindings: Vec::new(),
            bootstrap: None,
            dropped_types: Vec::new(),
            planned: Vec::new(),
        }
    }

    pub fn finish(&mut self, planned: Vec<String>) {
        self.planned = planned;
        self.finished_at = Some(Utc::now());
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for b in &self.bindings {
            match b.outcome {
                ReconciliationOutcome::Created => counts.created += 1,
                ReconciliationOutcome::Converted => counts.converted += 1,
                ReconciliationOutcome::Unchanged => counts.unchanged += 1,
                ReconciliationOutcome::Skipped { .. } => counts.skipped += 1,
                ReconciliationOutcome::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }

    /// True when no enum type or binding failed.
    pub fn is_clean(&self) -> bool {
        !self.bindings.iter().any(|b| b.outcome.is_failed())
            && !self
                .enum_types
                .iter()
                .any(|t| matches!(t.outcome, TypeOutcome::Failed { .. }))
    }

    pub fn binding(&self, table: &str, column: &str) -> Option<&BindingReport> {
        self.bindings
            .iter()
            .find(|b| b.table == table && b.column == column)
    }
}
