//! Canonical enum types and the columns bound to them.
//!
//! The registry is compile-time data. It is validated once at startup by
//! [`Registry::new`] and then passed by reference to every reconciler.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Prefix of enum types generated by the legacy ORM (`enum_<table>_<column>`).
pub const GENERATED_TYPE_PREFIX: &str = "enum_";

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumTypeDef {
    pub name: &'static str,
    /// Declared order is used for `CREATE TYPE`; membership is order-free.
    pub values: &'static [&'static str],
}

impl EnumTypeDef {
    pub fn contains(&self, value: &str) -> bool {
        self.values.contains(&value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnBinding {
    pub table: &'static str,
    pub column: &'static str,
    pub enum_type: &'static str,
    pub default: Option<&'static str>,
    pub nullable: bool,
}

impl ColumnBinding {
    /// The column is added `NOT NULL` only when a default can backfill existing rows.
    pub fn not_null(&self) -> bool {
        !self.nullable && self.default.is_some()
    }
}

impl fmt::Display for ColumnBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

// ---------- errors ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    InvalidIdentifier(String),
    DuplicateType(String),
    EmptyType(String),
    EmptyValue(String),
    DuplicateValue { enum_type: String, value: String },
    UnknownType { binding: String, enum_type: String },
    DuplicateBinding(String),
    DefaultNotAllowed { binding: String, value: String },
    MissingDefault(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::InvalidIdentifier(id) => write!(f, "Invalid identifier: {id:?}"),
            RegistryError::DuplicateType(name) => write!(f, "Enum type declared twice: {name}"),
            RegistryError::EmptyType(name) => write!(f, "Enum type {name} has no values"),
            RegistryError::EmptyValue(name) => write!(f, "Enum type {name} has an empty value"),
            RegistryError::DuplicateValue { enum_type, value } => {
                write!(f, "Enum type {enum_type} lists {value:?} twice")
            }
            RegistryError::UnknownType { binding, enum_type } => {
                write!(f, "Binding {binding} references undeclared type {enum_type}")
            }
            RegistryError::DuplicateBinding(binding) => write!(f, "Column bound twice: {binding}"),
            RegistryError::DefaultNotAllowed { binding, value } => {
                write!(f, "Default {value:?} of {binding} is not a value of its type")
            }
            RegistryError::MissingDefault(binding) => {
                write!(f, "Binding {binding} is NOT NULL but has no default")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

// ---------- registry ----------

#[derive(Debug, Clone)]
pub struct Registry {
    types: &'static [EnumTypeDef],
    bindings: &'static [ColumnBinding],
    by_name: HashMap<&'static str, usize>,
}

impl Registry {
    /// Build and validate a registry. Any error here is a programming error in
    /// the declared data and aborts startup.
    pub fn new(
        types: &'static [EnumTypeDef],
        bindings: &'static [ColumnBinding],
    ) -> Result<Self, RegistryError> {
        let mut by_name = HashMap::with_capacity(types.len());
        for (idx, def) in types.iter().enumerate() {
            check_identifier(def.name)?;
            if by_name.insert(def.name, idx).is_some() {
                return Err(RegistryError::DuplicateType(def.name.to_string()));
            }
            if def.values.is_empty() {
                return Err(RegistryError::EmptyType(def.name.to_string()));
            }
            let mut seen = HashSet::new();
            for value in def.values {
                if value.is_empty() {
                    return Err(RegistryError::EmptyValue(def.name.to_string()));
                }
                if !seen.insert(*value) {
                    return Err(RegistryError::DuplicateValue {
                        enum_type: def.name.to_string(),
                        value: value.to_string(),
                    });
                }
            }
        }

        let mut columns = HashSet::new();
        for binding in bindings {
            check_identifier(binding.table)?;
            check_identifier(binding.column)?;
            if !columns.insert((binding.table, binding.column)) {
                return Err(RegistryError::DuplicateBinding(binding.to_string()));
            }
            let def = by_name
                .get(binding.enum_type)
                .map(|idx| &types[*idx])
                .ok_or_else(|| RegistryError::UnknownType {
                    binding: binding.to_string(),
                    enum_type: binding.enum_type.to_string(),
                })?;
            match binding.default {
                Some(value) if !def.contains(value) => {
                    return Err(RegistryError::DefaultNotAllowed {
                        binding: binding.to_string(),
                        value: value.to_string(),
                    });
                }
                None if !binding.nullable => {
                    return Err(RegistryError::MissingDefault(binding.to_string()));
                }
                _ => {}
            }
        }

        Ok(Self {
            types,
            bindings,
            by_name,
        })
    }

    /// The CRM's canonical data model.
    pub fn canonical() -> Result<Self, RegistryError> {
        Self::new(CANONICAL_TYPES, CANONICAL_BINDINGS)
    }

    pub fn types(&self) -> &'static [EnumTypeDef] {
        self.types
    }

    pub fn bindings(&self) -> &'static [ColumnBinding] {
        self.bindings
    }

    pub fn enum_type(&self, name: &str) -> Option<&'static EnumTypeDef> {
        self.by_name.get(name).map(|idx| &self.types[*idx])
    }

    pub fn is_canonical(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn canonical_names(&self) -> HashSet<String> {
        self.types.iter().map(|t| t.name.to_string()).collect()
    }

    /// Whether a catalog type name belongs to the application: either a
    /// canonical type or one generated under the legacy naming convention.
    pub fn is_managed_type(&self, name: &str) -> bool {
        self.is_canonical(name) || name.starts_with(GENERATED_TYPE_PREFIX)
    }
}

fn check_identifier(id: &str) -> Result<(), RegistryError> {
    if IDENTIFIER.is_match(id) {
        Ok(())
    } else {
        Err(RegistryError::InvalidIdentifier(id.to_string()))
    }
}

// ---------- canonical data ----------

pub const LIFECYCLE_STAGE: EnumTypeDef = EnumTypeDef {
    name: "lifecycle_stage_enum",
    values: &[
        "subscriber",
        "lead",
        "marketing_qualified_lead",
        "sales_qualified_lead",
        "opportunity",
        "customer",
        "evangelist",
        "prospect",
        "qualified",
        "negotiation",
        "closed_won",
        "closed_lost",
        "churned",
        "other",
    ],
};

pub const LEAD_STATUS: EnumTypeDef = EnumTypeDef {
    name: "lead_status_enum",
    values: &[
        "new",
        "open",
        "in_progress",
        "open_deal",
        "unqualified",
        "attempted_to_contact",
        "connected",
        "bad_timing",
    ],
};

pub const DEAL_STAGE: EnumTypeDef = EnumTypeDef {
    name: "deal_stage_enum",
    values: &[
        "appointment_scheduled",
        "qualified_to_buy",
        "presentation_scheduled",
        "decision_maker_bought_in",
        "contract_sent",
        "closed_won",
        "closed_lost",
    ],
};

pub const PRIORITY: EnumTypeDef = EnumTypeDef {
    name: "priority_enum",
    values: &["low", "medium", "high", "urgent"],
};

pub const TASK_STATUS: EnumTypeDef = EnumTypeDef {
    name: "task_status_enum",
    values: &["not_started", "in_progress", "waiting", "completed", "deferred"],
};

pub const TASK_TYPE: EnumTypeDef = EnumTypeDef {
    name: "task_type_enum",
    values: &["todo", "call", "email", "meeting"],
};

pub const TICKET_STATUS: EnumTypeDef = EnumTypeDef {
    name: "ticket_status_enum",
    values: &["new", "waiting_on_contact", "waiting_on_us", "closed"],
};

pub const TICKET_SOURCE: EnumTypeDef = EnumTypeDef {
    name: "ticket_source_enum",
    values: &["email", "phone", "chat", "form"],
};

pub const CAMPAIGN_STATUS: EnumTypeDef = EnumTypeDef {
    name: "campaign_status_enum",
    values: &["draft", "scheduled", "active", "paused", "completed", "cancelled"],
};

pub const CAMPAIGN_TYPE: EnumTypeDef = EnumTypeDef {
    name: "campaign_type_enum",
    values: &["email", "social", "event", "webinar", "ads", "other"],
};

pub const PAYMENT_STATUS: EnumTypeDef = EnumTypeDef {
    name: "payment_status_enum",
    values: &["pending", "completed", "failed", "refunded", "cancelled"],
};

pub const PAYMENT_METHOD: EnumTypeDef = EnumTypeDef {
    name: "payment_method_enum",
    values: &["credit_card", "bank_transfer", "cash", "check", "paypal", "other"],
};

pub const CANONICAL_TYPES: &[EnumTypeDef] = &[
    LIFECYCLE_STAGE,
    LEAD_STATUS,
    DEAL_STAGE,
    PRIORITY,
    TASK_STATUS,
    TASK_TYPE,
    TICKET_STATUS,
    TICKET_SOURCE,
    CAMPAIGN_STATUS,
    CAMPAIGN_TYPE,
    PAYMENT_STATUS,
    PAYMENT_METHOD,
];

const fn required(
    table: &'static str,
    column: &'static str,
    enum_type: &'static str,
    default: &'static str,
) -> ColumnBinding {
    ColumnBinding {
        table,
        column,
        enum_type,
        default: Some(default),
        nullable: false,
    }
}

const fn optional(table: &'static str, column: &'static str, enum_type: &'static str) -> ColumnBinding {
    ColumnBinding {
        table,
        column,
        enum_type,
        default: None,
        nullable: true,
    }
}

pub const CANONICAL_BINDINGS: &[ColumnBinding] = &[
    required("companies", "lifecycleStage", "lifecycle_stage_enum", "lead"),
    required("contacts", "lifecycleStage", "lifecycle_stage_enum", "lead"),
    optional("contacts", "leadStatus", "lead_status_enum"),
    required("deals", "stage", "deal_stage_enum", "appointment_scheduled"),
    required("deals", "priority", "priority_enum", "medium"),
    required("tasks", "status", "task_status_enum", "not_started"),
    required("tasks", "priority", "priority_enum", "medium"),
    required("tasks", "type", "task_type_enum", "todo"),
    required("tickets", "status", "ticket_status_enum", "new"),
    required("tickets", "priority", "priority_enum", "medium"),
    optional("tickets", "source", "ticket_source_enum"),
    required("campaigns", "status", "campaign_status_enum", "draft"),
    optional("campaigns", "type", "campaign_type_enum"),
    required("payments", "status", "payment_status_enum", "pending"),
    optional("payments", "method", "payment_method_enum"),
];
