use std::fmt;

/// A single attribute-level validation failure. Whole-record validation
/// collects every failing attribute before reporting, it never stops at the
/// first one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationItem {
    pub attribute: String,
    pub message: String,
}

impl ValidationItem {
    pub fn new(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub enum OrmError {
    Validation(Vec<ValidationItem>),
    UniqueConstraint { entity: String, attribute: String },
    ForeignKeyConstraint { entity: String },
    InvalidOperator(String),
    TypeAmbiguity(String),
    AssociationNotFound(String),
    ScopeNotFound { entity: String, scope: String },
    UnknownAttribute { entity: String, attribute: String },
    OptimisticLock { entity: String, pk: i64 },
    CyclicDependency(Vec<String>),
    SchemaError(String),
    TxnExpired,
    Database(String),
    Configuration(String),
}

impl fmt::Display for OrmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrmError::Validation(items) => {
                write!(f, "Validation error: ")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}: {}", item.attribute, item.message)?;
                }
                Ok(())
            }
            OrmError::UniqueConstraint { entity, attribute } => {
                write!(f, "Unique constraint violation on {}.{}", entity, attribute)
            }
            OrmError::ForeignKeyConstraint { entity } => {
                write!(f, "Foreign key constraint violation on {}", entity)
            }
            OrmError::InvalidOperator(key) => write!(f, "Invalid operator: {}", key),
            OrmError::TypeAmbiguity(msg) => write!(f, "Ambiguous value: {}", msg),
            OrmError::AssociationNotFound(name) => {
                write!(f, "Association not found: {}", name)
            }
            OrmError::ScopeNotFound { entity, scope } => {
                write!(f, "Scope '{}' not found on {}", scope, entity)
            }
            OrmError::UnknownAttribute { entity, attribute } => {
                write!(f, "Unknown attribute {}.{}", entity, attribute)
            }
            OrmError::OptimisticLock { entity, pk } => {
                write!(f, "Stale version for {} id {}", entity, pk)
            }
            OrmError::CyclicDependency(names) => {
                write!(f, "Cyclic dependency between entities: {}", names.join(", "))
            }
            OrmError::SchemaError(msg) => write!(f, "Schema error: {}", msg),
            OrmError::TxnExpired => write!(f, "Transaction expired before resolution"),
            OrmError::Database(msg) => write!(f, "Database error: {}", msg),
            OrmError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for OrmError {}

impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        OrmError::Database(err.to_string())
    }
}

impl From<anyhow::Error> for OrmError {
    fn from(err: anyhow::Error) -> Self {
        OrmError::Configuration(err.to_string())
    }
}

/// Map a driver error to the constraint-specific variants where the SQLite
/// message identifies one. `UNIQUE constraint failed: table.column` carries
/// the offending column, foreign key failures do not.
pub(crate) fn map_db_err(entity: &str, err: sqlx::Error) -> OrmError {
    if let sqlx::Error::Database(db_err) = &err {
        let msg = db_err.message();
        if let Some(rest) = msg.strip_prefix("UNIQUE constraint failed: ") {
            let attribute = rest
                .split(',')
                .next()
                .and_then(|col| col.trim().split('.').nth(1))
                .unwrap_or(rest)
                .to_string();
            return OrmError::UniqueConstraint {
                entity: entity.to_string(),
                attribute,
            };
        }
        if msg.contains("FOREIGN KEY constraint failed") {
            return OrmError::ForeignKeyConstraint {
                entity: entity.to_string(),
            };
        }
    }
    OrmError::Database(err.to_string())
}

pub type OrmResult<T> = Result<T, OrmError>;
