// Entity definitions - named record types with an ordered attribute list

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::ValidationItem;

/// Semantic attribute type, mapped onto a storage class by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SemanticType {
    Integer,
    Float,
    Text,
    Boolean,
    DateTime,
    Json,
}

impl SemanticType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            SemanticType::Integer | SemanticType::Boolean => "INTEGER",
            SemanticType::Float => "REAL",
            SemanticType::Text | SemanticType::DateTime | SemanticType::Json => "TEXT",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            SemanticType::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            SemanticType::Float => value.is_number(),
            SemanticType::Text | SemanticType::DateTime => value.is_string(),
            SemanticType::Boolean => value.is_boolean(),
            SemanticType::Json => true,
        }
    }
}

/// Computed read transform applied when a record is hydrated.
pub type Getter = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
/// Computed write transform applied before a value is persisted.
pub type Setter = Arc<dyn Fn(Value) -> Value + Send + Sync>;
/// Per-attribute validator. Returns a human-readable failure message.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub struct AttributeDef {
    pub name: String,
    pub semantic: SemanticType,
    pub nullable: bool,
    pub unique: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub default_value: Option<Value>,
    pub getter: Option<Getter>,
    pub setter: Option<Setter>,
    pub validators: Vec<(String, Validator)>,
}

impl AttributeDef {
    pub fn new(name: impl Into<String>, semantic: SemanticType) -> Self {
        Self {
            name: name.into(),
            semantic,
            nullable: true,
            unique: false,
            primary_key: false,
            auto_increment: false,
            default_value: None,
            getter: None,
            setter: None,
            validators: Vec::new(),
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn primary(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn get<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(f));
        self
    }

    pub fn set<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(f));
        self
    }

    pub fn validate(mut self, name: impl Into<String>, validator: Validator) -> Self {
        self.validators.push((name.into(), validator));
        self
    }
}

impl fmt::Debug for AttributeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeDef")
            .field("name", &self.name)
            .field("semantic", &self.semantic)
            .field("nullable", &self.nullable)
            .field("unique", &self.unique)
            .field("primary_key", &self.primary_key)
            .field("auto_increment", &self.auto_increment)
            .field("default_value", &self.default_value)
            .finish()
    }
}

/// Common validators, in the spirit of the usual attribute checks
/// (length bounds, email shape).
pub mod validators {
    use super::Validator;
    use serde_json::Value;
    use std::sync::Arc;

    pub fn length(min: usize, max: usize) -> Validator {
        Arc::new(move |v: &Value| {
            let s = v.as_str().unwrap_or_default();
            let n = s.chars().count();
            if n < min {
                Err(format!("must be at least {} characters", min))
            } else if n > max {
                Err(format!("must be at most {} characters", max))
            } else {
                Ok(())
            }
        })
    }

    pub fn is_email() -> Validator {
        Arc::new(|v: &Value| match v.as_str() {
            Some(s) if s.contains('@') => Ok(()),
            _ => Err("invalid email format".to_string()),
        })
    }

    pub fn not_empty() -> Validator {
        Arc::new(|v: &Value| match v.as_str() {
            Some(s) if !s.is_empty() => Ok(()),
            _ => Err("cannot be empty".to_string()),
        })
    }
}

#[derive(Clone)]
pub struct EntityDef {
    pub name: String,
    pub table: String,
    pub attributes: Vec<AttributeDef>,
    pub timestamps: bool,
    pub versioned: bool,
}

impl EntityDef {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let table = format!("{}s", name);
        Self {
            name,
            table,
            attributes: Vec::new(),
            timestamps: false,
            versioned: false,
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn attr(mut self, attr: AttributeDef) -> Self {
        self.attributes.push(attr);
        self
    }

    /// Maintain `created_at` / `updated_at` on writes (via the built-in
    /// timestamp hook).
    pub fn timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    /// Enable optimistic locking through an integer `version` attribute.
    pub fn versioned(mut self) -> Self {
        self.versioned = true;
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    /// The primary key attribute. The registry guarantees one exists after
    /// finalization.
    pub fn primary_key(&self) -> &AttributeDef {
        self.attributes
            .iter()
            .find(|a| a.primary_key)
            .expect("entity finalized without primary key")
    }

    /// Inject implicit attributes: an auto-increment `id` primary key when
    /// none was declared, bookkeeping timestamps, and the version counter.
    pub(crate) fn finalize(&mut self) {
        if !self.attributes.iter().any(|a| a.primary_key) {
            self.attributes.insert(
                0,
                AttributeDef::new("id", SemanticType::Integer)
                    .primary()
                    .auto_increment(),
            );
        }
        if self.timestamps {
            for name in ["created_at", "updated_at"] {
                if !self.has_attribute(name) {
                    self.attributes
                        .push(AttributeDef::new(name, SemanticType::DateTime));
                }
            }
        }
        if self.versioned && !self.has_attribute("version") {
            self.attributes.push(
                AttributeDef::new("version", SemanticType::Integer)
                    .default_value(Value::from(0)),
            );
        }
    }

    /// Validate a record against every attribute, collecting all failures
    /// rather than stopping at the first.
    pub fn validate_record(&self, record: &Map<String, Value>) -> Vec<ValidationItem> {
        let mut items = Vec::new();
        for attr in &self.attributes {
            let value = record.get(&attr.name);
            let missing = matches!(value, None | Some(Value::Null));
            if missing {
                let implicit = attr.auto_increment
                    || attr.default_value.is_some()
                    || (self.timestamps
                        && (attr.name == "created_at" || attr.name == "updated_at"));
                if !attr.nullable && !implicit {
                    items.push(ValidationItem::new(&attr.name, "cannot be null"));
                }
                continue;
            }
            let value = value.unwrap_or(&Value::Null);
            if !attr.semantic.matches(value) {
                items.push(ValidationItem::new(
                    &attr.name,
                    format!("expected {:?} value", attr.semantic),
                ));
                continue;
            }
            for (vname, validator) in &attr.validators {
                if let Err(msg) = validator(value) {
                    tracing::debug!("validator '{}' rejected {}.{}", vname, self.name, attr.name);
                    items.push(ValidationItem::new(&attr.name, msg));
                }
            }
        }
        items
    }
}

impl fmt::Debug for EntityDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDef")
            .field("name", &self.name)
            .field("table", &self.table)
            .field(
                "attributes",
                &self.attributes.iter().map(|a| &a.name).collect::<Vec<_>>(),
            )
            .field("timestamps", &self.timestamps)
            .field("versioned", &self.versioned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_entity() -> EntityDef {
        let mut def = EntityDef::new("user")
            .attr(
                AttributeDef::new("username", SemanticType::Text)
                    .not_null()
                    .validate("length", validators::length(3, 30)),
            )
            .attr(AttributeDef::new("email", SemanticType::Text).validate("email", validators::is_email()))
            .attr(AttributeDef::new("age", SemanticType::Integer));
        def.finalize();
        def
    }

    #[test]
    fn finalize_injects_primary_key() {
        let def = user_entity();
        assert_eq!(def.primary_key().name, "id");
        assert!(def.primary_key().auto_increment);
    }

    #[test]
    fn validation_collects_every_failure() {
        let def = user_entity();
        let record = json!({"username": "ab", "email": "nope", "age": "old"});
        let items = def.validate_record(record.as_object().unwrap());
        let attrs: Vec<_> = items.iter().map(|i| i.attribute.as_str()).collect();
        assert_eq!(attrs, vec!["username", "email", "age"]);
    }

    #[test]
    fn missing_not_null_is_reported() {
        let def = user_entity();
        let record = json!({"email": "a@b.c"});
        let items = def.validate_record(record.as_object().unwrap());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attribute, "username");
    }

    #[test]
    fn versioned_entity_gets_version_attribute() {
        let mut def = EntityDef::new("document").versioned();
        def.finalize();
        assert!(def.has_attribute("version"));
        assert_eq!(
            def.attribute("version").unwrap().default_value,
            Some(json!(0))
        );
    }
}
