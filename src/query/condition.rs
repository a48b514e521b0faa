// Condition compiler - nested operator trees compiled into the
// backend-neutral predicate AST

use serde_json::Value;

use crate::error::{OrmError, OrmResult};
use crate::query::predicate::{CmpOp, ColumnRef, Predicate};
use crate::schema::entity::EntityDef;

/// Comparison operators carried as explicit tags. The JSON form maps each
/// snake_case key to exactly one tag; there are no aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
    NotBetween,
    In,
    NotIn,
    Like,
    NotLike,
    IsNull,
    NotNull,
}

impl Operator {
    pub fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "eq" => Operator::Eq,
            "ne" => Operator::Ne,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "between" => Operator::Between,
            "not_between" => Operator::NotBetween,
            "in" => Operator::In,
            "not_in" => Operator::NotIn,
            "like" => Operator::Like,
            "not_like" => Operator::NotLike,
            "is_null" => Operator::IsNull,
            "not_null" => Operator::NotNull,
            _ => return None,
        })
    }
}

/// Recursive condition tree: operator leaves combined by AND/OR/NOT.
#[derive(Debug, Clone, PartialEq)]
pub enum Cond {
    And(Vec<Cond>),
    Or(Vec<Cond>),
    Not(Box<Cond>),
    Leaf {
        field: String,
        op: Operator,
        value: Value,
    },
}

impl Cond {
    pub fn leaf(field: impl Into<String>, op: Operator, value: Value) -> Self {
        Cond::Leaf {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::leaf(field, Operator::Eq, value)
    }

    pub fn and(conds: Vec<Cond>) -> Self {
        Cond::And(conds)
    }

    pub fn or(conds: Vec<Cond>) -> Self {
        Cond::Or(conds)
    }

    pub fn not(cond: Cond) -> Self {
        Cond::Not(Box::new(cond))
    }

    /// Parse the JSON operator-map form:
    ///
    /// ```json
    /// {"title": {"like": "foo%"}, "or": [{"author_id": 12}, {"author_id": 13}]}
    /// ```
    ///
    /// Map keys are ANDed. A scalar value is shorthand for `eq`; an explicit
    /// `null` is a null check. A bare array value is ambiguous between set
    /// membership and a literal array and is rejected; callers must either
    /// use `{"in": [...]}` or wrap a literal array one level (`[[...]]`).
    pub fn parse(value: &Value) -> OrmResult<Cond> {
        match value {
            Value::Object(map) => {
                let mut conds = Vec::with_capacity(map.len());
                for (key, v) in map {
                    conds.push(match key.as_str() {
                        "and" => Cond::And(Self::parse_list(v)?),
                        "or" => Cond::Or(Self::parse_list(v)?),
                        "not" => Cond::not(Self::parse(v)?),
                        field => Self::parse_field(field, v)?,
                    });
                }
                Ok(Self::unwrap_single(conds, Cond::And))
            }
            Value::Array(items) => {
                let conds = items.iter().map(Self::parse).collect::<OrmResult<_>>()?;
                Ok(Self::unwrap_single(conds, Cond::And))
            }
            other => Err(OrmError::InvalidOperator(format!(
                "condition must be an object, got {}",
                other
            ))),
        }
    }

    fn parse_list(value: &Value) -> OrmResult<Vec<Cond>> {
        match value {
            Value::Array(items) => items.iter().map(Self::parse).collect(),
            Value::Object(_) => Ok(vec![Self::parse(value)?]),
            other => Err(OrmError::InvalidOperator(format!(
                "logical combinator expects an array or object, got {}",
                other
            ))),
        }
    }

    fn unwrap_single(mut conds: Vec<Cond>, wrap: fn(Vec<Cond>) -> Cond) -> Cond {
        if conds.len() == 1 {
            conds.remove(0)
        } else {
            wrap(conds)
        }
    }

    fn parse_field(field: &str, value: &Value) -> OrmResult<Cond> {
        match value {
            Value::Null => Ok(Self::leaf(field, Operator::IsNull, Value::Null)),
            Value::Array(items) => {
                // Single-length-array wrapping marks a literal array value.
                if items.len() == 1 && items[0].is_array() {
                    return Ok(Self::eq(field, items[0].clone()));
                }
                Err(OrmError::TypeAmbiguity(format!(
                    "bare array for field '{}': use {{\"in\": [...]}} for set membership \
                     or wrap a literal array as [[...]]",
                    field
                )))
            }
            Value::Object(ops) => {
                let mut conds = Vec::with_capacity(ops.len());
                for (key, operand) in ops {
                    conds.push(match key.as_str() {
                        "or" => Cond::Or(Self::parse_field_list(field, operand)?),
                        "and" => Cond::And(Self::parse_field_list(field, operand)?),
                        "not" => Cond::not(Self::parse_field(field, operand)?),
                        op_key => {
                            let op = Operator::from_key(op_key)
                                .ok_or_else(|| OrmError::InvalidOperator(op_key.to_string()))?;
                            Self::check_operand(field, op, operand)?;
                            Self::leaf(field, op, operand.clone())
                        }
                    });
                }
                Ok(Self::unwrap_single(conds, Cond::And))
            }
            scalar => Ok(Self::eq(field, scalar.clone())),
        }
    }

    /// Per-field combinator list: `{"author_id": {"or": [12, 13]}}`.
    fn parse_field_list(field: &str, value: &Value) -> OrmResult<Vec<Cond>> {
        let items = value.as_array().ok_or_else(|| {
            OrmError::InvalidOperator(format!(
                "combinator under field '{}' expects an array",
                field
            ))
        })?;
        items.iter().map(|v| Self::parse_field(field, v)).collect()
    }

    fn check_operand(field: &str, op: Operator, operand: &Value) -> OrmResult<()> {
        match op {
            Operator::Between | Operator::NotBetween => {
                if operand.as_array().map(|a| a.len()) != Some(2) {
                    return Err(OrmError::InvalidOperator(format!(
                        "between on '{}' expects exactly two values",
                        field
                    )));
                }
            }
            Operator::In | Operator::NotIn => {
                if !operand.is_array() {
                    return Err(OrmError::InvalidOperator(format!(
                        "in on '{}' expects an array",
                        field
                    )));
                }
            }
            Operator::Like | Operator::NotLike => {
                if !operand.is_string() {
                    return Err(OrmError::InvalidOperator(format!(
                        "like on '{}' expects a string pattern",
                        field
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Compile against an entity into the predicate AST, resolving every
    /// field through `qualifier`. Nested same-kind combinators flatten, so
    /// the compiled shape preserves the logical precedence of the tree.
    pub fn compile(&self, entity: &EntityDef, qualifier: &str) -> OrmResult<Predicate> {
        match self {
            Cond::And(children) => {
                let mut preds = Vec::with_capacity(children.len());
                for child in children {
                    match child.compile(entity, qualifier)? {
                        Predicate::And(inner) => preds.extend(inner),
                        p => preds.push(p),
                    }
                }
                Ok(Predicate::and_all(preds))
            }
            Cond::Or(children) => {
                let mut preds = Vec::with_capacity(children.len());
                for child in children {
                    match child.compile(entity, qualifier)? {
                        Predicate::Or(inner) => preds.extend(inner),
                        p => preds.push(p),
                    }
                }
                Ok(Predicate::or_all(preds))
            }
            Cond::Not(inner) => Ok(Predicate::Not(Box::new(inner.compile(entity, qualifier)?))),
            Cond::Leaf { field, op, value } => {
                if !entity.has_attribute(field) {
                    return Err(OrmError::UnknownAttribute {
                        entity: entity.name.clone(),
                        attribute: field.clone(),
                    });
                }
                let col = ColumnRef::new(qualifier, field);
                Ok(match op {
                    Operator::Eq if value.is_null() => Predicate::Null { col, negated: false },
                    Operator::Ne if value.is_null() => Predicate::Null { col, negated: true },
                    Operator::Eq => Predicate::cmp(col, CmpOp::Eq, value.clone()),
                    Operator::Ne => Predicate::cmp(col, CmpOp::Ne, value.clone()),
                    Operator::Gt => Predicate::cmp(col, CmpOp::Gt, value.clone()),
                    Operator::Gte => Predicate::cmp(col, CmpOp::Gte, value.clone()),
                    Operator::Lt => Predicate::cmp(col, CmpOp::Lt, value.clone()),
                    Operator::Lte => Predicate::cmp(col, CmpOp::Lte, value.clone()),
                    Operator::Between | Operator::NotBetween => {
                        let bounds = value.as_array().ok_or_else(|| {
                            OrmError::InvalidOperator(format!(
                                "between on '{}' expects exactly two values",
                                field
                            ))
                        })?;
                        if bounds.len() != 2 {
                            return Err(OrmError::InvalidOperator(format!(
                                "between on '{}' expects exactly two values",
                                field
                            )));
                        }
                        Predicate::Between {
                            col,
                            low: bounds[0].clone(),
                            high: bounds[1].clone(),
                            negated: *op == Operator::NotBetween,
                        }
                    }
                    Operator::In | Operator::NotIn => Predicate::InSet {
                        col,
                        values: value.as_array().cloned().unwrap_or_default(),
                        negated: *op == Operator::NotIn,
                    },
                    Operator::Like | Operator::NotLike => Predicate::Like {
                        col,
                        pattern: value.as_str().unwrap_or_default().to_string(),
                        negated: *op == Operator::NotLike,
                    },
                    Operator::IsNull => Predicate::Null { col, negated: false },
                    Operator::NotNull => Predicate::Null { col, negated: true },
                })
            }
        }
    }
}
