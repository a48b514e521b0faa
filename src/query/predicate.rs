// Backend-neutral predicate AST and its parameterized SQL rendering

use serde_json::Value;

/// Alias-qualified column reference. The qualifier is always a join alias
/// from the plan, never a raw table name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub qualifier: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(qualifier: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            qualifier: qualifier.into(),
            column: column.into(),
        }
    }

    pub fn render(&self) -> String {
        format!("\"{}\".\"{}\"", self.qualifier, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    fn as_sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Always-true, the identity for AND merging.
    True,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Cmp {
        col: ColumnRef,
        op: CmpOp,
        value: Value,
    },
    /// Column-to-column equality, used for join conditions.
    ColEq { left: ColumnRef, right: ColumnRef },
    Between {
        col: ColumnRef,
        low: Value,
        high: Value,
        negated: bool,
    },
    InSet {
        col: ColumnRef,
        values: Vec<Value>,
        negated: bool,
    },
    Like {
        col: ColumnRef,
        pattern: String,
        negated: bool,
    },
    Null { col: ColumnRef, negated: bool },
}

impl Predicate {
    pub fn cmp(col: ColumnRef, op: CmpOp, value: Value) -> Self {
        Predicate::Cmp { col, op, value }
    }

    /// AND a list together, dropping `True` and unwrapping singletons.
    pub fn and_all(preds: Vec<Predicate>) -> Predicate {
        let mut out: Vec<Predicate> = Vec::with_capacity(preds.len());
        for p in preds {
            match p {
                Predicate::True => {}
                Predicate::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Predicate::True,
            1 => out.remove(0),
            _ => Predicate::And(out),
        }
    }

    pub fn or_all(preds: Vec<Predicate>) -> Predicate {
        let mut out: Vec<Predicate> = Vec::with_capacity(preds.len());
        for p in preds {
            match p {
                Predicate::Or(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Predicate::True,
            1 => out.remove(0),
            _ => Predicate::Or(out),
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Predicate::True)
    }

    /// Render to SQL, pushing bind values in positional order. Composite
    /// nodes are parenthesized so the emitted precedence always matches the
    /// tree shape. Values are never interpolated into the SQL text.
    pub fn render(&self, sql: &mut String, binds: &mut Vec<Value>) {
        match self {
            Predicate::True => sql.push_str("1 = 1"),
            Predicate::And(children) => Self::render_list(children, " AND ", sql, binds),
            Predicate::Or(children) => Self::render_list(children, " OR ", sql, binds),
            Predicate::Not(inner) => {
                sql.push_str("NOT (");
                inner.render(sql, binds);
                sql.push(')');
            }
            Predicate::Cmp { col, op, value } => {
                sql.push_str(&col.render());
                sql.push(' ');
                sql.push_str(op.as_sql());
                sql.push_str(" ?");
                binds.push(value.clone());
            }
            Predicate::ColEq { left, right } => {
                sql.push_str(&left.render());
                sql.push_str(" = ");
                sql.push_str(&right.render());
            }
            Predicate::Between {
                col,
                low,
                high,
                negated,
            } => {
                sql.push_str(&col.render());
                if *negated {
                    sql.push_str(" NOT");
                }
                sql.push_str(" BETWEEN ? AND ?");
                binds.push(low.clone());
                binds.push(high.clone());
            }
            Predicate::InSet {
                col,
                values,
                negated,
            } => {
                if values.is_empty() {
                    // IN () is invalid SQL; an empty set matches nothing.
                    sql.push_str(if *negated { "1 = 1" } else { "1 = 0" });
                    return;
                }
                sql.push_str(&col.render());
                if *negated {
                    sql.push_str(" NOT");
                }
                sql.push_str(" IN (");
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    sql.push('?');
                    binds.push(v.clone());
                }
                sql.push(')');
            }
            Predicate::Like {
                col,
                pattern,
                negated,
            } => {
                sql.push_str(&col.render());
                if *negated {
                    sql.push_str(" NOT");
                }
                sql.push_str(" LIKE ?");
                binds.push(Value::String(pattern.clone()));
            }
            Predicate::Null { col, negated } => {
                sql.push_str(&col.render());
                sql.push_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
        }
    }

    fn render_list(children: &[Predicate], sep: &str, sql: &mut String, binds: &mut Vec<Value>) {
        if children.is_empty() {
            sql.push_str("1 = 1");
            return;
        }
        sql.push('(');
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                sql.push_str(sep);
            }
            child.render(sql, binds);
        }
        sql.push(')');
    }

    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut sql = String::new();
        let mut binds = Vec::new();
        self.render(&mut sql, &mut binds);
        (sql, binds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn col(name: &str) -> ColumnRef {
        ColumnRef::new("post", name)
    }

    #[test]
    fn nested_or_in_and_is_parenthesized() {
        let pred = Predicate::And(vec![
            Predicate::cmp(col("status"), CmpOp::Eq, json!("active")),
            Predicate::Or(vec![
                Predicate::cmp(col("author_id"), CmpOp::Eq, json!(12)),
                Predicate::cmp(col("author_id"), CmpOp::Eq, json!(13)),
            ]),
        ]);
        let (sql, binds) = pred.to_sql();
        assert_eq!(
            sql,
            "(\"post\".\"status\" = ? AND (\"post\".\"author_id\" = ? OR \"post\".\"author_id\" = ?))"
        );
        assert_eq!(binds, vec![json!("active"), json!(12), json!(13)]);
    }

    #[test]
    fn empty_in_set_matches_nothing() {
        let pred = Predicate::InSet {
            col: col("id"),
            values: vec![],
            negated: false,
        };
        assert_eq!(pred.to_sql().0, "1 = 0");
    }

    #[test]
    fn and_all_drops_true_and_flattens() {
        let pred = Predicate::and_all(vec![
            Predicate::True,
            Predicate::And(vec![
                Predicate::cmp(col("a"), CmpOp::Eq, json!(1)),
                Predicate::cmp(col("b"), CmpOp::Eq, json!(2)),
            ]),
            Predicate::cmp(col("c"), CmpOp::Eq, json!(3)),
        ]);
        match pred {
            Predicate::And(children) => assert_eq!(children.len(), 3),
            other => panic!("expected flat And, got {:?}", other),
        }
    }

    #[test]
    fn not_wraps_inner_predicate() {
        let pred = Predicate::Not(Box::new(Predicate::cmp(col("a"), CmpOp::Eq, json!(1))));
        assert_eq!(pred.to_sql().0, "NOT (\"post\".\"a\" = ?)");
    }

    #[test]
    fn between_binds_both_bounds() {
        let pred = Predicate::Between {
            col: col("id"),
            low: json!(6),
            high: json!(10),
            negated: false,
        };
        let (sql, binds) = pred.to_sql();
        assert_eq!(sql, "\"post\".\"id\" BETWEEN ? AND ?");
        assert_eq!(binds.len(), 2);
    }
}
