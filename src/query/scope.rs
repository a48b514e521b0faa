// Scope merger - named, composable query fragments

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{OrmError, OrmResult};
use crate::query::condition::Cond;
use crate::query::planner::{Include, LockHint, OrderBy};

/// A partial query. Scopes, the default scope and finder options all share
/// this shape and compose through `merge`.
#[derive(Debug, Clone, Default)]
pub struct QueryFragment {
    pub where_: Option<Cond>,
    pub include: Vec<Include>,
    pub order: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub lock: Option<LockHint>,
    pub attributes: Option<Vec<String>>,
}

impl QueryFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, cond: Cond) -> Self {
        self.where_ = Some(cond);
        self
    }

    pub fn with_include(mut self, include: Include) -> Self {
        self.include.push(include);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn lock(mut self, lock: LockHint) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn attributes(mut self, attrs: Vec<String>) -> Self {
        self.attributes = Some(attrs);
        self
    }

    /// Merge `other` over `self`. Condition trees AND together and include
    /// lists merge structurally by association key; `order`, `limit`,
    /// `offset`, `lock` and `attributes` are overridden by `other` when it
    /// sets them.
    pub fn merge(self, other: QueryFragment) -> QueryFragment {
        let where_ = match (self.where_, other.where_) {
            (Some(a), Some(b)) => Some(Cond::And(vec![a, b])),
            (a, b) => a.or(b),
        };
        QueryFragment {
            where_,
            include: merge_includes(self.include, other.include),
            order: if other.order.is_empty() { self.order } else { other.order },
            limit: other.limit.or(self.limit),
            offset: other.offset.or(self.offset),
            lock: other.lock.or(self.lock),
            attributes: other.attributes.or(self.attributes),
        }
    }
}

/// Structural include merge: entries for the same association collapse into
/// one, ANDing filters and recursing into nested includes; later `required`
/// overrides earlier.
fn merge_includes(base: Vec<Include>, over: Vec<Include>) -> Vec<Include> {
    let mut out = base;
    for inc in over {
        match out.iter_mut().find(|i| i.association == inc.association) {
            Some(existing) => {
                existing.where_ = match (existing.where_.take(), inc.where_) {
                    (Some(a), Some(b)) => Some(Cond::And(vec![a, b])),
                    (a, b) => a.or(b),
                };
                if inc.required.is_some() {
                    existing.required = inc.required;
                }
                let nested = std::mem::take(&mut existing.include);
                existing.include = merge_includes(nested, inc.include);
                existing.scopes.extend(inc.scopes);
            }
            None => out.push(inc),
        }
    }
    out
}

/// A named scope: a static fragment or a function of caller arguments.
#[derive(Clone)]
pub enum ScopeDef {
    Static(QueryFragment),
    Function(Arc<dyn Fn(&[Value]) -> QueryFragment + Send + Sync>),
}

impl ScopeDef {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> QueryFragment + Send + Sync + 'static,
    {
        ScopeDef::Function(Arc::new(f))
    }

    fn resolve(&self, args: &[Value]) -> QueryFragment {
        match self {
            ScopeDef::Static(fragment) => fragment.clone(),
            ScopeDef::Function(f) => f(args),
        }
    }
}

impl fmt::Debug for ScopeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeDef::Static(fragment) => f.debug_tuple("Static").field(fragment).finish(),
            ScopeDef::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Per-entity scope registry. The default scope applies to every finder
/// unless explicitly removed.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    scopes: HashMap<String, ScopeDef>,
    default_scope: Option<QueryFragment>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, def: ScopeDef) {
        self.scopes.insert(name.into(), def);
    }

    pub fn set_default(&mut self, fragment: QueryFragment) {
        self.default_scope = Some(fragment);
    }

    pub fn default_scope(&self) -> Option<&QueryFragment> {
        self.default_scope.as_ref()
    }

    pub fn resolve(&self, entity: &str, name: &str, args: &[Value]) -> OrmResult<QueryFragment> {
        if name == "default_scope" {
            return Ok(self.default_scope.clone().unwrap_or_default());
        }
        self.scopes
            .get(name)
            .map(|def| def.resolve(args))
            .ok_or_else(|| OrmError::ScopeNotFound {
                entity: entity.to_string(),
                scope: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::condition::Operator;
    use crate::query::planner::{OrderDir, OrderTarget};
    use serde_json::json;

    fn scope1() -> QueryFragment {
        QueryFragment::new()
            .filter(Cond::And(vec![
                Cond::eq("first_name", json!("bob")),
                Cond::leaf("age", Operator::Gt, json!(20)),
            ]))
            .limit(2)
    }

    fn scope2() -> QueryFragment {
        QueryFragment::new()
            .filter(Cond::leaf("age", Operator::Gt, json!(30)))
            .limit(10)
    }

    #[test]
    fn later_scope_overrides_limit_and_unions_where() {
        let merged = scope1().merge(scope2());
        assert_eq!(merged.limit, Some(10));
        match merged.where_ {
            Some(Cond::And(parts)) => assert_eq!(parts.len(), 2),
            other => panic!("expected ANDed where, got {:?}", other),
        }
    }

    #[test]
    fn order_overridden_only_when_set() {
        let a = QueryFragment::new().order_by(OrderBy::attr("title", OrderDir::Asc));
        let merged = a.clone().merge(QueryFragment::new());
        assert_eq!(merged.order.len(), 1);

        let b = QueryFragment::new().order_by(OrderBy::attr("id", OrderDir::Desc));
        let merged = a.merge(b);
        assert_eq!(merged.order.len(), 1);
        assert_eq!(
            merged.order[0].target,
            OrderTarget::Attribute("id".to_string())
        );
    }

    #[test]
    fn includes_merge_structurally_by_association() {
        let a = QueryFragment::new()
            .with_include(Include::new("task").filter(Cond::eq("done", json!(false))));
        let b = QueryFragment::new()
            .with_include(Include::new("task").filter(Cond::eq("urgent", json!(true))))
            .with_include(Include::new("profile"));
        let merged = a.merge(b);
        assert_eq!(merged.include.len(), 2);
        match &merged.include[0].where_ {
            Some(Cond::And(parts)) => assert_eq!(parts.len(), 2),
            other => panic!("expected merged include filter, got {:?}", other),
        }
    }

    #[test]
    fn parameterized_scope_resolves_with_args() {
        let mut reg = ScopeRegistry::new();
        reg.add(
            "access_level",
            ScopeDef::function(|args| {
                let level = args.first().cloned().unwrap_or(json!(0));
                QueryFragment::new().filter(Cond::leaf("access_level", Operator::Gte, level))
            }),
        );
        let fragment = reg.resolve("project", "access_level", &[json!(19)]).unwrap();
        assert_eq!(
            fragment.where_,
            Some(Cond::leaf("access_level", Operator::Gte, json!(19)))
        );
    }

    #[test]
    fn unknown_scope_is_an_error() {
        let reg = ScopeRegistry::new();
        assert!(matches!(
            reg.resolve("project", "nope", &[]),
            Err(OrmError::ScopeNotFound { .. })
        ));
    }
}
