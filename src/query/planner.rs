// Eager-load planner - resolves requested includes against the association
// graph into a deterministic join plan, and folds joined rows back into
// nested records

use serde_json::{Map, Value};

use crate::error::{OrmError, OrmResult};
use crate::executor::{coerce, RowMap};
use crate::query::condition::Cond;
use crate::query::predicate::{ColumnRef, Predicate};
use crate::schema::association::AssociationKind;
use crate::schema::entity::EntityDef;
use crate::schema::registry::SchemaRegistry;

/// One requested eager load. Addressed by association alias (or target
/// entity name when no alias was declared), never by table name.
#[derive(Debug, Clone, Default)]
pub struct Include {
    pub association: String,
    pub where_: Option<Cond>,
    /// Join mode override. When unset, attaching a filter upgrades the join
    /// to inner automatically.
    pub required: Option<bool>,
    pub include: Vec<Include>,
    /// Named scopes of the included entity to fold in before planning.
    pub scopes: Vec<String>,
}

impl Include {
    pub fn new(association: impl Into<String>) -> Self {
        Self {
            association: association.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, cond: Cond) -> Self {
        self.where_ = Some(cond);
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = Some(required);
        self
    }

    pub fn nested(mut self, include: Include) -> Self {
        self.include.push(include);
        self
    }

    pub fn scoped(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDir {
    Asc,
    Desc,
}

impl OrderDir {
    pub fn as_sql(&self) -> &'static str {
        match self {
            OrderDir::Asc => "ASC",
            OrderDir::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderTarget {
    /// Attribute of the root entity.
    Attribute(String),
    /// Attribute of an included association, addressed by the include path
    /// (association names from the root).
    Association {
        path: Vec<String>,
        attribute: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub target: OrderTarget,
    pub dir: OrderDir,
}

impl OrderBy {
    pub fn attr(name: impl Into<String>, dir: OrderDir) -> Self {
        Self {
            target: OrderTarget::Attribute(name.into()),
            dir,
        }
    }

    pub fn association(path: Vec<String>, attribute: impl Into<String>, dir: OrderDir) -> Self {
        Self {
            target: OrderTarget::Association {
                path,
                attribute: attribute.into(),
            },
            dir,
        }
    }
}

/// Row-lock hint forwarded to the engine. The planner never takes locks
/// itself; engines without the syntax ignore the hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LockHint {
    Update,
    Share,
    SkipLocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Left,
    Inner,
}

impl JoinKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinKind::Left => "LEFT OUTER JOIN",
            JoinKind::Inner => "INNER JOIN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannedJoin {
    /// Association name, the key this branch hydrates under.
    pub assoc_name: String,
    /// Unique alias, the dotted include path from the root.
    pub alias: String,
    pub entity: String,
    pub table: String,
    pub kind: JoinKind,
    pub on: Predicate,
    /// Hydrates as an array (has-many / belongs-to-many) vs a single object.
    pub many: bool,
    /// Intermediate hop of a belongs-to-many edge; skipped during hydration.
    pub through: bool,
    pub children: Vec<PlannedJoin>,
}

#[derive(Debug, Clone)]
pub struct JoinPlan {
    pub root_entity: String,
    pub root_alias: String,
    pub joins: Vec<PlannedJoin>,
}

impl JoinPlan {
    /// Joins in SQL emission order (parents before children).
    pub fn flat_joins(&self) -> Vec<&PlannedJoin> {
        let mut out = Vec::new();
        fn walk<'a>(nodes: &'a [PlannedJoin], out: &mut Vec<&'a PlannedJoin>) {
            for node in nodes {
                out.push(node);
                walk(&node.children, out);
            }
        }
        walk(&self.joins, &mut out);
        out
    }

    /// Resolve an order target to an alias-qualified column. Association
    /// targets must name an include path present in this plan.
    pub fn resolve_order(
        &self,
        reg: &SchemaRegistry,
        order: &OrderBy,
    ) -> OrmResult<ColumnRef> {
        match &order.target {
            OrderTarget::Attribute(name) => {
                let root = reg.entity(&self.root_entity)?;
                if !root.has_attribute(name) {
                    return Err(OrmError::UnknownAttribute {
                        entity: root.name.clone(),
                        attribute: name.clone(),
                    });
                }
                Ok(ColumnRef::new(&self.root_alias, name))
            }
            OrderTarget::Association { path, attribute } => {
                let mut nodes = &self.joins;
                let mut found: Option<&PlannedJoin> = None;
                for seg in path {
                    found = find_child(nodes, seg);
                    match found {
                        Some(node) => nodes = &node.children,
                        None => {
                            return Err(OrmError::AssociationNotFound(format!(
                                "order references '{}' which is not included",
                                path.join(".")
                            )))
                        }
                    }
                }
                let node = found.ok_or_else(|| {
                    OrmError::AssociationNotFound("empty association order path".to_string())
                })?;
                let entity = reg.entity(&node.entity)?;
                if !entity.has_attribute(attribute) {
                    return Err(OrmError::UnknownAttribute {
                        entity: entity.name.clone(),
                        attribute: attribute.clone(),
                    });
                }
                Ok(ColumnRef::new(&node.alias, attribute))
            }
        }
    }

    /// Fold joined rows back into nested records. Roots keep first-seen
    /// order and are deduplicated by primary key, as are nested records at
    /// every level.
    pub fn hydrate(&self, reg: &SchemaRegistry, rows: &[RowMap]) -> OrmResult<Vec<Value>> {
        let root = reg.entity(&self.root_entity)?;
        let refs: Vec<&RowMap> = rows.iter().collect();
        fold_level(reg, root, &self.root_alias, &self.joins, &refs)
    }
}

/// Find a direct child association node, looking through belongs-to-many
/// intermediate hops transparently.
fn find_child<'a>(nodes: &'a [PlannedJoin], seg: &str) -> Option<&'a PlannedJoin> {
    for node in nodes {
        if node.through {
            if let Some(hit) = find_child(&node.children, seg) {
                return Some(hit);
            }
        } else if node.assoc_name == seg {
            return Some(node);
        }
    }
    None
}

fn fold_level(
    reg: &SchemaRegistry,
    entity: &EntityDef,
    alias: &str,
    children: &[PlannedJoin],
    rows: &[&RowMap],
) -> OrmResult<Vec<Value>> {
    let pk_key = format!("{}.{}", alias, entity.primary_key().name);
    let mut order: Vec<Value> = Vec::new();
    let mut groups: Vec<Vec<&RowMap>> = Vec::new();
    for row in rows {
        let pk = row.get(&pk_key).cloned().unwrap_or(Value::Null);
        if pk.is_null() {
            continue; // left join without a match
        }
        match order.iter().position(|p| *p == pk) {
            Some(i) => groups[i].push(row),
            None => {
                order.push(pk);
                groups.push(vec![row]);
            }
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for group in groups {
        let first = group[0];
        let mut record = Map::new();
        for attr in &entity.attributes {
            let key = format!("{}.{}", alias, attr.name);
            // Absent key means the column was projected out, not NULL.
            let Some(raw) = first.get(&key).cloned() else {
                continue;
            };
            let mut value = coerce(attr.semantic, raw);
            if let Some(getter) = &attr.getter {
                value = getter(&value);
            }
            record.insert(attr.name.clone(), value);
        }
        attach_children(reg, &mut record, children, &group)?;
        out.push(Value::Object(record));
    }
    Ok(out)
}

fn attach_children(
    reg: &SchemaRegistry,
    record: &mut Map<String, Value>,
    children: &[PlannedJoin],
    rows: &[&RowMap],
) -> OrmResult<()> {
    for child in children {
        if child.through {
            // Hydrate the target hop directly against the same row group.
            attach_children(reg, record, &child.children, rows)?;
            continue;
        }
        let entity = reg.entity(&child.entity)?;
        let values = fold_level(reg, entity, &child.alias, &child.children, rows)?;
        let nested = if child.many {
            Value::Array(values)
        } else {
            values.into_iter().next().unwrap_or(Value::Null)
        };
        record.insert(child.assoc_name.clone(), nested);
    }
    Ok(())
}

/// Build the join plan for a root entity and its requested includes.
pub fn plan(
    reg: &SchemaRegistry,
    root: &EntityDef,
    includes: &[Include],
) -> OrmResult<JoinPlan> {
    let root_alias = root.name.clone();
    let mut joins = Vec::with_capacity(includes.len());
    for inc in includes {
        joins.push(plan_include(reg, root, &root_alias, inc)?);
    }
    Ok(JoinPlan {
        root_entity: root.name.clone(),
        root_alias,
        joins,
    })
}

fn plan_include(
    reg: &SchemaRegistry,
    parent: &EntityDef,
    parent_alias: &str,
    inc: &Include,
) -> OrmResult<PlannedJoin> {
    let assoc = reg.association(&parent.name, &inc.association).ok_or_else(|| {
        OrmError::AssociationNotFound(format!(
            "'{}' is not associated to '{}'",
            inc.association, parent.name
        ))
    })?;
    let target = reg.entity(&assoc.target)?;
    let alias = format!("{}.{}", parent_alias, assoc.name());

    // A filtered include must match; the join is upgraded to inner unless
    // the caller explicitly opted out.
    let required = inc.required.unwrap_or(inc.where_.is_some());
    let kind = if required { JoinKind::Inner } else { JoinKind::Left };

    let mut filters = Vec::new();
    if let Some(scope) = &assoc.scope {
        filters.push(scope.compile(target, &alias)?);
    }
    if let Some(where_) = &inc.where_ {
        filters.push(where_.compile(target, &alias)?);
    }

    let mut children = Vec::with_capacity(inc.include.len());
    for nested in &inc.include {
        children.push(plan_include(reg, target, &alias, nested)?);
    }

    match &assoc.kind {
        AssociationKind::BelongsToMany { through } => {
            let through_entity = reg.entity(through)?;
            let through_alias = format!("{}~join", alias);
            let other_key = assoc.other_key.as_deref().unwrap_or("id");
            let mut on = vec![Predicate::ColEq {
                left: ColumnRef::new(&alias, &target.primary_key().name),
                right: ColumnRef::new(&through_alias, other_key),
            }];
            on.extend(filters);
            let target_node = PlannedJoin {
                assoc_name: assoc.name().to_string(),
                alias: alias.clone(),
                entity: target.name.clone(),
                table: target.table.clone(),
                kind,
                on: Predicate::and_all(on),
                many: true,
                through: false,
                children,
            };
            Ok(PlannedJoin {
                assoc_name: format!("{}~join", assoc.name()),
                alias: through_alias.clone(),
                entity: through_entity.name.clone(),
                table: through_entity.table.clone(),
                kind,
                on: Predicate::ColEq {
                    left: ColumnRef::new(&through_alias, &assoc.foreign_key),
                    right: ColumnRef::new(parent_alias, &parent.primary_key().name),
                },
                many: true,
                through: true,
                children: vec![target_node],
            })
        }
        AssociationKind::BelongsTo => {
            let mut on = vec![Predicate::ColEq {
                left: ColumnRef::new(parent_alias, &assoc.foreign_key),
                right: ColumnRef::new(&alias, &target.primary_key().name),
            }];
            on.extend(filters);
            Ok(PlannedJoin {
                assoc_name: assoc.name().to_string(),
                alias,
                entity: target.name.clone(),
                table: target.table.clone(),
                kind,
                on: Predicate::and_all(on),
                many: false,
                through: false,
                children,
            })
        }
        AssociationKind::HasOne | AssociationKind::HasMany => {
            let mut on = vec![Predicate::ColEq {
                left: ColumnRef::new(&alias, &assoc.foreign_key),
                right: ColumnRef::new(parent_alias, &parent.primary_key().name),
            }];
            on.extend(filters);
            Ok(PlannedJoin {
                assoc_name: assoc.name().to_string(),
                alias,
                entity: target.name.clone(),
                table: target.table.clone(),
                kind,
                on: Predicate::and_all(on),
                many: assoc.kind == AssociationKind::HasMany,
                through: false,
                children,
            })
        }
    }
}
